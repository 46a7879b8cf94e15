//! Owns the connection to the origin: the response pump, the suspend/resume
//! handshake, and origin switching with TLS-state replay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tokio_rustls::{TlsConnector, TlsStream};
use tracing::debug;

use crate::client_writer::ClientWriter;
use crate::codec::{closes_multiline_reply, opens_multiline_reply, parse_line, write_raw};
use crate::error::ProxyError;
use crate::stream::BoxedStream;
use crate::tls::server_name_from_addr;

struct SuspendGate {
    requested: AtomicBool,
    parked: Notify,
    resume: Notify,
    /// Fired whenever `requested` flips to `true`, so a pump already blocked
    /// inside a read (waiting for a reply nothing will solicit until the
    /// suspending handler runs) can abandon that read and park instead of
    /// leaving `suspend` waiting for an acknowledgement that never comes.
    requested_changed: Notify,
}

impl SuspendGate {
    fn new() -> Self {
        SuspendGate {
            requested: AtomicBool::new(false),
            parked: Notify::new(),
            resume: Notify::new(),
            requested_changed: Notify::new(),
        }
    }
}

/// RAII guard returned by [`ProxyLeg::suspend`]; dropping it always calls
/// `unsuspend`, even if the holder returns early via `?`.
pub struct SuspendGuard<'a> {
    leg: &'a ProxyLeg,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.leg.unsuspend();
    }
}

pub struct ProxyLeg {
    reader: Mutex<BufReader<ReadHalf<BoxedStream>>>,
    writer: Mutex<BufWriter<WriteHalf<BoxedStream>>>,
    addr: Mutex<String>,
    client_writer: Arc<ClientWriter>,
    proxy_timeout: Duration,
    proxy_protocol: bool,
    gate: SuspendGate,
}

fn box_tcp(s: TcpStream) -> BoxedStream {
    Box::new(s)
}

async fn dial(addr: &str, proxy_timeout: Duration) -> Result<TcpStream, ProxyError> {
    match timeout(proxy_timeout, TcpStream::connect(addr)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(ProxyError::Timeout),
    }
}

fn proxy_protocol_header(src_ip: &str, origin: &TcpStream) -> Option<String> {
    let local = origin.local_addr().ok()?;
    let peer = origin.peer_addr().ok()?;
    let src_port = src_ip.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok());
    let src_host = src_ip.rsplit_once(':').map(|(h, _)| h).unwrap_or(src_ip);
    Some(format!(
        "PROXY TCP4 {} {} {} {}\r\n",
        src_host,
        peer.ip(),
        src_port.unwrap_or(0),
        local.port()
    ))
}

impl ProxyLeg {
    /// Dial `origin_addr` and, on success, write a PROXY-protocol v1 header
    /// if configured.
    pub async fn connect(
        client_writer: Arc<ClientWriter>,
        src_ip: &str,
        origin_addr: &str,
        proxy_timeout: Duration,
        proxy_protocol: bool,
    ) -> Result<Self, ProxyError> {
        let tcp = dial(origin_addr, proxy_timeout).await?;

        if proxy_protocol {
            if let Some(header) = proxy_protocol_header(src_ip, &tcp) {
                let mut tcp = &tcp;
                tcp.write_all(header.as_bytes()).await?;
            }
        }

        let boxed = box_tcp(tcp);
        let (r, w) = split(boxed);

        Ok(ProxyLeg {
            reader: Mutex::new(BufReader::new(r)),
            writer: Mutex::new(BufWriter::new(w)),
            addr: Mutex::new(origin_addr.to_string()),
            client_writer,
            proxy_timeout,
            proxy_protocol,
            gate: SuspendGate::new(),
        })
    }

    pub async fn current_addr(&self) -> String {
        self.addr.lock().await.clone()
    }

    /// Read one reply (single- or multi-line) from origin and forward it to
    /// the client verbatim. Returns `Err(ProxyError::Eof)` when origin closes.
    pub async fn response_proxy(&self) -> Result<(), ProxyError> {
        let first = self.read_first_line_cooperatively().await?;

        let mut out = first.clone();
        if let Some(code) = opens_multiline_reply(&first) {
            loop {
                let mut reader = self.reader.lock().await;
                let next = read_one_line(&mut reader).await?;
                drop(reader);
                let done = closes_multiline_reply(&next, code);
                out.push_str(&next);
                if done {
                    break;
                }
            }
        }

        self.client_writer.write_raw(&out).await?;
        Ok(())
    }

    async fn park_if_suspended(&self) {
        if self.gate.requested.load(Ordering::Acquire) {
            self.gate.parked.notify_one();
            self.gate.resume.notified().await;
        }
    }

    /// Read the reply's first line, but give up on an in-flight read the
    /// instant a suspend is requested instead of blocking indefinitely on
    /// bytes that may never come (they're destined for the suspending
    /// handler's own `exchange` instead). Safe to retry: nothing is lost
    /// except bytes already buffered by the OS/tokio below a line boundary,
    /// which stay queued on the socket for the next read attempt.
    async fn read_first_line_cooperatively(&self) -> Result<String, ProxyError> {
        loop {
            self.park_if_suspended().await;

            let mut reader = self.reader.lock().await;
            tokio::select! {
                biased;
                _ = self.gate.requested_changed.notified() => continue,
                res = read_one_line(&mut *reader) => return res,
            }
        }
    }

    /// Park the response pump at its next yield point. Returns once the
    /// pump has acknowledged parking (or immediately, if it's already there).
    pub async fn suspend(&self) -> SuspendGuard<'_> {
        self.gate.requested.store(true, Ordering::Release);
        self.gate.requested_changed.notify_one();
        // The pump only notifies `parked` from inside `park_if_suspended`,
        // which runs at the top of its loop between replies; wait for that
        // acknowledgement so callers never race a fresh origin exchange
        // against an in-flight read.
        self.gate.parked.notified().await;
        SuspendGuard { leg: self }
    }

    fn unsuspend(&self) {
        self.gate.requested.store(false, Ordering::Release);
        self.gate.resume.notify_one();
    }

    /// Forward a raw client line straight to origin.
    pub async fn send_to_origin(&self, line: &str) -> Result<(), ProxyError> {
        let mut writer = self.writer.lock().await;
        write_raw(&mut *writer, line).await?;
        Ok(())
    }

    /// Send `line` to origin and wait for its (possibly multi-line) reply,
    /// returning the full reply text. Used for synchronous exchanges such as
    /// TLS-command replay; callers must already hold the pump suspended.
    pub async fn exchange(&self, line: &str) -> Result<String, ProxyError> {
        {
            let mut writer = self.writer.lock().await;
            write_raw(&mut *writer, line).await?;
        }

        let mut reader = self.reader.lock().await;
        let first = read_one_line(&mut reader).await?;
        let mut out = first.clone();
        if let Some(code) = opens_multiline_reply(&first) {
            loop {
                let next = read_one_line(&mut reader).await?;
                let done = closes_multiline_reply(&next, code);
                out.push_str(&next);
                if done {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Dial `new_addr`, replay `previous_tls_commands` in order (each must
    /// get a successful reply), and optionally perform a TLS handshake
    /// before declaring the switch complete. On any failure the existing
    /// origin connection is left untouched.
    pub async fn switch_origin(
        &self,
        src_ip: &str,
        new_addr: &str,
        tls_client_config: Option<Arc<rustls::ClientConfig>>,
        previous_tls_commands: &[String],
    ) -> Result<(), ProxyError> {
        if new_addr == self.current_addr().await {
            return Ok(());
        }

        let tcp = dial(new_addr, self.proxy_timeout).await?;

        if self.proxy_protocol {
            if let Some(header) = proxy_protocol_header(src_ip, &tcp) {
                let mut tcp_ref = &tcp;
                tcp_ref.write_all(header.as_bytes()).await?;
            }
        }

        let boxed: BoxedStream = box_tcp(tcp);

        // Replay AUTH/PBSZ/PROT before (optionally) wrapping the connection
        // in TLS, matching the order the client originally issued them in.
        // One BufReader spans the whole replay loop so bytes it reads ahead
        // of a line boundary aren't discarded between commands.
        let (r, mut w) = split(boxed);
        let mut r = BufReader::new(r);
        for cmd in previous_tls_commands {
            write_raw(&mut w, cmd).await?;
            let reply = read_one_line(&mut r).await?;
            let code: u16 = reply
                .get(..3)
                .and_then(|s| s.parse().ok())
                .unwrap_or(500);
            if !(200..400).contains(&code) {
                return Err(ProxyError::Other(anyhow::anyhow!(
                    "origin rejected replayed command {:?}: {}",
                    parse_line(cmd).command,
                    reply.trim_end()
                )));
            }
        }
        let mut boxed = r.into_inner().unsplit(w);

        if let Some(client_cfg) = tls_client_config {
            let connector = TlsConnector::from(client_cfg);
            let server_name = server_name_from_addr(new_addr).map_err(ProxyError::Other)?;
            let handshake = timeout(self.proxy_timeout, connector.connect(server_name, boxed)).await;
            let tls_stream = match handshake {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => return Err(ProxyError::Io(e)),
                Err(_) => return Err(ProxyError::Timeout),
            };
            boxed = Box::new(TlsStream::Client(tls_stream));
        }

        let (r, w) = split(boxed);
        *self.reader.lock().await = BufReader::new(r);
        *self.writer.lock().await = BufWriter::new(w);
        *self.addr.lock().await = new_addr.to_string();

        debug!(new_addr, "origin switched");
        Ok(())
    }

    /// Close the origin connection; subsequent `response_proxy` calls return
    /// `ProxyError::Eof`.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

async fn read_one_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<String, ProxyError> {
    match crate::codec::read_line(reader).await? {
        Some(line) => Ok(line),
        None => Err(ProxyError::Eof),
    }
}
