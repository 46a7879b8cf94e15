//! Per-client orchestration: connects the proxy leg, spawns the
//! origin→client pump and the client→origin command loop, and reconciles
//! their exit into one result for the caller.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;
use tokio::io::{split, BufReader, ReadHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::client_writer::ClientWriter;
use crate::codec::{parse_line, read_line, ParsedLine};
use crate::config::Config;
use crate::context::ContextHandle;
use crate::error::ProxyError;
use crate::handlers::{self, HandlerKind};
use crate::middleware::MiddlewareRegistry;
use crate::proxy_leg::ProxyLeg;
use crate::result::Reply;
use crate::stream::BoxedStream;

/// Everything a command dispatch needs: the shared pieces (config,
/// middleware, TLS material) plus this connection's own mutable state.
pub struct ClientSession {
    pub id: u64,
    pub src_ip: String,
    reader: Option<BufReader<ReadHalf<BoxedStream>>>,
    client_writer: Arc<ClientWriter>,
    proxy: Arc<ProxyLeg>,
    context: ContextHandle,
    middleware: Arc<MiddlewareRegistry>,
    server_tls: Arc<rustls::ServerConfig>,
    origin_tls: Arc<rustls::ClientConfig>,
    proxy_timeout: Duration,

    current: ParsedLine,
    is_logged_in: bool,
    tls_protocol: Option<rustls::ProtocolVersion>,
    previous_tls_commands: Vec<String>,
    /// Set by a handler that hit an unrecoverable error (e.g. a failed TLS
    /// handshake); the command loop stops after replying instead of
    /// continuing the session.
    fatal: bool,
}

impl ClientSession {
    /// Runs the whole per-command dispatch (middleware, handler table,
    /// unknown-verb passthrough) behind one `catch_unwind` boundary: any of
    /// the three can panic (middleware is user-supplied code, the most
    /// plausible source), and the spec wants a synthetic 500 plus a
    /// continued session regardless of where the panic happened.
    async fn dispatch(&mut self) -> Option<Reply> {
        let outcome = AssertUnwindSafe(self.dispatch_inner()).catch_unwind().await;
        match outcome {
            Ok(reply) => reply,
            Err(panic) => Some(Reply::internal_error(panic_message(panic))),
        }
    }

    async fn dispatch_inner(&mut self) -> Option<Reply> {
        let command = self.current.command.clone();
        let param = self.current.param.clone();

        if command == "PASS" {
            info!(command = %command, "read from client: PASS ********");
        } else {
            debug!(line = %self.current.raw.trim_end(), "read from client");
        }

        if self.middleware.has(&command) {
            if let Err(e) = self
                .middleware
                .dispatch(&command, self.context.clone(), param.clone())
                .await
            {
                return Some(Reply::internal_error(e));
            }
        }

        let Some(spec) = handlers::lookup(&command) else {
            if let Err(e) = self.proxy.send_to_origin(&self.current.raw).await {
                return Some(Reply::internal_error(e));
            }
            return None;
        };

        let _suspend_guard = if spec.suspend {
            Some(self.proxy.suspend().await)
        } else {
            None
        };

        match self.run_handler(spec.kind).await {
            Ok(reply) => reply,
            Err(e) => Some(Reply::internal_error(e)),
        }
    }

    async fn run_handler(&mut self, kind: HandlerKind) -> anyhow::Result<Option<Reply>> {
        match kind {
            HandlerKind::Proxy => self.handle_proxy().await,
            HandlerKind::User => self.handle_user().await,
            HandlerKind::Auth => self.handle_auth().await,
            HandlerKind::Pbsz => self.handle_pbsz_or_prot().await,
            HandlerKind::Prot => self.handle_pbsz_or_prot().await,
            HandlerKind::Transfer => self.handle_transfer().await,
        }
    }

    /// Parse an inbound PROXY-protocol v1 header on the client leg. No
    /// origin traffic is involved.
    async fn handle_proxy(&mut self) -> anyhow::Result<Option<Reply>> {
        let fields: Vec<&str> = self.current.raw.trim_end().split(' ').collect();
        if fields.len() == 6 && fields[0] == "PROXY" {
            self.src_ip = format!("{}:{}", fields[2], fields[4]);
        }
        Ok(None)
    }

    async fn handle_user(&mut self) -> anyhow::Result<Option<Reply>> {
        let target = self.context.lock().unwrap().remote_addr.clone();
        if target != self.proxy.current_addr().await {
            let tls_cfg = self.tls_protocol.map(|_| self.origin_tls.clone());
            self.proxy
                .switch_origin(&self.src_ip, &target, tls_cfg, &self.previous_tls_commands)
                .await?;
        }

        let reply_raw = self.proxy.exchange(&self.current.raw).await?;
        self.client_writer.write_raw(&reply_raw).await?;

        if let Some(200..300) = reply_raw.get(..3).and_then(|s| s.parse::<u16>().ok()) {
            self.is_logged_in = true;
        }
        Ok(None)
    }

    async fn handle_auth(&mut self) -> anyhow::Result<Option<Reply>> {
        self.previous_tls_commands.push(self.current.raw.clone());

        let reply_raw = self.proxy.exchange(&self.current.raw).await?;
        self.client_writer.write_raw(&reply_raw).await?;

        let code = reply_raw.get(..3).and_then(|s| s.parse::<u16>().ok()).unwrap_or(0);
        if code == 234 || code == 334 {
            if let Err(e) = self.upgrade_client_tls().await {
                self.fatal = true;
                return Ok(Some(Reply::internal_error(e)));
            }
        }
        Ok(None)
    }

    async fn handle_pbsz_or_prot(&mut self) -> anyhow::Result<Option<Reply>> {
        self.previous_tls_commands.push(self.current.raw.clone());
        let reply_raw = self.proxy.exchange(&self.current.raw).await?;
        self.client_writer.write_raw(&reply_raw).await?;
        Ok(None)
    }

    /// RETR/STOR stay in ordinary passthrough today; the dedicated handler
    /// slot exists so per-transfer hooks have somewhere to live later.
    async fn handle_transfer(&mut self) -> anyhow::Result<Option<Reply>> {
        self.proxy.send_to_origin(&self.current.raw).await?;
        Ok(None)
    }

    /// Recombine the client socket's read/write halves, perform an in-band
    /// TLS handshake acting as the server, and re-split the result.
    async fn upgrade_client_tls(&mut self) -> anyhow::Result<()> {
        let read_half = self
            .reader
            .take()
            .expect("client reader missing: concurrent upgrades are not supported")
            .into_inner();
        let (mut writer_guard, write_half) = self.client_writer.take_for_upgrade().await;

        let combined: BoxedStream = read_half.unsplit(write_half);
        let acceptor = TlsAcceptor::from(self.server_tls.clone());

        let tls_stream = match timeout(self.proxy_timeout, acceptor.accept(combined)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(anyhow!("client TLS handshake failed: {e}")),
            Err(_) => return Err(anyhow!("client TLS handshake timed out")),
        };

        let negotiated = tls_stream.get_ref().1.protocol_version();
        let boxed: BoxedStream = Box::new(tokio_rustls::TlsStream::Server(tls_stream));
        let (r, w) = split(boxed);

        self.reader = Some(BufReader::new(r));
        ClientWriter::restore(&mut writer_guard, w);
        self.tls_protocol = negotiated;

        debug!(?negotiated, "client leg upgraded to TLS");
        Ok(())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

enum ReadOutcome {
    Line(ParsedLine),
    Eof,
    Timeout,
    Io(std::io::Error),
    Cancelled,
}

async fn next_client_line(
    reader: &mut BufReader<ReadHalf<BoxedStream>>,
    idle_timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> ReadOutcome {
    let read_fut = read_line(reader);
    tokio::pin!(read_fut);

    let raw_result = match idle_timeout {
        Some(dur) => {
            tokio::select! {
                _ = cancel.cancelled() => return ReadOutcome::Cancelled,
                res = timeout(dur, &mut read_fut) => match res {
                    Ok(inner) => inner,
                    Err(_) => return ReadOutcome::Timeout,
                },
            }
        }
        None => {
            tokio::select! {
                _ = cancel.cancelled() => return ReadOutcome::Cancelled,
                res = &mut read_fut => res,
            }
        }
    };

    match raw_result {
        Ok(Some(raw)) => ReadOutcome::Line(parse_line(&raw)),
        Ok(None) => ReadOutcome::Eof,
        Err(e) => ReadOutcome::Io(e),
    }
}

async fn command_loop(
    mut session: ClientSession,
    idle_timeout: Option<Duration>,
    last_command: Arc<StdMutex<String>>,
    cancel: CancellationToken,
) {
    loop {
        match next_client_line(session.reader.as_mut().unwrap(), idle_timeout, &cancel).await {
            ReadOutcome::Line(parsed) => {
                session.current = parsed;
                *last_command.lock().unwrap() = session.current.command.clone();

                if let Some(reply) = session.dispatch().await {
                    if reply.respond(&session.client_writer).await.is_err() {
                        break;
                    }
                }
                if session.fatal {
                    break;
                }
            }
            ReadOutcome::Eof => {
                session.client_writer.shutdown().await;
                break;
            }
            ReadOutcome::Timeout => {
                let _ = session
                    .client_writer
                    .write_reply(421, "command timeout : closing control connection")
                    .await;
                session.client_writer.shutdown().await;
                break;
            }
            ReadOutcome::Io(e) => {
                warn!(error = %e, "client read error");
                break;
            }
            ReadOutcome::Cancelled => break,
        }
    }

    cancel.cancel();
}

/// Per-connection orchestrator: builds the initial proxy leg, spawns the two
/// worker tasks, and folds their outcome into one `Result` for the acceptor
/// to log.
pub struct ClientHandler {
    id: u64,
    config: Arc<Config>,
    middleware: Arc<MiddlewareRegistry>,
    server_tls: Arc<rustls::ServerConfig>,
    origin_tls: Arc<rustls::ClientConfig>,
    counter: Arc<AtomicI64>,
}

impl ClientHandler {
    pub fn new(
        id: u64,
        config: Arc<Config>,
        middleware: Arc<MiddlewareRegistry>,
        server_tls: Arc<rustls::ServerConfig>,
        origin_tls: Arc<rustls::ClientConfig>,
        counter: Arc<AtomicI64>,
    ) -> Self {
        ClientHandler {
            id,
            config,
            middleware,
            server_tls,
            origin_tls,
            counter,
        }
    }

    pub async fn handle(self, socket: TcpStream, src_ip: String) -> anyhow::Result<()> {
        let span = info_span!("conn", id = self.id, src_ip = %src_ip);
        self.handle_inner(socket, src_ip).instrument(span).await
    }

    async fn handle_inner(self, socket: TcpStream, src_ip: String) -> anyhow::Result<()> {
        // The acceptor already incremented `counter` before spawning us; this
        // guard only owns the matching decrement on the way out, including
        // early returns via `?`.
        let _counter_guard = CounterGuard(self.counter.clone());

        let boxed: BoxedStream = Box::new(socket);
        let (r, w) = split(boxed);
        let client_writer = ClientWriter::new(w);
        let reader = BufReader::new(r);

        let proxy_timeout = Duration::from_secs(self.config.proxy_timeout_secs.max(1));
        let remote_addr = self.config.remote_addr.clone();

        let proxy = Arc::new(
            ProxyLeg::connect(
                client_writer.clone(),
                &src_ip,
                &remote_addr,
                proxy_timeout,
                self.config.proxy_protocol,
            )
            .await
            .map_err(anyhow::Error::from)?,
        );

        let context: ContextHandle = Arc::new(StdMutex::new(crate::context::Context::new(remote_addr)));

        let session = ClientSession {
            id: self.id,
            src_ip,
            reader: Some(reader),
            client_writer,
            proxy: proxy.clone(),
            context,
            middleware: self.middleware.clone(),
            server_tls: self.server_tls.clone(),
            origin_tls: self.origin_tls.clone(),
            proxy_timeout,
            current: ParsedLine::default(),
            is_logged_in: false,
            tls_protocol: None,
            previous_tls_commands: Vec::new(),
            fatal: false,
        };

        let cancel = CancellationToken::new();
        let last_command = Arc::new(StdMutex::new(String::new()));

        let idle_timeout = (self.config.idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.config.idle_timeout_secs));

        let pump_handle = tokio::spawn({
            let proxy = proxy.clone();
            let cancel = cancel.clone();
            async move { pump_loop(proxy, cancel).await }
        });

        let cmd_handle = tokio::spawn({
            let cancel = cancel.clone();
            let last_command = last_command.clone();
            async move { command_loop(session, idle_timeout, last_command, cancel).await }
        });

        let pump_result = match pump_handle.await {
            Ok(res) => res,
            Err(join_err) => Err(ProxyError::Other(anyhow!("pump task panicked: {join_err}"))),
        };

        cancel.cancel();
        let _ = cmd_handle.await;

        proxy.close().await;

        match pump_result {
            Ok(()) => Ok(()),
            Err(ProxyError::Eof) => {
                if last_command.lock().unwrap().as_str() == "QUIT" {
                    Ok(())
                } else {
                    Err(anyhow!("idle timeout from origin"))
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn pump_loop(proxy: Arc<ProxyLeg>, cancel: CancellationToken) -> Result<(), ProxyError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = proxy.response_proxy() => res?,
        }
    }
}

struct CounterGuard(Arc<AtomicI64>);

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TlsConfig};
    use crate::middleware::MiddlewareRegistry;
    use crate::tls::test_support::build_pair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// A connected loopback pair: `.0` is driven by the test as the FTP
    /// client, `.1` is handed to `ClientHandler::handle` as the accepted
    /// socket.
    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dial, accept) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (dial.unwrap(), accept.unwrap().0)
    }

    fn test_config(remote_addr: String, idle_timeout_secs: u64) -> Config {
        Config {
            listen_addr: "127.0.0.1:0".to_string(),
            idle_timeout_secs,
            proxy_timeout_secs: 5,
            proxy_protocol: false,
            remote_addr,
            tls: TlsConfig {
                ca_file: String::new(),
                server_cert: String::new(),
                server_key: String::new(),
                client_cert: None,
                client_key: None,
            },
        }
    }

    /// Counter pre-seeded to 1, mimicking the acceptor having already
    /// incremented it before spawning, so the invariant under test is "back
    /// to 0 after exit", not "started and stayed at 0".
    fn spawn_handler(
        remote_addr: String,
        idle_timeout_secs: u64,
        middleware: MiddlewareRegistry,
        proxy_side: TcpStream,
    ) -> (tokio::task::JoinHandle<anyhow::Result<()>>, Arc<AtomicI64>) {
        let (server_tls, origin_tls) = build_pair();
        let counter = Arc::new(AtomicI64::new(1));
        let handler = ClientHandler::new(
            1,
            Arc::new(test_config(remote_addr, idle_timeout_secs)),
            Arc::new(middleware),
            Arc::new(server_tls),
            Arc::new(origin_tls),
            counter.clone(),
        );
        let join = tokio::spawn(handler.handle(proxy_side, "203.0.113.9:4242".to_string()));
        (join, counter)
    }

    async fn read_exact_len(sock: &mut TcpStream, expected: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; expected.len()];
        sock.read_exact(&mut buf).await.unwrap();
        buf
    }

    async fn expect(sock: &mut TcpStream, expected: &[u8]) {
        let got = read_exact_len(sock, expected).await;
        assert_eq!(got, expected);
    }

    /// Drives `QUIT` to completion on `sock` (the current origin side) and
    /// the matching close on `client`, for tests that don't otherwise care
    /// about teardown.
    async fn finish_with_quit(client: &mut TcpStream, origin: &mut TcpStream) {
        client.write_all(b"QUIT\r\n").await.unwrap();
        expect(origin, b"QUIT\r\n").await;
        origin.write_all(b"221 Goodbye\r\n").await.unwrap();
        expect(client, b"221 Goodbye\r\n").await;
    }

    #[tokio::test]
    async fn quit_passthrough_closes_cleanly() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap().to_string();

        let (mut client_side, proxy_side) = connected_pair().await;
        let (join, counter) = spawn_handler(origin_addr, 0, MiddlewareRegistry::new(), proxy_side);

        let (mut origin_sock, _) = origin_listener.accept().await.unwrap();

        client_side.write_all(b"QUIT\r\n").await.unwrap();
        expect(&mut origin_sock, b"QUIT\r\n").await;

        origin_sock.write_all(b"221 Goodbye\r\n").await.unwrap();
        expect(&mut client_side, b"221 Goodbye\r\n").await;
        drop(origin_sock);

        assert!(join.await.unwrap().is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 0, "live-connection counter should return to its pre-accept value");
    }

    #[tokio::test]
    async fn unknown_verb_is_forwarded_byte_exact() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap().to_string();

        let (mut client_side, proxy_side) = connected_pair().await;
        let (join, _counter) = spawn_handler(origin_addr, 0, MiddlewareRegistry::new(), proxy_side);

        let (mut origin_sock, _) = origin_listener.accept().await.unwrap();

        client_side.write_all(b"NOOP\r\n").await.unwrap();
        expect(&mut origin_sock, b"NOOP\r\n").await;

        origin_sock.write_all(b"200 OK\r\n").await.unwrap();
        expect(&mut client_side, b"200 OK\r\n").await;

        finish_with_quit(&mut client_side, &mut origin_sock).await;
        drop(origin_sock);
        assert!(join.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn pass_redaction_keeps_password_out_of_logs() {
        #[derive(Clone, Default)]
        struct Captured(Arc<StdMutex<Vec<u8>>>);

        impl std::io::Write for Captured {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
            type Writer = Captured;
            fn make_writer(&'a self) -> Self::Writer {
                self.clone()
            }
        }

        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_max_level(tracing::Level::INFO)
            .finish();
        // `#[tokio::test]` defaults to a current-thread runtime, so this
        // thread-local default also covers the handler's two spawned tasks.
        let _guard = tracing::subscriber::set_default(subscriber);

        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap().to_string();

        let (mut client_side, proxy_side) = connected_pair().await;
        let (join, _counter) = spawn_handler(origin_addr, 0, MiddlewareRegistry::new(), proxy_side);

        let (mut origin_sock, _) = origin_listener.accept().await.unwrap();

        client_side.write_all(b"PASS hunter2\r\n").await.unwrap();
        expect(&mut origin_sock, b"PASS hunter2\r\n").await;

        origin_sock.write_all(b"230 Logged in\r\n").await.unwrap();
        expect(&mut client_side, b"230 Logged in\r\n").await;

        finish_with_quit(&mut client_side, &mut origin_sock).await;
        drop(origin_sock);
        assert!(join.await.unwrap().is_ok());

        let text = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(!text.contains("hunter2"), "log leaked the password: {text}");
        assert!(text.contains("PASS ********"), "log missing redacted marker: {text}");
    }

    #[tokio::test]
    async fn middleware_retarget_switches_origin_before_forwarding_user() {
        let origin1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin1_addr = origin1.local_addr().unwrap().to_string();
        let origin2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin2_addr = origin2.local_addr().unwrap().to_string();

        let mut middleware = MiddlewareRegistry::new();
        let retarget = origin2_addr.clone();
        middleware.use_verb("USER", move |ctx, _param| {
            let retarget = retarget.clone();
            async move {
                ctx.lock().unwrap().remote_addr = retarget;
                Ok(())
            }
        });

        let (mut client_side, proxy_side) = connected_pair().await;
        let (join, _counter) = spawn_handler(origin1_addr, 0, middleware, proxy_side);

        // Held alive (named binding) for the whole test: dropping it early
        // would surface as a premature EOF on the still-active origin pump.
        let (_origin1_sock, _) = origin1.accept().await.unwrap();

        client_side.write_all(b"USER alice\r\n").await.unwrap();

        let (mut origin2_sock, _) = origin2.accept().await.unwrap();
        expect(&mut origin2_sock, b"USER alice\r\n").await;

        origin2_sock.write_all(b"230 Logged in\r\n").await.unwrap();
        expect(&mut client_side, b"230 Logged in\r\n").await;

        finish_with_quit(&mut client_side, &mut origin2_sock).await;
        drop(origin2_sock);
        assert!(join.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn auth_pbsz_prot_replay_order_survives_origin_switch() {
        let origin1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin1_addr = origin1.local_addr().unwrap().to_string();
        let origin2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin2_addr = origin2.local_addr().unwrap().to_string();

        let mut middleware = MiddlewareRegistry::new();
        let retarget = origin2_addr.clone();
        middleware.use_verb("USER", move |ctx, _param| {
            let retarget = retarget.clone();
            async move {
                ctx.lock().unwrap().remote_addr = retarget;
                Ok(())
            }
        });

        let (mut client_side, proxy_side) = connected_pair().await;
        let (join, _counter) = spawn_handler(origin1_addr, 0, middleware, proxy_side);

        let (mut origin1_sock, _) = origin1.accept().await.unwrap();

        // AUTH gets a non-234/334 reply so no real TLS handshake is
        // triggered; this test is only about replay order, not the
        // handshake itself (see tls.rs for real handshake coverage).
        client_side.write_all(b"AUTH TLS\r\n").await.unwrap();
        expect(&mut origin1_sock, b"AUTH TLS\r\n").await;
        origin1_sock.write_all(b"502 not supported\r\n").await.unwrap();
        expect(&mut client_side, b"502 not supported\r\n").await;

        client_side.write_all(b"PBSZ 0\r\n").await.unwrap();
        expect(&mut origin1_sock, b"PBSZ 0\r\n").await;
        origin1_sock.write_all(b"200 PBSZ=0\r\n").await.unwrap();
        expect(&mut client_side, b"200 PBSZ=0\r\n").await;

        client_side.write_all(b"PROT P\r\n").await.unwrap();
        expect(&mut origin1_sock, b"PROT P\r\n").await;
        origin1_sock.write_all(b"200 PROT P\r\n").await.unwrap();
        expect(&mut client_side, b"200 PROT P\r\n").await;

        client_side.write_all(b"USER alice\r\n").await.unwrap();

        let (mut origin2_sock, _) = origin2.accept().await.unwrap();
        expect(&mut origin2_sock, b"AUTH TLS\r\n").await;
        origin2_sock.write_all(b"200 AUTH ok\r\n").await.unwrap();

        expect(&mut origin2_sock, b"PBSZ 0\r\n").await;
        origin2_sock.write_all(b"200 PBSZ=0\r\n").await.unwrap();

        expect(&mut origin2_sock, b"PROT P\r\n").await;
        origin2_sock.write_all(b"200 PROT P\r\n").await.unwrap();

        expect(&mut origin2_sock, b"USER alice\r\n").await;
        origin2_sock.write_all(b"230 Logged in\r\n").await.unwrap();
        expect(&mut client_side, b"230 Logged in\r\n").await;

        finish_with_quit(&mut client_side, &mut origin2_sock).await;
        drop(origin2_sock);
        assert!(join.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn idle_timeout_sends_421_and_closes_client_socket() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap().to_string();

        let (mut client_side, proxy_side) = connected_pair().await;
        let (_join, _counter) = spawn_handler(origin_addr, 1, MiddlewareRegistry::new(), proxy_side);
        // Held alive so the pump doesn't observe a premature EOF while the
        // client leg's idle timer is what's actually under test.
        let (_origin_sock, _) = origin_listener.accept().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1200)).await;

        expect(&mut client_side, b"421 command timeout : closing control connection\r\n").await;

        // The close in `ReadOutcome::Timeout` is explicit, not incidental:
        // confirm the socket is actually shut down, not just left dangling.
        let mut probe = [0u8; 1];
        let n = client_side.read(&mut probe).await.unwrap();
        assert_eq!(n, 0, "client socket should be closed after the timeout reply");
    }
}
