//! The client socket's write half, shared between the command loop, the
//! origin-response pump, and middleware-driven error replies.
//!
//! Wrapped in `Option` so an in-band TLS upgrade can briefly take ownership
//! of the underlying half, reunite it with the read half, perform the
//! handshake, and put the new (TLS) half back.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufWriter, WriteHalf};
use tokio::sync::Mutex;

use crate::codec::{write_raw, write_reply};
use crate::stream::BoxedStream;

pub struct ClientWriter {
    inner: Mutex<Option<BufWriter<WriteHalf<BoxedStream>>>>,
}

impl ClientWriter {
    pub fn new(half: WriteHalf<BoxedStream>) -> Arc<Self> {
        Arc::new(ClientWriter {
            inner: Mutex::new(Some(BufWriter::new(half))),
        })
    }

    fn closed_err() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::NotConnected, "client writer closed")
    }

    pub async fn write_raw(&self, raw: &str) -> std::io::Result<()> {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(w) => write_raw(w, raw).await,
            None => Err(Self::closed_err()),
        }
    }

    pub async fn write_reply(&self, code: u16, message: &str) -> std::io::Result<()> {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(w) => write_reply(w, code, message).await,
            None => Err(Self::closed_err()),
        }
    }

    /// Take the write half out for a TLS upgrade, returning both the taken
    /// half and a lock guard the caller must hold (and refill via
    /// [`Self::restore`]) for the whole upgrade window, so no other write
    /// can interleave with the in-flight handshake.
    pub async fn take_for_upgrade(
        &self,
    ) -> (
        tokio::sync::MutexGuard<'_, Option<BufWriter<WriteHalf<BoxedStream>>>>,
        WriteHalf<BoxedStream>,
    ) {
        let mut guard = self.inner.lock().await;
        let writer = guard
            .take()
            .expect("client writer missing: concurrent TLS upgrades are not supported")
            .into_inner();
        (guard, writer)
    }

    /// Refill the writer slot after a successful (or aborted) upgrade.
    pub fn restore(
        guard: &mut tokio::sync::MutexGuard<'_, Option<BufWriter<WriteHalf<BoxedStream>>>>,
        half: WriteHalf<BoxedStream>,
    ) {
        **guard = Some(BufWriter::new(half));
    }

    pub async fn shutdown(&self) {
        if let Some(w) = self.inner.lock().await.as_mut() {
            let _ = w.shutdown().await;
        }
    }
}
