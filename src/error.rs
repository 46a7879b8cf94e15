//! Error types for per-connection control flow.
//!
//! Setup code (config loading, TLS construction, the acceptor bind) stays on
//! plain `anyhow::Result` for `?`-propagation to `main`. Inside a connection,
//! callers need to branch on *kind* of failure (EOF vs. timeout vs. fatal),
//! so that flow uses [`ProxyError`] instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The peer closed the connection cleanly.
    #[error("connection closed")]
    Eof,

    /// No data arrived within the configured idle/proxy timeout.
    #[error("timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn is_eof(&self) -> bool {
        matches!(self, ProxyError::Eof)
    }
}
