//! Uniform reply value produced by intercepted-verb handlers.

use tracing::debug;

use crate::client_writer::ClientWriter;

/// A reply a handler wants sent to the client.
///
/// `None` (as returned from a handler) means the handler already managed the
/// client-facing exchange itself and no further reply should be synthesized.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub message: String,
}

impl Reply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Reply {
            code,
            message: message.into(),
        }
    }

    pub fn internal_error(err: impl std::fmt::Display) -> Self {
        Reply::new(500, format!("Internal error: {err}"))
    }

    /// Write this reply to the client leg, logging at debug level.
    pub async fn respond(&self, client_writer: &ClientWriter) -> std::io::Result<()> {
        debug!(code = self.code, message = %self.message, "send to client");
        client_writer.write_reply(self.code, &self.message).await
    }
}
