//! A boxed duplex stream so either leg of the bridge can be upgraded from
//! plain TCP to TLS in-band without changing the type of everything above it.

use tokio::io::{AsyncRead, AsyncWrite};

/// Blanket-implemented for anything that can stand in as a connection leg.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A connection leg whose concrete type (plain TCP vs. TLS) can change at
/// runtime, following an in-band `AUTH TLS` upgrade.
pub type BoxedStream = Box<dyn Stream>;
