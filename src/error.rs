//! Error types for the server.

use std::io;

/// Errors surfaced by connections and server setup.
///
/// `WouldBlock` never appears here; transient readiness is handled inside
/// the buffers and state machine. Anything that reaches this enum terminates
/// the connection (or, for `Config`, the process).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fatal socket error (anything other than would-block).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A request did not fit within the receive buffer capacity.
    #[error("request too large for receive buffer")]
    RequestTooLarge,

    /// A formatted message exceeded the staging scratch buffer.
    #[error("formatted message too large")]
    MessageTooLarge,

    /// Configuration could not be loaded or parsed.
    #[error("config error: {0}")]
    Config(String),
}
