// ABOUTME: Crate-wide error types distinguishing the dispositions a session
// ABOUTME: can end in, per the error handling design

use std::io;
use thiserror::Error;

use crate::frame::CodecError;

/// Every way a session's life can end other than a clean `Closing` drain.
///
/// Every variant here destroys the session. The distinction exists so
/// logging and tests can tell *why* without string-matching.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("receive buffer would overflow")]
    RecvBufferOverflow,

    #[error(transparent)]
    Encode(#[from] CodecError),

    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] io::Error),

    #[error("I/O error on a child pipe: {0}")]
    PipeIo(#[source] io::Error),

    #[error("I/O error on the client socket: {0}")]
    SocketIo(#[source] io::Error),

    #[error("peer closed the connection")]
    PeerClosed,
}

impl SessionError {
    /// Whether this disposition should be logged at `error` (operational
    /// failure) rather than `warn` (a misbehaving or disconnecting peer).
    pub fn is_operational_failure(&self) -> bool {
        matches!(self, Self::Spawn(_) | Self::PipeIo(_))
    }
}
