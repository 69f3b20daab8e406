//! Errors raised by the RPC layer.

use tandem_types::error::TandemError;
use thiserror::Error;

/// Errors from the wire transport.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Unknown message type tag: {0}")]
    UnknownMessageType(u8),
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),
    #[error(transparent)]
    Lost(#[from] ConnectionLost),
}

/// A call that was sent but never answered because its connection failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Connection to {worker} lost: {reason}")]
pub struct ConnectionLost {
    /// Name of the destination worker.
    pub worker: String,
    pub reason: String,
}

impl ConnectionLost {
    pub fn new(worker: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            reason: reason.into(),
        }
    }
}

/// Error type for the RPC layer, wrapping the shared taxonomy.
#[derive(Debug, Error)]
pub enum RpcError {
    /// A wrapped TandemError.
    #[error(transparent)]
    Tandem(#[from] TandemError),

    /// A transport failure.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Tandem(TandemError::from(e))
    }
}

impl From<ConnectionLost> for RpcError {
    fn from(e: ConnectionLost) -> Self {
        RpcError::Wire(WireError::Lost(e))
    }
}

impl RpcError {
    /// The remote error text, if this error came from the destination's
    /// computation failing.
    pub fn remote_text(&self) -> Option<&str> {
        match self {
            RpcError::Tandem(TandemError::RemoteError(text)) => Some(text),
            _ => None,
        }
    }

    /// Whether the call failed in transport rather than on the destination.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Wire(_))
    }
}

/// Alias for RPC results.
pub type RpcResult<T> = Result<T, RpcError>;
