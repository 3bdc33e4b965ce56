use tandem_protocol::ProtocolError;
use thiserror::Error;

/// Failures surfaced by the relay. The `Display` text of request-level errors is what the
/// requester receives in an `ErrorResp`.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("room not found")]
    RoomNotFound,
    #[error("client {0} is not connected")]
    UnknownClient(String),
    #[error("expected a binary client hello")]
    HelloMissing,
    #[error("timed out waiting for client hello")]
    HelloTimeout,
    #[error("expected client hello, got {0}")]
    UnexpectedHello(&'static str),
    #[error("no inbound traffic for {0:?}")]
    ReadTimeout(std::time::Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("websocket error: {0}")]
    Transport(#[from] axum::Error),
}
