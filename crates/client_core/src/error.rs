use thiserror::Error;

/// Failure taxonomy for the client-side synchronization core. Every variant
/// is absorbed at a component boundary (delivery marker or empty fallback);
/// none of them may tear down a room view.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("message body cannot be empty")]
    EmptyMessageBody,
    #[error("no live transport connection: {0}")]
    TransportUnavailable(String),
    #[error("durable write failed: {0}")]
    DurableWriteFailed(String),
    #[error("malformed server response: {0}")]
    MalformedServerResponse(String),
}
