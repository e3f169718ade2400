/// Failures the session coordinator can observe while running a conversation.
///
/// Every variant is recoverable at the session level: the coordinator records the
/// error, tears the session down and returns to `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("Audio capture device failed: {0}")]
    CaptureDevice(String),
    #[error("Failed to obtain a signed conversation URL: {0}")]
    SignalingFailure(String),
    #[error("Transport error: {0}")]
    TransportError(String),
    #[error("Renderer is not ready: {0}")]
    RendererPreconditionFailure(String),
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
}
