use crate::types::StreamId;

/// Errors returned by [`QuicTransport`](crate::QuicTransport) operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("stream {0} already finished")]
    StreamFinished(StreamId),

    #[error("stream limit reached")]
    StreamLimitReached,

    #[error("wrong direction for operation on stream {0}")]
    WrongDirection(StreamId),

    #[error("partial reliability not supported by this transport")]
    PartialReliabilityUnsupported,

    #[error("transport internal: {0}")]
    Internal(String),
}
