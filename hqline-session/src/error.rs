use hqline_transport::{StreamId, TransportError};

/// Errors detected while parsing stream or control-stream bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected frame type for this stream")]
    FrameUnexpected,

    #[error("frame error")]
    FrameError,

    #[error("malformed PUSH_PROMISE frame")]
    MalformedPushPromise,

    #[error("control stream did not start with SETTINGS")]
    MissingSettings,

    #[error("second SETTINGS frame on control stream")]
    DuplicateSettings,

    #[error("qpack: {0}")]
    Qpack(#[from] crate::qpack::QpackError),

    #[error("malformed HTTP/1.1 message")]
    BadH1Message,
}

/// Terminal error kinds delivered to a transaction or reported with the
/// session's end. The retry contract lives here: `StreamUnacknowledged`
/// means no part of the request was processed and it is safe to retry;
/// `EarlyDataFailed` means retry without 0-RTT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    /// The transport failed underneath the session.
    ConnectionReset,
    /// The peer aborted this stream.
    StreamAbort,
    /// The peer rejected this stream before processing it; safe to retry.
    StreamUnacknowledged,
    /// 0-RTT data lost the race; retry without early data.
    EarlyDataFailed,
    /// Session setup failed (unknown ALPN, control stream creation).
    ConnectFailed,
    /// The connection was dropped locally.
    Dropped,
    /// A write to the transport failed.
    WriteError,
    /// A transaction timed out.
    Timeout,
    /// Codec-level protocol violation on this stream.
    ProtocolError,
    /// Session shut down while the transaction was in flight.
    ShutdownInProgress,
}

impl HttpError {
    /// Whether the failed request may be replayed on a new connection.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            HttpError::StreamUnacknowledged | HttpError::EarlyDataFailed
        )
    }
}

/// Errors returned by the session's public API.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport not ready")]
    NotReady,

    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),

    #[error("failed to create egress control streams")]
    ControlStreamCreation,

    #[error("session is draining")]
    Draining,

    #[error("session is closed")]
    Closed,

    #[error("unknown transaction on stream {0}")]
    UnknownTransaction(StreamId),

    #[error("egress already completed on stream {0}")]
    EgressComplete(StreamId),

    #[error("partial reliability not enabled")]
    PartialReliabilityDisabled,

    #[error("offset: {0}")]
    Offset(#[from] crate::prerel::OffsetError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}
