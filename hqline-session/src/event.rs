//! Application-facing session events.

use bytes::Bytes;
use hqline_transport::StreamId;

use crate::byte_event::ByteEventKind;
use crate::error::HttpError;
use crate::qpack::HeaderField;
use crate::settings::HqSettings;

/// Events produced by the session for the HTTP transaction layer.
///
/// Drained with [`HqSession::poll_event`](crate::session::HqSession::poll_event).
/// Per transaction, at most one terminal event is delivered: either
/// `MessageComplete` (clean) or `TxnError`.
#[derive(Debug)]
pub enum SessionEvent {
    /// The peer's SETTINGS arrived on the control stream.
    SettingsReceived { settings: HqSettings },

    /// A complete header section on a request or push stream.
    Headers {
        id: StreamId,
        fields: Vec<HeaderField>,
    },

    /// Body bytes on a request or push stream.
    Body { id: StreamId, data: Bytes },

    /// Trailing headers.
    Trailers {
        id: StreamId,
        fields: Vec<HeaderField>,
    },

    /// Clean end of the ingress message.
    MessageComplete { id: StreamId },

    /// A push promise received on its associated request stream.
    PushPromise {
        parent: StreamId,
        push_id: u64,
        fields: Vec<HeaderField>,
    },

    /// An ingress push stream bound to a previously promised push id.
    PushStreamBegin { id: StreamId, push_id: u64 },

    /// Terminal transaction failure.
    TxnError { id: StreamId, error: HttpError },

    /// The peer announced drain; streams above the id will not be serviced.
    GoawayReceived { last_good_stream_id: u64 },

    /// Egress backpressure toggled for one transaction.
    EgressPaused { id: StreamId },
    EgressResumed { id: StreamId },

    /// A tracked egress byte offset was flushed or acknowledged.
    ByteEvent {
        id: StreamId,
        kind: ByteEventKind,
        offset: u64,
    },

    /// The transport canceled delivery tracking for the stream's last byte.
    DeliveryCanceled { id: StreamId },

    /// Partial reliability: the peer expired ingress body below the offset.
    BodySkipped { id: StreamId, body_offset: u64 },

    /// Partial reliability: the peer rejected egress body below the offset.
    BodyRejected { id: StreamId, body_offset: u64 },

    /// The peer updated a request stream's priority.
    PriorityUpdated { id: StreamId, urgency: u8 },

    /// The session finished tearing down. Emitted exactly once.
    Destroyed { error: Option<HttpError> },
}
