//! The `QuicTransport` trait: everything the session core asks of a QUIC
//! implementation.
//!
//! The trait is sans-IO in the same sense the rest of the stack is: no
//! method blocks, and the transport's own events (new stream, readable,
//! write-ready, delivery ack) are delivered *to* the session by whoever
//! drives the connection, not through this trait.

use bytes::Bytes;

use crate::error::TransportError;
use crate::types::{ErrorCode, FlowControlState, StreamId, StreamTransportInfo, TransportInfo};

pub trait QuicTransport {
    /// Open a new locally-initiated bidirectional stream.
    fn create_bidi_stream(&mut self) -> Result<StreamId, TransportError>;

    /// Open a new locally-initiated unidirectional stream.
    fn create_uni_stream(&mut self) -> Result<StreamId, TransportError>;

    /// Append `data` to the stream's send buffer, optionally capping the
    /// stream with FIN. Returns the number of bytes accepted; the caller
    /// retains anything beyond that. FIN is recorded only when every byte
    /// was accepted.
    fn write_chain(
        &mut self,
        id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<usize, TransportError>;

    /// Read up to `max` buffered ingress bytes. Returns the data and whether
    /// the read reached the end of the stream.
    fn read(&mut self, id: StreamId, max: usize) -> Result<(Bytes, bool), TransportError>;

    /// The contiguous unconsumed ingress prefix of the stream, without
    /// consuming it.
    fn peek(&self, id: StreamId) -> Result<&[u8], TransportError>;

    /// Discard `n` bytes from the front of the stream's ingress buffer.
    fn consume(&mut self, id: StreamId, n: usize) -> Result<(), TransportError>;

    /// Abort the sending half of the stream.
    fn reset_stream(&mut self, id: StreamId, code: ErrorCode) -> Result<(), TransportError>;

    /// Ask the peer to stop sending on the stream.
    fn stop_sending(&mut self, id: StreamId, code: ErrorCode) -> Result<(), TransportError>;

    /// Drop interest in further read/peek events for the stream.
    fn clear_stream_callbacks(&mut self, id: StreamId);

    /// Mark a stream as connection-critical (its loss kills the connection).
    fn set_control_stream(&mut self, id: StreamId) -> Result<(), TransportError>;

    /// Current flow control state for one stream.
    fn stream_flow_control(&self, id: StreamId) -> Result<FlowControlState, TransportError>;

    /// Next write offset for the stream (bytes handed to the transport).
    fn stream_write_offset(&self, id: StreamId) -> Result<u64, TransportError>;

    /// Bytes accepted by the transport but not yet packetized.
    fn stream_write_buffered(&self, id: StreamId) -> Result<u64, TransportError>;

    /// Request an acknowledgement callback once every byte up to `offset`
    /// has been delivered to (and acked by) the peer. The driver reports it
    /// back through the session's `on_delivery_ack` / `on_delivery_canceled`.
    fn register_delivery_callback(
        &mut self,
        id: StreamId,
        offset: u64,
    ) -> Result<(), TransportError>;

    /// Ask to be woken with `on_connection_write_ready` when the connection
    /// can egress again.
    fn notify_pending_write(&mut self);

    /// Partial reliability: declare egress bytes below `offset` expired.
    /// Returns the stream offset actually in effect.
    fn send_data_expired(&mut self, id: StreamId, offset: u64) -> Result<u64, TransportError>;

    /// Partial reliability: reject ingress bytes below `offset`.
    /// Returns the stream offset actually in effect.
    fn send_data_rejected(&mut self, id: StreamId, offset: u64) -> Result<u64, TransportError>;

    /// Close the connection, optionally with an application error.
    fn close(&mut self, error: Option<(ErrorCode, String)>);

    fn transport_info(&self) -> TransportInfo;

    fn stream_transport_info(&self, id: StreamId)
    -> Result<StreamTransportInfo, TransportError>;
}
