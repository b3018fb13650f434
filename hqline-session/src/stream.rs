//! Per-transaction request stream state.
//!
//! A request stream owns its codec chain, an ingress read buffer, an
//! egress write buffer of already-framed bytes, and a deferred body queue
//! of bytes the application handed over but the scheduler has not yet
//! framed (the framing happens inside the flow-control budget, so a
//! window-blocked stream defers raw body instead of ballooning the write
//! buffer).

use std::collections::VecDeque;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use hqline_transport::StreamId;

use crate::byte_event::{ByteEventKind, ByteEventTracker};
use crate::codec::StreamCodec;
use crate::prerel::BodyOffsetTracker;
use crate::scheduler::DEFAULT_URGENCY;

pub struct RequestStream {
    pub id: StreamId,
    pub codec: StreamCodec,

    // Ingress.
    pub read_buf: BytesMut,
    pub read_eof: bool,
    /// Ingress stream bytes consumed by the codec so far.
    pub bytes_read: u64,
    pub ingress_started: bool,
    pub ingress_complete: bool,
    pub ingress_error: bool,
    /// QPACK insert count this stream's header block is blocked on.
    pub blocked_at_insert_count: Option<u64>,
    /// Push id, for ingress push streams bound by the dispatcher.
    pub ingress_push_id: Option<u64>,

    // Egress.
    pub write_buf: BytesMut,
    pub deferred_body: VecDeque<Bytes>,
    pub pending_eom: bool,
    pub headers_sent: bool,
    pub eom_written: bool,
    pub egress_complete: bool,
    pub egress_paused: bool,
    /// Out of the ready queue until a flow-control update reopens the
    /// stream window.
    pub flow_blocked: bool,
    /// Arm `Connection: close` on the next serialized head (h1q drain).
    pub egress_close_header: bool,
    pub bytes_written: u64,

    // Delivery tracking.
    pub byte_events: ByteEventTracker,
    pub pending_byte_event_count: u32,
    first_body_byte_tracked: bool,

    // Partial reliability.
    pub offset_tracker: Option<BodyOffsetTracker>,

    // Lifecycle.
    pub detached: bool,
    pub terminal_event_sent: bool,
    pub urgency: u8,
    pub created: Instant,
}

impl RequestStream {
    pub fn new(id: StreamId, codec: StreamCodec) -> Self {
        RequestStream {
            id,
            codec,
            read_buf: BytesMut::new(),
            read_eof: false,
            bytes_read: 0,
            ingress_started: false,
            ingress_complete: false,
            ingress_error: false,
            blocked_at_insert_count: None,
            ingress_push_id: None,
            write_buf: BytesMut::new(),
            deferred_body: VecDeque::new(),
            pending_eom: false,
            headers_sent: false,
            eom_written: false,
            egress_complete: false,
            egress_paused: false,
            flow_blocked: false,
            egress_close_header: false,
            bytes_written: 0,
            byte_events: ByteEventTracker::default(),
            pending_byte_event_count: 0,
            first_body_byte_tracked: false,
            offset_tracker: None,
            detached: false,
            terminal_event_sent: false,
            urgency: DEFAULT_URGENCY,
            created: Instant::now(),
        }
    }

    /// Total egress bytes generated so far (committed plus buffered).
    pub fn egress_offset(&self) -> u64 {
        self.bytes_written + self.write_buf.len() as u64
    }

    pub fn has_pending_body(&self) -> bool {
        self.deferred_body.iter().any(|b| !b.is_empty())
    }

    pub fn deferred_body_len(&self) -> usize {
        self.deferred_body.iter().map(Bytes::len).sum()
    }

    pub fn has_pending_egress(&self) -> bool {
        !self.write_buf.is_empty() || self.has_pending_body() || self.pending_eom
    }

    /// Whether the scheduler should invite this stream to frame more body:
    /// either window remains beyond what is already buffered and body is
    /// deferred, or only the EOM is left to flush.
    pub fn wants_write_invitation(&self, can_send: usize) -> bool {
        (can_send > self.write_buf.len() && self.has_pending_body())
            || (!self.has_pending_body() && self.pending_eom)
    }

    /// Frame deferred body into the write buffer, spending at most
    /// `max_bytes` of window (framing overhead included).
    pub fn fill_write_buf(&mut self, max_bytes: usize) {
        let mut budget = max_bytes;
        while budget > 0 {
            let overhead = self.codec.body_overhead();
            if budget <= overhead {
                break;
            }
            let mut chunk = match self.deferred_body.pop_front() {
                Some(c) => c,
                None => break,
            };
            let take = chunk.len().min(budget - overhead);
            let payload = chunk.split_to(take);
            if !chunk.is_empty() {
                self.deferred_body.push_front(chunk);
            }
            if payload.is_empty() {
                break;
            }

            let mut framed = Vec::with_capacity(payload.len() + overhead);
            self.codec.generate_body(&payload, &mut framed);
            let frame_overhead = framed.len() - payload.len();

            if !self.first_body_byte_tracked {
                self.first_body_byte_tracked = true;
                let first_payload_offset = self.egress_offset() + frame_overhead as u64 + 1;
                self.byte_events
                    .add(first_payload_offset, ByteEventKind::FirstBodyByteFlushed);
                if self.offset_tracker.is_some() {
                    let egress_body_offset = self.egress_offset() + frame_overhead as u64;
                    self.offset_tracker
                        .as_mut()
                        .unwrap()
                        .start_egress_body(egress_body_offset);
                }
            }
            self.write_buf.extend_from_slice(&framed);
            budget -= framed.len().min(budget);
        }
    }

    /// Both directions done and nothing is holding the transaction open.
    pub fn check_detach_ready(&mut self) {
        if self.detached {
            return;
        }
        let ingress_done = self.ingress_complete || self.ingress_error;
        let egress_done = self.egress_complete;
        if ingress_done && egress_done && self.pending_byte_event_count == 0 {
            // Ack events are armed together with the pending counter and
            // fire or cancel before it reaches zero.
            debug_assert!(
                self.byte_events.is_empty(),
                "stream {} detaching with pending byte events",
                self.id
            );
            self.detached = true;
        }
    }

    /// Invariant: a stream is reaped only once fully drained.
    pub fn eligible_for_destruction(&self) -> bool {
        self.detached
            && self.read_buf.is_empty()
            && self.write_buf.is_empty()
            && !self.pending_eom
    }

    /// Drop all egress state after an abort. Outstanding delivery
    /// callbacks are considered canceled: the reset supersedes them.
    pub fn abort_egress(&mut self) {
        self.write_buf.clear();
        self.deferred_body.clear();
        self.pending_eom = false;
        self.egress_complete = true;
        self.byte_events.cancel_all();
        self.pending_byte_event_count = 0;
    }

    /// Drop all ingress state after an abort.
    pub fn abort_ingress(&mut self) {
        self.read_buf.clear();
        self.read_eof = true;
        self.ingress_error = true;
        self.blocked_at_insert_count = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StreamCodec;

    fn framed_stream() -> RequestStream {
        RequestStream::new(StreamId(0), StreamCodec::framed(false))
    }

    #[test]
    fn fill_respects_budget() {
        let mut stream = framed_stream();
        stream.deferred_body.push_back(Bytes::from_static(&[0x42; 100]));
        stream.fill_write_buf(50);
        // Budget covers framing overhead plus payload.
        assert!(stream.write_buf.len() <= 50);
        assert!(stream.has_pending_body());
    }

    #[test]
    fn fill_consumes_all_when_budget_allows() {
        let mut stream = framed_stream();
        stream.deferred_body.push_back(Bytes::from_static(b"hello"));
        stream.fill_write_buf(1024);
        assert!(!stream.has_pending_body());
        // DATA frame header (2 bytes) + payload.
        assert_eq!(stream.write_buf.len(), 7);
    }

    #[test]
    fn tiny_budget_frames_nothing() {
        let mut stream = framed_stream();
        stream.deferred_body.push_back(Bytes::from_static(b"hello"));
        stream.fill_write_buf(2);
        assert!(stream.write_buf.is_empty());
        assert_eq!(stream.deferred_body_len(), 5);
    }

    #[test]
    fn detach_waits_for_byte_events() {
        let mut stream = framed_stream();
        stream.ingress_complete = true;
        stream.egress_complete = true;
        stream.pending_byte_event_count = 1;
        stream.check_detach_ready();
        assert!(!stream.detached);
        stream.pending_byte_event_count = 0;
        stream.check_detach_ready();
        assert!(stream.detached);
        assert!(stream.eligible_for_destruction());
    }

    #[test]
    fn pending_eom_blocks_destruction() {
        let mut stream = framed_stream();
        stream.detached = true;
        stream.pending_eom = true;
        assert!(!stream.eligible_for_destruction());
    }
}
