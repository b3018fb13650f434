//! Byte-event tracking for egress delivery reporting.
//!
//! Events are registered at the exact stream offset where they occur and
//! fired once that offset is observably flushed to the transport or
//! acknowledged by the peer.

/// What happened at a tracked offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteEventKind {
    /// First byte of the header section reached the transport.
    FirstHeaderByteFlushed,
    /// First body byte reached the transport.
    FirstBodyByteFlushed,
    /// The final byte of the message reached the transport.
    LastByteFlushed,
    /// The header section was acknowledged (partial reliability).
    LastHeaderByteAcked,
    /// A tracked body offset was acknowledged (partial reliability).
    BodyByteAcked,
    /// The final byte of the message was acknowledged.
    LastByteAcked,
}

impl ByteEventKind {
    fn fires_on_ack(self) -> bool {
        matches!(
            self,
            ByteEventKind::LastHeaderByteAcked
                | ByteEventKind::BodyByteAcked
                | ByteEventKind::LastByteAcked
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ByteEvent {
    pub offset: u64,
    pub kind: ByteEventKind,
}

/// Ordered pending byte events for one stream.
#[derive(Default)]
pub struct ByteEventTracker {
    pending: Vec<ByteEvent>,
}

impl ByteEventTracker {
    pub fn add(&mut self, offset: u64, kind: ByteEventKind) {
        self.pending.push(ByteEvent { offset, kind });
    }

    /// Fire flush events with offsets at or below the committed offset.
    pub fn process_flushed(&mut self, committed: u64) -> Vec<ByteEvent> {
        self.take(|e| !e.kind.fires_on_ack() && e.offset <= committed)
    }

    /// Fire ack events with offsets at or below the acknowledged offset.
    pub fn process_acked(&mut self, acked: u64) -> Vec<ByteEvent> {
        self.take(|e| e.kind.fires_on_ack() && e.offset <= acked)
    }

    /// Drop every pending event (stream aborted).
    pub fn cancel_all(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take(&mut self, matches: impl Fn(&ByteEvent) -> bool) -> Vec<ByteEvent> {
        let mut fired: Vec<ByteEvent> = Vec::new();
        self.pending.retain(|e| {
            if matches(e) {
                fired.push(*e);
                false
            } else {
                true
            }
        });
        fired.sort_by_key(|e| e.offset);
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_events_fire_in_offset_order() {
        let mut tracker = ByteEventTracker::default();
        tracker.add(10, ByteEventKind::FirstBodyByteFlushed);
        tracker.add(1, ByteEventKind::FirstHeaderByteFlushed);
        tracker.add(20, ByteEventKind::LastByteFlushed);

        let fired = tracker.process_flushed(10);
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].offset, 1);
        assert_eq!(fired[1].offset, 10);

        let fired = tracker.process_flushed(25);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, ByteEventKind::LastByteFlushed);
        assert!(tracker.is_empty());
    }

    #[test]
    fn ack_events_wait_for_ack() {
        let mut tracker = ByteEventTracker::default();
        tracker.add(5, ByteEventKind::LastByteAcked);
        assert!(tracker.process_flushed(100).is_empty());
        let fired = tracker.process_acked(5);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, ByteEventKind::LastByteAcked);
    }
}
