//! Egress scheduling across request streams.
//!
//! Streams with pending egress sit in one of eight urgency buckets
//! (RFC 9218 shape: 0 is most urgent, 7 least; new streams default to 3).
//! Each write opportunity drains buckets in urgency order, FIFO within a
//! bucket, and hands the caller a `(stream, share_ratio)` list; the ratio
//! is an equal split among the streams of the same bucket.

use hqline_transport::StreamId;

pub const DEFAULT_URGENCY: u8 = 3;
const LEVELS: usize = 8;

#[derive(Default)]
pub struct EgressQueue {
    levels: [Vec<StreamId>; LEVELS],
    len: usize,
}

impl EgressQueue {
    pub fn new() -> Self {
        EgressQueue::default()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.levels.iter().any(|level| level.contains(&id))
    }

    /// Add a stream at the given urgency. Re-enqueuing an already-queued
    /// stream is a no-op (its position is kept).
    pub fn enqueue(&mut self, id: StreamId, urgency: u8) {
        if self.contains(id) {
            return;
        }
        let level = (urgency as usize).min(LEVELS - 1);
        self.levels[level].push(id);
        self.len += 1;
    }

    /// Remove a stream wherever it is queued.
    pub fn remove(&mut self, id: StreamId) {
        for level in &mut self.levels {
            if let Some(pos) = level.iter().position(|s| *s == id) {
                level.remove(pos);
                self.len -= 1;
                return;
            }
        }
    }

    /// Move a stream to a new urgency, keeping it queued.
    pub fn update_urgency(&mut self, id: StreamId, urgency: u8) {
        if self.contains(id) {
            self.remove(id);
            self.enqueue(id, urgency);
        }
    }

    /// Produce the next egress set: every queued stream in priority order
    /// with its share of the write budget.
    pub fn next_egress(&self, out: &mut Vec<(StreamId, f64)>) {
        out.clear();
        for level in &self.levels {
            if level.is_empty() {
                continue;
            }
            let ratio = 1.0 / level.len() as f64;
            for &id in level {
                out.push((id, ratio));
            }
        }
    }

    /// Rotate a stream to the back of its bucket after it was serviced, so
    /// same-urgency streams round-robin across write opportunities.
    pub fn rotate(&mut self, id: StreamId) {
        for level in &mut self.levels {
            if let Some(pos) = level.iter().position(|s| *s == id) {
                let id = level.remove(pos);
                level.push(id);
                return;
            }
        }
    }

    /// Drain every queued stream id.
    pub fn clear(&mut self) -> Vec<StreamId> {
        let mut out = Vec::with_capacity(self.len);
        for level in &mut self.levels {
            out.append(level);
        }
        self.len = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgency_order_and_shares() {
        let mut q = EgressQueue::new();
        q.enqueue(StreamId(8), 3);
        q.enqueue(StreamId(0), 1);
        q.enqueue(StreamId(4), 3);

        let mut out = Vec::new();
        q.next_egress(&mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].0, StreamId(0));
        assert_eq!(out[0].1, 1.0);
        assert_eq!(out[1].0, StreamId(8));
        assert_eq!(out[1].1, 0.5);
        assert_eq!(out[2].0, StreamId(4));
    }

    #[test]
    fn enqueue_is_idempotent() {
        let mut q = EgressQueue::new();
        q.enqueue(StreamId(0), 3);
        q.enqueue(StreamId(0), 3);
        assert_eq!(q.len(), 1);
        q.remove(StreamId(0));
        assert!(q.is_empty());
        q.remove(StreamId(0));
        assert!(q.is_empty());
    }

    #[test]
    fn rotate_round_robins_within_bucket() {
        let mut q = EgressQueue::new();
        q.enqueue(StreamId(0), 3);
        q.enqueue(StreamId(4), 3);
        q.rotate(StreamId(0));

        let mut out = Vec::new();
        q.next_egress(&mut out);
        assert_eq!(out[0].0, StreamId(4));
        assert_eq!(out[1].0, StreamId(0));
    }

    #[test]
    fn update_urgency_requeues() {
        let mut q = EgressQueue::new();
        q.enqueue(StreamId(0), 3);
        q.enqueue(StreamId(4), 3);
        q.update_urgency(StreamId(4), 0);

        let mut out = Vec::new();
        q.next_egress(&mut out);
        assert_eq!(out[0].0, StreamId(4));
    }
}
