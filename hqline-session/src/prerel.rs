//! Partial-reliability body offset bookkeeping.
//!
//! Skip/reject operations are expressed in *body* offsets, while the
//! transport works in *stream* offsets. Header bytes consume stream bytes
//! but not body bytes, so the mapping is a fixed shift once the header
//! section length is known. Partially reliable streams carry their body
//! unframed after the head; skipped and rejected ranges appear as gaps in
//! the stream without consuming body bytes on the wire.

/// Errors from stream/body offset mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OffsetError {
    #[error("partial reliability not tracking this direction yet")]
    NotTracking,

    #[error("offset precedes the body")]
    OffsetBeforeBody,
}

/// Offset mapper for one partially reliable stream.
#[derive(Debug, Default)]
pub struct BodyOffsetTracker {
    /// Stream offset of the first egress body byte.
    egress_body_start: Option<u64>,
    /// Stream offset of the first ingress body byte.
    ingress_body_start: Option<u64>,
    /// Egress body bytes already committed to the transport; skips below
    /// this point are ignored.
    egress_committed_body: u64,
    /// Ingress body offset consumed or rejected so far.
    ingress_committed_body: u64,
}

impl BodyOffsetTracker {
    /// Record where the egress body begins (headers fully serialized).
    pub fn start_egress_body(&mut self, stream_offset: u64) {
        if self.egress_body_start.is_none() {
            self.egress_body_start = Some(stream_offset);
        }
    }

    /// Record where the ingress body begins (head fully parsed).
    pub fn start_ingress_body(&mut self, stream_offset: u64) {
        if self.ingress_body_start.is_none() {
            self.ingress_body_start = Some(stream_offset);
        }
    }

    pub fn egress_body_started(&self) -> bool {
        self.egress_body_start.is_some()
    }

    /// Translate an egress body offset to its stream offset.
    pub fn egress_body_to_stream(&self, body_offset: u64) -> Result<u64, OffsetError> {
        let start = self.egress_body_start.ok_or(OffsetError::NotTracking)?;
        Ok(start + body_offset)
    }

    /// Translate an ingress stream offset to a body offset.
    pub fn ingress_stream_to_body(&self, stream_offset: u64) -> Result<u64, OffsetError> {
        let start = self.ingress_body_start.ok_or(OffsetError::NotTracking)?;
        stream_offset
            .checked_sub(start)
            .ok_or(OffsetError::OffsetBeforeBody)
    }

    /// Translate an ingress body offset to its stream offset.
    pub fn ingress_body_to_stream(&self, body_offset: u64) -> Result<u64, OffsetError> {
        let start = self.ingress_body_start.ok_or(OffsetError::NotTracking)?;
        Ok(start + body_offset)
    }

    /// Advance the committed egress body offset. A skip target at or below
    /// the committed point is a no-op (returns 0 bytes to trim).
    pub fn advance_egress(&mut self, body_offset: u64) -> u64 {
        if body_offset <= self.egress_committed_body {
            return 0;
        }
        let delta = body_offset - self.egress_committed_body;
        self.egress_committed_body = body_offset;
        delta
    }

    pub fn egress_committed_body(&self) -> u64 {
        self.egress_committed_body
    }

    /// Advance the committed ingress body offset; rewinds are ignored.
    pub fn advance_ingress(&mut self, body_offset: u64) -> u64 {
        if body_offset <= self.ingress_committed_body {
            return 0;
        }
        let delta = body_offset - self.ingress_committed_body;
        self.ingress_committed_body = body_offset;
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_requires_body_start() {
        let tracker = BodyOffsetTracker::default();
        assert_eq!(
            tracker.egress_body_to_stream(0),
            Err(OffsetError::NotTracking)
        );
    }

    #[test]
    fn egress_mapping_shifts_by_header_len() {
        let mut tracker = BodyOffsetTracker::default();
        tracker.start_egress_body(120);
        assert_eq!(tracker.egress_body_to_stream(0), Ok(120));
        assert_eq!(tracker.egress_body_to_stream(512), Ok(632));
    }

    #[test]
    fn ingress_offset_before_body_rejected() {
        let mut tracker = BodyOffsetTracker::default();
        tracker.start_ingress_body(64);
        assert_eq!(tracker.ingress_stream_to_body(64), Ok(0));
        assert_eq!(tracker.ingress_stream_to_body(100), Ok(36));
        assert_eq!(
            tracker.ingress_stream_to_body(10),
            Err(OffsetError::OffsetBeforeBody)
        );
    }

    #[test]
    fn rewind_below_committed_is_ignored() {
        let mut tracker = BodyOffsetTracker::default();
        tracker.start_egress_body(0);
        assert_eq!(tracker.advance_egress(100), 100);
        // Rewinding is silently ignored and trims nothing.
        assert_eq!(tracker.advance_egress(50), 0);
        assert_eq!(tracker.advance_egress(100), 0);
        assert_eq!(tracker.egress_committed_body(), 100);
        assert_eq!(tracker.advance_egress(150), 50);
    }
}
