//! Unidirectional stream dispatcher.
//!
//! A peer-initiated unidirectional stream has no type until its preface
//! varint (and, for push streams, the push id that follows) has been read.
//! The dispatcher owns such streams, decoding prefaces from peeked bytes
//! which may arrive one byte at a time; the session then promotes each
//! stream to a typed control stream, binds it as a push stream, or rejects
//! it with STOP_SENDING.

use std::collections::BTreeSet;

use hqline_transport::{StreamId, UniStreamType};

use crate::frame::decode_varint;

/// What the peeked prefix of a pending stream resolved to.
#[derive(Debug, PartialEq, Eq)]
pub enum PrefaceOutcome {
    /// Not enough contiguous bytes yet; stay pending.
    Pending,
    /// A type the active profile recognizes. `consumed` covers the preface
    /// varint (and the push id for push streams).
    Recognized {
        stream_type: UniStreamType,
        push_id: Option<u64>,
        consumed: usize,
    },
    /// A preface the profile does not recognize.
    Unknown { preface: u64 },
}

/// Decode a stream preface from peeked bytes, given the profile's
/// recognizer.
pub fn decode_preface(
    peeked: &[u8],
    recognize: impl Fn(u64) -> Option<UniStreamType>,
) -> PrefaceOutcome {
    let (preface, n) = match decode_varint(peeked) {
        Some(v) => v,
        None => return PrefaceOutcome::Pending,
    };
    let stream_type = match recognize(preface) {
        Some(t) => t,
        None => return PrefaceOutcome::Unknown { preface },
    };
    if stream_type == UniStreamType::Push {
        // Push streams carry the push id immediately after the preface.
        match decode_varint(&peeked[n..]) {
            Some((push_id, m)) => PrefaceOutcome::Recognized {
                stream_type,
                push_id: Some(push_id),
                consumed: n + m,
            },
            None => PrefaceOutcome::Pending,
        }
    } else {
        PrefaceOutcome::Recognized {
            stream_type,
            push_id: None,
            consumed: n,
        }
    }
}

/// The set of unidirectional stream ids whose preface is still unread.
#[derive(Default)]
pub struct UniDispatcher {
    pending: BTreeSet<StreamId>,
}

impl UniDispatcher {
    pub fn take_ownership(&mut self, id: StreamId) {
        self.pending.insert(id);
    }

    pub fn owns(&self, id: StreamId) -> bool {
        self.pending.contains(&id)
    }

    pub fn release(&mut self, id: StreamId) -> bool {
        self.pending.remove(&id)
    }

    /// Drain every pending id; used exactly once at session teardown so
    /// each stream's callbacks are cleared exactly once.
    pub fn drain_pending(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_varint;

    fn h3_recognize(preface: u64) -> Option<UniStreamType> {
        match preface {
            0x00 => Some(UniStreamType::Control),
            0x01 => Some(UniStreamType::Push),
            0x02 => Some(UniStreamType::QpackEncoder),
            0x03 => Some(UniStreamType::QpackDecoder),
            _ => None,
        }
    }

    #[test]
    fn empty_peek_stays_pending() {
        assert_eq!(decode_preface(&[], h3_recognize), PrefaceOutcome::Pending);
    }

    #[test]
    fn control_preface_recognized() {
        assert_eq!(
            decode_preface(&[0x00, 0xff], h3_recognize),
            PrefaceOutcome::Recognized {
                stream_type: UniStreamType::Control,
                push_id: None,
                consumed: 1,
            }
        );
    }

    #[test]
    fn push_preface_waits_for_push_id() {
        // Type byte alone is not enough for a push stream.
        assert_eq!(decode_preface(&[0x01], h3_recognize), PrefaceOutcome::Pending);
        let mut buf = vec![0x01];
        encode_varint(&mut buf, 77);
        assert_eq!(
            decode_preface(&buf, h3_recognize),
            PrefaceOutcome::Recognized {
                stream_type: UniStreamType::Push,
                push_id: Some(77),
                consumed: buf.len(),
            }
        );
    }

    #[test]
    fn multibyte_preface_boundary() {
        // 0x40 starts a 2-byte varint; one byte is not enough.
        assert_eq!(decode_preface(&[0x40], h3_recognize), PrefaceOutcome::Pending);
        assert_eq!(
            decode_preface(&[0x40, 0x00], h3_recognize),
            PrefaceOutcome::Recognized {
                stream_type: UniStreamType::Control,
                push_id: None,
                consumed: 2,
            }
        );
    }

    #[test]
    fn unknown_preface_reported() {
        assert_eq!(
            decode_preface(&[0x21, 1, 2, 3, 4], h3_recognize),
            PrefaceOutcome::Unknown { preface: 0x21 }
        );
    }

    #[test]
    fn drain_pending_is_idempotent() {
        let mut d = UniDispatcher::default();
        d.take_ownership(StreamId(3));
        d.take_ownership(StreamId(7));
        assert_eq!(d.drain_pending().len(), 2);
        assert!(d.drain_pending().is_empty());
    }
}
