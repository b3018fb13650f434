//! Control stream state.
//!
//! A control stream is identified by its unidirectional type tag, not by a
//! stream id: the egress id exists from session setup, the ingress id is
//! bound late by the dispatcher once the peer's preface arrives. The
//! CONTROL/H1Q_CONTROL types carry HTTP/3 frames; the QPACK types carry
//! table instructions handled by the shared QPACK state.

use bytes::BytesMut;
use hqline_transport::{StreamId, UniStreamType};

use crate::error::CodecError;
use crate::frame::{self, Frame};

pub struct ControlStream {
    pub stream_type: UniStreamType,
    pub ingress_id: Option<StreamId>,
    pub egress_id: Option<StreamId>,
    pub read_buf: BytesMut,
    pub read_eof: bool,
    pub write_buf: BytesMut,
    /// CONTROL ingress: SETTINGS seen (must be the first frame).
    pub seen_settings: bool,
    /// Offsets at which GOAWAY delivery callbacks were registered.
    pub goaway_delivery_offsets: Vec<u64>,
    pub bytes_written: u64,
}

impl ControlStream {
    pub fn new(stream_type: UniStreamType) -> Self {
        ControlStream {
            stream_type,
            ingress_id: None,
            egress_id: None,
            read_buf: BytesMut::new(),
            read_eof: false,
            write_buf: BytesMut::new(),
            seen_settings: false,
            goaway_delivery_offsets: Vec::new(),
            bytes_written: 0,
        }
    }

    /// Whether this type carries HTTP/3 frames (vs QPACK instructions).
    pub fn is_frame_stream(&self) -> bool {
        matches!(
            self.stream_type,
            UniStreamType::Control | UniStreamType::H1qControl
        )
    }

    /// Decode complete control frames from the read buffer.
    ///
    /// Enforces the CONTROL ordering rules: the first frame must be
    /// SETTINGS, and SETTINGS must not repeat. The legacy H1Q control
    /// stream carries no SETTINGS and skips the first-frame rule.
    pub fn decode_frames(&mut self) -> Result<Vec<Frame>, CodecError> {
        let mut frames = Vec::new();
        loop {
            if self.read_buf.is_empty() {
                break;
            }
            let (frame, consumed) = match frame::decode_frame(&self.read_buf)? {
                Some(v) => v,
                None => break,
            };
            let _ = self.read_buf.split_to(consumed);

            if self.stream_type == UniStreamType::Control {
                match &frame {
                    Frame::Settings(_) => {
                        if self.seen_settings {
                            return Err(CodecError::DuplicateSettings);
                        }
                        self.seen_settings = true;
                    }
                    Frame::Unknown { .. } => {
                        // Unknown frames are ignored, but do not satisfy the
                        // SETTINGS-first requirement.
                    }
                    _ => {
                        if !self.seen_settings {
                            return Err(CodecError::MissingSettings);
                        }
                    }
                }
            }

            match frame {
                Frame::Data { .. } | Frame::Headers { .. } | Frame::PushPromise { .. } => {
                    return Err(CodecError::FrameUnexpected);
                }
                Frame::Unknown { .. } => {}
                other => frames.push(other),
            }
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::HqSettings;

    fn feed(cs: &mut ControlStream, frame: &Frame) {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        cs.read_buf.extend_from_slice(&buf);
    }

    #[test]
    fn settings_must_come_first() {
        let mut cs = ControlStream::new(UniStreamType::Control);
        feed(&mut cs, &Frame::GoAway { stream_id: 0 });
        assert!(matches!(
            cs.decode_frames(),
            Err(CodecError::MissingSettings)
        ));
    }

    #[test]
    fn duplicate_settings_rejected() {
        let mut cs = ControlStream::new(UniStreamType::Control);
        feed(&mut cs, &Frame::Settings(HqSettings::default()));
        feed(&mut cs, &Frame::Settings(HqSettings::default()));
        assert!(matches!(
            cs.decode_frames(),
            Err(CodecError::DuplicateSettings)
        ));
    }

    #[test]
    fn settings_then_goaway_parsed() {
        let mut cs = ControlStream::new(UniStreamType::Control);
        feed(&mut cs, &Frame::Settings(HqSettings::default()));
        feed(&mut cs, &Frame::GoAway { stream_id: 8 });
        let frames = cs.decode_frames().unwrap();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], Frame::GoAway { stream_id: 8 }));
    }

    #[test]
    fn h1q_control_needs_no_settings() {
        let mut cs = ControlStream::new(UniStreamType::H1qControl);
        feed(&mut cs, &Frame::GoAway { stream_id: 4 });
        let frames = cs.decode_frames().unwrap();
        assert!(matches!(frames[0], Frame::GoAway { stream_id: 4 }));
    }

    #[test]
    fn partial_frame_left_buffered() {
        let mut cs = ControlStream::new(UniStreamType::Control);
        let mut buf = Vec::new();
        Frame::Settings(HqSettings::default()).encode(&mut buf);
        cs.read_buf.extend_from_slice(&buf[..1]);
        assert!(cs.decode_frames().unwrap().is_empty());
        cs.read_buf.extend_from_slice(&buf[1..]);
        assert_eq!(cs.decode_frames().unwrap().len(), 1);
    }

    #[test]
    fn headers_on_control_stream_rejected() {
        let mut cs = ControlStream::new(UniStreamType::Control);
        feed(&mut cs, &Frame::Settings(HqSettings::default()));
        feed(
            &mut cs,
            &Frame::Headers {
                encoded: vec![0, 0],
            },
        );
        assert!(matches!(
            cs.decode_frames(),
            Err(CodecError::FrameUnexpected)
        ));
    }
}
