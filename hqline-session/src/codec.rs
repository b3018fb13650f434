//! Per-request-stream codecs.
//!
//! A request stream owns one [`StreamCodec`]: the framed HTTP/3 variant
//! (frames + QPACK field sections) or the HTTP/1.1 variant used by the
//! legacy h1q profiles. Codecs are sans-io: `decode` consumes from a caller
//! buffer and emits [`CodecEvent`]s; `generate_*` append wire bytes for the
//! egress buffer.

use bytes::Bytes;

use crate::error::CodecError;
use crate::frame::{self, Frame};
use crate::h1::{self, H1Head};
use crate::qpack::{DecodeOutcome, HeaderField, QpackState};

/// Message events a codec reports to the session.
#[derive(Debug)]
pub enum CodecEvent {
    /// A complete header section.
    Headers(Vec<HeaderField>),
    /// A chunk of body bytes.
    Body(Bytes),
    /// A trailing header section.
    Trailers(Vec<HeaderField>),
    /// End of message.
    MessageComplete,
    /// A push promise embedded in the parent stream.
    PushPromise {
        push_id: u64,
        fields: Vec<HeaderField>,
    },
    /// The peer signalled `Connection: close` (unframed h1q drain).
    ConnectionCloseSeen,
}

/// Result of one `decode` pass.
#[derive(Debug, Default)]
pub struct DecodeResult {
    /// Bytes consumed from the front of the caller's buffer.
    pub consumed: usize,
    pub events: Vec<CodecEvent>,
    /// Set when a header block references QPACK entries not yet received;
    /// the unconsumed bytes must be re-offered once the insert count
    /// reaches this value.
    pub blocked_at_insert_count: Option<u64>,
    /// Buffer offset just past the message head, when the head completed
    /// in this pass (body offset bookkeeping).
    pub head_consumed: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageStage {
    WaitingHeaders,
    Body,
    Trailers,
    Complete,
}

/// Framed (HTTP/3) request-stream codec.
pub struct FramedCodec {
    stage: MessageStage,
    /// Promises may only arrive on peer-initiated exchanges toward a client.
    accept_push_promise: bool,
}

impl FramedCodec {
    fn decode(
        &mut self,
        qpack: &mut QpackState,
        stream_id: u64,
        buf: &[u8],
        eof: bool,
    ) -> Result<DecodeResult, CodecError> {
        let mut result = DecodeResult::default();

        loop {
            let rest = &buf[result.consumed..];
            if rest.is_empty() {
                break;
            }
            let (frame, len) = match frame::decode_frame(rest)? {
                Some(v) => v,
                None => {
                    if eof {
                        return Err(CodecError::FrameError);
                    }
                    break;
                }
            };

            match frame {
                Frame::Headers { encoded } => {
                    match qpack.decode_field_section(stream_id, &encoded)? {
                        DecodeOutcome::Blocked {
                            required_insert_count,
                        } => {
                            result.blocked_at_insert_count = Some(required_insert_count);
                            return Ok(result);
                        }
                        DecodeOutcome::Fields(fields) => match self.stage {
                            MessageStage::WaitingHeaders => {
                                self.stage = MessageStage::Body;
                                result.head_consumed = Some(result.consumed + len);
                                result.events.push(CodecEvent::Headers(fields));
                            }
                            MessageStage::Body => {
                                self.stage = MessageStage::Trailers;
                                result.events.push(CodecEvent::Trailers(fields));
                            }
                            _ => return Err(CodecError::FrameUnexpected),
                        },
                    }
                }
                Frame::Data { payload } => {
                    if self.stage != MessageStage::Body {
                        return Err(CodecError::FrameUnexpected);
                    }
                    result.events.push(CodecEvent::Body(Bytes::from(payload)));
                }
                Frame::PushPromise { push_id, encoded } => {
                    if !self.accept_push_promise {
                        return Err(CodecError::MalformedPushPromise);
                    }
                    match qpack.decode_field_section(stream_id, &encoded)? {
                        DecodeOutcome::Blocked {
                            required_insert_count,
                        } => {
                            result.blocked_at_insert_count = Some(required_insert_count);
                            return Ok(result);
                        }
                        DecodeOutcome::Fields(fields) => {
                            result.events.push(CodecEvent::PushPromise { push_id, fields });
                        }
                    }
                }
                Frame::Unknown { .. } => {}
                // Control-plane frames never appear on request streams.
                Frame::Settings(_)
                | Frame::GoAway { .. }
                | Frame::CancelPush { .. }
                | Frame::MaxPushId { .. }
                | Frame::PriorityUpdate { .. } => {
                    return Err(CodecError::FrameUnexpected);
                }
            }
            result.consumed += len;
        }

        if eof && result.consumed == buf.len() && self.stage != MessageStage::Complete {
            if self.stage != MessageStage::WaitingHeaders {
                result.events.push(CodecEvent::MessageComplete);
            }
            self.stage = MessageStage::Complete;
        }
        Ok(result)
    }
}

/// HTTP/1.1 request-stream codec (legacy h1q profiles).
pub struct H1Codec {
    /// Parses requests when true (server side), responses otherwise.
    parse_requests: bool,
    stage: MessageStage,
    /// Body bytes still expected from Content-Length, when known.
    body_remaining: Option<u64>,
}

impl H1Codec {
    fn decode(&mut self, buf: &[u8], eof: bool) -> Result<DecodeResult, CodecError> {
        let mut result = DecodeResult::default();

        if self.stage == MessageStage::WaitingHeaders {
            match h1::find_end_of_headers(buf) {
                None => {
                    if eof && !buf.is_empty() {
                        return Err(CodecError::BadH1Message);
                    }
                    // Head incomplete; an empty stream capped by FIN is just
                    // a closed stream, not a message.
                    return Ok(result);
                }
                Some(end) => {
                    let head: H1Head = if self.parse_requests {
                        h1::parse_request_head(&buf[..end])?
                    } else {
                        h1::parse_response_head(&buf[..end])?
                    };
                    result.consumed = end;
                    result.head_consumed = Some(end);
                    self.body_remaining = head.content_length;
                    self.stage = MessageStage::Body;
                    if head.connection_close {
                        result.events.push(CodecEvent::ConnectionCloseSeen);
                    }
                    result.events.push(CodecEvent::Headers(head.fields));
                }
            }
        }

        if self.stage == MessageStage::Body {
            let rest = &buf[result.consumed..];
            let take = match self.body_remaining {
                Some(remaining) => rest.len().min(remaining as usize),
                None => rest.len(),
            };
            if take > 0 {
                result
                    .events
                    .push(CodecEvent::Body(Bytes::copy_from_slice(&rest[..take])));
                result.consumed += take;
                if let Some(remaining) = &mut self.body_remaining {
                    *remaining -= take as u64;
                }
            }
            let length_done = self.body_remaining == Some(0);
            if length_done || (eof && result.consumed == buf.len()) {
                result.events.push(CodecEvent::MessageComplete);
                self.stage = MessageStage::Complete;
            }
        }

        Ok(result)
    }
}

/// The codec chain installed on one request stream.
pub enum StreamCodec {
    Framed(FramedCodec),
    H1(H1Codec),
}

impl StreamCodec {
    pub fn framed(accept_push_promise: bool) -> Self {
        StreamCodec::Framed(FramedCodec {
            stage: MessageStage::WaitingHeaders,
            accept_push_promise,
        })
    }

    pub fn h1(parse_requests: bool) -> Self {
        StreamCodec::H1(H1Codec {
            parse_requests,
            stage: MessageStage::WaitingHeaders,
            body_remaining: None,
        })
    }

    /// Consume ingress bytes, emitting message events.
    pub fn decode(
        &mut self,
        qpack: Option<&mut QpackState>,
        stream_id: u64,
        buf: &[u8],
        eof: bool,
    ) -> Result<DecodeResult, CodecError> {
        match self {
            StreamCodec::Framed(codec) => {
                let qpack = qpack.expect("framed codec requires qpack state");
                codec.decode(qpack, stream_id, buf, eof)
            }
            StreamCodec::H1(codec) => codec.decode(buf, eof),
        }
    }

    /// Serialize a header section into `out`. `close` arms the h1q
    /// `Connection: close` drain signal and is ignored by the framed codec.
    pub fn generate_headers(
        &mut self,
        qpack: Option<&QpackState>,
        fields: &[HeaderField],
        close: bool,
        out: &mut Vec<u8>,
    ) {
        match self {
            StreamCodec::Framed(_) => {
                let qpack = qpack.expect("framed codec requires qpack state");
                let encoded = qpack.encode_field_section(fields);
                Frame::Headers { encoded }.encode(out);
            }
            StreamCodec::H1(_) => h1::serialize_head(fields, close, out),
        }
    }

    /// Serialize a body chunk into `out`.
    pub fn generate_body(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        match self {
            StreamCodec::Framed(_) => {
                frame::encode_frame_header(out, frame::FRAME_DATA, payload.len() as u64);
                out.extend_from_slice(payload);
            }
            StreamCodec::H1(_) => out.extend_from_slice(payload),
        }
    }

    /// Worst-case framing overhead for one body chunk.
    pub fn body_overhead(&self) -> usize {
        match self {
            // Frame type varint (1) + length varint (up to 8).
            StreamCodec::Framed(_) => 9,
            StreamCodec::H1(_) => 0,
        }
    }

    /// Serialize a trailer section. The h1q codecs carry no trailers.
    pub fn generate_trailers(
        &mut self,
        qpack: Option<&QpackState>,
        fields: &[HeaderField],
        out: &mut Vec<u8>,
    ) {
        match self {
            StreamCodec::Framed(_) => {
                let qpack = qpack.expect("framed codec requires qpack state");
                let encoded = qpack.encode_field_section(fields);
                Frame::Headers { encoded }.encode(out);
            }
            StreamCodec::H1(_) => {}
        }
    }

    /// Serialize a push promise on the parent stream (framed only).
    pub fn generate_push_promise(
        &mut self,
        qpack: Option<&QpackState>,
        push_id: u64,
        fields: &[HeaderField],
        out: &mut Vec<u8>,
    ) {
        match self {
            StreamCodec::Framed(_) => {
                let qpack = qpack.expect("framed codec requires qpack state");
                let encoded = qpack.encode_field_section(fields);
                Frame::PushPromise { push_id, encoded }.encode(out);
            }
            StreamCodec::H1(_) => {}
        }
    }

    /// Serialize a chunk header (h1 chunked encoding; no-op when framed,
    /// DATA frames already delimit).
    pub fn generate_chunk_header(&mut self, len: u64, out: &mut Vec<u8>) {
        if let StreamCodec::H1(_) = self {
            h1::serialize_chunk_header(len, out);
        }
    }

    /// Serialize a chunk terminator.
    pub fn generate_chunk_terminator(&mut self, out: &mut Vec<u8>) {
        if let StreamCodec::H1(_) = self {
            h1::serialize_chunk_terminator(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_fields() -> Vec<HeaderField> {
        vec![
            HeaderField::new(b":method".as_slice(), b"GET".as_slice()),
            HeaderField::new(b":path".as_slice(), b"/".as_slice()),
        ]
    }

    #[test]
    fn framed_request_round_trip() {
        let mut qpack = QpackState::new(0);
        let mut egress = StreamCodec::framed(false);
        let mut wire = Vec::new();
        egress.generate_headers(Some(&qpack), &request_fields(), false, &mut wire);
        egress.generate_body(b"hello", &mut wire);

        let mut ingress = StreamCodec::framed(false);
        let result = ingress
            .decode(Some(&mut qpack), 0, &wire, true)
            .unwrap();
        assert_eq!(result.consumed, wire.len());
        assert!(matches!(result.events[0], CodecEvent::Headers(_)));
        match &result.events[1] {
            CodecEvent::Body(b) => assert_eq!(&b[..], b"hello"),
            other => panic!("expected body, got {other:?}"),
        }
        assert!(matches!(result.events[2], CodecEvent::MessageComplete));
    }

    #[test]
    fn framed_data_before_headers_rejected() {
        let mut qpack = QpackState::new(0);
        let mut wire = Vec::new();
        Frame::Data {
            payload: b"x".to_vec(),
        }
        .encode(&mut wire);
        let mut ingress = StreamCodec::framed(false);
        assert!(matches!(
            ingress.decode(Some(&mut qpack), 0, &wire, false),
            Err(CodecError::FrameUnexpected)
        ));
    }

    #[test]
    fn framed_trailers_after_body() {
        let mut qpack = QpackState::new(0);
        let mut egress = StreamCodec::framed(false);
        let mut wire = Vec::new();
        egress.generate_headers(Some(&qpack), &request_fields(), false, &mut wire);
        egress.generate_body(b"b", &mut wire);
        let trailers = vec![HeaderField::new(b"x-check".as_slice(), b"ok".as_slice())];
        egress.generate_trailers(Some(&qpack), &trailers, &mut wire);

        let mut ingress = StreamCodec::framed(false);
        let result = ingress.decode(Some(&mut qpack), 0, &wire, true).unwrap();
        assert!(matches!(result.events[2], CodecEvent::Trailers(_)));
        assert!(matches!(result.events[3], CodecEvent::MessageComplete));
    }

    #[test]
    fn framed_partial_frame_waits() {
        let mut qpack = QpackState::new(0);
        let mut egress = StreamCodec::framed(false);
        let mut wire = Vec::new();
        egress.generate_headers(Some(&qpack), &request_fields(), false, &mut wire);
        let mut ingress = StreamCodec::framed(false);
        let result = ingress
            .decode(Some(&mut qpack), 0, &wire[..wire.len() - 1], false)
            .unwrap();
        assert_eq!(result.consumed, 0);
        assert!(result.events.is_empty());
    }

    #[test]
    fn h1_request_round_trip() {
        let mut egress = StreamCodec::h1(true);
        let mut wire = Vec::new();
        let fields = vec![
            HeaderField::new(b":method".as_slice(), b"POST".as_slice()),
            HeaderField::new(b":path".as_slice(), b"/echo".as_slice()),
            HeaderField::new(b"content-length".as_slice(), b"4".as_slice()),
        ];
        egress.generate_headers(None, &fields, false, &mut wire);
        egress.generate_body(b"ping", &mut wire);

        let mut ingress = StreamCodec::h1(true);
        let result = ingress.decode(None, 0, &wire, false).unwrap();
        assert_eq!(result.consumed, wire.len());
        assert!(matches!(result.events[0], CodecEvent::Headers(_)));
        match &result.events[1] {
            CodecEvent::Body(b) => assert_eq!(&b[..], b"ping"),
            other => panic!("expected body, got {other:?}"),
        }
        // Content-Length satisfied: complete without FIN.
        assert!(matches!(result.events[2], CodecEvent::MessageComplete));
    }

    #[test]
    fn h1_connection_close_surfaces() {
        let mut egress = StreamCodec::h1(false);
        let mut wire = Vec::new();
        let fields = vec![HeaderField::new(b":status".as_slice(), b"200".as_slice())];
        egress.generate_headers(None, &fields, true, &mut wire);

        let mut ingress = StreamCodec::h1(false);
        let result = ingress.decode(None, 0, &wire, true).unwrap();
        assert!(matches!(result.events[0], CodecEvent::ConnectionCloseSeen));
    }
}
