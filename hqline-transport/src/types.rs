//! Stream identifiers, wire error codes, and transport-level info types.

use std::fmt;
use std::time::Duration;

/// The largest value representable in a QUIC variable-length integer
/// (RFC 9000 Section 16): 2^62 - 1.
pub const VARINT_MAX: u64 = (1 << 62) - 1;

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connection initiator; transactions are locally created.
    Client,
    /// Connection acceptor; transactions arrive on peer streams.
    Server,
}

/// A QUIC stream id (RFC 9000 Section 2.1).
///
/// The two low bits encode initiator and directionality:
/// `0x0` client bidi, `0x1` server bidi, `0x2` client uni, `0x3` server uni.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_bidi(self) -> bool {
        self.0 & 0x2 == 0
    }

    pub fn is_uni(self) -> bool {
        self.0 & 0x2 != 0
    }

    pub fn is_client_initiated(self) -> bool {
        self.0 & 0x1 == 0
    }

    pub fn is_server_initiated(self) -> bool {
        self.0 & 0x1 != 0
    }

    /// True when `role` is the peer that initiated this stream.
    pub fn initiated_by(self, role: Role) -> bool {
        match role {
            Role::Client => self.is_client_initiated(),
            Role::Server => self.is_server_initiated(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StreamId {
    fn from(v: u64) -> Self {
        StreamId(v)
    }
}

/// Unidirectional stream type tags carried in the stream preface varint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UniStreamType {
    /// HTTP/3 control stream (0x00).
    Control,
    /// HTTP/3 server push stream (0x01).
    Push,
    /// QPACK encoder stream (0x02).
    QpackEncoder,
    /// QPACK decoder stream (0x03).
    QpackDecoder,
    /// Legacy framed HTTP/1-over-QUIC control stream.
    H1qControl,
}

impl UniStreamType {
    pub fn preface(self) -> u64 {
        match self {
            UniStreamType::Control => 0x00,
            UniStreamType::Push => 0x01,
            UniStreamType::QpackEncoder => 0x02,
            UniStreamType::QpackDecoder => 0x03,
            UniStreamType::H1qControl => 0x04,
        }
    }
}

impl fmt::Display for UniStreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UniStreamType::Control => "control",
            UniStreamType::Push => "push",
            UniStreamType::QpackEncoder => "qpack-encoder",
            UniStreamType::QpackDecoder => "qpack-decoder",
            UniStreamType::H1qControl => "h1q-control",
        };
        f.write_str(s)
    }
}

/// Application error codes used on the wire.
///
/// These are the draft-era HTTP/3 error codes the legacy version profiles
/// speak; `GiveupZeroRtt` is a reserved application code signalling that the
/// QUIC attempt lost the race against TCP and 0-RTT data must be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    HttpNoError,
    HttpWrongStream,
    HttpWrongStreamCount,
    HttpClosedCriticalStream,
    HttpRequestCancelled,
    HttpRequestRejected,
    HttpInternalError,
    HttpUnknownStreamType,
    HttpMalformedFramePushPromise,
    GiveupZeroRtt,
}

impl ErrorCode {
    pub fn to_wire(self) -> u64 {
        match self {
            ErrorCode::HttpNoError => 0x00,
            ErrorCode::HttpInternalError => 0x03,
            ErrorCode::HttpRequestCancelled => 0x05,
            ErrorCode::HttpWrongStream => 0x0a,
            ErrorCode::HttpUnknownStreamType => 0x0d,
            ErrorCode::HttpWrongStreamCount => 0x0e,
            ErrorCode::HttpClosedCriticalStream => 0x0f,
            ErrorCode::HttpRequestRejected => 0x14,
            // MALFORMED_FRAME codes are 0x01XX with XX the frame type;
            // PUSH_PROMISE is frame type 0x05.
            ErrorCode::HttpMalformedFramePushPromise => 0x0105,
            ErrorCode::GiveupZeroRtt => 0xf2,
        }
    }

    pub fn from_wire(v: u64) -> Option<Self> {
        match v {
            0x00 => Some(ErrorCode::HttpNoError),
            0x03 => Some(ErrorCode::HttpInternalError),
            0x05 => Some(ErrorCode::HttpRequestCancelled),
            0x0a => Some(ErrorCode::HttpWrongStream),
            0x0d => Some(ErrorCode::HttpUnknownStreamType),
            0x0e => Some(ErrorCode::HttpWrongStreamCount),
            0x0f => Some(ErrorCode::HttpClosedCriticalStream),
            0x14 => Some(ErrorCode::HttpRequestRejected),
            0x0105 => Some(ErrorCode::HttpMalformedFramePushPromise),
            0xf2 => Some(ErrorCode::GiveupZeroRtt),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} (0x{:x})", self.to_wire())
    }
}

/// The error surfaced by a stream read failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The peer reset the stream with an application error code.
    Reset(ErrorCode),
    /// The peer reset the stream with a code outside [`ErrorCode`].
    ResetRaw(u64),
    /// A local transport error (socket closed, internal failure).
    Local { no_error: bool },
    /// A QUIC transport-level error.
    Transport(String),
}

/// Flow control state for one stream, as reported by the transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowControlState {
    /// Bytes the peer will currently accept on this stream.
    pub send_window_available: u64,
    /// Bytes we advertise willingness to receive.
    pub receive_window_available: u64,
}

/// Connection-level transport information.
#[derive(Debug, Clone, Default)]
pub struct TransportInfo {
    pub rtt: Duration,
    pub rtt_var: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_retransmitted: u64,
}

/// Per-stream transport information.
#[derive(Debug, Clone, Default)]
pub struct StreamTransportInfo {
    /// Total bytes the peer has acknowledged on this stream.
    pub bytes_acked: u64,
    /// Bytes written to the transport but not yet acknowledged.
    pub bytes_in_flight: u64,
    /// Holb (head-of-line blocking) events observed on the stream.
    pub holb_count: u32,
    /// Total time the stream spent head-of-line blocked.
    pub total_holb_time: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_bits() {
        assert!(StreamId(0).is_bidi());
        assert!(StreamId(0).is_client_initiated());
        assert!(StreamId(1).is_server_initiated());
        assert!(StreamId(2).is_uni());
        assert!(StreamId(3).is_uni());
        assert!(StreamId(3).is_server_initiated());
        assert!(StreamId(4).is_bidi());
        assert!(StreamId(0).initiated_by(Role::Client));
        assert!(!StreamId(0).initiated_by(Role::Server));
    }

    #[test]
    fn error_code_wire_round_trip() {
        let codes = [
            ErrorCode::HttpNoError,
            ErrorCode::HttpWrongStream,
            ErrorCode::HttpWrongStreamCount,
            ErrorCode::HttpClosedCriticalStream,
            ErrorCode::HttpRequestCancelled,
            ErrorCode::HttpRequestRejected,
            ErrorCode::HttpInternalError,
            ErrorCode::HttpUnknownStreamType,
            ErrorCode::HttpMalformedFramePushPromise,
            ErrorCode::GiveupZeroRtt,
        ];
        for code in codes {
            assert_eq!(ErrorCode::from_wire(code.to_wire()), Some(code));
        }
        assert_eq!(ErrorCode::from_wire(0x4242), None);
    }
}
