//! In-process loopback transport.
//!
//! `LoopbackTransport` implements [`QuicTransport`] entirely in memory, with
//! a scriptable peer side: tests inject peer-opened streams, peer bytes and
//! resets, inspect the exact bytes the session egressed, and decide when
//! delivery acknowledgements fire. There is no packetization and no loss;
//! written bytes are committed immediately, so `stream_write_buffered` is
//! always zero.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::TransportError;
use crate::traits::QuicTransport;
use crate::types::{
    ErrorCode, FlowControlState, Role, StreamId, StreamTransportInfo, TransportInfo,
};

const DEFAULT_SEND_WINDOW: u64 = 1 << 20;

#[derive(Default)]
struct LoopbackStream {
    // Ingress (peer -> session).
    recv: BytesMut,
    recv_fin: bool,
    // Egress (session -> peer).
    sent: BytesMut,
    fin_sent: bool,
    write_offset: u64,
    send_window: u64,
    // Wire actions the session took.
    reset_code: Option<ErrorCode>,
    stop_sending_code: Option<ErrorCode>,
    delivery_offsets: Vec<u64>,
    expired_at: Option<u64>,
    rejected_at: Option<u64>,
    is_control: bool,
    callbacks_cleared: bool,
}

impl LoopbackStream {
    fn new() -> Self {
        LoopbackStream {
            send_window: DEFAULT_SEND_WINDOW,
            ..Default::default()
        }
    }
}

pub struct LoopbackTransport {
    role: Role,
    streams: HashMap<StreamId, LoopbackStream>,
    next_local_bidi: u64,
    next_local_uni: u64,
    next_peer_bidi: u64,
    next_peer_uni: u64,
    closed: Option<Option<(ErrorCode, String)>>,
    write_ready_requested: bool,
    uni_streams_allowed: u64,
    fail_delivery_registration: bool,
}

impl LoopbackTransport {
    pub fn new(role: Role) -> Self {
        let (local_bidi, local_uni, peer_bidi, peer_uni) = match role {
            Role::Client => (0, 2, 1, 3),
            Role::Server => (1, 3, 0, 2),
        };
        LoopbackTransport {
            role,
            streams: HashMap::new(),
            next_local_bidi: local_bidi,
            next_local_uni: local_uni,
            next_peer_bidi: peer_bidi,
            next_peer_uni: peer_uni,
            closed: None,
            write_ready_requested: false,
            uni_streams_allowed: u64::MAX,
            fail_delivery_registration: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    // ── Peer-side scripting (test API) ──────────────────────────────

    /// Simulate the peer opening a bidirectional stream.
    pub fn peer_open_bidi(&mut self) -> StreamId {
        let id = StreamId(self.next_peer_bidi);
        self.next_peer_bidi += 4;
        self.streams.insert(id, LoopbackStream::new());
        id
    }

    /// Simulate the peer opening a unidirectional stream.
    pub fn peer_open_uni(&mut self) -> StreamId {
        let id = StreamId(self.next_peer_uni);
        self.next_peer_uni += 4;
        self.streams.insert(id, LoopbackStream::new());
        id
    }

    /// Deliver peer bytes on an existing stream.
    pub fn peer_write(&mut self, id: StreamId, data: &[u8], fin: bool) {
        let stream = self.streams.entry(id).or_insert_with(LoopbackStream::new);
        stream.recv.extend_from_slice(data);
        stream.recv_fin |= fin;
    }

    /// Cap the peer's stream without further data.
    pub fn peer_fin(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.recv_fin = true;
        }
    }

    /// Restrict how many uni streams `create_uni_stream` will allow.
    pub fn limit_uni_streams(&mut self, n: u64) {
        self.uni_streams_allowed = n;
    }

    /// Set the peer-granted send window for one stream.
    pub fn set_send_window(&mut self, id: StreamId, window: u64) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.send_window = window;
        }
    }

    /// Make `register_delivery_callback` fail, to exercise the session's
    /// registration-failure path.
    pub fn fail_delivery_registration(&mut self, fail: bool) {
        self.fail_delivery_registration = fail;
    }

    // ── Egress inspection (test API) ────────────────────────────────

    /// Everything the session has written on the stream so far.
    pub fn written(&self, id: StreamId) -> &[u8] {
        self.streams.get(&id).map(|s| &s.sent[..]).unwrap_or(&[])
    }

    /// Drain and return the bytes written on the stream.
    pub fn take_written(&mut self, id: StreamId) -> Bytes {
        match self.streams.get_mut(&id) {
            Some(s) => s.sent.split().freeze(),
            None => Bytes::new(),
        }
    }

    pub fn fin_written(&self, id: StreamId) -> bool {
        self.streams.get(&id).is_some_and(|s| s.fin_sent)
    }

    pub fn reset_code(&self, id: StreamId) -> Option<ErrorCode> {
        self.streams.get(&id).and_then(|s| s.reset_code)
    }

    pub fn stop_sending_code(&self, id: StreamId) -> Option<ErrorCode> {
        self.streams.get(&id).and_then(|s| s.stop_sending_code)
    }

    /// Unconsumed ingress bytes still buffered for the session.
    pub fn ingress_buffered(&self, id: StreamId) -> usize {
        self.streams.get(&id).map(|s| s.recv.len()).unwrap_or(0)
    }

    pub fn delivery_offsets(&self, id: StreamId) -> &[u64] {
        self.streams
            .get(&id)
            .map(|s| &s.delivery_offsets[..])
            .unwrap_or(&[])
    }

    pub fn data_expired_at(&self, id: StreamId) -> Option<u64> {
        self.streams.get(&id).and_then(|s| s.expired_at)
    }

    pub fn data_rejected_at(&self, id: StreamId) -> Option<u64> {
        self.streams.get(&id).and_then(|s| s.rejected_at)
    }

    pub fn closed_with(&self) -> Option<&Option<(ErrorCode, String)>> {
        self.closed.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Whether the session asked for another write-ready notification, and
    /// reset the flag.
    pub fn take_write_ready_request(&mut self) -> bool {
        std::mem::take(&mut self.write_ready_requested)
    }

    fn stream(&self, id: StreamId) -> Result<&LoopbackStream, TransportError> {
        self.streams.get(&id).ok_or(TransportError::UnknownStream(id))
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut LoopbackStream, TransportError> {
        self.streams
            .get_mut(&id)
            .ok_or(TransportError::UnknownStream(id))
    }
}

impl QuicTransport for LoopbackTransport {
    fn create_bidi_stream(&mut self) -> Result<StreamId, TransportError> {
        if self.closed.is_some() {
            return Err(TransportError::ConnectionClosed);
        }
        let id = StreamId(self.next_local_bidi);
        self.next_local_bidi += 4;
        self.streams.insert(id, LoopbackStream::new());
        Ok(id)
    }

    fn create_uni_stream(&mut self) -> Result<StreamId, TransportError> {
        if self.closed.is_some() {
            return Err(TransportError::ConnectionClosed);
        }
        if self.uni_streams_allowed == 0 {
            return Err(TransportError::StreamLimitReached);
        }
        self.uni_streams_allowed -= 1;
        let id = StreamId(self.next_local_uni);
        self.next_local_uni += 4;
        self.streams.insert(id, LoopbackStream::new());
        Ok(id)
    }

    fn write_chain(
        &mut self,
        id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<usize, TransportError> {
        if self.closed.is_some() {
            return Err(TransportError::ConnectionClosed);
        }
        let stream = self.stream_mut(id)?;
        if stream.fin_sent {
            return Err(TransportError::StreamFinished(id));
        }
        let accepted = data.len().min(stream.send_window as usize);
        stream.sent.extend_from_slice(&data[..accepted]);
        stream.send_window -= accepted as u64;
        stream.write_offset += accepted as u64;
        if fin && accepted == data.len() {
            stream.fin_sent = true;
        }
        Ok(accepted)
    }

    fn read(&mut self, id: StreamId, max: usize) -> Result<(Bytes, bool), TransportError> {
        let stream = self.stream_mut(id)?;
        let n = stream.recv.len().min(max);
        let data = stream.recv.split_to(n).freeze();
        let eof = stream.recv_fin && stream.recv.is_empty();
        Ok((data, eof))
    }

    fn peek(&self, id: StreamId) -> Result<&[u8], TransportError> {
        Ok(&self.stream(id)?.recv[..])
    }

    fn consume(&mut self, id: StreamId, n: usize) -> Result<(), TransportError> {
        let stream = self.stream_mut(id)?;
        if n > stream.recv.len() {
            return Err(TransportError::Internal(format!(
                "consume {n} beyond buffered {}",
                stream.recv.len()
            )));
        }
        stream.recv.advance(n);
        Ok(())
    }

    fn reset_stream(&mut self, id: StreamId, code: ErrorCode) -> Result<(), TransportError> {
        let stream = self.stream_mut(id)?;
        stream.reset_code = Some(code);
        Ok(())
    }

    fn stop_sending(&mut self, id: StreamId, code: ErrorCode) -> Result<(), TransportError> {
        let stream = self.stream_mut(id)?;
        stream.stop_sending_code = Some(code);
        Ok(())
    }

    fn clear_stream_callbacks(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.callbacks_cleared = true;
        }
    }

    fn set_control_stream(&mut self, id: StreamId) -> Result<(), TransportError> {
        self.stream_mut(id)?.is_control = true;
        Ok(())
    }

    fn stream_flow_control(&self, id: StreamId) -> Result<FlowControlState, TransportError> {
        let stream = self.stream(id)?;
        Ok(FlowControlState {
            send_window_available: stream.send_window,
            receive_window_available: DEFAULT_SEND_WINDOW,
        })
    }

    fn stream_write_offset(&self, id: StreamId) -> Result<u64, TransportError> {
        Ok(self.stream(id)?.write_offset)
    }

    fn stream_write_buffered(&self, id: StreamId) -> Result<u64, TransportError> {
        self.stream(id)?;
        Ok(0)
    }

    fn register_delivery_callback(
        &mut self,
        id: StreamId,
        offset: u64,
    ) -> Result<(), TransportError> {
        if self.fail_delivery_registration {
            return Err(TransportError::Internal(
                "delivery callback registration refused".to_string(),
            ));
        }
        self.stream_mut(id)?.delivery_offsets.push(offset);
        Ok(())
    }

    fn notify_pending_write(&mut self) {
        self.write_ready_requested = true;
    }

    fn send_data_expired(&mut self, id: StreamId, offset: u64) -> Result<u64, TransportError> {
        let stream = self.stream_mut(id)?;
        stream.expired_at = Some(offset);
        Ok(offset)
    }

    fn send_data_rejected(&mut self, id: StreamId, offset: u64) -> Result<u64, TransportError> {
        let stream = self.stream_mut(id)?;
        stream.rejected_at = Some(offset);
        Ok(offset)
    }

    fn close(&mut self, error: Option<(ErrorCode, String)>) {
        if self.closed.is_none() {
            self.closed = Some(error);
        }
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            bytes_sent: self.streams.values().map(|s| s.write_offset).sum(),
            ..Default::default()
        }
    }

    fn stream_transport_info(
        &self,
        id: StreamId,
    ) -> Result<StreamTransportInfo, TransportError> {
        let stream = self.stream(id)?;
        Ok(StreamTransportInfo {
            bytes_acked: 0,
            bytes_in_flight: stream.write_offset,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_respects_send_window() {
        let mut t = LoopbackTransport::new(Role::Server);
        let id = t.peer_open_bidi();
        t.set_send_window(id, 4);
        let sent = t.write_chain(id, b"abcdef", true).unwrap();
        assert_eq!(sent, 4);
        assert_eq!(t.written(id), b"abcd");
        // FIN must not latch on a partial write.
        assert!(!t.fin_written(id));
    }

    #[test]
    fn peek_then_consume() {
        let mut t = LoopbackTransport::new(Role::Server);
        let id = t.peer_open_uni();
        t.peer_write(id, &[0x00, 0x04, 0x00], false);
        assert_eq!(t.peek(id).unwrap(), &[0x00, 0x04, 0x00]);
        t.consume(id, 1).unwrap();
        assert_eq!(t.peek(id).unwrap(), &[0x04, 0x00]);
    }

    #[test]
    fn read_reports_eof_only_when_drained() {
        let mut t = LoopbackTransport::new(Role::Server);
        let id = t.peer_open_bidi();
        t.peer_write(id, b"hello", true);
        let (data, eof) = t.read(id, 3).unwrap();
        assert_eq!(&data[..], b"hel");
        assert!(!eof);
        let (data, eof) = t.read(id, 16).unwrap();
        assert_eq!(&data[..], b"lo");
        assert!(eof);
    }

    #[test]
    fn stream_id_allocation_by_role() {
        let mut server = LoopbackTransport::new(Role::Server);
        assert_eq!(server.create_bidi_stream().unwrap(), StreamId(1));
        assert_eq!(server.create_uni_stream().unwrap(), StreamId(3));
        assert_eq!(server.create_uni_stream().unwrap(), StreamId(7));
        assert_eq!(server.peer_open_bidi(), StreamId(0));
        assert_eq!(server.peer_open_uni(), StreamId(2));

        let mut client = LoopbackTransport::new(Role::Client);
        assert_eq!(client.create_bidi_stream().unwrap(), StreamId(0));
        assert_eq!(client.peer_open_uni(), StreamId(3));
    }
}
