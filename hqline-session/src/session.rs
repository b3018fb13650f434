//! The HTTP-over-QUIC session orchestrator.
//!
//! `HqSession` multiplexes HTTP transactions over one QUIC connection. The
//! transport driver feeds it connection events (`on_new_*_stream`,
//! `on_read_available`, `on_connection_write_ready`, delivery acks) and
//! calls [`run_loop`](HqSession::run_loop) once per event batch; the
//! transaction layer drains [`SessionEvent`]s with
//! [`poll_event`](HqSession::poll_event) and egresses through the `send_*`
//! methods.
//!
//! Loop tick ordering: (1) a latched deferred drop, (2) accumulated reads
//! into codecs, (3) the profile's post-read hook (QPACK Insert Count
//! Increment emission), (4) control stream writes, (5) request stream
//! writes under the connection budget, (6) shutdown check.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use hqline_transport::{
    ErrorCode, QuicTransport, ReadError, Role, StreamId, StreamTransportInfo, TransportInfo,
    UniStreamType, VARINT_MAX,
};

use crate::byte_event::ByteEventKind;
use crate::codec::CodecEvent;
use crate::config::SessionConfig;
use crate::control::ControlStream;
use crate::dispatch::{self, PrefaceOutcome, UniDispatcher};
use crate::error::{CodecError, HttpError, SessionError};
use crate::event::SessionEvent;
use crate::frame::Frame;
use crate::prerel::BodyOffsetTracker;
use crate::profile::{HqVersion, VersionProfile};
use crate::qpack::HeaderField;
use crate::scheduler::EgressQueue;
use crate::settings::HqSettings;
use crate::stream::RequestStream;

/// Controlled-shutdown progress. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainState {
    None,
    Pending,
    CloseSent,
    CloseReceived,
    FirstGoaway,
    SecondGoaway,
    Done,
}

pub struct HqSession {
    role: Role,
    config: SessionConfig,
    version: Option<HqVersion>,
    profile: Option<VersionProfile>,

    streams: HashMap<StreamId, RequestStream>,
    control_streams: BTreeMap<UniStreamType, ControlStream>,
    dispatcher: UniDispatcher,
    /// Ingress push streams by push id.
    ingress_push_ids: HashMap<u64, StreamId>,

    egress_queue: EgressQueue,
    pending_process_read: BTreeSet<StreamId>,
    events: VecDeque<SessionEvent>,

    drain_state: DrainState,
    /// Largest peer-initiated bidirectional stream id accepted.
    max_incoming_stream_id: u64,
    /// Largest local stream id the peer promised to service (their GOAWAY).
    max_allowed_stream_id: u64,
    ingress_settings: Option<HqSettings>,

    /// Single-slot deferred drop, honored at the top of the next loop tick.
    drop_in_next_loop: Option<(ErrorCode, String, HttpError)>,
    reads_this_loop: u16,
    max_to_send: u64,
    dropping: bool,
    destroyed: bool,
}

impl HqSession {
    pub fn new(role: Role, config: SessionConfig) -> Self {
        HqSession {
            role,
            config,
            version: None,
            profile: None,
            streams: HashMap::new(),
            control_streams: BTreeMap::new(),
            dispatcher: UniDispatcher::default(),
            ingress_push_ids: HashMap::new(),
            egress_queue: EgressQueue::new(),
            pending_process_read: BTreeSet::new(),
            events: VecDeque::new(),
            drain_state: DrainState::None,
            max_incoming_stream_id: 0,
            max_allowed_stream_id: VARINT_MAX,
            ingress_settings: None,
            drop_in_next_loop: None,
            reads_this_loop: 0,
            max_to_send: 0,
            dropping: false,
            destroyed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn version(&self) -> Option<HqVersion> {
        self.version
    }

    pub fn drain_state(&self) -> DrainState {
        self.drain_state
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn ingress_settings(&self) -> Option<&HqSettings> {
        self.ingress_settings.as_ref()
    }

    /// Drain the next application event.
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    // ── Setup ───────────────────────────────────────────────────────

    /// Install the version profile for the negotiated protocol and create
    /// the egress control streams it requires.
    pub fn on_transport_ready<T: QuicTransport>(
        &mut self,
        t: &mut T,
        alpn: &str,
    ) -> Result<(), SessionError> {
        let (version, mut profile) =
            match VersionProfile::select(alpn, &self.config.egress_settings) {
                Some(v) => v,
                None => {
                    error!(alpn, "unsupported application protocol");
                    self.connect_failed(t, "unsupported alpn");
                    return Err(SessionError::UnsupportedProtocol(alpn.to_string()));
                }
            };
        debug!(?version, role = ?self.role, "transport ready");

        for &stream_type in profile.required_egress_streams() {
            let id = match t.create_uni_stream() {
                Ok(id) => id,
                Err(e) => {
                    error!(%stream_type, %e, "cannot create egress control stream");
                    self.connect_failed(t, "control stream creation failed");
                    return Err(SessionError::ControlStreamCreation);
                }
            };
            let cs = self
                .control_streams
                .entry(stream_type)
                .or_insert_with(|| ControlStream::new(stream_type));
            cs.egress_id = Some(id);
            let mut preface = Vec::new();
            crate::frame::encode_varint(&mut preface, stream_type.preface());
            cs.write_buf.extend_from_slice(&preface);
        }

        if profile.sends_settings() {
            let cs = self
                .control_streams
                .get_mut(&UniStreamType::Control)
                .ok_or(SessionError::ControlStreamCreation)?;
            let mut buf = Vec::new();
            Frame::Settings(self.config.egress_settings.clone()).encode(&mut buf);
            cs.write_buf.extend_from_slice(&buf);
        }

        self.version = Some(version);
        self.profile = Some(profile);

        // notify_pending_shutdown may have arrived before the transport was
        // ready; kick the GOAWAY machinery now.
        if self.drain_state == DrainState::Pending {
            self.send_goaway(t);
        }
        self.schedule_write(t);
        Ok(())
    }

    fn connect_failed<T: QuicTransport>(&mut self, t: &mut T, msg: &str) {
        t.close(Some((ErrorCode::HttpNoError, msg.to_string())));
        self.drain_state = DrainState::Done;
        self.destroy(t, Some(HttpError::ConnectFailed));
    }

    // ── New streams ─────────────────────────────────────────────────

    pub fn on_new_bidirectional_stream<T: QuicTransport>(&mut self, t: &mut T, id: StreamId) {
        if self.destroyed || self.profile.is_none() {
            return;
        }
        trace!(%id, "new bidirectional stream");
        if !self.check_new_stream(t, id) {
            return;
        }
        let profile = match self.profile.as_ref() {
            Some(p) => p,
            None => return,
        };
        let codec = profile.make_stream_codec(self.role, false);
        let mut stream = RequestStream::new(id, codec);
        if self.config.partial_reliability {
            stream.offset_tracker = Some(BodyOffsetTracker::default());
        }
        self.streams.insert(id, stream);
        self.max_incoming_stream_id = self.max_incoming_stream_id.max(id.value());
    }

    pub fn on_new_unidirectional_stream<T: QuicTransport>(&mut self, t: &mut T, id: StreamId) {
        if self.destroyed || self.profile.is_none() {
            return;
        }
        trace!(%id, "new unidirectional stream");
        if !self.check_new_stream(t, id) {
            return;
        }
        // Type unknown until the preface arrives; the dispatcher owns it.
        self.dispatcher.take_ownership(id);
        self.process_uni_preface(t, id);
    }

    /// Validate direction and GOAWAY limits for a peer-initiated stream.
    fn check_new_stream<T: QuicTransport>(&mut self, t: &mut T, id: StreamId) -> bool {
        let unframed = self.version == Some(HqVersion::H1qUnframed);
        if unframed && (id.is_uni() || id.is_server_initiated()) {
            self.abort_stream_directions(t, id, ErrorCode::HttpWrongStream);
            return false;
        }
        // Bidirectional streams are client-initiated in every profile.
        if id.is_bidi() && id.is_server_initiated() {
            self.abort_stream_directions(t, id, ErrorCode::HttpWrongStream);
            return false;
        }
        if self.drain_state != DrainState::None {
            // Streams may arrive out of order relative to our GOAWAY; only
            // ids above what we advertised are turned away.
            let out_of_range = match self.role {
                Role::Client => id.value() > self.max_allowed_stream_id,
                Role::Server => id.is_bidi() && id.value() > self.max_incoming_stream_id,
            };
            if out_of_range {
                debug!(%id, "rejecting stream past goaway limit");
                self.abort_stream_directions(t, id, ErrorCode::HttpRequestRejected);
                return false;
            }
        }
        true
    }

    /// Reset/stop-send whichever directions of `id` exist, without any
    /// transaction bookkeeping.
    fn abort_stream_directions<T: QuicTransport>(
        &mut self,
        t: &mut T,
        id: StreamId,
        code: ErrorCode,
    ) {
        if id.is_bidi() || !id.initiated_by(peer_of(self.role)) {
            let _ = t.reset_stream(id, code);
        }
        if id.is_bidi() || id.initiated_by(peer_of(self.role)) {
            let _ = t.stop_sending(id, code);
        }
    }

    // ── Unidirectional dispatch ─────────────────────────────────────

    fn process_uni_preface<T: QuicTransport>(&mut self, t: &mut T, id: StreamId) {
        if !self.dispatcher.owns(id) {
            return;
        }
        let profile = match self.profile.as_ref() {
            Some(p) => p,
            None => return,
        };
        let peeked = match t.peek(id) {
            Ok(p) => p,
            Err(_) => return,
        };
        let outcome = dispatch::decode_preface(peeked, |p| profile.parse_stream_preface(p));
        match outcome {
            PrefaceOutcome::Pending => {}
            PrefaceOutcome::Unknown { preface } => {
                debug!(%id, preface, "unknown unidirectional stream preface");
                let buffered = peeked.len();
                self.dispatcher.release(id);
                // Discard what we peeked and refuse the rest; the peer
                // resets the stream on receipt of STOP_SENDING.
                let _ = t.consume(id, buffered);
                let _ = t.stop_sending(id, ErrorCode::HttpUnknownStreamType);
                t.clear_stream_callbacks(id);
            }
            PrefaceOutcome::Recognized {
                stream_type,
                push_id,
                consumed,
            } => {
                self.dispatcher.release(id);
                if t.consume(id, consumed).is_err() {
                    return;
                }
                match stream_type {
                    UniStreamType::Push => self.bind_push_stream(t, id, push_id),
                    _ => self.bind_control_stream(t, id, stream_type),
                }
            }
        }
    }

    fn bind_control_stream<T: QuicTransport>(
        &mut self,
        t: &mut T,
        id: StreamId,
        stream_type: UniStreamType,
    ) {
        let cs = self
            .control_streams
            .entry(stream_type)
            .or_insert_with(|| ControlStream::new(stream_type));
        if cs.ingress_id.is_some() {
            // One control stream per type; a second is a connection error.
            error!(%id, %stream_type, "duplicate control stream");
            self.drop_connection_async(
                ErrorCode::HttpWrongStreamCount,
                "duplicate control stream".to_string(),
                HttpError::ProtocolError,
            );
            return;
        }
        debug!(%id, %stream_type, "control stream bound");
        cs.ingress_id = Some(id);
        let _ = t.set_control_stream(id);
        // Bytes may have arrived behind the preface; drain them now.
        self.read_control_stream(t, stream_type, id);
    }

    fn bind_push_stream<T: QuicTransport>(
        &mut self,
        t: &mut T,
        id: StreamId,
        push_id: Option<u64>,
    ) {
        let push_id = match push_id {
            Some(p) => p,
            None => return,
        };
        if self.role != Role::Client {
            // Only servers promise pushes.
            self.abort_stream_directions(t, id, ErrorCode::HttpWrongStream);
            return;
        }
        let profile = match self.profile.as_ref() {
            Some(p) => p,
            None => return,
        };
        let codec = profile.make_stream_codec(self.role, true);
        let mut stream = RequestStream::new(id, codec);
        stream.ingress_push_id = Some(push_id);
        // Push streams have no egress half.
        stream.egress_complete = true;
        self.streams.insert(id, stream);
        self.ingress_push_ids.insert(push_id, id);
        self.events
            .push_back(SessionEvent::PushStreamBegin { id, push_id });
        self.read_request_stream_data(t, id);
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn on_read_available<T: QuicTransport>(&mut self, t: &mut T, id: StreamId) {
        if self.destroyed {
            return;
        }
        if self.reads_this_loop >= self.config.max_reads_per_loop {
            // Level-triggered transport; it will tell us again next loop.
            trace!(%id, "reads-per-loop cap hit, skipping");
            return;
        }
        self.reads_this_loop += 1;

        if self.dispatcher.owns(id) {
            self.process_uni_preface(t, id);
            return;
        }
        let control_type = self
            .control_streams
            .iter()
            .find(|(_, cs)| cs.ingress_id == Some(id))
            .map(|(&stream_type, _)| stream_type);
        if let Some(stream_type) = control_type {
            self.read_control_stream(t, stream_type, id);
            return;
        }
        if self.streams.contains_key(&id) {
            self.read_request_stream_data(t, id);
        }
    }

    fn read_request_stream_data<T: QuicTransport>(&mut self, t: &mut T, id: StreamId) {
        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => return,
        };
        loop {
            let (data, eof) = match t.read(id, 65536) {
                Ok(r) => r,
                Err(_) => break,
            };
            if !data.is_empty() {
                stream.ingress_started = true;
                stream.read_buf.extend_from_slice(&data);
            }
            if eof {
                stream.read_eof = true;
            }
            if data.is_empty() || eof {
                break;
            }
        }
        // Processing is deferred to the loop tick so QPACK inserts landing
        // in the same batch can unblock many streams in one pass.
        self.pending_process_read.insert(id);
    }

    fn read_control_stream<T: QuicTransport>(
        &mut self,
        t: &mut T,
        stream_type: UniStreamType,
        id: StreamId,
    ) {
        let cs = match self.control_streams.get_mut(&stream_type) {
            Some(cs) => cs,
            None => return,
        };
        loop {
            let (data, eof) = match t.read(id, 65536) {
                Ok(r) => r,
                Err(_) => break,
            };
            if !data.is_empty() {
                cs.read_buf.extend_from_slice(&data);
            }
            if eof {
                cs.read_eof = true;
            }
            if data.is_empty() || eof {
                break;
            }
        }
        if self.control_streams[&stream_type].read_eof {
            // A critical stream must never close.
            error!(%id, %stream_type, "control stream closed by peer");
            self.drop_connection_async(
                ErrorCode::HttpClosedCriticalStream,
                "control stream closed".to_string(),
                HttpError::ProtocolError,
            );
            return;
        }
        self.process_control_ingress(t, stream_type);
    }

    fn process_control_ingress<T: QuicTransport>(
        &mut self,
        t: &mut T,
        stream_type: UniStreamType,
    ) {
        match stream_type {
            UniStreamType::Control | UniStreamType::H1qControl => {
                let cs = match self.control_streams.get_mut(&stream_type) {
                    Some(cs) => cs,
                    None => return,
                };
                let frames = match cs.decode_frames() {
                    Ok(f) => f,
                    Err(e) => {
                        self.control_codec_error(e);
                        return;
                    }
                };
                for frame in frames {
                    self.on_control_frame(t, frame);
                }
            }
            UniStreamType::QpackEncoder | UniStreamType::QpackDecoder => {
                let encoder = stream_type == UniStreamType::QpackEncoder;
                let result = {
                    let qpack = match self.profile.as_mut().and_then(|p| p.qpack()) {
                        Some(q) => q,
                        None => return,
                    };
                    let cs = match self.control_streams.get_mut(&stream_type) {
                        Some(cs) => cs,
                        None => return,
                    };
                    let result = if encoder {
                        qpack.on_encoder_stream_data(&cs.read_buf)
                    } else {
                        qpack.on_decoder_stream_data(&cs.read_buf)
                    };
                    if let Ok(consumed) = &result {
                        let _ = cs.read_buf.split_to(*consumed);
                    }
                    result
                };
                match result {
                    Ok(consumed) => {
                        if encoder && consumed > 0 {
                            self.unblock_streams();
                        }
                    }
                    Err(e) => {
                        warn!(%e, %stream_type, "qpack stream error");
                        self.drop_connection_async(
                            ErrorCode::HttpInternalError,
                            format!("qpack: {e}"),
                            HttpError::ProtocolError,
                        );
                    }
                }
            }
            UniStreamType::Push => {}
        }
    }

    /// Streams whose header blocks were waiting on QPACK inserts get
    /// re-inserted into the pending-read set once the insert count covers
    /// their requirement.
    fn unblock_streams(&mut self) {
        let insert_count = match self.profile.as_ref().and_then(|p| p.qpack_ref()) {
            Some(q) => q.insert_count(),
            None => return,
        };
        for (id, stream) in self.streams.iter_mut() {
            if let Some(required) = stream.blocked_at_insert_count
                && required <= insert_count
            {
                trace!(id = %id, required, "qpack unblocked");
                stream.blocked_at_insert_count = None;
                self.pending_process_read.insert(*id);
            }
        }
    }

    fn control_codec_error(&mut self, e: CodecError) {
        error!(%e, "control stream codec error");
        self.drop_connection_async(
            ErrorCode::HttpWrongStream,
            e.to_string(),
            HttpError::ProtocolError,
        );
    }

    fn on_control_frame<T: QuicTransport>(&mut self, t: &mut T, frame: Frame) {
        match frame {
            Frame::Settings(settings) => {
                if let Some(profile) = self.profile.as_mut() {
                    profile.apply_ingress_settings(&settings);
                }
                self.ingress_settings = Some(settings.clone());
                self.events
                    .push_back(SessionEvent::SettingsReceived { settings });
            }
            Frame::GoAway { stream_id } => {
                self.on_goaway(t, stream_id);
            }
            Frame::PriorityUpdate { element_id, urgency } => {
                let id = StreamId(element_id);
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.urgency = urgency;
                    self.egress_queue.update_urgency(id, urgency);
                    self.events
                        .push_back(SessionEvent::PriorityUpdated { id, urgency });
                }
            }
            Frame::CancelPush { push_id } => {
                debug!(push_id, "push cancelled by peer");
            }
            Frame::MaxPushId { .. } => {}
            // decode_frames filtered everything else already.
            _ => {}
        }
    }

    fn on_goaway<T: QuicTransport>(&mut self, t: &mut T, last_good: u64) {
        debug!(last_good, "goaway received");
        self.max_allowed_stream_id = self.max_allowed_stream_id.min(last_good);
        self.events.push_back(SessionEvent::GoawayReceived {
            last_good_stream_id: last_good,
        });
        self.drain_impl(t);

        // Locally-initiated transactions above the advertised limit were
        // never processed; fail them as retryable.
        let doomed: Vec<StreamId> = self
            .streams
            .keys()
            .copied()
            .filter(|id| {
                id.is_bidi()
                    && id.initiated_by(self.role)
                    && id.value() > self.max_allowed_stream_id
            })
            .collect();
        for id in doomed {
            self.error_on_transaction(id, HttpError::StreamUnacknowledged);
        }
        self.check_for_shutdown(t);
    }

    // ── Read processing (loop step 2) ───────────────────────────────

    fn process_read_data(&mut self) {
        let ids: Vec<StreamId> = std::mem::take(&mut self.pending_process_read)
            .into_iter()
            .collect();
        for id in ids {
            self.process_stream_read(id);
        }
    }

    fn process_stream_read(&mut self, id: StreamId) {
        let profile = match self.profile.as_mut() {
            Some(p) => p,
            None => return,
        };
        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => return,
        };
        if stream.detached || stream.ingress_error {
            // Late data on a dead stream is absorbed silently.
            stream.read_buf.clear();
            return;
        }
        if stream.read_buf.is_empty() && !stream.read_eof {
            return;
        }

        let qpack_count = profile.qpack_ref().map(|q| q.insert_count());
        if let (Some(required), Some(count)) = (stream.blocked_at_insert_count, qpack_count)
            && required > count
        {
            return;
        }

        // Work on the buffer without holding the stream entry; unconsumed
        // bytes go back afterwards.
        let mut buf = std::mem::take(&mut stream.read_buf);
        let result = stream
            .codec
            .decode(profile.qpack(), id.value(), &buf, stream.read_eof);

        let result = match result {
            Ok(r) => r,
            Err(CodecError::MalformedPushPromise) => {
                self.drop_connection_async(
                    ErrorCode::HttpMalformedFramePushPromise,
                    "malformed push promise".to_string(),
                    HttpError::ProtocolError,
                );
                return;
            }
            Err(e) => {
                debug!(%id, %e, "request stream codec error");
                self.stream_codec_error(id, e);
                return;
            }
        };

        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => return,
        };
        let prior_bytes_read = stream.bytes_read;
        let _ = buf.split_to(result.consumed);
        stream.read_buf = buf;
        stream.bytes_read = prior_bytes_read + result.consumed as u64;
        stream.blocked_at_insert_count = result.blocked_at_insert_count;
        if let Some(head_end) = result.head_consumed
            && let Some(tracker) = &mut stream.offset_tracker
        {
            tracker.start_ingress_body(prior_bytes_read + head_end as u64);
        }

        for event in result.events {
            self.deliver_codec_event(id, event);
        }
    }

    fn deliver_codec_event(&mut self, id: StreamId, event: CodecEvent) {
        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => return,
        };
        if stream.terminal_event_sent {
            return;
        }
        match event {
            CodecEvent::Headers(fields) => {
                self.events.push_back(SessionEvent::Headers { id, fields });
            }
            CodecEvent::Body(data) => {
                self.events.push_back(SessionEvent::Body { id, data });
            }
            CodecEvent::Trailers(fields) => {
                self.events.push_back(SessionEvent::Trailers { id, fields });
            }
            CodecEvent::MessageComplete => {
                stream.ingress_complete = true;
                stream.check_detach_ready();
                self.events.push_back(SessionEvent::MessageComplete { id });
            }
            CodecEvent::PushPromise { push_id, fields } => {
                self.events.push_back(SessionEvent::PushPromise {
                    parent: id,
                    push_id,
                    fields,
                });
            }
            CodecEvent::ConnectionCloseSeen => {
                // h1q-unframed drain signal.
                match self.drain_state {
                    DrainState::None => self.drain_state = DrainState::CloseReceived,
                    DrainState::CloseSent => self.drain_state = DrainState::Done,
                    _ => {}
                }
            }
        }
    }

    fn stream_codec_error(&mut self, id: StreamId, _e: CodecError) {
        // Stream-scoped: fail the transaction, leave the session up.
        self.error_on_transaction(id, HttpError::ProtocolError);
        if let Some(profile) = self.profile.as_mut() {
            profile.on_stream_abort(id.value());
        }
    }

    // ── Stream errors ───────────────────────────────────────────────

    pub fn on_read_error<T: QuicTransport>(&mut self, t: &mut T, id: StreamId, err: ReadError) {
        if self.destroyed {
            return;
        }
        // Control streams are critical; any read error is fatal.
        let control_type = self
            .control_streams
            .iter()
            .find(|(_, cs)| cs.ingress_id == Some(id) || cs.egress_id == Some(id))
            .map(|(&stream_type, _)| stream_type);
        if let Some(stream_type) = control_type {
            let code = match &err {
                ReadError::Reset(code) => *code,
                _ => ErrorCode::HttpClosedCriticalStream,
            };
            error!(%id, %stream_type, ?err, "error on control stream");
            self.drop_connection_async(
                code,
                "error on control stream".to_string(),
                HttpError::ProtocolError,
            );
            return;
        }

        if self.dispatcher.owns(id) {
            self.dispatcher.release(id);
            t.clear_stream_callbacks(id);
            return;
        }

        match err {
            ReadError::Reset(code) => self.on_reset_stream(t, id, code),
            ReadError::ResetRaw(_) => {
                self.on_reset_stream(t, id, ErrorCode::HttpRequestCancelled)
            }
            ReadError::Local { no_error } => {
                if !no_error {
                    self.error_on_transaction(id, HttpError::ConnectionReset);
                }
            }
            ReadError::Transport(_) => {
                self.error_on_transaction(id, HttpError::ConnectionReset);
            }
        }
        self.check_for_shutdown(t);
    }

    /// Peer reset of a request stream: map the code to a transaction error
    /// and a reply code (§ reset mapping).
    fn on_reset_stream<T: QuicTransport>(&mut self, t: &mut T, id: StreamId, code: ErrorCode) {
        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => return,
        };
        let reply = if self.role == Role::Client {
            // Upstream ingress closed: cancel the request.
            ErrorCode::HttpRequestCancelled
        } else if !stream.ingress_started {
            // Nothing was processed; the peer may safely retry elsewhere.
            ErrorCode::HttpRequestRejected
        } else {
            ErrorCode::HttpNoError
        };
        let error = match code {
            ErrorCode::HttpRequestRejected => HttpError::StreamUnacknowledged,
            ErrorCode::GiveupZeroRtt => HttpError::EarlyDataFailed,
            _ => HttpError::StreamAbort,
        };
        debug!(%id, %code, %reply, "peer reset stream");
        self.error_on_transaction(id, error);
        let _ = t.reset_stream(id, reply);
        if let Some(profile) = self.profile.as_mut() {
            profile.on_stream_abort(id.value());
        }
    }

    pub fn on_stop_sending<T: QuicTransport>(&mut self, t: &mut T, id: StreamId, code: ErrorCode) {
        if self.destroyed {
            return;
        }
        // Errors surfacing while the peer kills our egress must not
        // re-enter teardown; anything fatal latches a deferred drop.
        if self
            .control_streams
            .values()
            .any(|cs| cs.egress_id == Some(id))
        {
            self.drop_connection_async(
                ErrorCode::HttpClosedCriticalStream,
                "stop_sending on control stream".to_string(),
                HttpError::ProtocolError,
            );
            return;
        }
        if self.streams.contains_key(&id) {
            let error = match code {
                ErrorCode::HttpRequestRejected => HttpError::StreamUnacknowledged,
                ErrorCode::GiveupZeroRtt => HttpError::EarlyDataFailed,
                _ => HttpError::StreamAbort,
            };
            self.error_on_transaction(id, error);
            let _ = t.reset_stream(id, ErrorCode::HttpRequestCancelled);
            if let Some(profile) = self.profile.as_mut() {
                profile.on_stream_abort(id.value());
            }
        }
    }

    // ── Flow control / write readiness ──────────────────────────────

    pub fn on_flow_control_update<T: QuicTransport>(&mut self, t: &mut T, id: StreamId) {
        if self.destroyed {
            return;
        }
        let window = match t.stream_flow_control(id) {
            Ok(fc) => fc.send_window_available,
            Err(_) => return,
        };
        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => return,
        };
        if window > 0 && stream.has_pending_egress() {
            trace!(%id, window, "flow control opened, re-enqueueing");
            stream.flow_blocked = false;
            self.egress_queue.enqueue(id, stream.urgency);
            if stream.egress_paused {
                stream.egress_paused = false;
                self.events.push_back(SessionEvent::EgressResumed { id });
            }
            self.schedule_write(t);
        }
    }

    pub fn on_connection_write_ready<T: QuicTransport>(&mut self, t: &mut T, max_to_send: u64) {
        if self.destroyed {
            return;
        }
        trace!(max_to_send, "connection write ready");
        self.max_to_send = max_to_send;
        self.run_loop(t);
    }

    pub fn on_connection_write_error<T: QuicTransport>(&mut self, t: &mut T) {
        if self.destroyed {
            return;
        }
        error!("connection write error");
        self.drop_connection_sync(
            t,
            ErrorCode::HttpInternalError,
            "connection write error".to_string(),
            HttpError::WriteError,
        );
    }

    pub fn on_connection_end<T: QuicTransport>(&mut self, t: &mut T) {
        if self.destroyed {
            return;
        }
        debug!("connection ended by peer");
        self.drop_connection_sync(
            t,
            ErrorCode::HttpNoError,
            "connection end".to_string(),
            HttpError::ConnectionReset,
        );
    }

    // ── Delivery acknowledgements ───────────────────────────────────

    pub fn on_delivery_ack<T: QuicTransport>(&mut self, t: &mut T, id: StreamId, offset: u64) {
        if self.destroyed {
            return;
        }
        if self
            .control_streams
            .values()
            .any(|cs| cs.egress_id == Some(id))
        {
            // The only control-stream delivery callbacks are GOAWAYs.
            self.on_goaway_ack(t);
            return;
        }
        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => {
                warn!(%id, "delivery ack for unknown stream");
                return;
            }
        };
        stream.pending_byte_event_count = stream.pending_byte_event_count.saturating_sub(1);
        for fired in stream.byte_events.process_acked(offset) {
            self.events.push_back(SessionEvent::ByteEvent {
                id,
                kind: fired.kind,
                offset: fired.offset,
            });
        }
        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => return,
        };
        stream.check_detach_ready();
        self.check_for_shutdown(t);
    }

    pub fn on_delivery_canceled<T: QuicTransport>(&mut self, t: &mut T, id: StreamId) {
        if self.destroyed {
            return;
        }
        if self
            .control_streams
            .values()
            .any(|cs| cs.egress_id == Some(id))
        {
            // GOAWAY tracking canceled: accelerate draining.
            warn!(%id, "goaway delivery canceled");
            self.drain_state = DrainState::Done;
            self.check_for_shutdown(t);
            return;
        }
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.pending_byte_event_count = stream.pending_byte_event_count.saturating_sub(1);
            // The canceled offset's events can never fire now.
            stream.byte_events.cancel_all();
            stream.check_detach_ready();
            self.events.push_back(SessionEvent::DeliveryCanceled { id });
            self.check_for_shutdown(t);
        }
    }

    // ── Partial reliability ─────────────────────────────────────────

    pub fn on_data_expired<T: QuicTransport>(&mut self, t: &mut T, id: StreamId, offset: u64) {
        let _ = t;
        if !self.config.partial_reliability {
            return;
        }
        let stream = match self.streams.get_mut(&id) {
            Some(s) if !s.detached => s,
            _ => {
                debug!(%id, "data expired for missing or detached stream");
                return;
            }
        };
        let Some(tracker) = &mut stream.offset_tracker else {
            return;
        };
        match tracker.ingress_stream_to_body(offset) {
            Ok(body_offset) => {
                tracker.advance_ingress(body_offset);
                // Drop buffered ingress below the new offset.
                stream.read_buf.clear();
                self.events
                    .push_back(SessionEvent::BodySkipped { id, body_offset });
            }
            Err(e) => debug!(%id, %e, "unmappable expired offset"),
        }
    }

    pub fn on_data_rejected<T: QuicTransport>(&mut self, t: &mut T, id: StreamId, offset: u64) {
        let _ = t;
        if !self.config.partial_reliability {
            return;
        }
        let stream = match self.streams.get_mut(&id) {
            Some(s) if !s.detached => s,
            _ => return,
        };
        let Some(tracker) = &mut stream.offset_tracker else {
            return;
        };
        match tracker.egress_body_to_stream(0) {
            Ok(body_start) => {
                let body_offset = offset.saturating_sub(body_start);
                tracker.advance_egress(body_offset);
                self.events
                    .push_back(SessionEvent::BodyRejected { id, body_offset });
            }
            Err(e) => debug!(%id, %e, "unmappable rejected offset"),
        }
    }

    /// Declare egress body below `body_offset` expired. Returns the number
    /// of body bytes newly skipped; rewinding below committed bytes is
    /// ignored and returns 0.
    pub fn skip_body_to<T: QuicTransport>(
        &mut self,
        t: &mut T,
        id: StreamId,
        body_offset: u64,
    ) -> Result<u64, SessionError> {
        if !self.config.partial_reliability {
            return Err(SessionError::PartialReliabilityDisabled);
        }
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(SessionError::UnknownTransaction(id))?;
        let tracker = stream
            .offset_tracker
            .as_mut()
            .ok_or(SessionError::PartialReliabilityDisabled)?;
        let body_start = tracker.egress_body_to_stream(0)?;
        let stream_offset = tracker.egress_body_to_stream(body_offset)?;
        let skipped = tracker.advance_egress(body_offset);
        if skipped == 0 {
            return Ok(0);
        }
        // Trim unsent body below the new offset, oldest first. The write
        // buffer may still hold head bytes ahead of the body; those are
        // never skipped.
        let mut to_trim = skipped as usize;
        let head_in_buf = (body_start.saturating_sub(stream.bytes_written) as usize)
            .min(stream.write_buf.len());
        let body_in_buf = stream.write_buf.len() - head_in_buf;
        let drop_from_buf = body_in_buf.min(to_trim);
        if drop_from_buf > 0 {
            let mut tail = stream.write_buf.split_off(head_in_buf);
            let _ = tail.split_to(drop_from_buf);
            stream.write_buf.unsplit(tail);
        }
        to_trim -= drop_from_buf;
        while to_trim > 0 {
            match stream.deferred_body.front_mut() {
                Some(chunk) => {
                    let n = chunk.len().min(to_trim);
                    let _ = chunk.split_to(n);
                    to_trim -= n;
                    if chunk.is_empty() {
                        stream.deferred_body.pop_front();
                    }
                }
                None => break,
            }
        }
        t.send_data_expired(id, stream_offset)?;
        Ok(skipped)
    }

    /// Reject ingress body below `body_offset`. Returns the number of body
    /// bytes newly rejected; rewinds are ignored and return 0.
    pub fn reject_body_to<T: QuicTransport>(
        &mut self,
        t: &mut T,
        id: StreamId,
        body_offset: u64,
    ) -> Result<u64, SessionError> {
        if !self.config.partial_reliability {
            return Err(SessionError::PartialReliabilityDisabled);
        }
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(SessionError::UnknownTransaction(id))?;
        let tracker = stream
            .offset_tracker
            .as_mut()
            .ok_or(SessionError::PartialReliabilityDisabled)?;
        let stream_offset = tracker.ingress_body_to_stream(body_offset)?;
        let rejected = tracker.advance_ingress(body_offset);
        if rejected == 0 {
            return Ok(0);
        }
        stream.read_buf.clear();
        t.send_data_rejected(id, stream_offset)?;
        Ok(rejected)
    }

    // ── Upper API: transactions ─────────────────────────────────────

    /// Open a new locally-initiated transaction (client role).
    pub fn new_transaction<T: QuicTransport>(
        &mut self,
        t: &mut T,
    ) -> Result<StreamId, SessionError> {
        if self.destroyed {
            return Err(SessionError::Closed);
        }
        let profile = self.profile.as_ref().ok_or(SessionError::NotReady)?;
        if self.drain_state != DrainState::None {
            return Err(SessionError::Draining);
        }
        let id = t.create_bidi_stream()?;
        if id.value() > self.max_allowed_stream_id {
            // The peer already told us it will not service this id.
            let _ = t.reset_stream(id, ErrorCode::HttpRequestCancelled);
            return Err(SessionError::Draining);
        }
        let codec = profile.make_stream_codec(self.role, false);
        let mut stream = RequestStream::new(id, codec);
        if self.config.partial_reliability {
            stream.offset_tracker = Some(BodyOffsetTracker::default());
        }
        self.streams.insert(id, stream);
        debug!(%id, "transaction created");
        Ok(id)
    }

    pub fn send_headers<T: QuicTransport>(
        &mut self,
        t: &mut T,
        id: StreamId,
        fields: &[HeaderField],
        eom: bool,
    ) -> Result<(), SessionError> {
        let close_armed = {
            let stream = self
                .streams
                .get_mut(&id)
                .ok_or(SessionError::UnknownTransaction(id))?;
            if stream.eom_written || stream.pending_eom {
                return Err(SessionError::EgressComplete(id));
            }
            // The unframed profile signals drain in the message head.
            stream.egress_close_header
                || (self.version == Some(HqVersion::H1qUnframed)
                    && self.drain_state != DrainState::None)
        };

        let profile = self.profile.as_mut().ok_or(SessionError::NotReady)?;
        let qpack = profile.qpack_ref();
        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => return Err(SessionError::UnknownTransaction(id)),
        };

        let mut buf = Vec::new();
        stream
            .codec
            .generate_headers(qpack, fields, close_armed, &mut buf);
        if !stream.headers_sent {
            stream.headers_sent = true;
            stream
                .byte_events
                .add(stream.egress_offset() + 1, ByteEventKind::FirstHeaderByteFlushed);
        }
        if stream.offset_tracker.is_some() {
            let egress_body_offset = stream.egress_offset() + buf.len() as u64;
            stream
                .offset_tracker
                .as_mut()
                .unwrap()
                .start_egress_body(egress_body_offset);
        }
        stream.write_buf.extend_from_slice(&buf);
        if eom {
            stream.pending_eom = true;
        }
        let urgency = stream.urgency;
        self.egress_queue.enqueue(id, urgency);

        if close_armed && self.version == Some(HqVersion::H1qUnframed) {
            // Emitting the close header advances the unframed drain.
            match self.drain_state {
                DrainState::None | DrainState::Pending => {
                    self.drain_state = DrainState::CloseSent
                }
                DrainState::CloseReceived => self.drain_state = DrainState::Done,
                _ => {}
            }
        }
        self.schedule_write(t);
        Ok(())
    }

    pub fn send_body<T: QuicTransport>(
        &mut self,
        t: &mut T,
        id: StreamId,
        data: Bytes,
        eom: bool,
    ) -> Result<(), SessionError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(SessionError::UnknownTransaction(id))?;
        if stream.eom_written {
            return Err(SessionError::EgressComplete(id));
        }
        if !data.is_empty() {
            stream.deferred_body.push_back(data);
        }
        if eom {
            stream.pending_eom = true;
        }
        let urgency = stream.urgency;
        self.egress_queue.enqueue(id, urgency);
        self.schedule_write(t);
        Ok(())
    }

    pub fn send_eom<T: QuicTransport>(&mut self, t: &mut T, id: StreamId) -> Result<(), SessionError> {
        self.send_body(t, id, Bytes::new(), true)
    }

    pub fn send_trailers<T: QuicTransport>(
        &mut self,
        t: &mut T,
        id: StreamId,
        fields: &[HeaderField],
    ) -> Result<(), SessionError> {
        let profile = self.profile.as_mut().ok_or(SessionError::NotReady)?;
        let qpack = profile.qpack_ref();
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(SessionError::UnknownTransaction(id))?;
        if stream.eom_written {
            return Err(SessionError::EgressComplete(id));
        }
        let mut buf = Vec::new();
        stream.codec.generate_trailers(qpack, fields, &mut buf);
        stream.write_buf.extend_from_slice(&buf);
        let urgency = stream.urgency;
        self.egress_queue.enqueue(id, urgency);
        self.schedule_write(t);
        Ok(())
    }

    pub fn send_chunk_header<T: QuicTransport>(
        &mut self,
        t: &mut T,
        id: StreamId,
        len: u64,
    ) -> Result<(), SessionError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(SessionError::UnknownTransaction(id))?;
        let mut buf = Vec::new();
        stream.codec.generate_chunk_header(len, &mut buf);
        stream.write_buf.extend_from_slice(&buf);
        let urgency = stream.urgency;
        self.egress_queue.enqueue(id, urgency);
        self.schedule_write(t);
        Ok(())
    }

    pub fn send_chunk_terminator<T: QuicTransport>(
        &mut self,
        t: &mut T,
        id: StreamId,
    ) -> Result<(), SessionError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(SessionError::UnknownTransaction(id))?;
        let mut buf = Vec::new();
        stream.codec.generate_chunk_terminator(&mut buf);
        stream.write_buf.extend_from_slice(&buf);
        let urgency = stream.urgency;
        self.egress_queue.enqueue(id, urgency);
        self.schedule_write(t);
        Ok(())
    }

    /// Serialize a push promise on the parent request stream.
    pub fn send_push_promise<T: QuicTransport>(
        &mut self,
        t: &mut T,
        parent: StreamId,
        push_id: u64,
        fields: &[HeaderField],
    ) -> Result<(), SessionError> {
        let profile = self.profile.as_mut().ok_or(SessionError::NotReady)?;
        let qpack = profile.qpack_ref();
        let stream = self
            .streams
            .get_mut(&parent)
            .ok_or(SessionError::UnknownTransaction(parent))?;
        let mut buf = Vec::new();
        stream
            .codec
            .generate_push_promise(qpack, push_id, fields, &mut buf);
        stream.write_buf.extend_from_slice(&buf);
        let urgency = stream.urgency;
        self.egress_queue.enqueue(parent, urgency);
        self.schedule_write(t);
        Ok(())
    }

    /// Abort a transaction in both directions.
    pub fn send_abort<T: QuicTransport>(
        &mut self,
        t: &mut T,
        id: StreamId,
        code: ErrorCode,
    ) -> Result<(), SessionError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(SessionError::UnknownTransaction(id))?;
        debug!(%id, %code, "aborting transaction");
        stream.abort_egress();
        stream.abort_ingress();
        // Locally-initiated abort is terminal but not an error event.
        stream.terminal_event_sent = true;
        stream.check_detach_ready();
        self.egress_queue.remove(id);
        let _ = t.reset_stream(id, code);
        let _ = t.stop_sending(id, code);
        if let Some(profile) = self.profile.as_mut() {
            profile.on_stream_abort(id.value());
        }
        self.check_for_shutdown(t);
        Ok(())
    }

    pub fn set_priority(&mut self, id: StreamId, urgency: u8) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.urgency = urgency.min(7);
            self.egress_queue.update_urgency(id, stream.urgency);
        }
    }

    /// Direct ingress peek for partially reliable consumers.
    pub fn peek<'t, T: QuicTransport>(
        &self,
        t: &'t T,
        id: StreamId,
    ) -> Result<&'t [u8], SessionError> {
        if !self.streams.contains_key(&id) {
            return Err(SessionError::UnknownTransaction(id));
        }
        Ok(t.peek(id)?)
    }

    /// Direct ingress consume for partially reliable consumers.
    pub fn consume<T: QuicTransport>(
        &mut self,
        t: &mut T,
        id: StreamId,
        n: usize,
    ) -> Result<(), SessionError> {
        if !self.streams.contains_key(&id) {
            return Err(SessionError::UnknownTransaction(id));
        }
        Ok(t.consume(id, n)?)
    }

    pub fn transport_info<T: QuicTransport>(&self, t: &T) -> TransportInfo {
        t.transport_info()
    }

    pub fn stream_transport_info<T: QuicTransport>(
        &self,
        t: &T,
        id: StreamId,
    ) -> Result<StreamTransportInfo, SessionError> {
        Ok(t.stream_transport_info(id)?)
    }

    // ── Drain / shutdown ────────────────────────────────────────────

    /// Begin a graceful drain: existing transactions complete, new ones
    /// are refused.
    pub fn drain<T: QuicTransport>(&mut self, t: &mut T) {
        self.drain_impl(t);
    }

    /// `notifyPendingShutdown` alias used by connection managers.
    pub fn notify_pending_shutdown<T: QuicTransport>(&mut self, t: &mut T) {
        self.drain_impl(t);
    }

    fn drain_impl<T: QuicTransport>(&mut self, t: &mut T) {
        if self.drain_state != DrainState::None {
            trace!("already draining");
            return;
        }
        debug!("drain starting");
        self.drain_state = DrainState::Pending;
        if self.profile.is_some() {
            self.send_goaway(t);
        }
    }

    /// Drain, then tear down as soon as no streams remain.
    pub fn close_when_idle<T: QuicTransport>(&mut self, t: &mut T) {
        self.drain_impl(t);
        if self.version == Some(HqVersion::H1qUnframed) {
            // No wire signal to wait for beyond per-stream close headers.
            self.drain_state = DrainState::Done;
        }
        self.cleanup_pending_streams(t);
        self.check_for_shutdown(t);
    }

    fn send_goaway<T: QuicTransport>(&mut self, t: &mut T) {
        let Some(profile) = self.profile.as_ref() else {
            return;
        };
        let goaway_stream = match profile.goaway_on_control_stream() {
            Some(stream_type) => stream_type,
            None => {
                // Unframed: arm `Connection: close` on every live response.
                for stream in self.streams.values_mut() {
                    stream.egress_close_header = true;
                }
                return;
            }
        };
        if self.role == Role::Client {
            // Upstream sessions do not send GOAWAY; they simply stop
            // creating streams.
            return;
        }
        if self.drain_state == DrainState::Done || self.drain_state == DrainState::SecondGoaway {
            return;
        }
        let goaway_id = self.goaway_stream_id();

        let Some(cs) = self.control_streams.get_mut(&goaway_stream) else {
            self.drain_state = DrainState::Done;
            return;
        };
        let Some(egress_id) = cs.egress_id else {
            self.drain_state = DrainState::Done;
            return;
        };
        let mut buf = Vec::new();
        Frame::GoAway {
            stream_id: goaway_id,
        }
        .encode(&mut buf);
        cs.write_buf.extend_from_slice(&buf);

        let (write_offset, buffered) = match (
            t.stream_write_offset(egress_id),
            t.stream_write_buffered(egress_id),
        ) {
            (Ok(o), Ok(b)) => (o, b),
            _ => {
                error!("cannot compute goaway offset, shutting down");
                self.drain_state = DrainState::Done;
                return;
            }
        };
        let ack_offset = write_offset + buffered + cs.write_buf.len() as u64;
        if t.register_delivery_callback(egress_id, ack_offset).is_err() {
            error!("cannot register goaway delivery callback, shutting down");
            self.drain_state = DrainState::Done;
            return;
        }
        cs.goaway_delivery_offsets.push(ack_offset);
        debug!(goaway_id, ack_offset, state = ?self.drain_state, "goaway generated");

        self.drain_state = match self.drain_state {
            DrainState::Pending => DrainState::FirstGoaway,
            _ => DrainState::SecondGoaway,
        };
        self.schedule_write(t);
    }

    /// The first GOAWAY advertises the largest representable id; the second
    /// pins the largest stream actually accepted.
    fn goaway_stream_id(&self) -> u64 {
        match self.drain_state {
            DrainState::None | DrainState::Pending => VARINT_MAX,
            _ => self.max_incoming_stream_id,
        }
    }

    fn on_goaway_ack<T: QuicTransport>(&mut self, t: &mut T) {
        debug!(state = ?self.drain_state, "goaway delivered");
        match self.drain_state {
            DrainState::FirstGoaway => self.send_goaway(t),
            DrainState::SecondGoaway => self.drain_state = DrainState::Done,
            _ => {}
        }
        self.check_for_shutdown(t);
    }

    /// Tear the connection down now.
    pub fn drop_connection<T: QuicTransport>(&mut self, t: &mut T, reason: &str) {
        let msg = if reason.is_empty() { "Stopping" } else { reason };
        self.drop_connection_sync(
            t,
            ErrorCode::HttpNoError,
            msg.to_string(),
            HttpError::Dropped,
        );
    }

    /// Latch a drop for the top of the next loop tick. Only the first
    /// request wins; later ones are absorbed.
    fn drop_connection_async(&mut self, code: ErrorCode, msg: String, error: HttpError) {
        if self.drop_in_next_loop.is_none() {
            self.drop_in_next_loop = Some((code, msg, error));
        } else {
            trace!("drop already scheduled");
        }
    }

    fn drop_connection_sync<T: QuicTransport>(
        &mut self,
        t: &mut T,
        code: ErrorCode,
        msg: String,
        error: HttpError,
    ) {
        if self.dropping {
            trace!("already dropping");
            return;
        }
        self.dropping = true;
        debug!(%code, msg, "dropping connection");
        if !self.streams.is_empty() || code != ErrorCode::HttpNoError {
            t.close(Some((code, msg)));
            let ids: Vec<StreamId> = self.streams.keys().copied().collect();
            for id in ids {
                self.error_on_transaction(id, error);
            }
        } else {
            t.close(None);
        }
        self.drain_state = DrainState::Done;
        // Every stream was just failed and detached; reap and finish.
        self.streams.clear();
        self.destroy(t, Some(error));
    }

    /// Deliver the terminal error to a transaction and tear down its
    /// stream state. At most one terminal event per transaction.
    fn error_on_transaction(&mut self, id: StreamId, error: HttpError) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        if !stream.terminal_event_sent && !stream.detached {
            stream.terminal_event_sent = true;
            self.events.push_back(SessionEvent::TxnError { id, error });
        }
        stream.abort_ingress();
        stream.abort_egress();
        stream.check_detach_ready();
        self.egress_queue.remove(id);
        self.pending_process_read.remove(&id);
    }

    fn cleanup_pending_streams<T: QuicTransport>(&mut self, t: &mut T) {
        for id in self.dispatcher.drain_pending() {
            trace!(%id, "clearing pending uni stream");
            t.clear_stream_callbacks(id);
        }
    }

    fn check_for_shutdown<T: QuicTransport>(&mut self, t: &mut T) {
        // A draining upstream with a control stream never sends GOAWAY; it
        // just stops opening streams and shuts down when the last one ends.
        if self.version != Some(HqVersion::H1qUnframed)
            && self.role == Role::Client
            && self.drain_state == DrainState::Pending
        {
            self.drain_state = DrainState::Done;
        }

        let reap: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.eligible_for_destruction())
            .map(|(id, _)| *id)
            .collect();
        for id in reap {
            trace!(%id, "reaping stream");
            if let Some(stream) = self.streams.remove(&id)
                && let Some(push_id) = stream.ingress_push_id
            {
                self.ingress_push_ids.remove(&push_id);
            }
            self.egress_queue.remove(id);
            self.pending_process_read.remove(&id);
        }

        if self.drain_state == DrainState::Done && self.streams.is_empty() && !self.destroyed {
            t.close(None);
            self.destroy(t, None);
        }
    }

    /// The single point where the session ends. Emits `Destroyed` once.
    fn destroy<T: QuicTransport>(&mut self, t: &mut T, error: Option<HttpError>) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.cleanup_pending_streams(t);
        self.egress_queue.clear();
        self.pending_process_read.clear();
        debug!(?error, "session destroyed");
        self.events.push_back(SessionEvent::Destroyed { error });
    }

    // ── Timeouts ────────────────────────────────────────────────────

    /// Idle timeout hook. Returns `true` when the session started closing;
    /// `false` means streams are active and the driver should re-arm.
    pub fn timeout_expired<T: QuicTransport>(&mut self, t: &mut T) -> bool {
        if !self.streams.is_empty() {
            trace!("ignoring idle timeout, streams active");
            return false;
        }
        debug!("idle timeout, closing");
        self.close_when_idle(t);
        true
    }

    /// Per-transaction timeout: abort ingress if it never finished.
    pub fn on_transaction_timeout<T: QuicTransport>(&mut self, t: &mut T, id: StreamId) {
        let Some(stream) = self.streams.get(&id) else {
            return;
        };
        if !stream.ingress_complete && !stream.ingress_error {
            let _ = t.stop_sending(id, ErrorCode::HttpInternalError);
        }
        self.error_on_transaction(id, HttpError::Timeout);
        self.check_for_shutdown(t);
    }

    // ── The loop ────────────────────────────────────────────────────

    fn schedule_write<T: QuicTransport>(&mut self, t: &mut T) {
        t.notify_pending_write();
    }

    /// One event-loop iteration.
    pub fn run_loop<T: QuicTransport>(&mut self, t: &mut T) {
        if self.destroyed {
            return;
        }
        if let Some((code, msg, error)) = self.drop_in_next_loop.take() {
            self.drop_connection_sync(t, code, msg, error);
            return;
        }
        self.reads_this_loop = 0;

        // (2) reads accumulated since the last tick.
        self.process_read_data();

        // (3) profile hook: QPACK decoder instructions generated while
        // reading land on the decoder stream before control writes.
        if let Some(profile) = self.profile.as_mut()
            && let Some(bytes) = profile.take_decoder_stream_bytes()
            && let Some(cs) = self.control_streams.get_mut(&UniStreamType::QpackDecoder)
        {
            cs.write_buf.extend_from_slice(&bytes);
        }

        // (4)(5) writes under the connection budget.
        let budget_granted = self.max_to_send > 0;
        let mut budget = self.max_to_send;
        budget -= self.write_control_streams(t, budget);
        if !self.egress_queue.is_empty() && budget > 0 {
            self.write_request_streams(t, budget);
        }
        // Nothing else egresses until the next write-ready grant.
        self.max_to_send = 0;

        if !self.egress_queue.is_empty() || self.has_pending_control_egress() {
            self.schedule_write(t);
        }
        if budget_granted {
            if self.egress_queue.is_empty() {
                self.resume_transactions();
            } else {
                self.pause_transactions();
            }
        }

        // (6)
        self.check_for_shutdown(t);
    }

    fn has_pending_control_egress(&self) -> bool {
        self.control_streams
            .values()
            .any(|cs| !cs.write_buf.is_empty())
    }

    fn write_control_streams<T: QuicTransport>(&mut self, t: &mut T, budget: u64) -> u64 {
        let mut remaining = budget;
        let types: Vec<UniStreamType> = self.control_streams.keys().copied().collect();
        for stream_type in types {
            if remaining == 0 {
                break;
            }
            let cs = match self.control_streams.get_mut(&stream_type) {
                Some(cs) => cs,
                None => continue,
            };
            if cs.write_buf.is_empty() {
                continue;
            }
            let Some(egress_id) = cs.egress_id else {
                continue;
            };
            let window = match t.stream_flow_control(egress_id) {
                Ok(fc) => fc.send_window_available,
                Err(_) => {
                    self.drop_connection_async(
                        ErrorCode::HttpClosedCriticalStream,
                        "flow control query failed on control stream".to_string(),
                        HttpError::WriteError,
                    );
                    return budget - remaining;
                }
            };
            let can_send = (window.min(remaining) as usize).min(cs.write_buf.len());
            if can_send == 0 {
                continue;
            }
            let sent = match t.write_chain(egress_id, &cs.write_buf[..can_send], false) {
                Ok(n) => n,
                Err(e) => {
                    error!(%egress_id, %e, "write error on control stream");
                    self.drop_connection_async(
                        ErrorCode::HttpClosedCriticalStream,
                        "write error on control stream".to_string(),
                        HttpError::WriteError,
                    );
                    return budget - remaining;
                }
            };
            let _ = cs.write_buf.split_to(sent);
            cs.bytes_written += sent as u64;
            trace!(%egress_id, sent, "control stream write");
            remaining -= sent as u64;
        }
        budget - remaining
    }

    fn write_request_streams<T: QuicTransport>(&mut self, t: &mut T, budget: u64) {
        let mut remaining = budget;
        let mut next_egress = Vec::new();
        self.egress_queue.next_egress(&mut next_egress);
        for (id, ratio) in next_egress {
            if remaining == 0 {
                debug!("more to send than the transport could take");
                break;
            }
            let sent = self.request_stream_write(t, id, remaining, ratio);
            remaining -= sent.min(remaining);
        }
    }

    fn request_stream_write<T: QuicTransport>(
        &mut self,
        t: &mut T,
        id: StreamId,
        budget: u64,
        ratio: f64,
    ) -> u64 {
        if !self.egress_queue.contains(id) {
            // An abort during this pass already dequeued it.
            return 0;
        }
        let window = match t.stream_flow_control(id) {
            Ok(fc) => fc.send_window_available,
            Err(_) => {
                self.error_on_transaction(id, HttpError::WriteError);
                return 0;
            }
        };
        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => {
                self.egress_queue.remove(id);
                return 0;
            }
        };

        let can_send = window.min(budget) as usize;
        if stream.wants_write_invitation(can_send) {
            let max_body = can_send.saturating_sub(stream.write_buf.len());
            trace!(%id, can_send, max_body, ratio, "inviting body fill");
            stream.fill_write_buf(max_body);
        }
        if stream.write_buf.is_empty() && !stream.pending_eom {
            self.egress_queue.remove(id);
            return 0;
        }

        let send_len = can_send.min(stream.write_buf.len());
        let fin = stream.pending_eom
            && !stream.has_pending_body()
            && send_len == stream.write_buf.len();
        if send_len == 0 && !fin {
            // Flow-control blocked: out of the ready queue until an update.
            trace!(%id, window, "flow control blocked");
            self.egress_queue.remove(id);
            stream.flow_blocked = true;
            if !stream.egress_complete && !stream.egress_paused {
                stream.egress_paused = true;
                self.events.push_back(SessionEvent::EgressPaused { id });
            }
            return 0;
        }

        let sent = match t.write_chain(id, &stream.write_buf[..send_len], fin) {
            Ok(n) => n,
            Err(e) => {
                debug!(%id, %e, "write error on request stream");
                self.error_on_transaction(id, HttpError::WriteError);
                let _ = t.reset_stream(id, ErrorCode::HttpRequestCancelled);
                return 0;
            }
        };
        let _ = stream.write_buf.split_to(sent);
        stream.bytes_written += sent as u64;
        let fin_sent = fin && sent == send_len;

        if fin_sent {
            stream.pending_eom = false;
            stream.eom_written = true;
            stream.egress_complete = true;
            let offset = stream.bytes_written;
            match t.register_delivery_callback(id, offset) {
                Ok(()) => {
                    // Hold the transaction open until the last byte is
                    // acked. The counter and the ack event move together.
                    stream.pending_byte_event_count += 1;
                    stream
                        .byte_events
                        .add(offset, ByteEventKind::LastByteFlushed);
                    stream.byte_events.add(offset, ByteEventKind::LastByteAcked);
                }
                Err(e) => {
                    // No ack can ever arrive for this offset; fail the
                    // transaction rather than arm events that cannot fire.
                    debug!(%id, %e, "delivery callback registration failed");
                    self.error_on_transaction(id, HttpError::WriteError);
                    return sent as u64;
                }
            }
        }

        for fired in stream.byte_events.process_flushed(stream.bytes_written) {
            self.events.push_back(SessionEvent::ByteEvent {
                id,
                kind: fired.kind,
                offset: fired.offset,
            });
        }

        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => return sent as u64,
        };
        let flow_blocked = sent as u64 == window && !fin_sent;
        if !stream.has_pending_egress() || flow_blocked {
            self.egress_queue.remove(id);
        } else {
            self.egress_queue.rotate(id);
        }
        if flow_blocked {
            stream.flow_blocked = true;
            if !stream.egress_complete && !stream.egress_paused {
                stream.egress_paused = true;
                self.events.push_back(SessionEvent::EgressPaused { id });
            }
        }
        if fin_sent {
            stream.check_detach_ready();
        }
        trace!(%id, sent, fin_sent, flow_blocked, "request stream write");
        sent as u64
    }

    fn pause_transactions(&mut self) {
        let ids: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|&(id, s)| !s.egress_paused && self.egress_queue.contains(*id))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.egress_paused = true;
                self.events.push_back(SessionEvent::EgressPaused { id });
            }
        }
    }

    fn resume_transactions(&mut self) {
        // Flow-blocked streams stay paused until their window reopens.
        let ids: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.egress_paused && !s.flow_blocked)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.egress_paused = false;
                self.events.push_back(SessionEvent::EgressResumed { id });
            }
        }
    }
}

fn peer_of(role: Role) -> Role {
    match role {
        Role::Client => Role::Server,
        Role::Server => Role::Client,
    }
}
