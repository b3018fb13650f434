//! hqline-session — HTTP-over-QUIC session core.
//!
//! This crate multiplexes many concurrent HTTP request/response exchanges
//! over a single QUIC connection. It sits between a QUIC transport (the
//! [`hqline_transport::QuicTransport`] contract) and an HTTP transaction
//! layer, handling per-stream codec state, connection-level control
//! (SETTINGS, GOAWAY, the QPACK encoder/decoder streams, push), egress
//! scheduling under shared flow control, and orderly drain/shutdown.
//!
//! # Architecture
//!
//! ```text
//!   QUIC transport (quinn-proto, mvfst, ...)
//!        │ on_new_*_stream / on_read_available / on_delivery_ack ...
//!   ┌────▼─────────────────────────────────────────────┐
//!   │ HqSession                                        │
//!   │   version profile (h3 / h1q-framed / h1q)        │
//!   │   uni-stream dispatcher ──► control streams      │
//!   │   stream registry ──► request stream codecs      │
//!   │   egress scheduler ──► transport write_chain     │
//!   └────┬─────────────────────────────────────────────┘
//!        │ SessionEvent: Headers, Body, MessageComplete, TxnError ...
//!   HTTP transaction layer
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use hqline_session::{HqSession, SessionConfig, SessionEvent};
//! use hqline_transport::Role;
//!
//! let mut session = HqSession::new(Role::Server, SessionConfig::default());
//! session.on_transport_ready(&mut quic, "h3-27")?;
//!
//! // Driver loop: feed transport events, then tick.
//! session.on_new_bidirectional_stream(&mut quic, stream_id);
//! session.on_read_available(&mut quic, stream_id);
//! session.on_connection_write_ready(&mut quic, 65536);
//! session.run_loop(&mut quic);
//!
//! while let Some(event) = session.poll_event() {
//!     match event {
//!         SessionEvent::Headers { id, fields } => { /* route the request */ }
//!         SessionEvent::MessageComplete { id } => {
//!             session.send_headers(&mut quic, id, &response, false)?;
//!             session.send_body(&mut quic, id, body, true)?;
//!         }
//!         _ => {}
//!     }
//! }
//! ```

pub mod byte_event;
pub mod codec;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod frame;
pub mod h1;
pub mod prerel;
pub mod profile;
pub mod qpack;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod stream;

pub use byte_event::ByteEventKind;
pub use config::SessionConfig;
pub use error::{CodecError, HttpError, SessionError};
pub use event::SessionEvent;
pub use profile::HqVersion;
pub use qpack::HeaderField;
pub use session::{DrainState, HqSession};
pub use settings::HqSettings;

// Re-export the transport contract types that appear in this crate's API.
pub use hqline_transport::{ErrorCode, ReadError, Role, StreamId, UniStreamType};
