//! hqline-transport — the QUIC transport contract for the hqline session core.
//!
//! The session core multiplexes HTTP exchanges over a single QUIC connection
//! but does not implement QUIC itself. This crate defines the boundary: the
//! [`QuicTransport`] trait is everything the session asks of a transport
//! (per-stream writes with FIN, peek/consume reads, resets, flow-control
//! queries, delivery-acknowledgement registration), and the session exposes
//! `on_*` handlers for the events a transport delivers in return.
//!
//! ```text
//!   QUIC implementation (out of scope)
//!        │ on_new_*_stream / on_read_available / on_delivery_ack / ...
//!   ┌────▼─────────┐
//!   │ hqline-sessn │  drives the transport back through `QuicTransport`
//!   └──────────────┘
//! ```
//!
//! [`LoopbackTransport`] is an in-process implementation with a scriptable
//! peer side, used by the session's round-trip tests.

pub mod error;
pub mod loopback;
pub mod traits;
pub mod types;

pub use error::TransportError;
pub use loopback::LoopbackTransport;
pub use traits::QuicTransport;
pub use types::{
    ErrorCode, FlowControlState, ReadError, Role, StreamId, StreamTransportInfo, TransportInfo,
    UniStreamType, VARINT_MAX,
};
