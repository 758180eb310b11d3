//! Binary RPC framing protocol for the binder.
//!
//! The protocol is asymmetric: a client emits calls and describe requests,
//! a server answers them and owns the event lifecycle. Frames are
//! length-delimited little-endian binary messages carried over any channel
//! that preserves message boundaries (WebSocket binary messages, an
//! in-process channel in tests).
//!
//! Three layers:
//!
//! - [`codec`] — the [`Message`] enum with `encode`/`decode`.
//! - [`transport`] — the [`Transport`] trait the endpoint writes through.
//! - [`endpoint`] — the [`Endpoint`] engine: call/describe correlation,
//!   event routing, hangup draining.

pub mod codec;
pub mod endpoint;
pub mod transport;

pub use codec::{DecodeError, Message};
pub use endpoint::{
    CallListener, ClientHooks, DescribeCallback, DescribeRequest, Endpoint, IncomingCall,
    QueuingHook, ServerHooks, WireError,
};
pub use transport::{ChannelTransport, Transport, DEFAULT_SEND_CAPACITY, MAX_TOTAL_DROPS};
