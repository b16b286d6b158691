//! birpc: bidirectional RPC with JSON messages.
//!
//! Unlike traditional RPC where one side is permanently the client, every
//! birpc endpoint is symmetrically both: either peer may call methods the
//! other has registered, at any time, concurrently, over one shared
//! connection. Messages with sequence number 0 are "untagged" notifications
//! and are never responded to, so the same wire carries immediate
//! fire-and-forget events alongside request/response traffic.
//!
//! This crate defines:
//! - The wire envelope ([`Message`], [`RemoteError`])
//! - The transport-adapter contract ([`Codec`], [`Incoming`])
//! - The method table ([`Registry`], [`Service`], [`ServiceScope`])
//! - The session state machine ([`Endpoint`], [`EndpointHandle`])
//! - Handler context ([`CallContext`], [`Extensions`])
//! - Error types ([`CodecError`], [`CallError`], [`ServeError`])
//!
//! Transports live in sibling crates; anything that can frame one JSON
//! object per message and carry a ping/pong heartbeat can implement
//! [`Codec`]. The WebSocket codec is the reference deployment.

mod codec;
mod context;
mod endpoint;
mod error;
mod message;
mod registry;

pub use codec::*;
pub use context::*;
pub use endpoint::*;
pub use error::*;
pub use message::*;
pub use registry::*;
