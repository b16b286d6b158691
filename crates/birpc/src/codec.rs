//! The transport-adapter contract.

use std::future::Future;

use crate::context::Extensions;
use crate::error::CodecError;
use crate::message::Message;

/// One frame delivered by a [`Codec`]'s read side.
///
/// Heartbeats are transport-level frames, not envelopes; surfacing them as
/// variants lets the endpoint's reader loop react to them in place (answer
/// pings, record pongs) without a callback registration step.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// A complete envelope.
    Message(Message),
    /// Heartbeat probe from the peer; the endpoint answers with a pong.
    Ping,
    /// Heartbeat answer from the peer; the endpoint records liveness.
    Pong,
}

/// The adapter between a duplex transport and an [`Endpoint`](crate::Endpoint):
/// frames envelopes, carries heartbeats, and publishes connection-scoped
/// values to handlers.
///
/// # Concurrency contract
///
/// The endpoint has exactly one reader task, so `recv` is never called
/// concurrently. The write side has no such guarantee: `send`, `ping`, and
/// `pong` are called from the reader, the heartbeat, and one task per
/// outbound call, all at once. The codec MUST serialise writes internally
/// (an async mutex on the sink, or a channel that orders them naturally);
/// interleaved writes would corrupt the stream.
pub trait Codec: Send + Sync + 'static {
    /// Block until the next frame is decoded.
    ///
    /// Returns [`CodecError::Closed`] at end of stream.
    fn recv(&self) -> impl Future<Output = Result<Incoming, CodecError>> + Send;

    /// Write one envelope. May be called concurrently.
    ///
    /// A failure here is fatal for the connection; the endpoint does not
    /// retry.
    fn send(&self, msg: &Message) -> impl Future<Output = Result<(), CodecError>> + Send;

    /// Emit a heartbeat probe.
    ///
    /// If the transport has no native heartbeat frame, the codec may encode
    /// one however it likes, as long as the peer's codec surfaces it as
    /// [`Incoming::Ping`].
    fn ping(&self) -> impl Future<Output = Result<(), CodecError>> + Send;

    /// Answer a heartbeat probe.
    fn pong(&self) -> impl Future<Output = Result<(), CodecError>> + Send;

    /// Shut the transport down. Idempotent; unblocks in-flight reads and
    /// writes with [`CodecError::Closed`].
    fn close(&self) -> impl Future<Output = Result<(), CodecError>> + Send;

    /// Publish connection-scoped values for handlers.
    ///
    /// Called once when an endpoint binds the codec. Whatever the codec
    /// inserts here (its peer address, the underlying connection handle)
    /// is readable from every handler through
    /// [`CallContext::get`](crate::CallContext::get). The default publishes
    /// nothing.
    fn fill_extensions(&self, ext: &mut Extensions) {
        let _ = ext;
    }
}
