//! Endpoint: one side of an active bidirectional RPC session.
//!
//! An endpoint owns one [`Codec`] and multiplexes two directions over it:
//! outbound calls correlated through a sequence-numbered pending table, and
//! inbound requests dispatched onto a shared [`Registry`]. The key invariant
//! is that only [`Endpoint::serve`]'s reader loop calls `Codec::recv`; every
//! other actor (one write task per outbound call, one task per inbound
//! request, the heartbeat) goes through the codec's concurrency-safe write
//! side.
//!
//! ```text
//!                  ┌───────────────────────────────┐
//!                  │           Endpoint            │
//!                  ├───────────────────────────────┤
//!                  │  codec                        │
//!                  │  client: seq + pending map    │
//!                  │  registry: Arc<Registry>      │
//!                  └──────────────┬────────────────┘
//!                                 │
//!                            reader loop
//!                                 │
//!          ┌──────────────┬──────┴────────┬──────────────────┐
//!          │              │               │                  │
//!     ping/pong     response (fn "")  request (fn set)  "getMethods"
//!          │              │               │                  │
//!    answer/record   wake pending    spawn handler,     answer inline
//!                    oneshot         send reply back
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::codec::{Codec, Incoming};
use crate::context::{CallContext, Extensions};
use crate::error::{CallError, CodecError, ServeError};
use crate::message::{GET_METHODS, Message, encode_payload};
use crate::registry::{MethodHandler, Registry};

/// Error message returned for a request naming no registered method.
const NO_SUCH_FUNCTION: &str = "No such function.";

/// Endpoint tuning knobs.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Heartbeat period. A peer that answers no ping for twice this long is
    /// declared dead and `serve` fails with "remote connection is timeout.".
    pub ping_period: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            ping_period: Duration::from_secs(10),
        }
    }
}

/// What the reader delivers to a waiting caller: the peer's error, or the
/// still-encoded result payload.
type CallOutcome = Result<Option<Box<RawValue>>, CallError>;

/// Outbound-side record correlating an issued call with its response.
struct PendingEntry {
    method: String,
    tx: oneshot::Sender<CallOutcome>,
}

/// Sequence counter and pending table. Mutated together under one lock so
/// an ID is never observable without its entry.
#[derive(Default)]
struct ClientState {
    seq: u64,
    pending: HashMap<u64, PendingEntry>,
}

struct Inner<C> {
    codec: C,
    registry: Arc<Registry>,
    config: EndpointConfig,
    client: Mutex<ClientState>,
    /// Milliseconds since `started` (monotonic), written by the reader on
    /// pong, read by the heartbeat.
    last_pong_ms: AtomicU64,
    started: Instant,
    closed: AtomicBool,
    /// Cancelled by [`Endpoint::close`]; ends `serve` without waiting for
    /// the peer to acknowledge anything.
    shutdown: CancellationToken,
    /// Handlers in flight; drained before `serve` returns.
    running: TaskTracker,
    extensions: Arc<Extensions>,
}

/// One side of an active bidirectional RPC session, bound to one codec.
///
/// Both peers are symmetric: either may issue calls while serving the
/// other's. Clones are cheap and share the session. To actually process
/// messages, run [`serve`](Self::serve); it is kept separate from
/// construction so connection errors can be captured.
pub struct Endpoint<C: Codec> {
    inner: Arc<Inner<C>>,
    handle: EndpointHandle,
}

impl<C: Codec> Clone for Endpoint<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<C: Codec> Endpoint<C> {
    /// Bind a codec and a registry. Pass an empty registry to serve no
    /// callables to this peer.
    pub fn new(codec: C, registry: Arc<Registry>) -> Self {
        Self::with_config(codec, registry, EndpointConfig::default())
    }

    pub fn with_config(codec: C, registry: Arc<Registry>, config: EndpointConfig) -> Self {
        let mut extensions = Extensions::new();
        codec.fill_extensions(&mut extensions);

        let inner = Arc::new(Inner {
            codec,
            registry,
            config,
            client: Mutex::new(ClientState::default()),
            last_pong_ms: AtomicU64::new(0),
            started: Instant::now(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            running: TaskTracker::new(),
            extensions: Arc::new(extensions),
        });
        let handle = EndpointHandle {
            caller: Arc::new(inner.clone()),
        };
        Self { inner, handle }
    }

    /// A type-erased handle for issuing calls without naming the codec type.
    pub fn handle(&self) -> EndpointHandle {
        self.handle.clone()
    }

    /// Whether `serve` has terminated (or the endpoint was never served and
    /// explicitly shut down). New calls on a closed endpoint fail promptly.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Issue an asynchronous call. The returned [`PendingCall`] resolves to
    /// the decoded reply.
    ///
    /// The pending entry is installed before anything touches the wire, and
    /// the write itself runs on its own task, so a peer that refuses to
    /// read can never block the caller.
    pub fn go<A, R>(&self, method: &str, args: &A) -> Result<PendingCall<R>, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.handle.go(method, args)
    }

    /// Invoke `method` on the peer and wait for its reply.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.handle.call(method, args).await
    }

    /// Like [`call`](Self::call), giving up after `timeout`.
    ///
    /// On expiry the caller sees [`CallError::DeadlineExceeded`]. The
    /// request is already on the wire and is not retracted; the eventual
    /// response is dropped silently.
    pub async fn call_with_deadline<A, R>(
        &self,
        method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.handle.call_with_deadline(method, args, timeout).await
    }

    /// Send an untagged notification: a request with sequence number 0 that
    /// the peer dispatches but never answers.
    pub fn notify<A>(&self, method: &str, args: &A) -> Result<(), CallError>
    where
        A: Serialize + ?Sized,
    {
        self.handle.notify(method, args)
    }

    /// Actively shut the connection down.
    ///
    /// A running [`serve`](Self::serve) stops reading immediately and goes
    /// through its normal teardown (drain handlers, fail pending calls)
    /// before returning `Ok`; the codec close also tells the peer the
    /// conversation is over.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        if let Err(e) = self.inner.codec.close().await {
            debug!(error = %e, "closing codec");
        }
    }

    /// Serve the connection until the peer disconnects or a fatal error
    /// occurs.
    ///
    /// Runs the reader and the heartbeat; the first failure wins and
    /// becomes the return value (a clean peer close is `Ok`). Before
    /// returning, the codec is closed, every dispatched handler has run to
    /// completion, and outbound calls still pending fail with
    /// [`CallError::Closed`]. The endpoint is single-use: after `serve`
    /// returns it stays closed.
    pub async fn serve(&self) -> Result<(), ServeError> {
        let inner = &self.inner;

        // A peer that never pongs is declared dead two periods from now.
        inner
            .last_pong_ms
            .store(inner.started.elapsed().as_millis() as u64, Ordering::Release);

        let ctx = CallContext::new(self.handle.clone(), inner.extensions.clone());
        let result = tokio::select! {
            r = inner.clone().read_loop(ctx) => r,
            r = inner.heartbeat_loop() => r,
            _ = inner.shutdown.cancelled() => Ok(()),
        };

        inner.closed.store(true, Ordering::Release);
        if let Err(e) = inner.codec.close().await {
            debug!(error = %e, "closing codec after serve");
        }

        // Drain: dispatched handlers finish before we report termination.
        // Their replies go nowhere, but they are not cancelled mid-flight.
        inner.running.close();
        inner.running.wait().await;

        inner.fail_all_pending();

        result
    }
}

impl<C: Codec> Inner<C> {
    async fn read_loop(self: Arc<Self>, ctx: CallContext) -> Result<(), ServeError> {
        loop {
            let incoming = match self.codec.recv().await {
                Ok(frame) => frame,
                Err(CodecError::Closed) => {
                    debug!("peer closed the connection");
                    return Ok(());
                }
                Err(e) => return Err(ServeError::Read(e)),
            };

            match incoming {
                Incoming::Ping => {
                    // Answered in place; the codec's write side is quick and
                    // serialised, so the reader is not meaningfully stalled.
                    if let Err(e) = self.codec.pong().await {
                        return Err(ServeError::Write(e));
                    }
                }
                Incoming::Pong => {
                    let now = self.started.elapsed().as_millis() as u64;
                    self.last_pong_ms.store(now, Ordering::Release);
                }
                Incoming::Message(msg) if msg.is_request() => {
                    Self::serve_request(&self, msg, &ctx).await?;
                }
                Incoming::Message(msg) => {
                    self.serve_response(msg)?;
                }
            }
        }
    }

    async fn serve_request(
        this: &Arc<Self>,
        msg: Message,
        ctx: &CallContext,
    ) -> Result<(), ServeError> {
        // Sequence 0 marks an untagged notification: it is dispatched like
        // any request but nothing is ever written back, not even errors.
        let respond = msg.id != 0;

        if msg.func == GET_METHODS {
            if respond {
                let names = this.registry.method_names();
                match encode_payload(&names) {
                    Ok(raw) => {
                        let reply = Message::response(msg.id, raw);
                        this.codec.send(&reply).await.map_err(ServeError::Write)?;
                    }
                    Err(e) => warn!(error = %e, "encoding method list"),
                }
            }
            return Ok(());
        }

        let Some(handler) = this.registry.lookup(&msg.func) else {
            debug!(method = %msg.func, "request for unregistered method");
            if respond {
                let reply = Message::error_response(msg.id, NO_SUCH_FUNCTION);
                this.codec.send(&reply).await.map_err(ServeError::Write)?;
            }
            return Ok(());
        };

        // The reader never waits for handlers; each request runs on its own
        // task and parallelism across requests is unbounded.
        let inner = this.clone();
        let ctx = ctx.clone();
        this.running.spawn(async move {
            inner.dispatch(handler, msg, ctx).await;
        });
        Ok(())
    }

    async fn dispatch(&self, handler: Arc<MethodHandler>, msg: Message, ctx: CallContext) {
        let id = msg.id;
        let respond = id != 0;

        let reply = match handler(ctx, msg.args).await {
            Ok(raw) => Message::response(id, raw),
            Err(e) => {
                if !respond {
                    warn!(method = %msg.func, error = %e, "notification handler failed");
                    return;
                }
                Message::error_response(id, e.msg())
            }
        };

        if !respond {
            return;
        }

        if let Err(e) = self.codec.send(&reply).await {
            // The reply cannot be delivered, and neither can this error;
            // all that is left is to give up on the connection.
            warn!(method = %msg.func, error = %e, "sending reply failed, closing connection");
            let _ = self.codec.close().await;
        }
    }

    fn serve_response(&self, msg: Message) -> Result<(), ServeError> {
        let entry = self.client.lock().pending.remove(&msg.id);
        let Some(entry) = entry else {
            return Err(ServeError::UnknownSeq(msg.id));
        };

        let outcome = match msg.error {
            Some(err) => Err(CallError::Remote(err)),
            None => Ok(msg.result),
        };

        // The receiver may already be gone when the call's deadline won the
        // race; a late response is dropped without further ceremony.
        if entry.tx.send(outcome).is_err() {
            debug!(id = msg.id, method = %entry.method, "dropping late response");
        }
        Ok(())
    }

    async fn heartbeat_loop(&self) -> Result<(), ServeError> {
        let period = self.config.ping_period;
        let deadline = 2 * period;

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The zeroth tick completes immediately; the first ping goes out one
        // full period after serve starts.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.codec.ping().await.is_err() {
                return Err(ServeError::PingSend);
            }
            let last = Duration::from_millis(self.last_pong_ms.load(Ordering::Acquire));
            if self.started.elapsed().saturating_sub(last) > deadline {
                return Err(ServeError::PingTimeout);
            }
        }
    }

    /// Remove one pending call and fail it. Used when its write task dies.
    fn fail_call(&self, id: u64, err: CallError) {
        let entry = self.client.lock().pending.remove(&id);
        if let Some(entry) = entry {
            let _ = entry.tx.send(Err(err));
        }
    }

    /// Fail every call still pending. Runs once, as the last act of `serve`.
    fn fail_all_pending(&self) {
        let entries: Vec<PendingEntry> = {
            let mut client = self.client.lock();
            client.pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.tx.send(Err(CallError::Closed));
        }
    }
}

/// Object-safe core of the outbound-call path. `Endpoint` and
/// `EndpointHandle` both funnel through this, so handlers can hold a handle
/// without naming the codec type.
trait RawCaller: Send + Sync {
    fn go_raw(
        &self,
        method: &str,
        args: Option<Box<RawValue>>,
    ) -> Result<oneshot::Receiver<CallOutcome>, CallError>;

    fn notify_raw(&self, method: &str, args: Option<Box<RawValue>>) -> Result<(), CallError>;
}

impl<C: Codec> RawCaller for Arc<Inner<C>> {
    fn go_raw(
        &self,
        method: &str,
        args: Option<Box<RawValue>>,
    ) -> Result<oneshot::Receiver<CallOutcome>, CallError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CallError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        let msg = {
            let mut client = self.client.lock();
            client.seq += 1;
            let id = client.seq;
            client.pending.insert(
                id,
                PendingEntry {
                    method: method.to_owned(),
                    tx,
                },
            );
            Message::request(id, method, args)
        };

        // Sending happens off the caller's task so a malicious peer that
        // refuses to read can never make `go` block.
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.codec.send(&msg).await {
                warn!(method = %msg.func, error = %e, "sending request failed");
                inner.fail_call(msg.id, CallError::Transport(e));
            }
        });
        Ok(rx)
    }

    fn notify_raw(&self, method: &str, args: Option<Box<RawValue>>) -> Result<(), CallError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CallError::Closed);
        }

        let msg = Message::request(0, method, args);
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.codec.send(&msg).await {
                warn!(method = %msg.func, error = %e, "sending notification failed");
            }
        });
        Ok(())
    }
}

/// A type-erased, cheaply cloneable handle for issuing outbound calls.
///
/// Handlers receive one through
/// [`CallContext::endpoint`](crate::CallContext::endpoint), which lets them
/// call back to the peer over the same connection; user code can obtain one
/// from [`Endpoint::handle`] when it must not name the codec type.
#[derive(Clone)]
pub struct EndpointHandle {
    caller: Arc<dyn RawCaller>,
}

impl EndpointHandle {
    /// See [`Endpoint::go`].
    pub fn go<A, R>(&self, method: &str, args: &A) -> Result<PendingCall<R>, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = encode_payload(args).map_err(CallError::Encode)?;
        let rx = self.caller.go_raw(method, Some(payload))?;
        Ok(PendingCall {
            rx,
            method: method.to_owned(),
            _reply: PhantomData,
        })
    }

    /// See [`Endpoint::call`].
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.go(method, args)?.await
    }

    /// See [`Endpoint::call_with_deadline`].
    pub async fn call_with_deadline<A, R>(
        &self,
        method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        match tokio::time::timeout(timeout, self.go(method, args)?).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::DeadlineExceeded),
        }
    }

    /// See [`Endpoint::notify`].
    pub fn notify<A>(&self, method: &str, args: &A) -> Result<(), CallError>
    where
        A: Serialize + ?Sized,
    {
        let payload = encode_payload(args).map_err(CallError::Encode)?;
        self.caller.notify_raw(method, Some(payload))
    }
}

impl core::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EndpointHandle").finish_non_exhaustive()
    }
}

/// An in-flight outbound call; resolves to the decoded reply.
///
/// Dropping the handle abandons the call: the request stays on the wire and
/// its eventual response is discarded.
pub struct PendingCall<R> {
    rx: oneshot::Receiver<CallOutcome>,
    method: String,
    _reply: PhantomData<fn() -> R>,
}

impl<R> PendingCall<R> {
    /// The `Service.Method` this call was issued against.
    pub fn method(&self) -> &str {
        &self.method
    }
}

impl<R: DeserializeOwned> Future for PendingCall<R> {
    type Output = Result<R, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = ready!(Pin::new(&mut this.rx).poll(cx));
        Poll::Ready(match outcome {
            Ok(Ok(Some(raw))) => serde_json::from_str(raw.get()).map_err(CallError::Decode),
            Ok(Ok(None)) => Err(CallError::MissingResult),
            Ok(Err(e)) => Err(e),
            // The endpoint dropped the entry without signalling: shut down.
            Err(_) => Err(CallError::Closed),
        })
    }
}

impl<R> core::fmt::Debug for PendingCall<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PendingCall")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(EndpointHandle: Send, Sync);
static_assertions::assert_impl_all!(Message: Send, Sync);

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use super::*;
    use crate::registry::{Service, ServiceScope};

    /// Scripted codec: the test feeds frames in through a channel and
    /// inspects everything the endpoint writes.
    struct ScriptCodec {
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
        sent: Mutex<VecDeque<Message>>,
        sent_notify: tokio::sync::Notify,
        pings: AtomicUsize,
        pongs: AtomicUsize,
    }

    impl ScriptCodec {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Incoming>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let codec = Arc::new(Self {
                rx: tokio::sync::Mutex::new(rx),
                sent: Mutex::new(VecDeque::new()),
                sent_notify: tokio::sync::Notify::new(),
                pings: AtomicUsize::new(0),
                pongs: AtomicUsize::new(0),
            });
            (codec, tx)
        }

        /// Wait until the endpoint has written something, then pop it.
        async fn next_sent(&self) -> Message {
            loop {
                let notified = self.sent_notify.notified();
                if let Some(msg) = self.sent.lock().pop_front() {
                    return msg;
                }
                notified.await;
            }
        }

        fn sent_len(&self) -> usize {
            self.sent.lock().len()
        }
    }

    impl Codec for Arc<ScriptCodec> {
        async fn recv(&self) -> Result<Incoming, CodecError> {
            self.rx.lock().await.recv().await.ok_or(CodecError::Closed)
        }

        async fn send(&self, msg: &Message) -> Result<(), CodecError> {
            self.sent.lock().push_back(msg.clone());
            self.sent_notify.notify_waiters();
            Ok(())
        }

        async fn ping(&self) -> Result<(), CodecError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn pong(&self) -> Result<(), CodecError> {
            self.pongs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<(), CodecError> {
            Ok(())
        }
    }

    struct Arith;

    impl Service for Arith {
        const NAME: &'static str = "Arith";

        fn methods(scope: &mut ServiceScope<Self>) {
            scope.method("Double", |_svc, n: u64| async move { Ok(n * 2) });
            scope.method("Fail", |_svc, _args: ()| async move {
                Err::<(), _>(crate::MethodError::new("deliberate"))
            });
        }
    }

    fn arith_registry() -> Arc<Registry> {
        let registry = Registry::new();
        registry.register_service(Arith).expect("register");
        Arc::new(registry)
    }

    fn request_json(json: &str) -> Incoming {
        Incoming::Message(serde_json::from_str(json).expect("test message"))
    }

    #[tokio::test]
    async fn dispatches_request_and_replies() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), arith_registry());
        let server = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        tx.send(request_json(r#"{"id":3,"fn":"Arith.Double","args":21}"#))
            .unwrap();

        let reply = codec.next_sent().await;
        assert_eq!(reply.id, 3);
        assert_eq!(reply.func, "");
        assert_eq!(reply.result.as_ref().unwrap().get(), "42");
        assert!(reply.error.is_none());

        drop(tx);
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unknown_method_is_answered_with_same_id() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), arith_registry());
        let server = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        tx.send(request_json(r#"{"id":7,"fn":"Does.NotExist","args":{}}"#))
            .unwrap();

        let reply = codec.next_sent().await;
        assert_eq!(reply.id, 7);
        assert_eq!(reply.func, "");
        assert!(reply.result.is_none());
        assert_eq!(reply.error.unwrap().msg, "No such function.");

        drop(tx);
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn handler_error_becomes_error_reply() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), arith_registry());
        tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        tx.send(request_json(r#"{"id":11,"fn":"Arith.Fail","args":null}"#))
            .unwrap();

        let reply = codec.next_sent().await;
        assert_eq!(reply.id, 11);
        assert_eq!(reply.error.unwrap().msg, "deliberate");
    }

    #[tokio::test]
    async fn malformed_args_fail_without_running_handler() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), arith_registry());
        tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        tx.send(request_json(r#"{"id":4,"fn":"Arith.Double","args":"nope"}"#))
            .unwrap();

        let reply = codec.next_sent().await;
        assert_eq!(reply.id, 4);
        assert!(reply.error.unwrap().msg.starts_with("unmarshaling args:"));
    }

    #[tokio::test]
    async fn get_methods_bypasses_registry() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), arith_registry());
        tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        tx.send(request_json(r#"{"id":1,"fn":"getMethods"}"#)).unwrap();

        let reply = codec.next_sent().await;
        assert_eq!(reply.id, 1);
        let names: Vec<String> = serde_json::from_str(reply.result.unwrap().get()).unwrap();
        assert_eq!(names, vec!["Arith.Double", "Arith.Fail"]);
    }

    #[tokio::test]
    async fn get_methods_answers_on_empty_registry() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), Arc::new(Registry::new()));
        tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        tx.send(request_json(r#"{"id":2,"fn":"getMethods"}"#)).unwrap();

        let reply = codec.next_sent().await;
        let names: Vec<String> = serde_json::from_str(reply.result.unwrap().get()).unwrap();
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn notifications_are_never_answered() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), arith_registry());
        tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        // Success, handler error, unknown method, and discovery: with
        // sequence 0, none may produce a reply.
        tx.send(request_json(r#"{"id":0,"fn":"Arith.Double","args":1}"#))
            .unwrap();
        tx.send(request_json(r#"{"id":0,"fn":"Arith.Fail","args":null}"#))
            .unwrap();
        tx.send(request_json(r#"{"id":0,"fn":"Does.NotExist"}"#)).unwrap();
        tx.send(request_json(r#"{"id":0,"fn":"getMethods"}"#)).unwrap();

        // A tagged request afterwards proves the notifications were already
        // processed when we check.
        tx.send(request_json(r#"{"id":9,"fn":"Arith.Double","args":5}"#))
            .unwrap();

        let reply = codec.next_sent().await;
        assert_eq!(reply.id, 9);
        assert_eq!(reply.result.unwrap().get(), "10");
        assert_eq!(codec.sent_len(), 0);
    }

    #[tokio::test]
    async fn responses_wake_their_pending_calls() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), Arc::new(Registry::new()));
        tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        let first: PendingCall<u64> = endpoint.go("Peer.Value", &1u32).unwrap();
        let second: PendingCall<u64> = endpoint.go("Peer.Value", &2u32).unwrap();

        // The two write tasks race; only the ID set is guaranteed.
        let mut sent_ids = [codec.next_sent().await.id, codec.next_sent().await.id];
        sent_ids.sort_unstable();
        assert_eq!(sent_ids, [1, 2]);

        // Answer out of order; each response must find its own caller.
        tx.send(request_json(r#"{"id":2,"result":20}"#)).unwrap();
        tx.send(request_json(r#"{"id":1,"result":10}"#)).unwrap();

        assert_eq!(second.await.unwrap(), 20);
        assert_eq!(first.await.unwrap(), 10);
    }

    #[tokio::test]
    async fn remote_error_reaches_the_caller() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), Arc::new(Registry::new()));
        tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        let call: PendingCall<u64> = endpoint.go("Peer.Value", &()).unwrap();
        codec.next_sent().await;
        tx.send(request_json(r#"{"id":1,"error":{"msg":"No such function."}}"#))
            .unwrap();

        let err = call.await.unwrap_err();
        assert_eq!(err.to_string(), "No such function.");
    }

    #[tokio::test]
    async fn response_with_unknown_seq_is_fatal() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), Arc::new(Registry::new()));
        let server = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        tx.send(request_json(r#"{"id":99,"result":1}"#)).unwrap();

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, ServeError::UnknownSeq(99)));
        assert!(endpoint.is_closed());
    }

    #[tokio::test]
    async fn late_response_after_deadline_is_dropped_silently() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), arith_registry());
        let server = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        let err = endpoint
            .call_with_deadline::<_, u64>("Peer.Value", &(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "birpc: call timeout, dont resend");

        // The response arrives after the caller gave up: not a protocol
        // violation, and the connection keeps working.
        codec.next_sent().await;
        tx.send(request_json(r#"{"id":1,"result":5}"#)).unwrap();
        tx.send(request_json(r#"{"id":8,"fn":"Arith.Double","args":3}"#))
            .unwrap();

        let reply = codec.next_sent().await;
        assert_eq!(reply.id, 8);
        assert_eq!(reply.result.unwrap().get(), "6");

        drop(tx);
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn shutdown_fails_pending_calls() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), Arc::new(Registry::new()));
        let server = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        let call: PendingCall<u64> = endpoint.go("Peer.Value", &()).unwrap();
        codec.next_sent().await;

        drop(tx);
        assert!(server.await.unwrap().is_ok());

        let err = call.await.unwrap_err();
        assert!(matches!(err, CallError::Closed));
    }

    #[tokio::test]
    async fn calls_after_shutdown_fail_promptly() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), Arc::new(Registry::new()));
        let server = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        drop(tx);
        server.await.unwrap().unwrap();

        let err = endpoint.go::<_, u64>("Peer.Value", &()).unwrap_err();
        assert!(matches!(err, CallError::Closed));
        let err = endpoint.notify("Peer.Event", &()).unwrap_err();
        assert!(matches!(err, CallError::Closed));
    }

    #[tokio::test]
    async fn incoming_ping_is_answered_with_pong() {
        let (codec, tx) = ScriptCodec::new();
        let endpoint = Endpoint::new(codec.clone(), Arc::new(Registry::new()));
        tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        tx.send(Incoming::Ping).unwrap();
        // Follow with a request so we can await an observable write.
        tx.send(request_json(r#"{"id":1,"fn":"getMethods"}"#)).unwrap();
        codec.next_sent().await;

        assert_eq!(codec.pongs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_after_two_periods() {
        let (codec, _tx) = ScriptCodec::new();
        let config = EndpointConfig {
            ping_period: Duration::from_secs(10),
        };
        let endpoint = Endpoint::with_config(codec.clone(), Arc::new(Registry::new()), config);

        let started = tokio::time::Instant::now();
        let err = endpoint.serve().await.unwrap_err();

        assert!(matches!(err, ServeError::PingTimeout));
        assert_eq!(err.to_string(), "remote connection is timeout.");
        assert_eq!(codec.pings.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_the_connection_alive() {
        let (codec, tx) = ScriptCodec::new();
        let config = EndpointConfig {
            ping_period: Duration::from_secs(10),
        };
        let endpoint = Endpoint::with_config(codec.clone(), Arc::new(Registry::new()), config);
        let server = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });

        // Answer every ping promptly for five periods.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            tx.send(Incoming::Pong).unwrap();
        }

        assert!(!server.is_finished());
        // The final tick races our own wakeup; the four before it cannot.
        assert!(codec.pings.load(Ordering::SeqCst) >= 4);

        drop(tx);
        assert!(server.await.unwrap().is_ok());
    }
}
