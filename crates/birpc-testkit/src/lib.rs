//! birpc-testkit: conformance test suite for birpc codecs.
//!
//! Provides the [`CodecFactory`] trait and shared scenarios every codec
//! must pass. Each codec crate implements the factory and runs the shared
//! tests:
//!
//! ```ignore
//! use birpc_testkit::{CodecFactory, TestError};
//!
//! struct MyFactory;
//!
//! impl CodecFactory for MyFactory {
//!     type Codec = MyCodec;
//!
//!     async fn connect_pair() -> Result<(Self::Codec, Self::Codec), TestError> {
//!         /* create a connected pair */
//!     }
//! }
//!
//! #[tokio::test]
//! async fn my_codec_round_trip() {
//!     birpc_testkit::run_round_trip::<MyFactory>().await;
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use birpc::{
    CallError, Codec, CodecError, Endpoint, EndpointConfig, Incoming, Message, MethodError,
    Registry, RegisterError, Service, ServeError, ServiceScope,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Codec creation failed.
    Setup(String),
    /// An outbound call failed.
    Call(CallError),
    /// Raw codec I/O failed.
    Codec(CodecError),
    /// An endpoint terminated the wrong way.
    Serve(ServeError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {msg}"),
            TestError::Call(e) => write!(f, "call error: {e}"),
            TestError::Codec(e) => write!(f, "codec error: {e}"),
            TestError::Serve(e) => write!(f, "serve error: {e}"),
            TestError::Assertion(msg) => write!(f, "assertion failed: {msg}"),
        }
    }
}

impl std::error::Error for TestError {}

impl From<CallError> for TestError {
    fn from(e: CallError) -> Self {
        TestError::Call(e)
    }
}

impl From<CodecError> for TestError {
    fn from(e: CodecError) -> Self {
        TestError::Codec(e)
    }
}

impl From<ServeError> for TestError {
    fn from(e: ServeError) -> Self {
        TestError::Serve(e)
    }
}

impl From<RegisterError> for TestError {
    fn from(e: RegisterError) -> Self {
        TestError::Setup(e.to_string())
    }
}

/// Factory for creating connected codec pairs.
pub trait CodecFactory: Send + Sync + 'static {
    /// The codec type being tested.
    type Codec: Codec;

    /// Create a connected pair: frames sent on one half arrive on the
    /// other.
    fn connect_pair()
    -> impl Future<Output = Result<(Self::Codec, Self::Codec), TestError>> + Send;
}

// ============================================================================
// Test services
// ============================================================================

/// Payload used by the echo scenarios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoArgs {
    pub msg: String,
}

/// Payload of the writer-serialisation scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreetArgs {
    #[serde(rename = "Msg")]
    pub msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayedArgs {
    pub value: u64,
    pub delay_ms: u64,
}

/// Echo service used by most scenarios.
pub struct EchoService;

impl Service for EchoService {
    const NAME: &'static str = "Echo";

    fn methods(scope: &mut ServiceScope<Self>) {
        scope.method("Echo", |_svc, args: EchoArgs| async move { Ok(args) });
        scope.method("Delayed", |_svc, args: DelayedArgs| async move {
            tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
            Ok(args.value)
        });
        scope.method("Fail", |_svc, msg: String| async move {
            Err::<(), _>(MethodError::new(msg))
        });
    }
}

/// Word-length service from the discovery scenario.
pub struct WordLength;

impl Service for WordLength {
    const NAME: &'static str = "WordLength";

    fn methods(scope: &mut ServiceScope<Self>) {
        scope.method("Len", |_svc, word: String| async move {
            Ok(word.len() as u64)
        });
    }
}

/// Counter service driven by notifications.
pub struct Counter {
    pub hits: Arc<AtomicU64>,
}

impl Service for Counter {
    const NAME: &'static str = "Counter";

    fn methods(scope: &mut ServiceScope<Self>) {
        scope.method("Bump", |svc: Arc<Self>, n: u64| async move {
            svc.hits.fetch_add(n, Ordering::SeqCst);
            Ok(())
        });
        scope.method("Read", |svc: Arc<Self>, _args: ()| async move {
            Ok(svc.hits.load(Ordering::SeqCst))
        });
    }
}

/// Relay service: answers by calling back into the peer that asked.
pub struct Relay;

impl Service for Relay {
    const NAME: &'static str = "Relay";

    fn methods(scope: &mut ServiceScope<Self>) {
        scope.method_with_ctx("Len", |_svc, ctx, word: String| async move {
            ctx.endpoint()
                .call::<_, u64>("WordLength.Len", &word)
                .await
                .map_err(|e| MethodError::new(e.to_string()))
        });
    }
}

/// Slow worker for the shutdown-drain scenario.
pub struct SlowWorker {
    pub started: tokio::sync::mpsc::UnboundedSender<()>,
    pub finished: Arc<AtomicBool>,
}

impl Service for SlowWorker {
    const NAME: &'static str = "Slow";

    fn methods(scope: &mut ServiceScope<Self>) {
        scope.method("Work", |svc: Arc<Self>, _args: ()| async move {
            let _ = svc.started.send(());
            tokio::time::sleep(Duration::from_millis(100)).await;
            svc.finished.store(true, Ordering::SeqCst);
            Ok(())
        });
    }
}

// ============================================================================
// Scenario plumbing
// ============================================================================

/// An endpoint with its serve task, torn down explicitly by scenarios.
struct Session<C: Codec> {
    endpoint: Endpoint<C>,
    serve: JoinHandle<Result<(), ServeError>>,
}

impl<C: Codec> Session<C> {
    fn spawn(codec: C, registry: Arc<Registry>) -> Self {
        Self::spawn_with_config(codec, registry, EndpointConfig::default())
    }

    fn spawn_with_config(codec: C, registry: Arc<Registry>, config: EndpointConfig) -> Self {
        let endpoint = Endpoint::with_config(codec, registry, config);
        let serve = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.serve().await }
        });
        Self { endpoint, serve }
    }

    /// Close the connection and require a clean serve exit.
    async fn shutdown(self) -> Result<(), TestError> {
        self.endpoint.close().await;
        match self.serve.await {
            Ok(result) => Ok(result?),
            Err(e) => Err(TestError::Setup(format!("serve task panicked: {e}"))),
        }
    }
}

fn registry_with<S: Service>(service: S) -> Result<Arc<Registry>, TestError> {
    let registry = Registry::new();
    registry.register_service(service)?;
    Ok(Arc::new(registry))
}

fn empty_registry() -> Arc<Registry> {
    Arc::new(Registry::new())
}

// ============================================================================
// Scenario: round trip
// ============================================================================

/// A handler that copies `args` into `reply`: the caller receives exactly
/// the value it sent, modulo the encoding round trip.
pub async fn run_round_trip<F: CodecFactory>() {
    if let Err(e) = run_round_trip_inner::<F>().await {
        panic!("run_round_trip failed: {e}");
    }
}

async fn run_round_trip_inner<F: CodecFactory>() -> Result<(), TestError> {
    let (client_codec, server_codec) = F::connect_pair().await?;

    let client = Session::spawn(client_codec, empty_registry());
    let server = Session::spawn(server_codec, registry_with(EchoService)?);

    let sent = EchoArgs {
        msg: "Hello, world".to_owned(),
    };
    let received: EchoArgs = client.endpoint.call("Echo.Echo", &sent).await?;
    if received != sent {
        return Err(TestError::Assertion(format!(
            "echo mismatch: sent {sent:?}, received {received:?}"
        )));
    }

    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}

// ============================================================================
// Scenario: concurrent demultiplexing
// ============================================================================

/// Concurrent outbound calls with staggered completion: later calls finish
/// first, and every response must still find its own caller.
pub async fn run_concurrent_demux<F: CodecFactory>() {
    if let Err(e) = run_concurrent_demux_inner::<F>().await {
        panic!("run_concurrent_demux failed: {e}");
    }
}

async fn run_concurrent_demux_inner<F: CodecFactory>() -> Result<(), TestError> {
    const CALLS: u64 = 8;

    let (client_codec, server_codec) = F::connect_pair().await?;
    let client = Session::spawn(client_codec, empty_registry());
    let server = Session::spawn(server_codec, registry_with(EchoService)?);

    let mut pending = Vec::new();
    for i in 0..CALLS {
        // Reverse the delays so responses arrive in roughly reverse order.
        let args = DelayedArgs {
            value: i,
            delay_ms: (CALLS - i) * 20,
        };
        pending.push((i, client.endpoint.go::<_, u64>("Echo.Delayed", &args)?));
    }

    for (expected, call) in pending {
        let value = call.await?;
        if value != expected {
            return Err(TestError::Assertion(format!(
                "response demuxed to the wrong caller: expected {expected}, got {value}"
            )));
        }
    }

    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}

// ============================================================================
// Scenario: writer serialisation
// ============================================================================

/// Ten tasks write the same envelope concurrently through one codec; the
/// peer must read ten intact copies.
pub async fn run_concurrent_writes<F: CodecFactory>() {
    if let Err(e) = run_concurrent_writes_inner::<F>().await {
        panic!("run_concurrent_writes failed: {e}");
    }
}

async fn run_concurrent_writes_inner<F: CodecFactory>() -> Result<(), TestError> {
    const WRITERS: usize = 10;

    let (writer, reader) = F::connect_pair().await?;
    let writer = Arc::new(writer);

    let mut tasks = Vec::new();
    for _ in 0..WRITERS {
        let writer = writer.clone();
        tasks.push(tokio::spawn(async move {
            let args = serde_json::value::to_raw_value(&GreetArgs {
                msg: "Hello, world".to_owned(),
            })
            .expect("encode args");
            let msg = Message::request(42, "Greeting.Greet", Some(args));
            writer.send(&msg).await
        }));
    }
    for task in tasks {
        task.await
            .map_err(|e| TestError::Setup(format!("writer task panicked: {e}")))??;
    }

    for _ in 0..WRITERS {
        match reader.recv().await? {
            Incoming::Message(msg) => {
                if msg.id != 42 || msg.func != "Greeting.Greet" {
                    return Err(TestError::Assertion(format!(
                        "corrupted envelope: id={} fn={:?}",
                        msg.id, msg.func
                    )));
                }
                if msg.result.is_some() || msg.error.is_some() {
                    return Err(TestError::Assertion(
                        "request carries response fields".into(),
                    ));
                }
                let args: GreetArgs = msg
                    .decode_args()
                    .map_err(|e| TestError::Assertion(format!("corrupted args: {e}")))?;
                if args.msg != "Hello, world" {
                    return Err(TestError::Assertion(format!(
                        "corrupted args payload: {:?}",
                        args.msg
                    )));
                }
            }
            other => {
                return Err(TestError::Assertion(format!(
                    "expected an envelope, got {other:?}"
                )));
            }
        }
    }

    Ok(())
}

// ============================================================================
// Scenario: unknown method
// ============================================================================

pub async fn run_unknown_method<F: CodecFactory>() {
    if let Err(e) = run_unknown_method_inner::<F>().await {
        panic!("run_unknown_method failed: {e}");
    }
}

async fn run_unknown_method_inner<F: CodecFactory>() -> Result<(), TestError> {
    let (client_codec, server_codec) = F::connect_pair().await?;
    let client = Session::spawn(client_codec, empty_registry());
    let server = Session::spawn(server_codec, empty_registry());

    let err = match client
        .endpoint
        .call::<_, serde_json::Value>("Does.NotExist", &serde_json::json!({}))
        .await
    {
        Ok(v) => {
            return Err(TestError::Assertion(format!(
                "unknown method unexpectedly answered: {v:?}"
            )));
        }
        Err(e) => e,
    };

    match &err {
        CallError::Remote(remote) if remote.msg == "No such function." => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected remote \"No such function.\", got {other:?}"
            )));
        }
    }

    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}

// ============================================================================
// Scenario: handler error
// ============================================================================

pub async fn run_handler_error<F: CodecFactory>() {
    if let Err(e) = run_handler_error_inner::<F>().await {
        panic!("run_handler_error failed: {e}");
    }
}

async fn run_handler_error_inner<F: CodecFactory>() -> Result<(), TestError> {
    let (client_codec, server_codec) = F::connect_pair().await?;
    let client = Session::spawn(client_codec, empty_registry());
    let server = Session::spawn(server_codec, registry_with(EchoService)?);

    let err = client
        .endpoint
        .call::<_, ()>("Echo.Fail", &"kaboom")
        .await
        .err()
        .ok_or_else(|| TestError::Assertion("failing handler reported success".into()))?;

    match &err {
        CallError::Remote(remote) if remote.msg == "kaboom" => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected remote \"kaboom\", got {other:?}"
            )));
        }
    }

    // A per-request failure never takes the connection down.
    let pong: EchoArgs = client
        .endpoint
        .call(
            "Echo.Echo",
            &EchoArgs {
                msg: "still alive".to_owned(),
            },
        )
        .await?;
    if pong.msg != "still alive" {
        return Err(TestError::Assertion("connection unusable after error".into()));
    }

    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}

// ============================================================================
// Scenario: discovery
// ============================================================================

pub async fn run_discovery<F: CodecFactory>() {
    if let Err(e) = run_discovery_inner::<F>().await {
        panic!("run_discovery failed: {e}");
    }
}

async fn run_discovery_inner<F: CodecFactory>() -> Result<(), TestError> {
    let (client_codec, server_codec) = F::connect_pair().await?;

    let registry = Registry::new();
    registry.register_service(WordLength)?;
    registry.register_service(EchoService)?;

    let client = Session::spawn(client_codec, empty_registry());
    let server = Session::spawn(server_codec, Arc::new(registry));

    let names: Vec<String> = client.endpoint.call("getMethods", &()).await?;
    for expected in ["WordLength.Len", "Echo.Echo", "Echo.Delayed", "Echo.Fail"] {
        if !names.iter().any(|n| n == expected) {
            return Err(TestError::Assertion(format!(
                "discovery result {names:?} is missing {expected:?}"
            )));
        }
    }

    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}

pub async fn run_discovery_empty_registry<F: CodecFactory>() {
    if let Err(e) = run_discovery_empty_registry_inner::<F>().await {
        panic!("run_discovery_empty_registry failed: {e}");
    }
}

async fn run_discovery_empty_registry_inner<F: CodecFactory>() -> Result<(), TestError> {
    let (client_codec, server_codec) = F::connect_pair().await?;
    let client = Session::spawn(client_codec, empty_registry());
    let server = Session::spawn(server_codec, empty_registry());

    let names: Vec<String> = client.endpoint.call("getMethods", &()).await?;
    if !names.is_empty() {
        return Err(TestError::Assertion(format!(
            "empty registry advertises methods: {names:?}"
        )));
    }

    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}

// ============================================================================
// Scenario: notifications
// ============================================================================

/// Notifications are dispatched like requests but never answered; if the
/// peer answered one, the sender's endpoint would fail on the unknown
/// sequence number.
pub async fn run_notification<F: CodecFactory>() {
    if let Err(e) = run_notification_inner::<F>().await {
        panic!("run_notification failed: {e}");
    }
}

async fn run_notification_inner<F: CodecFactory>() -> Result<(), TestError> {
    let (client_codec, server_codec) = F::connect_pair().await?;

    let hits = Arc::new(AtomicU64::new(0));
    let client = Session::spawn(client_codec, empty_registry());
    let server = Session::spawn(
        server_codec,
        registry_with(Counter { hits: hits.clone() })?,
    );

    client.endpoint.notify("Counter.Bump", &3u64)?;
    client.endpoint.notify("Counter.Bump", &4u64)?;

    // Notifications race the poll calls; spin until both have landed.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let seen: u64 = client.endpoint.call("Counter.Read", &()).await?;
        if seen == 7 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(TestError::Assertion(format!(
                "notifications not dispatched in time: counter at {seen}"
            )));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    if client.serve.is_finished() {
        return Err(TestError::Assertion(
            "client endpoint died; the peer answered a notification".into(),
        ));
    }

    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}

// ============================================================================
// Scenario: nested callback
// ============================================================================

/// B's handler calls back into A over the same connection while A's call
/// is still outstanding.
pub async fn run_callback<F: CodecFactory>() {
    if let Err(e) = run_callback_inner::<F>().await {
        panic!("run_callback failed: {e}");
    }
}

async fn run_callback_inner<F: CodecFactory>() -> Result<(), TestError> {
    let (client_codec, server_codec) = F::connect_pair().await?;

    let client = Session::spawn(client_codec, registry_with(WordLength)?);
    let server = Session::spawn(server_codec, registry_with(Relay)?);

    let len: u64 = client.endpoint.call("Relay.Len", &"hello").await?;
    if len != 5 {
        return Err(TestError::Assertion(format!(
            "callback returned {len}, expected 5"
        )));
    }

    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}

// ============================================================================
// Scenario: deadline
// ============================================================================

pub async fn run_deadline_exceeded<F: CodecFactory>() {
    if let Err(e) = run_deadline_exceeded_inner::<F>().await {
        panic!("run_deadline_exceeded failed: {e}");
    }
}

async fn run_deadline_exceeded_inner<F: CodecFactory>() -> Result<(), TestError> {
    let (client_codec, server_codec) = F::connect_pair().await?;
    let client = Session::spawn(client_codec, empty_registry());
    let server = Session::spawn(server_codec, registry_with(EchoService)?);

    let args = DelayedArgs {
        value: 1,
        delay_ms: 60_000,
    };
    let err = client
        .endpoint
        .call_with_deadline::<_, u64>("Echo.Delayed", &args, Duration::from_secs(1))
        .await
        .err()
        .ok_or_else(|| TestError::Assertion("deadline did not fire".into()))?;

    if !matches!(err, CallError::DeadlineExceeded) {
        return Err(TestError::Assertion(format!(
            "expected deadline error, got {err:?}"
        )));
    }
    if err.to_string() != "birpc: call timeout, dont resend" {
        return Err(TestError::Assertion(format!(
            "wrong deadline wording: {err}"
        )));
    }

    // The request was sent and is not retracted; the connection stays
    // usable while the slow handler finishes in the background.
    let echo: EchoArgs = client
        .endpoint
        .call(
            "Echo.Echo",
            &EchoArgs {
                msg: "after timeout".to_owned(),
            },
        )
        .await?;
    if echo.msg != "after timeout" {
        return Err(TestError::Assertion("connection unusable after timeout".into()));
    }

    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}

// ============================================================================
// Scenario: shutdown drain
// ============================================================================

/// `serve` returns only after in-flight handlers have completed; pending
/// outbound calls fail instead of hanging.
pub async fn run_shutdown_drains_handlers<F: CodecFactory>() {
    if let Err(e) = run_shutdown_drains_handlers_inner::<F>().await {
        panic!("run_shutdown_drains_handlers failed: {e}");
    }
}

async fn run_shutdown_drains_handlers_inner<F: CodecFactory>() -> Result<(), TestError> {
    let (client_codec, server_codec) = F::connect_pair().await?;

    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let finished = Arc::new(AtomicBool::new(false));
    let worker = SlowWorker {
        started: started_tx,
        finished: finished.clone(),
    };

    let client = Session::spawn(client_codec, empty_registry());
    let server = Session::spawn(server_codec, registry_with(worker)?);

    let call = client.endpoint.go::<_, ()>("Slow.Work", &())?;
    started_rx
        .recv()
        .await
        .ok_or_else(|| TestError::Assertion("handler never started".into()))?;

    // Tear the connection down under the running handler.
    client.endpoint.close().await;
    let server_result = server
        .serve
        .await
        .map_err(|e| TestError::Setup(format!("serve task panicked: {e}")))?;
    server_result?;

    if !finished.load(Ordering::SeqCst) {
        return Err(TestError::Assertion(
            "serve returned before the running handler completed".into(),
        ));
    }

    client
        .serve
        .await
        .map_err(|e| TestError::Setup(format!("serve task panicked: {e}")))??;
    match call.await {
        Err(CallError::Closed) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "pending call should fail on shutdown, got {other:?}"
            )));
        }
    }

    Ok(())
}

// ============================================================================
// Scenario: heartbeat
// ============================================================================

/// A peer that answers pings keeps the connection alive; the endpoint
/// pings once per period.
pub async fn run_heartbeat_keepalive<F: CodecFactory>() {
    if let Err(e) = run_heartbeat_keepalive_inner::<F>().await {
        panic!("run_heartbeat_keepalive failed: {e}");
    }
}

async fn run_heartbeat_keepalive_inner<F: CodecFactory>() -> Result<(), TestError> {
    let (peer_codec, server_codec) = F::connect_pair().await?;

    let config = EndpointConfig {
        ping_period: Duration::from_secs(10),
    };
    let server = Session::spawn_with_config(server_codec, empty_registry(), config);

    // Raw peer: answer every ping, count them.
    let pings = Arc::new(AtomicU64::new(0));
    let peer = tokio::spawn({
        let pings = pings.clone();
        async move {
            loop {
                match peer_codec.recv().await {
                    Ok(Incoming::Ping) => {
                        pings.fetch_add(1, Ordering::SeqCst);
                        if peer_codec.pong().await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    });

    // Three ticks land in a window just past three periods.
    tokio::time::sleep(Duration::from_secs(31)).await;
    let seen = pings.load(Ordering::SeqCst);
    if seen != 3 {
        return Err(TestError::Assertion(format!(
            "expected 3 pings in 31s, saw {seen}"
        )));
    }
    if server.serve.is_finished() {
        return Err(TestError::Assertion(
            "endpoint died although the peer answered every ping".into(),
        ));
    }

    server.shutdown().await?;
    let _ = peer.await;
    Ok(())
}

/// A peer that swallows pongs is declared dead after two periods.
pub async fn run_heartbeat_timeout<F: CodecFactory>() {
    if let Err(e) = run_heartbeat_timeout_inner::<F>().await {
        panic!("run_heartbeat_timeout failed: {e}");
    }
}

async fn run_heartbeat_timeout_inner<F: CodecFactory>() -> Result<(), TestError> {
    let (peer_codec, server_codec) = F::connect_pair().await?;

    let config = EndpointConfig {
        ping_period: Duration::from_secs(10),
    };
    let server = Session::spawn_with_config(server_codec, empty_registry(), config);

    // Raw peer: read frames, answer nothing.
    let pings = Arc::new(AtomicU64::new(0));
    let peer = tokio::spawn({
        let pings = pings.clone();
        async move {
            while let Ok(frame) = peer_codec.recv().await {
                if matches!(frame, Incoming::Ping) {
                    pings.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    });

    let result = server
        .serve
        .await
        .map_err(|e| TestError::Setup(format!("serve task panicked: {e}")))?;

    let err = match result {
        Err(e) => e,
        Ok(()) => {
            return Err(TestError::Assertion(
                "serve survived a peer that never pongs".into(),
            ));
        }
    };
    if !matches!(err, ServeError::PingTimeout) {
        return Err(TestError::Assertion(format!(
            "expected ping timeout, got {err:?}"
        )));
    }
    if err.to_string() != "remote connection is timeout." {
        return Err(TestError::Assertion(format!("wrong timeout wording: {err}")));
    }

    let seen = pings.load(Ordering::SeqCst);
    if seen != 3 {
        return Err(TestError::Assertion(format!(
            "expected 3 pings before timeout, saw {seen}"
        )));
    }

    let _ = peer.await;
    Ok(())
}
