//! birpc-transport-mem: in-process codec for birpc.
//!
//! This is the **semantic reference** codec. Frames (envelopes and
//! heartbeats alike) travel through async channels with no serialization;
//! other codecs must behave identically modulo the encoding step. It is
//! also the codec of choice for endpoint tests: heartbeats are ordinary
//! frames here, so a test peer can drop pongs at will, which real WebSocket
//! stacks answer automatically.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use birpc::{Codec, CodecError, Incoming, Message};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Channel capacity for the in-process pair.
const CHANNEL_CAPACITY: usize = 64;

/// In-process codec: one half of a connected pair.
#[derive(Clone)]
pub struct MemCodec {
    inner: Arc<MemInner>,
}

struct MemInner {
    /// Frames to the peer. Taken on close so the peer's reader observes end
    /// of stream.
    tx: Mutex<Option<mpsc::Sender<Incoming>>>,
    /// Frames from the peer.
    rx: tokio::sync::Mutex<mpsc::Receiver<Incoming>>,
    closed: AtomicBool,
}

impl MemCodec {
    /// Create a connected pair.
    ///
    /// Frames sent on one half are received on the other and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let a = Self {
            inner: Arc::new(MemInner {
                tx: Mutex::new(Some(tx_b)),
                rx: tokio::sync::Mutex::new(rx_a),
                closed: AtomicBool::new(false),
            }),
        };
        let b = Self {
            inner: Arc::new(MemInner {
                tx: Mutex::new(Some(tx_a)),
                rx: tokio::sync::Mutex::new(rx_b),
                closed: AtomicBool::new(false),
            }),
        };
        (a, b)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Clone the sender out; never hold the lock across an await.
    fn sender(&self) -> Result<mpsc::Sender<Incoming>, CodecError> {
        self.inner.tx.lock().clone().ok_or(CodecError::Closed)
    }

    async fn push(&self, frame: Incoming) -> Result<(), CodecError> {
        self.sender()?
            .send(frame)
            .await
            .map_err(|_| CodecError::Closed)
    }
}

impl Codec for MemCodec {
    async fn recv(&self) -> Result<Incoming, CodecError> {
        if self.is_closed() {
            return Err(CodecError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        rx.recv().await.ok_or(CodecError::Closed)
    }

    async fn send(&self, msg: &Message) -> Result<(), CodecError> {
        self.push(Incoming::Message(msg.clone())).await
    }

    async fn ping(&self) -> Result<(), CodecError> {
        self.push(Incoming::Ping).await
    }

    async fn pong(&self) -> Result<(), CodecError> {
        self.push(Incoming::Pong).await
    }

    async fn close(&self) -> Result<(), CodecError> {
        self.inner.closed.store(true, Ordering::Release);
        // Dropping the sender is what ends the peer's stream.
        self.inner.tx.lock().take();
        Ok(())
    }
}

static_assertions::assert_impl_all!(MemCodec: Send, Sync);


/// Conformance tests using birpc-testkit.
#[cfg(test)]
mod conformance_tests {
    use std::sync::Once;

    use birpc_testkit::{CodecFactory, TestError};

    use super::*;

    static INIT: Once = Once::new();

    fn init_tracing() {
        INIT.call_once(|| {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::DEBUG.into()),
                )
                .with_test_writer()
                .init();
        });
    }

    struct MemFactory;

    impl CodecFactory for MemFactory {
        type Codec = MemCodec;

        async fn connect_pair() -> Result<(Self::Codec, Self::Codec), TestError> {
            Ok(MemCodec::pair())
        }
    }

    #[tokio::test]
    async fn round_trip() {
        init_tracing();
        birpc_testkit::run_round_trip::<MemFactory>().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_demux() {
        birpc_testkit::run_concurrent_demux::<MemFactory>().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_writes() {
        birpc_testkit::run_concurrent_writes::<MemFactory>().await;
    }

    #[tokio::test]
    async fn unknown_method() {
        birpc_testkit::run_unknown_method::<MemFactory>().await;
    }

    #[tokio::test]
    async fn handler_error() {
        birpc_testkit::run_handler_error::<MemFactory>().await;
    }

    #[tokio::test]
    async fn discovery() {
        birpc_testkit::run_discovery::<MemFactory>().await;
    }

    #[tokio::test]
    async fn discovery_empty_registry() {
        birpc_testkit::run_discovery_empty_registry::<MemFactory>().await;
    }

    #[tokio::test]
    async fn notification() {
        birpc_testkit::run_notification::<MemFactory>().await;
    }

    #[tokio::test]
    async fn callback() {
        birpc_testkit::run_callback::<MemFactory>().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exceeded() {
        birpc_testkit::run_deadline_exceeded::<MemFactory>().await;
    }

    #[tokio::test]
    async fn shutdown_drains_handlers() {
        birpc_testkit::run_shutdown_drains_handlers::<MemFactory>().await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keepalive() {
        birpc_testkit::run_heartbeat_keepalive::<MemFactory>().await;
    }

    // The timeout scenario needs a peer that reads frames but withholds
    // pongs; only the in-process codec can express that, so it lives here
    // rather than in every transport's conformance list.
    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout() {
        birpc_testkit::run_heartbeat_timeout::<MemFactory>().await;
    }
}
