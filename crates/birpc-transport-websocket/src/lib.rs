//! birpc-transport-websocket: the reference birpc deployment.
//!
//! One JSON envelope travels per WebSocket text frame; the protocol-level
//! Ping/Pong frames carry the endpoint heartbeat. The codec publishes the
//! peer's socket address through its extensions, so handlers can identify
//! who is calling:
//!
//! ```ignore
//! scope.method_with_ctx("Address", |_svc, ctx, _args: ()| async move {
//!     let peer = ctx.get::<PeerAddr>().ok_or(MethodError::new("no peer address"))?;
//!     Ok(peer.to_string())
//! });
//! ```
//!
//! `connect` and `accept` cover the two handshake directions;
//! [`Listener`](crate::Listener) adds a stoppable accept loop for servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use birpc::{Codec, CodecError, Extensions, Incoming, Message};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, client_async, connect_async};

mod listener;

pub use listener::Listener;

/// The peer's socket address, published to handlers through the codec's
/// extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// WebSocket codec over any duplex byte stream.
///
/// The stream is split once: the read half belongs to the endpoint's single
/// reader, the write half sits behind an async mutex so replies, requests,
/// and heartbeats from concurrent tasks are serialised per the codec
/// contract.
pub struct WsCodec<S> {
    inner: Arc<WsInner<S>>,
}

impl<S> Clone for WsCodec<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct WsInner<S> {
    sink: AsyncMutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    stream: AsyncMutex<SplitStream<WebSocketStream<S>>>,
    peer_addr: Option<SocketAddr>,
    closed: AtomicBool,
}

impl<S> WsCodec<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an already-handshaken WebSocket.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self::with_peer_addr(ws, None)
    }

    fn with_peer_addr(ws: WebSocketStream<S>, peer_addr: Option<SocketAddr>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            inner: Arc::new(WsInner {
                sink: AsyncMutex::new(sink),
                stream: AsyncMutex::new(stream),
                peer_addr,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The peer's socket address, when the underlying stream has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn write(&self, frame: WsMessage) -> Result<(), CodecError> {
        if self.is_closed() {
            return Err(CodecError::Closed);
        }
        let mut sink = self.inner.sink.lock().await;
        sink.send(frame).await.map_err(ws_error)
    }
}

impl WsCodec<TcpStream> {
    /// Server side: perform the WebSocket handshake on an accepted TCP
    /// connection, capturing the peer address.
    pub async fn accept(stream: TcpStream) -> Result<Self, CodecError> {
        let peer_addr = stream.peer_addr().ok();
        let ws = accept_async(stream).await.map_err(ws_error)?;
        Ok(Self::with_peer_addr(ws, peer_addr))
    }
}

impl WsCodec<MaybeTlsStream<TcpStream>> {
    /// Client side: connect to a `ws://` (or `wss://`) URL.
    pub async fn connect(url: &str) -> Result<Self, CodecError> {
        let (ws, _response) = connect_async(url).await.map_err(ws_error)?;
        let peer_addr = match ws.get_ref() {
            MaybeTlsStream::Plain(stream) => stream.peer_addr().ok(),
            _ => None,
        };
        Ok(Self::with_peer_addr(ws, peer_addr))
    }
}

impl WsCodec<tokio::io::DuplexStream> {
    /// Create a connected pair over an in-memory duplex stream, with a real
    /// handshake on both ends. For tests.
    pub async fn pair() -> (Self, Self) {
        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

        let (client_ws, server_ws) = tokio::join!(
            async {
                client_async("ws://localhost/", client_stream)
                    .await
                    .expect("client handshake failed")
                    .0
            },
            async {
                accept_async(server_stream)
                    .await
                    .expect("server handshake failed")
            }
        );

        (Self::new(client_ws), Self::new(server_ws))
    }
}

impl<S> Codec for WsCodec<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&self) -> Result<Incoming, CodecError> {
        if self.is_closed() {
            return Err(CodecError::Closed);
        }

        let mut stream = self.inner.stream.lock().await;
        loop {
            let frame = match stream.next().await {
                None => return Err(CodecError::Closed),
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(ws_error(e)),
            };

            match frame {
                WsMessage::Text(text) => {
                    let msg: Message = serde_json::from_str(&text)?;
                    return Ok(Incoming::Message(msg));
                }
                // Tolerated for peers that frame their JSON as binary.
                WsMessage::Binary(data) => {
                    let msg: Message = serde_json::from_slice(&data)?;
                    return Ok(Incoming::Message(msg));
                }
                WsMessage::Ping(_) => return Ok(Incoming::Ping),
                WsMessage::Pong(_) => return Ok(Incoming::Pong),
                WsMessage::Close(_) => {
                    self.inner.closed.store(true, Ordering::Release);
                    return Err(CodecError::Closed);
                }
                WsMessage::Frame(_) => continue,
            }
        }
    }

    async fn send(&self, msg: &Message) -> Result<(), CodecError> {
        let json = serde_json::to_string(msg)?;
        self.write(WsMessage::Text(json.into())).await
    }

    async fn ping(&self) -> Result<(), CodecError> {
        self.write(WsMessage::Ping(Vec::new().into())).await
    }

    async fn pong(&self) -> Result<(), CodecError> {
        self.write(WsMessage::Pong(Vec::new().into())).await
    }

    async fn close(&self) -> Result<(), CodecError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut sink = self.inner.sink.lock().await;
        // Best effort: the peer may already be gone.
        let _ = sink.send(WsMessage::Close(None)).await;
        Ok(())
    }

    fn fill_extensions(&self, ext: &mut Extensions) {
        if let Some(addr) = self.inner.peer_addr {
            ext.insert(PeerAddr(addr));
        }
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> CodecError {
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::ConnectionClosed | Error::AlreadyClosed => CodecError::Closed,
        Error::Io(e) => CodecError::Io(e),
        other => CodecError::Protocol(other.to_string()),
    }
}

static_assertions::assert_impl_all!(WsCodec<TcpStream>: Send, Sync);
static_assertions::assert_impl_all!(WsCodec<tokio::io::DuplexStream>: Send, Sync);
