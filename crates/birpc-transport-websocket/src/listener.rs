//! Stoppable accept loop for WebSocket servers.

use std::net::SocketAddr;

use birpc::CodecError;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::WsCodec;

/// A TCP listener whose `accept` can be unblocked from another task.
///
/// `stop()` cancels the token; a pending or future [`accept`](Self::accept)
/// then returns [`CodecError::Closed`] instead of waiting forever, which is
/// what lets servers shut down cleanly.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    stop: CancellationToken,
}

impl Listener {
    /// Bind, e.g. to `"127.0.0.1:0"` for an ephemeral test port.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, CodecError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            stop: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A token that can stop this listener from anywhere.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Unblock any pending `accept`.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Accept one connection and perform the WebSocket handshake on it.
    pub async fn accept(&self) -> Result<WsCodec<tokio::net::TcpStream>, CodecError> {
        let stream = tokio::select! {
            _ = self.stop.cancelled() => {
                debug!(addr = %self.local_addr, "listener stopped");
                return Err(CodecError::Closed);
            }
            accepted = self.listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "inbound connection");
                stream
            }
        };
        WsCodec::accept(stream).await
    }
}
