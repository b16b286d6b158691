//! WebSocket server example.
//!
//! Serves a small calculator to every connection, and demonstrates the
//! server calling back: each connection is greeted through the client's
//! own `Notify.Hello` handler, if it registers one.
//!
//! Run the server with: `cargo run --example ws_server -p birpc-transport-websocket`
//! Then connect with the client (see the ws_client example).

use std::sync::Arc;

use birpc::{Endpoint, MethodError, Registry, Service, ServiceScope};
use birpc_transport_websocket::Listener;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct BinaryOp {
    a: i64,
    b: i64,
}

struct Calculator;

impl Service for Calculator {
    const NAME: &'static str = "Calculator";

    fn methods(scope: &mut ServiceScope<Self>) {
        scope.method("Add", |_svc, op: BinaryOp| async move {
            println!("  Add({}, {}) called", op.a, op.b);
            Ok(op.a + op.b)
        });
        scope.method("Div", |_svc, op: BinaryOp| async move {
            println!("  Div({}, {}) called", op.a, op.b);
            if op.b == 0 {
                return Err(MethodError::new("division by zero"));
            }
            Ok(op.a / op.b)
        });
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = Registry::new();
    registry.register_service(Calculator)?;
    let registry = Arc::new(registry);

    let listener = Listener::bind("127.0.0.1:9123").await?;
    println!("Calculator server listening on ws://{}/", listener.local_addr());

    loop {
        let codec = listener.accept().await?;
        let peer = codec.peer_addr();
        println!("New connection from {peer:?}");

        let registry = registry.clone();
        tokio::spawn(async move {
            let endpoint = Endpoint::new(codec, registry);

            // Fire-and-forget greeting; clients without the handler just
            // log a warning on their side of the wire.
            let _ = endpoint.notify("Notify.Hello", &"welcome");

            if let Err(e) = endpoint.serve().await {
                eprintln!("Connection error from {peer:?}: {e}");
            }
            println!("Connection from {peer:?} closed");
        });
    }
}
