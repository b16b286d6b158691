//! WebSocket client example.
//!
//! First start the server: `cargo run --example ws_server -p birpc-transport-websocket`
//! Then run the client: `cargo run --example ws_client -p birpc-transport-websocket`

use std::sync::Arc;

use birpc::{Endpoint, Registry, Service, ServiceScope};
use birpc_transport_websocket::WsCodec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct BinaryOp {
    a: i64,
    b: i64,
}

/// The server pushes a greeting notification here right after connect.
struct Notify;

impl Service for Notify {
    const NAME: &'static str = "Notify";

    fn methods(scope: &mut ServiceScope<Self>) {
        scope.method("Hello", |_svc, greeting: String| async move {
            println!("Server says: {greeting}");
            Ok(())
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
    let url = "ws://127.0.0.1:9123/";
    println!("Connecting to {url}...");
    let codec = WsCodec::connect(url).await?;
    println!("Connected!");

    let registry = Registry::new();
    registry.register_service(Notify)?;

    let endpoint = Endpoint::new(codec, Arc::new(registry));
    let serve = tokio::spawn({
        let endpoint = endpoint.clone();
        async move { endpoint.serve().await }
    });

    let sum: i64 = endpoint.call("Calculator.Add", &BinaryOp { a: 10, b: 32 }).await?;
    println!("Calculator.Add(10, 32) = {sum}");

    match endpoint.call::<_, i64>("Calculator.Div", &BinaryOp { a: 1, b: 0 }).await {
        Ok(v) => println!("Calculator.Div(1, 0) = {v}?!"),
        Err(e) => println!("Calculator.Div(1, 0) failed as expected: {e}"),
    }

    let methods: Vec<String> = endpoint.call("getMethods", &()).await?;
    println!("Server methods: {methods:?}");

    endpoint.close().await;
    serve.await??;
    Ok(())
}
