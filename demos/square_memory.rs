//! In-process demo: a service and a caller sharing the memory transport.
//!
//! Run with: cargo run --example square_memory
//!
//! No broker required.

use mom_tunneler::{HandlerMap, RpcError, TransportBuilder, TunnelerBuilder};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let transport = TransportBuilder::new()
        .node_id("square-memory")
        .transport_type("memory")
        .build()
        .await?;

    let service = TunnelerBuilder::new(transport.clone()).name("service").build()?;
    service
        .handle_messages(HandlerMap::new().procedure("square", |x: i64| async move {
            Ok::<_, String>(x * x)
        }))
        .await?;

    let client = TunnelerBuilder::new(transport).name("client").build()?;
    let tunnel = client.service_tunnel("service").await?;

    let nine = tunnel.send("square", json!(3)).await?;
    println!("square(3) = {nine}");

    match tunnel.send("missing", json!(1)).await {
        Err(RpcError::UnknownProcedure(name)) => println!("unknown procedure: {name}"),
        other => println!("unexpected outcome: {other:?}"),
    }

    client.close().await?;
    Ok(())
}
