//! Responder demo: serves the `square` procedure over an AMQP broker.
//!
//! Run with: cargo run --example responder
//!
//! Requires: a RabbitMQ broker (default `amqp://localhost:5672/%2f`, override
//! with `BROKER_URI`). Start the `requester` demo in another terminal; stop
//! and restart the broker to watch both sides reconnect.

use mom_tunneler::{HandlerMap, TransportBuilder, TunnelerBuilder, ENV_BROKER_URI};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut builder = TransportBuilder::from_env()?.node_id("responder");
    if std::env::var(ENV_BROKER_URI).is_err() {
        builder = builder.uri("amqp://localhost:5672/%2f");
    }
    let transport = builder.build().await?;

    let tunneler = TunnelerBuilder::new(transport).name("responder").build()?;

    tunneler
        .handle_messages(HandlerMap::new().procedure("square", |x: i64| async move {
            tracing::info!("square({x})");
            x.checked_mul(x).ok_or_else(|| format!("square({x}) overflows"))
        }))
        .await?;

    tracing::info!("serving `square` on channel `responder`; Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    tunneler.close().await?;
    Ok(())
}
