//! Requester demo: calls `square` on the `responder` service every 3 seconds.
//!
//! Run with: cargo run --example requester
//!
//! Requires: a RabbitMQ broker (default `amqp://localhost:5672/%2f`, override
//! with `BROKER_URI`) and the `responder` demo. Failed calls (timeouts, broker
//! outages) are logged and the loop carries on.

use std::time::Duration;

use mom_tunneler::{TransportBuilder, TunnelerBuilder, ENV_BROKER_URI};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut builder = TransportBuilder::from_env()?.node_id("requester");
    if std::env::var(ENV_BROKER_URI).is_err() {
        builder = builder.uri("amqp://localhost:5672/%2f");
    }
    let transport = builder.build().await?;

    let tunneler = TunnelerBuilder::new(transport)
        .name("requester")
        .call_timeout(Duration::from_secs(5))
        .build()?;

    let tunnel = tunneler.service_tunnel("responder").await?;
    let mut ticker = tokio::time::interval(Duration::from_secs(3));
    let mut n: i64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                n += 1;
                match tunnel.call::<i64, i64>("square", &n).await {
                    Ok(sq) => tracing::info!("square({n}) = {sq}"),
                    Err(e) => tracing::warn!("square({n}) failed: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tunneler.close().await?;
    Ok(())
}
