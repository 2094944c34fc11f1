//! Tunneler endpoint.
//!
//! A single type that serves procedures to other endpoints and calls
//! procedures of other endpoints, sharing one transport.

use crate::server::{Dispatcher, HandlerMap, RequestConsumer};
use crate::{
    // ---
    Result,
    RpcError,
    ServiceTunnel,
    SubscribeOptions,
    Subscription,
    TransportPtr,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Named endpoint: service side and client side over one transport.
///
/// - **Service side**: [`handle_messages`](Self::handle_messages) merges
///   procedure handlers and, the first time, starts consuming the request
///   channel named after the endpoint.
/// - **Client side**: [`service_tunnel`](Self::service_tunnel) returns the
///   cached [`ServiceTunnel`] for a remote service, creating it on first use.
///
/// Cheap to clone; clones share handlers and tunnels.
///
/// # Example
///
/// ```
/// use mom_tunneler::{create_memory_transport, HandlerMap, TransportConfig, TunnelerBuilder};
/// use serde_json::json;
///
/// # async fn example() -> mom_tunneler::Result<()> {
/// let transport = create_memory_transport(&TransportConfig::memory("local")).await?;
///
/// let service = TunnelerBuilder::new(transport.clone()).name("service").build()?;
/// service
///     .handle_messages(HandlerMap::new().procedure("square", |x: i64| async move {
///         Ok::<_, String>(x * x)
///     }))
///     .await?;
///
/// let client = TunnelerBuilder::new(transport).name("client").build()?;
/// let tunnel = client.service_tunnel("service").await?;
/// assert_eq!(tunnel.send("square", json!(3)).await?, json!(9));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Tunneler {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    name: String,
    transport: TransportPtr,
    dispatcher: Arc<Dispatcher>,
    listening: Mutex<bool>,
    tunnels: Mutex<HashMap<String, ServiceTunnel>>,
    call_timeout: Option<Duration>,
    request_expiration: Duration,
}

impl fmt::Debug for Tunneler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunneler")
            .field("name", &self.inner.name)
            .field("transport", &self.inner.transport.transport_id())
            .finish_non_exhaustive()
    }
}

impl Tunneler {
    /// Create a new endpoint (internal use by TunnelerBuilder).
    pub(crate) fn new(
        name: String,
        transport: TransportPtr,
        call_timeout: Option<Duration>,
        request_expiration: Duration,
    ) -> Self {
        // ---
        Self {
            inner: Arc::new(Inner {
                name,
                transport,
                dispatcher: Arc::new(Dispatcher::new()),
                listening: Mutex::new(false),
                tunnels: Mutex::new(HashMap::new()),
                call_timeout,
                request_expiration,
            }),
        }
    }

    /// Endpoint name; also the name of its request channel.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the request channel is being consumed.
    pub async fn is_listening(&self) -> bool {
        *self.inner.listening.lock().await
    }

    /// Merge `handlers` into the endpoint's handler table.
    ///
    /// May be called any number of times, also while requests are being
    /// served: new names are dispatched from the next request on, existing
    /// names keep working. The first call subscribes to the request channel
    /// (durable, not auto-deleted).
    ///
    /// # Errors
    ///
    /// Returns the transport error if the request channel subscription
    /// fails; the handlers stay registered and a later call retries.
    pub async fn handle_messages(&self, handlers: HandlerMap) -> Result<()> {
        // ---
        self.inner.dispatcher.register(handlers);

        let mut listening = self.inner.listening.lock().await;
        if *listening {
            return Ok(());
        }

        let consumer = RequestConsumer::new(
            Arc::clone(&self.inner.dispatcher),
            self.inner.transport.clone(),
        );

        self.inner
            .transport
            .subscribe(
                Subscription::from(self.inner.name.as_str()),
                Arc::new(consumer),
                SubscribeOptions::request_channel(),
            )
            .await?;

        *listening = true;
        crate::log_info!("[{}] serving requests", self.inner.name);
        Ok(())
    }

    /// Get the tunnel to `service`, creating and caching it on first use.
    ///
    /// Every call for the same name returns a handle to the same tunnel,
    /// and so the same reply channel.
    pub async fn service_tunnel(&self, service: &str) -> Result<ServiceTunnel> {
        // ---
        let mut tunnels = self.inner.tunnels.lock().await;

        if let Some(tunnel) = tunnels.get(service) {
            return Ok(tunnel.clone());
        }

        let tunnel = ServiceTunnel::open(
            self.inner.transport.clone(),
            service,
            &self.inner.name,
            self.inner.call_timeout,
            self.inner.request_expiration,
        )
        .await?;

        tunnels.insert(service.to_string(), tunnel.clone());
        Ok(tunnel)
    }

    /// Reject every pending call with [`RpcError::Closed`] and close the
    /// transport.
    ///
    /// The transport is closed for every endpoint sharing it, not just this
    /// one. When several endpoints share a transport, close only the last of
    /// them, or reject pending calls through
    /// [`ServiceTunnel::reject_pending`] and close the transport separately.
    pub async fn close(&self) -> Result<()> {
        // ---
        let rejected: usize = {
            let tunnels = self.inner.tunnels.lock().await;
            tunnels
                .values()
                .map(|tunnel| tunnel.reject_pending(|| RpcError::Closed))
                .sum()
        };

        if rejected > 0 {
            crate::log_debug!("[{}] rejected {rejected} pending calls on close", self.inner.name);
        }

        self.inner.transport.close().await
    }
}
