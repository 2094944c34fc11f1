// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the capability contract the tunnel layer needs from a
//! message transport: publish a message to a named channel, and attach a
//! handler to a named channel. It intentionally avoids any reference to
//! concrete protocols, brokers, or client libraries.
//!
//! The transport layer is responsible only for delivering opaque envelopes
//! to subscribed handlers. Higher-level semantics such as correlation,
//! reply routing and timeouts are handled by the client and server layers.
//!
//! Concrete implementations of this interface live under `src/transport/`.
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

/// Default delay between reconnect attempts of a broker-backed transport.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Connection lifecycle of a transport.
///
/// ```text
/// Disconnected --connect attempt--> Connecting --success--> Connected
///      ^                                |                       |
///      +------------- failure ----------+---- broker closes ----+
/// ```
///
/// There is no terminal state; broker-backed transports retry forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    // ---
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Shared base state for all transport implementations.
///
/// Each concrete transport embeds this as a field named `base`:
///
/// ```ignore
/// struct AmqpTransport {
///     base: TransportBase,
///     // ... amqp specific fields
/// }
///
/// impl Transport for AmqpTransport {
///     fn base(&self) -> &TransportBase { &self.base }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct TransportBase {
    /// Unique identifier for this transport instance (the node_id).
    pub transport_id: String,
}

impl TransportBase {
    /// Create a new TransportBase.
    pub fn new(transport_id: impl Into<String>) -> Self {
        Self {
            transport_id: transport_id.into(),
        }
    }
}

impl From<&TransportConfig> for TransportBase {
    /// Clones only the identity, leaving `config` available for
    /// transport-specific use (URI, reconnect delay, etc.).
    fn from(config: &TransportConfig) -> Self {
        // ---
        Self {
            transport_id: config.node_id.clone(),
        }
    }
}

/// Configuration for creating a transport instance.
///
/// Usually produced by [`TransportBuilder`](crate::TransportBuilder) and passed
/// to the transport factory functions (`create_*_transport()`).
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Broker URI (e.g. `"amqp://localhost:5672/%2f"`). `None` for the
    /// in-memory transport.
    pub uri: Option<String>,
    /// Node ID for this transport instance, used in logs and consumer tags.
    pub node_id: String,
    /// Optional transport type override (`"memory"`, `"lapin"`).
    /// If `None`, the URI scheme decides.
    pub transport_type: Option<String>,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Maximum number of unacknowledged deliveries per consumer.
    pub prefetch: Option<u16>,
}

impl TransportConfig {
    /// Configuration for an in-memory transport (no broker).
    pub fn memory(node_id: impl Into<String>) -> Self {
        // ---
        Self {
            uri: None,
            node_id: node_id.into(),
            transport_type: Some("memory".to_string()),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            prefetch: None,
        }
    }
}

/// A transport address.
///
/// An `Address` names the channel (queue) a message is published to. It is
/// treated as an opaque identifier at the domain level.
///
/// Addresses are immutable, cheap to clone, and safe to share across threads.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A subscription identifier: the name of the channel to consume from.
///
/// Matching is exact channel-name equality; there is no wildcard syntax.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(pub Arc<str>);

impl From<Address> for Subscription {
    fn from(address: Address) -> Self {
        // ---
        Subscription(address.0)
    }
}

impl<T> From<T> for Subscription
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Subscription(value.into())
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque message envelope.
///
/// The unit of transport between publishers and subscribed handlers. The
/// transport does not interpret the payload; the protocol layer encodes its
/// request and response messages into it as JSON.
#[derive(Clone, Debug)]
pub struct Envelope {
    // ---
    /// Channel the envelope is published to or was received from.
    pub address: Address,

    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Envelope {
    // ---
    /// Create an envelope from raw payload bytes.
    pub fn new(address: Address, payload: Bytes) -> Self {
        Self { address, payload }
    }

    /// Create an envelope carrying `value` encoded as JSON.
    pub fn json<T: Serialize>(address: Address, value: &T) -> Result<Self> {
        // ---
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::new(address, Bytes::from(bytes)))
    }

    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        // ---
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Per-message publish options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Hint that the broker may drop the message if it is still undelivered
    /// after this long.
    pub expiration: Option<Duration>,
}

impl PublishOptions {
    /// Options with an expiration hint.
    pub fn with_expiration(expiration: Duration) -> Self {
        Self {
            expiration: Some(expiration),
        }
    }
}

/// Channel creation options, applied when a subscription declares its channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Channel survives a broker restart.
    pub durable: bool,
    /// Channel is removed by the broker once its last consumer goes away.
    pub auto_delete: bool,
}

impl SubscribeOptions {
    /// Request channels: durable and kept after consumers leave.
    pub fn request_channel() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }

    /// Reply channels: ephemeral, torn down with the owning process.
    pub fn reply_channel() -> Self {
        Self {
            durable: false,
            auto_delete: true,
        }
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self::request_channel()
    }
}

/// A consumer of transport-delivered envelopes.
///
/// The transport awaits `handle()` before settling the delivery, so a
/// crash mid-handling leaves the message re-deliverable by the broker.
/// Envelopes of one subscription are handled one at a time, in delivery
/// order.
///
/// - `Ok(())` acknowledges the delivery. Return it also for messages that
///   can never be processed (undecodable input), after logging them.
/// - `Err(_)` hands the delivery back to the broker for redelivery. Use it
///   for transient failures only, such as a failed publish.
///
/// Envelopes may be duplicated (at-least-once delivery).
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, env: Envelope) -> Result<()>;
}

/// Shared message handler pointer. Transports keep a clone per subscription
/// so it can be re-attached after a reconnect.
pub type MessageHandlerPtr = Arc<dyn MessageHandler>;

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, env: Envelope) -> Result<()> {
        (self.0)(env).await
    }
}

/// Wrap an async closure as a [`MessageHandlerPtr`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandlerPtr
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Transport abstraction.
///
/// A `Transport` publishes envelopes to named channels and attaches handlers
/// to named channels. It defines the minimal contract required by the tunnel
/// layer without committing to any specific broker.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, messages published to that
///   channel are delivered to the handler (immediately, or for broker-backed
///   transports once connected).
/// - `publish()` does not wait for subscribers to handle the message.
/// - Messages within one channel reach the handler in broker delivery order,
///   and the handler finishes one message before it is given the next.
///
/// # Available Implementations
///
/// - `create_memory_transport` - in-process transport (always available)
/// - `create_lapin_transport` - resilient AMQP transport (`transport_lapin`)
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Consumers should treat the methods as
/// normal `async fn`s.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &TransportBase;

    /// Returns the transport_id of the transport.
    fn transport_id(&self) -> &str {
        &self.base().transport_id
    }

    /// Current connection state. In-process transports are always connected.
    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    /// Publish an envelope to the channel named by `env.address`.
    ///
    /// Fails with [`RpcError::Disconnected`](crate::RpcError::Disconnected)
    /// if the transport is not connected; nothing is queued for later.
    async fn publish(&self, env: Envelope, opts: PublishOptions) -> Result<()>;

    /// Create the channel named by `channel` with `opts`, without consuming
    /// from it.
    ///
    /// Messages published to a declared channel wait there until a consumer
    /// attaches (or their expiration passes).
    async fn declare(&self, channel: Address, opts: SubscribeOptions) -> Result<()>;

    /// Attach `handler` to the channel, creating it with `opts`.
    async fn subscribe(
        &self,
        sub: Subscription,
        handler: MessageHandlerPtr,
        opts: SubscribeOptions,
    ) -> Result<()>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Multiple clones share the same underlying connection
pub type TransportPtr = Arc<dyn Transport>;
