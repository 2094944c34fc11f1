//! Request/reply RPC tunnels over fire-and-forget message queues.
//!
//! A message broker only delivers one-way messages to named queues. This
//! library adds the request/reply layer on top:
//!
//! - correlation of each request with its eventual response,
//! - a private, ephemeral reply channel per caller and remote service,
//! - call timeouts so lost replies never leak pending calls,
//! - a transport that survives broker outages by reconnecting and
//!   replaying its subscriptions.
//!
//! The entry point is [`Tunneler`], built with [`TunnelerBuilder`] on top of
//! a transport from [`TransportBuilder`].

// Import all sub modules once...
mod client;
mod correlation;
mod domain;
mod error;
mod macros;
mod protocol;
mod server;
mod transport;

mod transport_builder;
mod tunneler;
mod tunneler_builder;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use client::{PendingCall, PendingCalls, ServiceTunnel};
pub use correlation::CorrelationId;
pub use error::{Result, RpcError};
pub use protocol::{
    //
    reply_channel_name,
    FailureBody,
    RequestMessage,
    ResponseMessage,
    INVALID_PAYLOAD,
    INVALID_RESULT,
    UNKNOWN_PROCEDURE,
};
pub use server::{
    //
    BoxFuture,
    Dispatcher,
    HandlerMap,
    HandlerOutcome,
    ProcedureHandler,
    ProcedureHandlerPtr,
};
pub use transport_builder::{TransportBuilder, ENV_BROKER_URI, ENV_RECONNECT_MS, ENV_TRANSPORT};
pub use tunneler::Tunneler;
pub use tunneler_builder::{TunnelerBuilder, DEFAULT_CALL_TIMEOUT, DEFAULT_REQUEST_EXPIRATION};

pub use transport::create_memory_transport;

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_transport;

pub use transport::resilient::{
    //
    Acker,
    BrokerSession,
    ConsumerHandle,
    Connector,
    Delivery,
    ResilientTransport,
    SessionPtr,
};

// --- public re-exports
pub use domain::{
    //
    handler_fn,
    Address,
    ConnectionState,
    Envelope,
    MessageHandler,
    MessageHandlerPtr,
    PublishOptions,
    SubscribeOptions,
    Subscription,
    Transport,
    TransportBase,
    TransportConfig,
    TransportPtr,
    DEFAULT_RECONNECT_DELAY,
};

/// Create the transport selected by `config.transport_type`.
///
/// `None` falls back to the in-memory transport.
pub async fn create_transport(config: &TransportConfig) -> Result<TransportPtr> {
    // ---
    match config.transport_type.as_deref() {
        None | Some("memory") => create_memory_transport(config).await,

        #[cfg(feature = "transport_lapin")]
        Some("lapin") => create_lapin_transport(config).await,

        #[cfg(not(feature = "transport_lapin"))]
        Some("lapin") => Err(RpcError::InvalidConfig(
            "transport_type lapin requires the transport_lapin feature".into(),
        )),

        Some(other) => Err(RpcError::InvalidConfig(format!(
            "unrecognized transport_type: {other}, valid values: memory, lapin"
        ))),
    }
}
