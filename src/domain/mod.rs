//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! transport implementations, protocols, or infrastructure concerns.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod transport;

// --- Transport domain re-exports ---

pub use transport::{
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
