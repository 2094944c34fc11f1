// src/transport/resilient/session.rs

//! Broker session seam.
//!
//! A [`Connector`] opens one [`BrokerSession`]: a live connection plus
//! channel to a broker. Sessions are disposable; the resilient transport
//! throws a session away when it is lost and asks the connector for a new
//! one. Everything that must survive a reconnect (subscriptions, state)
//! lives in the transport, never in the session.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{PublishOptions, Result, SubscribeOptions};

/// Settles one delivery with the broker.
#[async_trait::async_trait]
pub trait Acker: Send + Sync {
    /// The delivery was processed; the broker may discard it.
    async fn ack(&self) -> Result<()>;

    /// The delivery was not processed; the broker requeues it.
    async fn nack(&self) -> Result<()>;
}

/// One message taken from a broker channel.
pub struct Delivery {
    pub payload: Bytes,
    pub acker: Box<dyn Acker>,
}

/// Receiving side of one consumer started on a session.
///
/// The inbox closes when the consumer stops (session lost or closed).
pub struct ConsumerHandle {
    pub inbox: mpsc::Receiver<Delivery>,
}

/// A live broker connection.
#[async_trait::async_trait]
pub trait BrokerSession: Send + Sync {
    // ---
    /// Declare `channel` with `opts`. Declaring an existing channel with
    /// the same options is a no-op.
    async fn declare(&self, channel: &str, opts: SubscribeOptions) -> Result<()>;

    /// Declare `channel` with `opts` and start consuming from it.
    async fn consume(&self, channel: &str, opts: SubscribeOptions) -> Result<ConsumerHandle>;

    /// Publish `payload` to `channel`.
    async fn publish(&self, channel: &str, payload: Bytes, opts: PublishOptions) -> Result<()>;

    /// Completes once the session is lost.
    async fn closed(&self);

    /// Release the session. Errors are not reported; the session is gone
    /// either way.
    async fn close(&self);
}

/// Shared session pointer.
pub type SessionPtr = Arc<dyn BrokerSession>;

/// Opens broker sessions.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<SessionPtr>;
}
