// src/transport/memory/transport.rs

//! In-memory transport implementation.
//!
//! This file contains the concrete implementation of the domain-level
//! `Transport` trait using in-process data structures only.
//!
//! The memory transport is the reference implementation of channel
//! semantics. The broker-backed transport approximates this behavior and
//! documents its deviations (connection loss, broker-side expiry).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::mpsc;

use crate::{
    // ---
    Address,
    ConnectionState,
    Envelope,
    MessageHandlerPtr,
    PublishOptions,
    Result,
    RpcError,
    SubscribeOptions,
    Subscription,
    Transport,
    TransportBase,
    TransportConfig,
    TransportPtr,
};

// One named channel: the inbox of its consumer, if any, and messages
// published before a consumer attached. The deadline mirrors the broker
// expiration hint.
#[derive(Default)]
struct Channel {
    consumer: Option<mpsc::UnboundedSender<Envelope>>,
    backlog: VecDeque<(Envelope, Option<Instant>)>,
}

/// In-memory transport.
///
/// This transport simulates a queue broker entirely within the process.
/// It is intended for tests and for running a service and its callers in
/// one process without a broker.
///
/// ## Semantics
///
/// - Channels behave like queues: a message published to a channel with no
///   consumer is kept until one subscribes (or its expiration passes).
/// - A channel has at most one consumer; subscribing again replaces it.
/// - Each consumer runs on its own task and handles its messages one at a
///   time, in publish order.
/// - The transport is always connected until `close()`; afterwards
///   `publish()` fails with [`RpcError::Disconnected`].
struct MemoryTransport {
    // ---
    base: TransportBase,
    channels: Mutex<HashMap<Arc<str>, Channel>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn channels(&self) -> MutexGuard<'_, HashMap<Arc<str>, Channel>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(RpcError::Disconnected)
        } else {
            Ok(())
        }
    }
}

// Consumer loop: the inbox preserves publish order and each envelope is
// handled to completion before the next one is taken.
async fn consume(handler: MessageHandlerPtr, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
    // ---
    while let Some(env) = inbox.recv().await {
        let address = env.address.clone();
        if let Err(e) = handler.handle(env).await {
            crate::log_warn!("handler for {address} failed: {e}");
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn connection_state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Acquire) {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        }
    }

    /// Hand the envelope to the channel's consumer, or queue it until one
    /// subscribes.
    async fn publish(&self, mut env: Envelope, opts: PublishOptions) -> Result<()> {
        // ---
        self.ensure_open()?;

        let mut channels = self.channels();
        let channel = channels.entry(env.address.0.clone()).or_default();

        if let Some(consumer) = &channel.consumer {
            match consumer.send(env) {
                Ok(()) => return Ok(()),
                // Consumer task is gone; keep the message for the next one
                Err(mpsc::error::SendError(returned)) => {
                    env = returned;
                    channel.consumer = None;
                }
            }
        }

        let deadline = opts.expiration.map(|ttl| Instant::now() + ttl);
        channel.backlog.push_back((env, deadline));
        Ok(())
    }

    async fn declare(&self, channel: Address, _opts: SubscribeOptions) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.channels().entry(channel.0).or_default();
        Ok(())
    }

    /// Attach `handler` to the channel and hand it any queued envelopes.
    async fn subscribe(
        &self,
        sub: Subscription,
        handler: MessageHandlerPtr,
        _opts: SubscribeOptions,
    ) -> Result<()> {
        // ---
        self.ensure_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut channels = self.channels();
            let channel = channels.entry(sub.0.clone()).or_default();

            // Backlog goes first so it keeps its place ahead of new publishes
            let now = Instant::now();
            for (env, deadline) in channel.backlog.drain(..) {
                match deadline {
                    Some(deadline) if deadline <= now => {
                        crate::log_debug!(
                            "[{}] dropping expired message on {sub}",
                            self.base.transport_id
                        );
                    }
                    _ => {
                        let _ = tx.send(env);
                    }
                }
            }

            if channel.consumer.replace(tx).is_some() {
                crate::log_debug!("[{}] replaced consumer of {sub}", self.base.transport_id);
            }
        }

        tokio::spawn(consume(handler, rx));
        Ok(())
    }

    /// Close the transport.
    ///
    /// For the in-memory transport, this detaches every consumer and drops
    /// queued messages. Consumers finish what they already received.
    async fn close(&self) -> Result<()> {
        // ---
        self.closed.store(true, Ordering::Release);
        self.channels().clear();
        Ok(())
    }
}

/// Create a new in-memory transport.
///
/// This transport is always available and requires no external resources.
pub async fn create_transport(config: &TransportConfig) -> Result<TransportPtr> {
    // ---
    let transport = MemoryTransport {
        // ---
        base: TransportBase::from(config),
        channels: Mutex::new(HashMap::new()),
        closed: AtomicBool::new(false),
    };

    Ok(Arc::new(transport))
}
