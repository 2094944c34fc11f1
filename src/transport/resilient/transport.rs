// src/transport/resilient/transport.rs

//! Reconnecting transport.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the connect/reconnect cycle.
//!   It opens a session through the [`Connector`], replays every recorded
//!   subscription on it, then waits until the session is lost or the
//!   transport is closed.
//! - After a loss it waits the fixed reconnect delay and tries again, forever.
//! - `publish()` uses whatever session is installed at the time of the call
//!   and fails with [`RpcError::Disconnected`] when there is none; nothing is
//!   buffered.
//! - `subscribe()` and `declare()` record the channel first, so it is
//!   replayed on every (re)connect, and apply it right away if a session is
//!   installed.
//!
//! ## Acknowledgement
//!
//! Each consumer task handles its deliveries one at a time, in the order the
//! broker delivered them. A delivery is acked once the handler returns `Ok`
//! and nacked (requeued) when it returns `Err`. Deliveries in flight when
//! the session drops are never settled and the broker redelivers them.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::session::{Connector, SessionPtr};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
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
};

/// A recorded subscription, replayed on every connect.
#[derive(Clone)]
struct SubscriptionEntry {
    channel: Arc<str>,
    handler: MessageHandlerPtr,
    opts: SubscribeOptions,
}

// Everything a fresh session must be told about. Declarations are replayed
// before subscriptions.
#[derive(Default)]
struct Registry {
    declarations: Vec<(Arc<str>, SubscribeOptions)>,
    subscriptions: Vec<SubscriptionEntry>,
}

// State shared between the transport handle and its actor.
struct Shared {
    // ---
    transport_id: String,
    registry: tokio::sync::Mutex<Registry>,
    session: RwLock<Option<SessionPtr>>,
    state: watch::Sender<ConnectionState>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Shared {
    // ---
    fn current_session(&self) -> Option<SessionPtr> {
        match self.session.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install_session(&self, session: Option<SessionPtr>) {
        match self.session.write() {
            Ok(mut guard) => *guard = session,
            Err(poisoned) => *poisoned.into_inner() = session,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        // ---
        let previous = self.state.send_replace(state);
        if previous != state {
            log_debug!("[{}] {previous} -> {state}", self.transport_id);
        }
    }

    /// Replay all declarations and subscriptions on a fresh session, then
    /// publish it.
    ///
    /// Holding the registry lock while the session is installed means a
    /// concurrent `subscribe()` is either replayed here or sees the session.
    async fn activate(&self, session: &SessionPtr) {
        // ---
        let registry = self.registry.lock().await;

        for (channel, opts) in registry.declarations.iter() {
            if let Err(e) = session.declare(channel, *opts).await {
                log_warn!("[{}] failed to declare {channel}: {e}", self.transport_id);
            }
        }

        for entry in registry.subscriptions.iter() {
            match self.start_consumer(session, entry).await {
                Ok(()) => log_info!("[{}] consuming {}", self.transport_id, entry.channel),
                Err(e) => log_warn!(
                    "[{}] failed to consume {}: {e}",
                    self.transport_id,
                    entry.channel
                ),
            }
        }

        self.install_session(Some(Arc::clone(session)));
        self.set_state(ConnectionState::Connected);
    }

    /// Forget the current session and stop its consumer tasks.
    fn deactivate(&self) {
        // ---
        self.install_session(None);
        for task in lock_ignore_poison(&self.consumers).drain(..) {
            task.abort();
        }
    }

    async fn start_consumer(&self, session: &SessionPtr, entry: &SubscriptionEntry) -> Result<()> {
        // ---
        let mut handle = session.consume(&entry.channel, entry.opts).await?;

        let transport_id = self.transport_id.clone();
        let channel = Arc::clone(&entry.channel);
        let handler = Arc::clone(&entry.handler);

        let task = tokio::spawn(async move {
            while let Some(delivery) = handle.inbox.recv().await {
                let env = Envelope::new(Address(Arc::clone(&channel)), delivery.payload);

                let settled = match handler.handle(env).await {
                    Ok(()) => delivery.acker.ack().await,
                    Err(e) => {
                        log_warn!("[{transport_id}] handler for {channel} failed, requeueing: {e}");
                        delivery.acker.nack().await
                    }
                };

                // The session is gone; the broker redelivers
                if let Err(e) = settled {
                    log_debug!("[{transport_id}] settling delivery on {channel} failed: {e}");
                }
            }
            log_debug!("[{transport_id}] consumer for {channel} stopped");
        });

        lock_ignore_poison(&self.consumers).push(task);
        Ok(())
    }
}

/// Transport that keeps a broker connection alive across failures.
///
/// States follow [`ConnectionState`]: `Connecting` while an attempt is in
/// flight, `Connected` once subscriptions are replayed, `Disconnected`
/// between attempts. Observe them with [`state_changes`](Self::state_changes)
/// or [`wait_for_state`](Self::wait_for_state).
pub struct ResilientTransport {
    // ---
    base: TransportBase,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl ResilientTransport {
    /// Start the connect cycle in the background and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C: Connector>(connector: C, config: &TransportConfig) -> Arc<Self> {
        // ---
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            transport_id: config.node_id.clone(),
            registry: tokio::sync::Mutex::new(Registry::default()),
            session: RwLock::new(None),
            state,
            consumers: Mutex::new(Vec::new()),
        });

        let actor = Actor {
            shared: Arc::clone(&shared),
            connector,
            reconnect_delay: config.reconnect_delay,
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(actor.run());

        Arc::new(Self {
            base: TransportBase::from(config),
            shared,
            shutdown,
            actor: Mutex::new(Some(handle)),
        })
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the transport reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) {
        // ---
        let mut rx = self.state_changes();
        let _ = rx.wait_for(|state| *state == target).await;
    }
}

#[async_trait::async_trait]
impl Transport for ResilientTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    async fn publish(&self, env: Envelope, opts: PublishOptions) -> Result<()> {
        // ---
        let Some(session) = self.shared.current_session() else {
            log_debug!("[{}] publish to {} while disconnected", self.base.transport_id, env.address);
            return Err(RpcError::Disconnected);
        };

        session.publish(&env.address.0, env.payload, opts).await
    }

    async fn declare(&self, channel: Address, opts: SubscribeOptions) -> Result<()> {
        // ---
        let mut registry = self.shared.registry.lock().await;

        let known = registry
            .declarations
            .iter()
            .any(|(name, recorded)| *name == channel.0 && *recorded == opts);
        if !known {
            registry.declarations.push((Arc::clone(&channel.0), opts));
        }

        // Not connected: the actor declares it on the next connect.
        if let Some(session) = self.shared.current_session() {
            if let Err(e) = session.declare(&channel.0, opts).await {
                log_warn!(
                    "[{}] failed to declare {channel}, retrying on reconnect: {e}",
                    self.base.transport_id
                );
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        sub: Subscription,
        handler: MessageHandlerPtr,
        opts: SubscribeOptions,
    ) -> Result<()> {
        // ---
        let entry = SubscriptionEntry {
            channel: sub.0,
            handler,
            opts,
        };

        let mut registry = self.shared.registry.lock().await;
        registry.subscriptions.push(entry.clone());

        // Not connected: the actor starts it on the next connect.
        if let Some(session) = self.shared.current_session() {
            if let Err(e) = self.shared.start_consumer(&session, &entry).await {
                log_warn!(
                    "[{}] failed to consume {}, retrying on reconnect: {e}",
                    self.base.transport_id,
                    entry.channel
                );
            }
        }

        Ok(())
    }

    /// Stop reconnecting and release the current session.
    async fn close(&self) -> Result<()> {
        // ---
        self.shutdown.send_replace(true);

        let actor = lock_ignore_poison(&self.actor).take();
        if let Some(actor) = actor {
            let _ = actor.await;
        }

        Ok(())
    }
}

struct Actor<C> {
    // ---
    shared: Arc<Shared>,
    connector: C,
    reconnect_delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<C: Connector> Actor<C> {
    // ---
    async fn run(mut self) {
        // ---
        let transport_id = self.shared.transport_id.clone();
        log_info!("[{transport_id}] connection actor started");

        while !*self.shutdown.borrow() {
            self.shared.set_state(ConnectionState::Connecting);

            let attempt = tokio::select! {
                attempt = self.connector.connect() => attempt,
                _ = self.shutdown.changed() => break,
            };

            match attempt {
                Ok(session) => {
                    self.shared.activate(&session).await;
                    log_info!("[{transport_id}] connected");

                    let stop = tokio::select! {
                        _ = session.closed() => false,
                        _ = self.shutdown.changed() => true,
                    };

                    self.shared.deactivate();
                    session.close().await;

                    if stop {
                        break;
                    }
                    log_warn!("[{transport_id}] connection lost");
                }
                Err(e) => {
                    log_warn!("[{transport_id}] connect failed: {e}");
                }
            }

            self.shared.set_state(ConnectionState::Disconnected);
            log_info!(
                "[{transport_id}] reconnecting in {} ms",
                self.reconnect_delay.as_millis()
            );

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        self.shared.deactivate();
        self.shared.set_state(ConnectionState::Disconnected);
        log_info!("[{transport_id}] connection actor stopped");
    }
}
