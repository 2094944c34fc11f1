//! AMQP transport implementation using `lapin`.
//!
//! This module adapts a lapin connection to the [`BrokerSession`] seam; the
//! reconnect cycle, subscription replay and ack-after-handle policy live in
//! [`ResilientTransport`].
//!
//! ## Connection behavior
//!
//! Connection to the broker is **lazy**: `create_transport()` returns at
//! once and the first connect attempt runs in the background. Connection
//! success/failure is logged at info/warn level respectively.
//!
//! A session counts as lost as soon as the connection or its channel stops
//! being usable: a watchdog polls both, and a consumer stream that ends or
//! a declare/publish error on a closed channel trip it immediately. The
//! broker may close only the channel (e.g. `PRECONDITION_FAILED` when a
//! queue is redeclared with other flags), so the connection alone is not
//! enough.
//!
//! ## Queue semantics
//!
//! Channels map one-to-one to AMQP queues on the default exchange (routing
//! key = queue name). Queue options come from [`SubscribeOptions`]:
//! - request queues: `durable: true`, `auto_delete: false`
//! - reply queues: `durable: false`, `auto_delete: true`
//!
//! Deliveries are acknowledged manually, after the handler has run, or
//! nacked with requeue when the handler fails.
//! The request expiration is sent as the per-message `expiration` property.
//!
//! This module intentionally avoids exposing AMQP-specific concepts
//! (exchanges, routing keys, message properties) outside the transport boundary.

use lapin::{
    //
    message::Delivery as AmqpDelivery,
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::transport::resilient::{
    //
    Acker,
    BrokerSession,
    ConsumerHandle,
    Connector,
    Delivery,
    ResilientTransport,
    SessionPtr,
};
use crate::{
    //
    log_debug,
    log_info,
    log_warn,
    PublishOptions,
    Result,
    RpcError,
    SubscribeOptions,
    TransportConfig,
    TransportPtr,
};

type TaskList = Arc<Mutex<Vec<JoinHandle<()>>>>;

const WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Opens lapin sessions against one broker URI.
struct AmqpConnector {
    // ---
    transport_id: String,
    uri: String,
    prefetch: Option<u16>,
}

#[async_trait::async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<SessionPtr> {
        // ---
        log_info!("[{}] connecting to AMQP broker", self.transport_id);

        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: connection failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: channel creation failed: {e}")))?;

        if let Some(prefetch) = self.prefetch {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| RpcError::Transport(format!("amqp: basic_qos failed: {e}")))?;
        }

        log_info!("[{}] created AMQP channel", self.transport_id);

        let (lost, _) = watch::channel(false);
        let session = AmqpSession {
            transport_id: self.transport_id.clone(),
            connection,
            channel,
            lost: Arc::new(lost),
            tasks: Arc::new(Mutex::new(Vec::new())),
        };
        session.spawn_watchdog();

        Ok(Arc::new(session))
    }
}

/// One lapin connection and channel.
struct AmqpSession {
    // ---
    transport_id: String,
    connection: Connection,
    channel: Channel,
    lost: Arc<watch::Sender<bool>>,
    tasks: TaskList,
}

impl AmqpSession {
    // ---
    fn usable(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    // Mark the session lost if `err` came from a channel that is no longer
    // usable, so the transport reconnects instead of failing forever.
    fn check_channel(&self, what: &str, err: lapin::Error) -> RpcError {
        // ---
        if !self.usable() && !self.lost.send_replace(true) {
            log_warn!("[{}] AMQP channel closed after {what} error: {err}", self.transport_id);
        }
        RpcError::Transport(format!("amqp: {what} failed: {err}"))
    }

    fn spawn_watchdog(&self) {
        // ---
        let connection = self.connection.status().clone();
        let channel = self.channel.status().clone();
        let lost = Arc::clone(&self.lost);
        let transport_id = self.transport_id.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
            loop {
                ticker.tick().await;
                if *lost.borrow() {
                    break;
                }
                if !connection.connected() || !channel.connected() {
                    log_warn!("[{transport_id}] AMQP connection or channel closed");
                    lost.send_replace(true);
                    break;
                }
            }
        });

        lock_ignore_poison(&self.tasks).push(handle);
    }
}

// Holds the delivery (payload already taken) until the handler is done
struct AmqpAcker {
    delivery: AmqpDelivery,
}

#[async_trait::async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        // ---
        self.delivery
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| RpcError::Transport(format!("amqp: ack failed: {e}")))
    }

    async fn nack(&self) -> Result<()> {
        // ---
        let opts = BasicNackOptions {
            multiple: false,
            requeue: true,
        };
        self.delivery
            .nack(opts)
            .await
            .map(|_| ())
            .map_err(|e| RpcError::Transport(format!("amqp: nack failed: {e}")))
    }
}

fn queue_options(opts: SubscribeOptions) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: opts.durable,
        exclusive: false,
        auto_delete: opts.auto_delete,
        nowait: false,
    }
}

#[async_trait::async_trait]
impl BrokerSession for AmqpSession {
    // ---
    async fn declare(&self, queue: &str, opts: SubscribeOptions) -> Result<()> {
        // ---
        self.channel
            .queue_declare(queue.into(), queue_options(opts), FieldTable::default())
            .await
            .map_err(|e| self.check_channel("queue declare", e))?;

        log_debug!("[{}] declared queue: {queue}", self.transport_id);
        Ok(())
    }

    async fn consume(&self, queue: &str, opts: SubscribeOptions) -> Result<ConsumerHandle> {
        // ---
        self.declare(queue, opts).await?;

        let consumer_tag = format!("{}-{}", self.transport_id, uuid::Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                queue.into(),
                consumer_tag.as_str().into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.check_channel("consume", e))?;

        let (tx, rx) = mpsc::channel(64);
        let queue_name = queue.to_string();
        let transport_id = self.transport_id.clone();
        let lost = Arc::clone(&self.lost);

        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(mut delivery) => {
                        let payload = Bytes::from(std::mem::take(&mut delivery.data));
                        let delivery = Delivery {
                            payload,
                            acker: Box::new(AmqpAcker { delivery }),
                        };
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log_warn!("[{transport_id}] consumer error on {queue_name}: {e}");
                        break;
                    }
                }
            }

            // Stream ended or failed: the consumer is gone, so is the session
            if !lost.send_replace(true) {
                log_warn!("[{transport_id}] consumer for {queue_name} ended");
            }
        });

        lock_ignore_poison(&self.tasks).push(handle);

        Ok(ConsumerHandle { inbox: rx })
    }

    async fn publish(&self, queue: &str, payload: Bytes, opts: PublishOptions) -> Result<()> {
        // ---
        let mut props = BasicProperties::default();
        if let Some(expiration) = opts.expiration {
            props = props.with_expiration(expiration.as_millis().to_string().into());
        }

        self.channel
            .basic_publish(
                "".into(),    // default exchange
                queue.into(), // routing key = queue name
                BasicPublishOptions::default(),
                &payload,
                props,
            )
            .await
            .map_err(|e| self.check_channel("publish", e))?;

        log_debug!("[{}] published to queue: {queue}", self.transport_id);
        Ok(())
    }

    async fn closed(&self) {
        // ---
        let mut rx = self.lost.subscribe();
        let _ = rx.wait_for(|lost| *lost).await;
    }

    async fn close(&self) {
        // ---
        for handle in lock_ignore_poison(&self.tasks).drain(..) {
            handle.abort();
        }

        if self.usable() {
            let _ = self.channel.close(200, "Normal shutdown".into()).await;
            let _ = self.connection.close(200, "Normal shutdown".into()).await;
        }

        log_info!("[{}] AMQP session closed", self.transport_id);
    }
}

/// Creates a reconnecting lapin-based AMQP transport.
///
/// # Errors
///
/// Returns [`RpcError::MissingConfig`] if the broker URI is missing.
///
/// # Connection Behavior
///
/// Returns immediately in the `Disconnected`/`Connecting` state; the broker
/// connection is established in the background and re-established after
/// every loss, `config.reconnect_delay` apart.
pub async fn create_transport(config: &TransportConfig) -> Result<TransportPtr> {
    // ---
    let uri = config
        .uri
        .clone()
        .ok_or_else(|| RpcError::MissingConfig("AMQP transport requires a broker uri".into()))?;

    let connector = AmqpConnector {
        transport_id: config.node_id.clone(),
        uri,
        prefetch: config.prefetch,
    };

    Ok(ResilientTransport::start(connector, config))
}
