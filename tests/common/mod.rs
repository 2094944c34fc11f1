// tests/common/mod.rs

//! Shared test fixtures: tracing setup and an in-process broker that can be
//! taken offline to drive the resilient transport through an outage.

#![allow(dead_code)]

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::sync::{mpsc, watch};

use mom_tunneler::{
    // ---
    Acker,
    BrokerSession,
    ConsumerHandle,
    Connector,
    Delivery,
    PublishOptions,
    Result,
    RpcError,
    SessionPtr,
    SubscribeOptions,
};

pub fn init_tracing() {
    // ---
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
struct Queue {
    consumers: Vec<mpsc::Sender<Delivery>>,
    backlog: VecDeque<Bytes>,
}

struct BrokerState {
    // ---
    online: AtomicBool,
    fail_publishes: AtomicBool,
    queues: Mutex<HashMap<String, Queue>>,
    declares: Mutex<HashMap<String, (SubscribeOptions, usize)>>,
    sessions: Mutex<Vec<Arc<watch::Sender<bool>>>>,
    connects: AtomicUsize,
    acks: AtomicUsize,
    nacks: AtomicUsize,
}

/// In-process broker with named queues, competing consumers and manual
/// acks. Like an AMQP default exchange, it drops messages published to a
/// queue nobody declared.
#[derive(Clone)]
pub struct TestBroker {
    state: Arc<BrokerState>,
}

impl Default for TestBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBroker {
    // ---
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                online: AtomicBool::new(true),
                fail_publishes: AtomicBool::new(false),
                queues: Mutex::new(HashMap::new()),
                declares: Mutex::new(HashMap::new()),
                sessions: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                acks: AtomicUsize::new(0),
                nacks: AtomicUsize::new(0),
            }),
        }
    }

    /// Drop every live session and refuse new connections.
    pub fn disconnect_all(&self) {
        // ---
        self.state.online.store(false, Ordering::SeqCst);

        for lost in self.state.sessions.lock().unwrap().drain(..) {
            lost.send_replace(true);
        }
        for queue in self.state.queues.lock().unwrap().values_mut() {
            queue.consumers.clear();
        }
    }

    /// Accept connections again.
    pub fn restore(&self) {
        self.state.online.store(true, Ordering::SeqCst);
    }

    /// Make publishes on live sessions fail without dropping the session.
    pub fn fail_publishes(&self, fail: bool) {
        self.state.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of acknowledged deliveries so far.
    pub fn ack_count(&self) -> usize {
        self.state.acks.load(Ordering::SeqCst)
    }

    /// Number of deliveries handed back for redelivery so far.
    pub fn nack_count(&self) -> usize {
        self.state.nacks.load(Ordering::SeqCst)
    }

    /// Options of the last declaration of `queue` and how many times it was
    /// declared, by `declare` or `consume`.
    pub fn declared(&self, queue: &str) -> Option<(SubscribeOptions, usize)> {
        self.state.declares.lock().unwrap().get(queue).copied()
    }

    /// Put a message on a queue directly, bypassing any client. Creates the
    /// queue if needed.
    pub fn inject(&self, queue: &str, payload: Bytes) {
        self.state.enqueue(queue, payload, true);
    }
}

impl BrokerState {
    // ---
    fn declare(&self, queue: &str, opts: SubscribeOptions) {
        // ---
        self.queues.lock().unwrap().entry(queue.to_string()).or_default();

        let mut declares = self.declares.lock().unwrap();
        let entry = declares.entry(queue.to_string()).or_insert((opts, 0));
        entry.0 = opts;
        entry.1 += 1;
    }

    fn enqueue(self: &Arc<Self>, queue: &str, payload: Bytes, create: bool) {
        // ---
        let mut queues = self.queues.lock().unwrap();
        if !create && !queues.contains_key(queue) {
            return;
        }
        let queue_ref = queues.entry(queue.to_string()).or_default();
        queue_ref.consumers.retain(|tx| !tx.is_closed());
        queue_ref.backlog.push_back(payload);
        self.flush(queue, queue_ref);
    }

    fn flush(self: &Arc<Self>, name: &str, queue: &mut Queue) {
        // ---
        while let Some(payload) = queue.backlog.pop_front() {
            let Some(tx) = queue.consumers.first() else {
                queue.backlog.push_front(payload);
                return;
            };
            let delivery = Delivery {
                payload: payload.clone(),
                acker: Box::new(CountingAcker {
                    state: Arc::clone(self),
                    queue: name.to_string(),
                    payload,
                }),
            };
            if let Err(e) = tx.try_send(delivery) {
                queue.backlog.push_front(e.into_inner().payload);
                queue.consumers.remove(0);
            } else {
                // Round-robin between competing consumers
                queue.consumers.rotate_left(1);
            }
        }
    }
}

struct CountingAcker {
    state: Arc<BrokerState>,
    queue: String,
    payload: Bytes,
}

#[async_trait::async_trait]
impl Acker for CountingAcker {
    async fn ack(&self) -> Result<()> {
        self.state.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self) -> Result<()> {
        // ---
        self.state.nacks.fetch_add(1, Ordering::SeqCst);
        self.state.enqueue(&self.queue, self.payload.clone(), false);
        Ok(())
    }
}

struct TestSession {
    state: Arc<BrokerState>,
    lost: Arc<watch::Sender<bool>>,
}

impl TestSession {
    fn check(&self) -> Result<()> {
        if *self.lost.borrow() {
            Err(RpcError::Transport("test broker: session lost".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl BrokerSession for TestSession {
    // ---
    async fn declare(&self, channel: &str, opts: SubscribeOptions) -> Result<()> {
        self.check()?;
        self.state.declare(channel, opts);
        Ok(())
    }

    async fn consume(&self, channel: &str, opts: SubscribeOptions) -> Result<ConsumerHandle> {
        // ---
        self.check()?;
        self.state.declare(channel, opts);

        let (tx, rx) = mpsc::channel(1024);
        let mut queues = self.state.queues.lock().unwrap();
        let queue = queues.entry(channel.to_string()).or_default();
        queue.consumers.push(tx);
        self.state.flush(channel, queue);

        Ok(ConsumerHandle { inbox: rx })
    }

    async fn publish(&self, channel: &str, payload: Bytes, _opts: PublishOptions) -> Result<()> {
        // ---
        self.check()?;
        if self.state.fail_publishes.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("test broker: publish refused".into()));
        }
        self.state.enqueue(channel, payload, false);
        Ok(())
    }

    async fn closed(&self) {
        let mut rx = self.lost.subscribe();
        let _ = rx.wait_for(|lost| *lost).await;
    }

    async fn close(&self) {
        self.lost.send_replace(true);
    }
}

#[async_trait::async_trait]
impl Connector for TestBroker {
    async fn connect(&self) -> Result<SessionPtr> {
        // ---
        if !self.state.online.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("test broker: offline".into()));
        }

        let (lost, _) = watch::channel(false);
        let lost = Arc::new(lost);
        self.state.sessions.lock().unwrap().push(Arc::clone(&lost));
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(TestSession {
            state: Arc::clone(&self.state),
            lost,
        }))
    }
}
