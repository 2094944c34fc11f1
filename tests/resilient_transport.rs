// tests/resilient_transport.rs

mod common;

use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::TestBroker;
use mom_tunneler::{
    // ---
    handler_fn,
    Address,
    ConnectionState,
    CorrelationId,
    Envelope,
    HandlerMap,
    PublishOptions,
    RequestMessage,
    ResilientTransport,
    ResponseMessage,
    RpcError,
    SubscribeOptions,
    Subscription,
    Transport,
    TransportConfig,
    TransportPtr,
    TunnelerBuilder,
};

const WAIT: Duration = Duration::from_secs(3);
const RECONNECT: Duration = Duration::from_millis(50);

fn start(broker: &TestBroker, id: &str) -> Arc<ResilientTransport> {
    // ---
    common::init_tracing();

    let mut config = TransportConfig::memory(id);
    config.transport_type = None;
    config.reconnect_delay = RECONNECT;

    ResilientTransport::start(broker.clone(), &config)
}

async fn connected(transport: &ResilientTransport) {
    timeout(WAIT, transport.wait_for_state(ConnectionState::Connected))
        .await
        .expect("transport did not connect");
}

async fn forward_to_channel(
    transport: &ResilientTransport,
    name: &str,
) -> mpsc::UnboundedReceiver<Envelope> {
    // ---
    let (tx, rx) = mpsc::unbounded_channel();
    transport
        .subscribe(
            Subscription::from(name),
            handler_fn(move |env| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(env);
                    Ok(())
                }
            }),
            SubscribeOptions::request_channel(),
        )
        .await
        .expect("subscribe failed");
    rx
}

fn envelope(channel: &str, body: &'static [u8]) -> Envelope {
    Envelope::new(Address::from(channel), Bytes::from_static(body))
}

#[tokio::test]
async fn test_subscription_resumes_after_reconnect() {
    // ---
    let broker = TestBroker::new();
    let transport = start(&broker, "resume");
    connected(&transport).await;

    let mut inbox = forward_to_channel(&transport, "jobs").await;

    transport
        .publish(envelope("jobs", b"before"), PublishOptions::default())
        .await
        .unwrap();
    let env = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(env.payload, Bytes::from_static(b"before"));

    // ---
    // Outage
    // ---
    broker.disconnect_all();
    timeout(WAIT, transport.wait_for_state(ConnectionState::Disconnected))
        .await
        .unwrap();

    broker.restore();
    connected(&transport).await;
    assert!(broker.connect_count() >= 2);

    // No re-registration by the caller
    transport
        .publish(envelope("jobs", b"after"), PublishOptions::default())
        .await
        .unwrap();
    let env = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(env.payload, Bytes::from_static(b"after"));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_while_disconnected_fails_immediately() {
    // ---
    let broker = TestBroker::new();
    broker.disconnect_all();

    let transport = start(&broker, "offline");

    let err = transport
        .publish(envelope("jobs", b"x"), PublishOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Disconnected));
    assert_ne!(transport.connection_state(), ConnectionState::Connected);

    transport.close().await.unwrap();
    assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_deferred_subscription_starts_on_connect() {
    // ---
    let broker = TestBroker::new();
    broker.disconnect_all();

    let transport = start(&broker, "deferred");
    let mut inbox = forward_to_channel(&transport, "later").await;

    broker.inject("later", Bytes::from_static(b"queued"));
    broker.restore();
    connected(&transport).await;

    let env = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(env.payload, Bytes::from_static(b"queued"));
    assert_eq!(env.address, Address::from("later"));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_ack_after_handler_and_requeue_on_failure() {
    // ---
    let broker = TestBroker::new();
    let transport = start(&broker, "acks");
    connected(&transport).await;

    let failed_once = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .subscribe(
            Subscription::from("work"),
            handler_fn(move |env| {
                let tx = tx.clone();
                let failed_once = Arc::clone(&failed_once);
                async move {
                    let _ = tx.send(env.payload);
                    if failed_once.swap(true, Ordering::SeqCst) {
                        Ok(())
                    } else {
                        Err(RpcError::Transport("handler gave up".into()))
                    }
                }
            }),
            SubscribeOptions::request_channel(),
        )
        .await
        .unwrap();

    broker.inject("work", Bytes::from_static(b"1"));

    // First attempt fails and is requeued, the redelivery succeeds
    for _ in 0..2 {
        let payload = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(payload, Bytes::from_static(b"1"));
    }

    timeout(WAIT, async {
        while broker.ack_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(broker.nack_count(), 1);

    transport.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deliveries_are_handled_in_order() {
    // ---
    const COUNT: usize = 1000;

    let broker = TestBroker::new();
    let transport = start(&broker, "ordered");
    connected(&transport).await;

    let seen = Arc::new(Mutex::new(Vec::with_capacity(COUNT)));
    transport
        .subscribe(
            Subscription::from("ordered"),
            handler_fn({
                let seen = Arc::clone(&seen);
                move |env| {
                    let seen = Arc::clone(&seen);
                    async move {
                        let index: usize = std::str::from_utf8(&env.payload).unwrap().parse().unwrap();
                        tokio::task::yield_now().await;
                        seen.lock().unwrap().push(index);
                        Ok(())
                    }
                }
            }),
            SubscribeOptions::request_channel(),
        )
        .await
        .unwrap();

    for i in 0..COUNT {
        broker.inject("ordered", Bytes::from(i.to_string()));
    }

    timeout(WAIT, async {
        while seen.lock().unwrap().len() < COUNT {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, (0..COUNT).collect::<Vec<_>>());

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_response_publish_requeues_request() {
    // ---
    let broker = TestBroker::new();
    let transport = start(&broker, "requeue");
    connected(&transport).await;

    let service = TunnelerBuilder::new(transport.clone() as TransportPtr)
        .name("service")
        .build()
        .unwrap();
    service
        .handle_messages(HandlerMap::new().raw("square", |v: Value| async move {
            Ok(json!(v.as_i64().unwrap_or(0).pow(2)))
        }))
        .await
        .unwrap();
    let mut replies = forward_to_channel(&transport, "replies").await;

    broker.fail_publishes(true);
    let request = RequestMessage::new(CorrelationId::from("c1"), "square", Some(json!(3)), "replies");
    broker.inject("service", Bytes::from(serde_json::to_vec(&request).unwrap()));

    timeout(WAIT, async {
        while broker.nack_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(broker.ack_count(), 0);

    // Once publishing works again the redelivered request is answered
    broker.fail_publishes(false);
    let env = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
    let response: ResponseMessage = env.decode().unwrap();
    assert_eq!(response.cid, CorrelationId::from("c1"));
    assert_eq!(response.into_outcome(), Ok(json!(9)));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_tunnel_declares_service_channel() {
    // ---
    let broker = TestBroker::new();
    let client_transport = start(&broker, "client");
    connected(&client_transport).await;

    let client = TunnelerBuilder::new(client_transport.clone() as TransportPtr)
        .name("client")
        .build()
        .unwrap();
    let tunnel = client.service_tunnel("late").await.unwrap();
    assert_eq!(broker.declared("late"), Some((SubscribeOptions::request_channel(), 1)));

    // Declarations are replayed after an outage
    broker.disconnect_all();
    timeout(WAIT, client_transport.wait_for_state(ConnectionState::Disconnected))
        .await
        .unwrap();
    broker.restore();
    connected(&client_transport).await;
    assert_eq!(broker.declared("late").map(|(_, n)| n), Some(2));

    // A request sent before the service exists waits in its channel
    let call = tokio::spawn({
        let tunnel = tunnel.clone();
        async move { tunnel.send("square", json!(6)).await }
    });
    timeout(WAIT, async {
        while tunnel.pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let service_transport = start(&broker, "late");
    connected(&service_transport).await;
    let service = TunnelerBuilder::new(service_transport.clone() as TransportPtr).build().unwrap();
    service
        .handle_messages(HandlerMap::new().raw("square", |v: Value| async move {
            Ok(json!(v.as_i64().unwrap_or(0).pow(2)))
        }))
        .await
        .unwrap();

    let outcome = timeout(WAIT, call).await.unwrap().unwrap();
    assert_eq!(outcome.unwrap(), json!(36));

    client.close().await.unwrap();
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_state_transitions_are_observable() {
    // ---
    let broker = TestBroker::new();
    broker.disconnect_all();

    let transport = start(&broker, "states");
    let mut states = transport.state_changes();

    // Failed attempts keep cycling through Connecting and Disconnected
    tokio::time::sleep(RECONNECT * 3).await;
    assert!(broker.connect_count() == 0);
    assert_ne!(*states.borrow_and_update(), ConnectionState::Connected);

    broker.restore();
    timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport.connection_state(), ConnectionState::Connected);
    assert_eq!(broker.connect_count(), 1);

    transport.close().await.unwrap();
    assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_tunnel_survives_outage() {
    // ---
    let broker = TestBroker::new();

    let service_transport = start(&broker, "service");
    let client_transport = start(&broker, "client");
    connected(&service_transport).await;
    connected(&client_transport).await;

    let service = TunnelerBuilder::new(service_transport.clone() as TransportPtr).build().unwrap();
    service
        .handle_messages(HandlerMap::new().raw("square", |v: Value| async move {
            Ok(json!(v.as_i64().unwrap_or(0).pow(2)))
        }))
        .await
        .unwrap();

    let client = TunnelerBuilder::new(client_transport.clone() as TransportPtr)
        .call_timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    let tunnel = client.service_tunnel("service").await.unwrap();

    assert_eq!(timeout(WAIT, tunnel.send("square", json!(3))).await.unwrap().unwrap(), json!(9));

    // ---
    // Outage: calls fail fast, nothing is left pending
    // ---
    broker.disconnect_all();
    timeout(WAIT, client_transport.wait_for_state(ConnectionState::Disconnected))
        .await
        .unwrap();

    let err = tunnel.send("square", json!(4)).await.unwrap_err();
    assert!(matches!(err, RpcError::Disconnected));
    assert_eq!(tunnel.pending_count(), 0);

    // ---
    // Recovery: both sides replay their subscriptions
    // ---
    broker.restore();
    connected(&service_transport).await;
    connected(&client_transport).await;

    assert_eq!(timeout(WAIT, tunnel.send("square", json!(5))).await.unwrap().unwrap(), json!(25));

    client.close().await.unwrap();
    service.close().await.unwrap();
}
