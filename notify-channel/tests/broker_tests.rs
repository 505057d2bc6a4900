//! End-to-end tests over real sockets against the in-process test broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify_channel::{
    ChannelConfig, HeartBeat, NotificationManager, NotificationPayload, RetryPolicy,
    SharedCredential, StaticCredential, Transport, TransportError, WebSocketTransport,
};
use test_broker::{BrokerEvent, TestBroker};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

const PORTS: (u16, u16) = (47300, 47399);
const DESTINATION: &str = "/user/queue/notifications";
const WAIT: Duration = Duration::from_secs(5);

fn config(broker: &TestBroker) -> ChannelConfig {
    ChannelConfig::new(broker.base_url())
        .with_retry_policy(RetryPolicy::Fixed(Duration::from_millis(200)))
        .with_credential_poll_interval(Duration::from_millis(100))
        .with_handshake_timeout(Duration::from_secs(2))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(10)).await;
    }
}

/// Skip events until one matches
async fn expect_event(events: &mut mpsc::UnboundedReceiver<BrokerEvent>, expected: BrokerEvent) {
    let found = timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if event == expected {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "never saw {expected:?}");
}

fn subscribed(token: &str) -> BrokerEvent {
    BrokerEvent::Subscribed {
        token: token.to_string(),
        destination: DESTINATION.to_string(),
    }
}

#[tokio::test]
async fn test_notification_round_trip_and_unregister() {
    let broker = TestBroker::start(PORTS).await.unwrap();
    let mut events = broker.events();
    let manager = NotificationManager::builder(config(&broker))
        .credentials(StaticCredential("alpha".to_string()))
        .build()
        .unwrap();

    let (tx, mut received) = mpsc::unbounded_channel();
    let registration = manager.add_notification_handler(move |payload: &NotificationPayload| {
        let _ = tx.send(payload.clone());
    });
    let total = Arc::new(AtomicUsize::new(0));
    let _counter = {
        let total = Arc::clone(&total);
        manager.add_notification_handler(move |_| {
            total.fetch_add(1, Ordering::SeqCst);
        })
    };

    manager.enable();
    expect_event(&mut events, subscribed("alpha")).await;
    wait_until(|| manager.is_connected()).await;

    let body = NotificationPayload::new("tasks")
        .with_field("id", 7)
        .to_envelope();
    assert_eq!(broker.publish(DESTINATION, &body), 1);

    let payload = timeout(WAIT, received.recv()).await.unwrap().unwrap();
    assert_eq!(payload.source, "tasks");
    assert_eq!(payload.field("id"), Some(&serde_json::Value::from(7)));

    assert!(registration.unregister());
    assert_eq!(broker.publish(DESTINATION, &body), 1);
    wait_until(|| total.load(Ordering::SeqCst) == 2).await;
    assert!(received.try_recv().is_err());

    manager.disable();
    expect_event(
        &mut events,
        BrokerEvent::Disconnected {
            token: "alpha".to_string(),
        },
    )
    .await;
    assert!(!manager.is_connected());
    broker.shutdown().await;
}

#[tokio::test]
async fn test_recovers_after_broker_drops_connection() {
    let broker = TestBroker::start(PORTS).await.unwrap();
    let mut events = broker.events();
    let manager = NotificationManager::builder(config(&broker))
        .credentials(StaticCredential("alpha".to_string()))
        .build()
        .unwrap();

    manager.enable();
    expect_event(&mut events, subscribed("alpha")).await;

    assert_eq!(broker.drop_all_connections(), 1);
    expect_event(&mut events, subscribed("alpha")).await;
    wait_until(|| manager.is_connected()).await;

    let stats = manager.stats();
    assert_eq!(stats.connections_lost, 1);
    assert_eq!(stats.handshakes_succeeded, 2);
    assert_eq!(stats.max_outstanding_retry_timers, 1);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_rejected_credential_is_retried() {
    let broker = TestBroker::start(PORTS).await.unwrap();
    broker.reject_token("alpha");
    let mut events = broker.events();
    let manager = NotificationManager::builder(config(&broker))
        .credentials(StaticCredential("alpha".to_string()))
        .build()
        .unwrap();

    manager.enable();
    wait_until(|| manager.stats().connections_lost >= 2).await;
    assert!(!manager.is_connected());
    assert!(manager.is_enabled());

    broker.accept_token("alpha");
    expect_event(&mut events, subscribed("alpha")).await;
    wait_until(|| manager.is_connected()).await;
    broker.shutdown().await;
}

#[tokio::test]
async fn test_rotated_credential_reconnects_with_new_token() {
    let broker = TestBroker::start(PORTS).await.unwrap();
    let mut events = broker.events();
    let credential = SharedCredential::new(Some("alpha".to_string()));
    let manager = NotificationManager::builder(config(&broker))
        .credentials(credential.clone())
        .build()
        .unwrap();

    manager.enable();
    expect_event(&mut events, subscribed("alpha")).await;
    wait_until(|| manager.is_connected()).await;

    credential.set("beta");
    expect_event(&mut events, subscribed("beta")).await;
    wait_until(|| manager.is_connected()).await;
    wait_until(|| broker.active_sessions() == 1).await;
    assert_eq!(manager.stats().reconnects, 1);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_silent_broker_times_out_after_twice_its_heart_beat() {
    let broker = TestBroker::start(PORTS).await.unwrap();
    // Promises a beat every 250ms and never sends one.
    broker.set_heart_beat(HeartBeat::new(250, 0));
    let endpoint = config(&broker).endpoint_url("alpha").unwrap();
    let transport = WebSocketTransport::new(HeartBeat::new(100, 100));

    let mut session = transport.open(&endpoint, DESTINATION).await.unwrap();
    let started = Instant::now();
    let result = timeout(WAIT, session.recv()).await.unwrap();
    let elapsed = started.elapsed();

    assert!(matches!(result, Some(Err(TransportError::Timeout))), "{result:?}");
    assert!(elapsed >= Duration::from_millis(400), "timed out after {elapsed:?}");
    broker.shutdown().await;
}

#[tokio::test]
async fn test_silent_broker_is_treated_as_lost_and_retried() {
    let broker = TestBroker::start(PORTS).await.unwrap();
    broker.set_heart_beat(HeartBeat::new(250, 0));
    let mut events = broker.events();
    let manager = NotificationManager::builder(
        config(&broker).with_heart_beat(HeartBeat::new(100, 100)),
    )
    .credentials(StaticCredential("alpha".to_string()))
    .build()
    .unwrap();

    manager.enable();
    expect_event(&mut events, subscribed("alpha")).await;
    expect_event(
        &mut events,
        BrokerEvent::Disconnected {
            token: "alpha".to_string(),
        },
    )
    .await;
    expect_event(&mut events, subscribed("alpha")).await;

    let stats = manager.stats();
    assert!(stats.connections_lost >= 1);
    assert!(stats.retries_fired >= 1);
    assert_eq!(stats.max_outstanding_retry_timers, 1);
    manager.disable();
    broker.shutdown().await;
}

#[tokio::test]
async fn test_keep_alives_follow_negotiated_period() {
    let broker = TestBroker::start(PORTS).await.unwrap();
    // Wants a beat every 200ms; the client offers 100ms, so 200ms wins.
    broker.set_heart_beat(HeartBeat::new(0, 200));
    let mut events = broker.events();
    let manager = NotificationManager::builder(
        config(&broker).with_heart_beat(HeartBeat::new(100, 100)),
    )
    .credentials(StaticCredential("alpha".to_string()))
    .build()
    .unwrap();

    manager.enable();
    expect_event(&mut events, subscribed("alpha")).await;

    let mut beats = Vec::new();
    while beats.len() < 5 {
        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(BrokerEvent::HeartBeat { token }) => {
                assert_eq!(token, "alpha");
                beats.push(Instant::now());
            }
            Some(other) => panic!("unexpected broker event {other:?}"),
            None => panic!("broker event stream ended"),
        }
    }
    for pair in beats.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_millis(150), "keep-alive gap {gap:?}");
    }

    // Nothing is expected from the broker, so its silence is fine.
    assert!(manager.is_connected());
    assert_eq!(manager.stats().connections_lost, 0);
    manager.disable();
    broker.shutdown().await;
}
