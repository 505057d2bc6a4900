use futures::{SinkExt, StreamExt};
use stomp_frame::{Command, Frame, HeartBeat};
use test_broker::{BrokerEvent, TestBroker};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const PORTS: (u16, u16) = (47200, 47299);

async fn next_frame<S>(stream: &mut S) -> Frame
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) if text.trim().is_empty() => continue,
            Some(Ok(Message::Text(text))) => return Frame::decode(&text).unwrap(),
            other => panic!("unexpected websocket message: {other:?}"),
        }
    }
}

fn ws_url(broker: &TestBroker, token: &str) -> String {
    format!("{}/ws?token={token}", broker.base_url().replacen("http", "ws", 1))
}

#[tokio::test]
async fn test_handshake_subscribe_and_publish() {
    let broker = TestBroker::start(PORTS).await.unwrap();
    let mut events = broker.events();

    let (ws, _) = connect_async(ws_url(&broker, "alpha")).await.unwrap();
    let (mut sink, mut stream) = ws.split();

    let connect = Frame::connect("127.0.0.1", HeartBeat::disabled());
    sink.send(Message::Text(connect.encode())).await.unwrap();
    assert_eq!(next_frame(&mut stream).await.command, Command::Connected);
    assert_eq!(
        events.recv().await,
        Some(BrokerEvent::Connected {
            token: "alpha".to_string()
        })
    );

    let subscribe = Frame::subscribe("sub-0", "/user/queue/notifications");
    sink.send(Message::Text(subscribe.encode())).await.unwrap();
    assert_eq!(
        events.recv().await,
        Some(BrokerEvent::Subscribed {
            token: "alpha".to_string(),
            destination: "/user/queue/notifications".to_string()
        })
    );
    assert_eq!(broker.active_sessions(), 1);

    assert_eq!(broker.publish("/elsewhere", "{}"), 0);
    assert_eq!(broker.publish("/user/queue/notifications", r#"{"payload":{"source":"tasks"}}"#), 1);

    let message = next_frame(&mut stream).await;
    assert_eq!(message.command, Command::Message);
    assert_eq!(message.header("subscription"), Some("sub-0"));
    assert_eq!(message.body, r#"{"payload":{"source":"tasks"}}"#);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_rejected_token_gets_error_frame() {
    let broker = TestBroker::start(PORTS).await.unwrap();
    broker.reject_token("revoked");

    let (ws, _) = connect_async(ws_url(&broker, "revoked")).await.unwrap();
    let (mut sink, mut stream) = ws.split();
    let connect = Frame::connect("127.0.0.1", HeartBeat::disabled());
    sink.send(Message::Text(connect.encode())).await.unwrap();

    let answer = next_frame(&mut stream).await;
    assert_eq!(answer.command, Command::Error);
    assert_eq!(answer.header("message"), Some("invalid token"));
    assert_eq!(broker.active_sessions(), 0);
}

#[tokio::test]
async fn test_drop_all_connections_reports_disconnects() {
    let broker = TestBroker::start(PORTS).await.unwrap();
    let mut events = broker.events();

    let (ws, _) = connect_async(ws_url(&broker, "alpha")).await.unwrap();
    let (mut sink, mut stream) = ws.split();
    let connect = Frame::connect("127.0.0.1", HeartBeat::disabled());
    sink.send(Message::Text(connect.encode())).await.unwrap();
    next_frame(&mut stream).await;
    events.recv().await;

    assert_eq!(broker.drop_all_connections(), 1);
    assert_eq!(
        events.recv().await,
        Some(BrokerEvent::Disconnected {
            token: "alpha".to_string()
        })
    );
    assert_eq!(broker.active_sessions(), 0);
}

#[tokio::test]
async fn test_heart_beat_is_advertised_and_recorded() {
    let broker = TestBroker::start(PORTS).await.unwrap();
    broker.set_heart_beat(HeartBeat::new(500, 250));
    let mut events = broker.events();

    let (ws, _) = connect_async(ws_url(&broker, "alpha")).await.unwrap();
    let (mut sink, mut stream) = ws.split();
    let connect = Frame::connect("127.0.0.1", HeartBeat::new(250, 500));
    sink.send(Message::Text(connect.encode())).await.unwrap();

    let connected = next_frame(&mut stream).await;
    assert_eq!(connected.header("heart-beat"), Some("500,250"));
    events.recv().await;

    sink.send(Message::Text("\n".to_string())).await.unwrap();
    assert_eq!(
        events.recv().await,
        Some(BrokerEvent::HeartBeat {
            token: "alpha".to_string()
        })
    );
    broker.shutdown().await;
}
