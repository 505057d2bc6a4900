//! STOMP over WebSocket transport (tokio-tungstenite).

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use stomp_frame::{is_heartbeat, Command, Frame, HeartBeat};
use tokio::net::TcpStream;
use tokio::time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

use super::{BrokerSession, Transport};
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUBSCRIPTION_ID: &str = "sub-0";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Production transport: WebSocket connect, STOMP `CONNECT`, `SUBSCRIBE`.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    heart_beat: HeartBeat,
}

impl WebSocketTransport {
    /// Create a transport offering the given heart-beat intervals to the broker
    pub fn new(heart_beat: HeartBeat) -> Self {
        Self { heart_beat }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(HeartBeat::new(10_000, 10_000))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(
        &self,
        endpoint: &Url,
        destination: &str,
    ) -> Result<Box<dyn BrokerSession>, TransportError> {
        let (ws, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let host = endpoint.host_str().unwrap_or("localhost");
        send_frame(&mut sink, &Frame::connect(host, self.heart_beat)).await?;

        let answer = next_frame(&mut stream).await?;
        match answer.command {
            Command::Connected => {}
            Command::Error => {
                let reason = answer
                    .header("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| answer.body.clone());
                return Err(TransportError::Rejected(reason));
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected CONNECTED, got {other}"
                )))
            }
        }

        let server_beat = answer
            .header("heart-beat")
            .and_then(HeartBeat::parse)
            .unwrap_or_default();
        let (send_ms, expect_ms) = HeartBeat::negotiate(self.heart_beat, server_beat);
        debug!(send_ms, expect_ms, "STOMP session established");

        send_frame(&mut sink, &Frame::subscribe(SUBSCRIPTION_ID, destination)).await?;

        Ok(Box::new(WebSocketSession::new(sink, stream, send_ms, expect_ms)))
    }
}

async fn send_frame(
    sink: &mut SplitSink<WsStream, Message>,
    frame: &Frame,
) -> Result<(), TransportError> {
    sink.send(Message::Text(frame.encode()))
        .await
        .map_err(|e| TransportError::Protocol(e.to_string()))
}

/// Next non-heart-beat frame during the handshake
async fn next_frame(stream: &mut SplitStream<WsStream>) -> Result<Frame, TransportError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if is_heartbeat(&text) {
                    continue;
                }
                return Ok(Frame::decode(&text)?);
            }
            Some(Ok(Message::Binary(bytes))) => {
                let text = String::from_utf8(bytes)
                    .map_err(|_| TransportError::Protocol("binary frame is not UTF-8".into()))?;
                return Ok(Frame::decode(&text)?);
            }
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(TransportError::Protocol(e.to_string())),
        }
    }
}

struct WebSocketSession {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    heartbeat: Option<Interval>,
    /// Silence longer than this is a dead peer
    read_deadline: Option<Duration>,
    last_seen: Instant,
    closed: bool,
}

impl WebSocketSession {
    fn new(
        sink: SplitSink<WsStream, Message>,
        stream: SplitStream<WsStream>,
        send_ms: u64,
        expect_ms: u64,
    ) -> Self {
        let heartbeat = (send_ms > 0).then(|| {
            let period = Duration::from_millis(send_ms);
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self {
            sink,
            stream,
            heartbeat,
            read_deadline: (expect_ms > 0).then(|| Duration::from_millis(expect_ms * 2)),
            last_seen: Instant::now(),
            closed: false,
        }
    }

    /// Handle one inbound WebSocket message; `Some` ends the current `recv`.
    fn on_message(&mut self, message: Message) -> Option<Option<Result<String, TransportError>>> {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    return Some(Some(Err(TransportError::Protocol(
                        "binary frame is not UTF-8".into(),
                    ))))
                }
            },
            Message::Close(_) => {
                self.closed = true;
                return Some(None);
            }
            _ => return None,
        };

        if is_heartbeat(&text) {
            trace!("Heart-beat from broker");
            return None;
        }

        match Frame::decode(&text) {
            Ok(frame) => match frame.command {
                Command::Message => Some(Some(Ok(frame.body))),
                Command::Error => {
                    let reason = frame
                        .header("message")
                        .map(str::to_string)
                        .unwrap_or(frame.body);
                    Some(Some(Err(TransportError::Protocol(reason))))
                }
                other => {
                    debug!(command = %other, "Ignoring broker frame");
                    None
                }
            },
            Err(e) => Some(Some(Err(e.into()))),
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expire_at(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl BrokerSession for WebSocketSession {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        if self.closed {
            return None;
        }

        loop {
            let deadline = self.read_deadline.map(|d| self.last_seen + d);

            tokio::select! {
                message = self.stream.next() => {
                    self.last_seen = Instant::now();
                    match message {
                        Some(Ok(message)) => {
                            if let Some(result) = self.on_message(message) {
                                return result;
                            }
                        }
                        Some(Err(e)) => return Some(Err(TransportError::Protocol(e.to_string()))),
                        None => {
                            self.closed = true;
                            return None;
                        }
                    }
                }
                _ = next_tick(&mut self.heartbeat) => {
                    if let Err(e) = self.sink.send(Message::Text("\n".to_string())).await {
                        return Some(Err(TransportError::Protocol(e.to_string())));
                    }
                }
                _ = expire_at(deadline) => {
                    return Some(Err(TransportError::Timeout));
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let sink = &mut self.sink;
        let graceful = async move {
            send_frame(sink, &Frame::unsubscribe(SUBSCRIPTION_ID)).await?;
            send_frame(sink, &Frame::disconnect("disconnect-0")).await?;
            sink.send(Message::Close(None))
                .await
                .map_err(|e| TransportError::Protocol(e.to_string()))
        };
        match timeout(CLOSE_TIMEOUT, graceful).await {
            Ok(Ok(())) => debug!("STOMP session closed"),
            Ok(Err(e)) => debug!(error = %e, "Close was not acknowledged cleanly"),
            Err(_) => debug!("Close timed out"),
        }
    }
}
