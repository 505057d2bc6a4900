//! In-process STOMP-over-WebSocket broker for integration tests.
//!
//! [`TestBroker`] binds a local port, accepts WebSocket upgrades on
//! `/ws?token=...`, answers the STOMP handshake and records subscriptions.
//! Tests publish messages to a destination, reject tokens and cut
//! connections to exercise the client's recovery paths.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use stomp_frame::{is_heartbeat, Command, Frame, HeartBeat};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use warp::ws::{Message, WebSocket};
use warp::Filter;

/// Errors starting the broker
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("No available port found in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },
}

/// Something a client did, in the order the broker saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected { token: String },
    Subscribed { token: String, destination: String },
    /// The client sent an EOL keep-alive
    HeartBeat { token: String },
    Disconnected { token: String },
}

enum Outbound {
    Frame(String),
    Drop,
}

struct Session {
    token: String,
    /// (subscription id, destination)
    subscriptions: Vec<(String, String)>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct BrokerState {
    sessions: Mutex<HashMap<u64, Session>>,
    rejected: Mutex<HashSet<String>>,
    heart_beat: Mutex<HeartBeat>,
    observers: Mutex<Vec<mpsc::UnboundedSender<BrokerEvent>>>,
    next_session: AtomicU64,
    next_message: AtomicU64,
}

impl BrokerState {
    fn emit(&self, event: BrokerEvent) {
        debug!(?event, "Broker event");
        self.observers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn is_rejected(&self, token: &str) -> bool {
        token.is_empty() || self.rejected.lock().contains(token)
    }
}

/// Local STOMP broker.
///
/// # Example
///
/// ```no_run
/// # use test_broker::TestBroker;
/// # #[tokio::main]
/// # async fn main() {
/// let broker = TestBroker::start((47000, 47100)).await.unwrap();
/// let mut events = broker.events();
/// println!("Broker listening at {}", broker.base_url());
///
/// // ... point a client at broker.base_url(), wait for it to subscribe ...
/// let reached = broker.publish("/user/queue/notifications", r#"{"payload":{"source":"tasks"}}"#);
/// # let _ = (reached, events.recv().await);
/// broker.shutdown().await;
/// # }
/// ```
pub struct TestBroker {
    port: u16,
    base_url: String,
    state: Arc<BrokerState>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    server_handle: Option<JoinHandle<()>>,
}

impl TestBroker {
    /// Bind the first free port of `port_range` on 127.0.0.1 and start serving.
    pub async fn start(port_range: (u16, u16)) -> Result<Self, BrokerError> {
        let (start, end) = port_range;
        let state = Arc::new(BrokerState::default());
        let route = routes(Arc::clone(&state));

        // First port that binds wins.
        for port in start..=end {
            let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
            let bound = warp::serve(route.clone()).try_bind_with_graceful_shutdown(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
                async move {
                    shutdown_rx.recv().await;
                },
            );

            match bound {
                Ok((addr, server)) => {
                    debug!(%addr, "Test broker listening");
                    return Ok(Self {
                        port: addr.port(),
                        base_url: format!("http://{addr}"),
                        state,
                        shutdown_tx: Some(shutdown_tx),
                        server_handle: Some(tokio::spawn(server)),
                    });
                }
                Err(e) => trace!(port, error = %e, "Port unavailable"),
            }
        }

        Err(BrokerError::NoAvailablePort { start, end })
    }

    /// `http://127.0.0.1:<port>`, suitable as a channel base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send `body` to every subscription on `destination`. Returns how many
    /// subscriptions it was queued for.
    pub fn publish(&self, destination: &str, body: &str) -> usize {
        let sessions = self.state.sessions.lock();
        let mut reached = 0;
        for session in sessions.values() {
            for (subscription, subscribed_to) in &session.subscriptions {
                if subscribed_to != destination {
                    continue;
                }
                let id = self.state.next_message.fetch_add(1, Ordering::Relaxed);
                let frame = Frame::message(destination, subscription, &format!("msg-{id}"), body);
                if session.outbound.send(Outbound::Frame(frame.encode())).is_ok() {
                    reached += 1;
                }
            }
        }
        reached
    }

    /// Answer future `CONNECT`s carrying `token` with an `ERROR` frame
    pub fn reject_token(&self, token: impl Into<String>) {
        self.state.rejected.lock().insert(token.into());
    }

    /// Undo [`reject_token`](Self::reject_token)
    pub fn accept_token(&self, token: &str) {
        self.state.rejected.lock().remove(token);
    }

    /// Heart-beat header of future `CONNECTED` frames. The broker never
    /// sends beats itself, so a positive outgoing value makes it a peer that
    /// promises traffic and then stays silent.
    pub fn set_heart_beat(&self, heart_beat: HeartBeat) {
        *self.state.heart_beat.lock() = heart_beat;
    }

    /// Close every client connection from the broker side
    pub fn drop_all_connections(&self) -> usize {
        let sessions = self.state.sessions.lock();
        for session in sessions.values() {
            debug!(token = %session.token, "Dropping client connection");
            let _ = session.outbound.send(Outbound::Drop);
        }
        sessions.len()
    }

    /// Number of clients that completed the STOMP handshake and are still
    /// connected
    pub fn active_sessions(&self) -> usize {
        self.state.sessions.lock().len()
    }

    /// Receiver for everything that happens from now on
    pub fn events(&self) -> mpsc::UnboundedReceiver<BrokerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.observers.lock().push(tx);
        rx
    }

    /// Close all connections and stop listening
    pub async fn shutdown(mut self) {
        self.drop_all_connections();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

fn routes(
    state: Arc<BrokerState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone + Send + Sync + 'static {
    warp::path("ws")
        .and(warp::path::end())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::ws())
        .map(move |query: HashMap<String, String>, ws: warp::ws::Ws| {
            let state = Arc::clone(&state);
            let token = query.get("token").cloned().unwrap_or_default();
            ws.on_upgrade(move |socket| serve_session(state, token, socket))
        })
}

async fn serve_session(state: Arc<BrokerState>, token: String, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let id = state.next_session.fetch_add(1, Ordering::Relaxed);
    let mut registered = false;

    loop {
        tokio::select! {
            inbound = stream.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!(error = %e, "Client socket error");
                        break;
                    }
                    None => break,
                };
                if message.is_close() {
                    break;
                }
                let Ok(text) = message.to_str() else {
                    continue;
                };
                if is_heartbeat(text) {
                    if registered {
                        trace!(token = %token, "Client heart-beat");
                        state.emit(BrokerEvent::HeartBeat { token: token.clone() });
                    }
                    continue;
                }
                let frame = match Frame::decode(text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "Undecodable client frame");
                        break;
                    }
                };

                match frame.command {
                    Command::Connect | Command::Stomp => {
                        if state.is_rejected(&token) {
                            let error = Frame::error("invalid token", "authentication failed");
                            let _ = sink.send(Message::text(error.encode())).await;
                            break;
                        }
                        state.sessions.lock().insert(
                            id,
                            Session {
                                token: token.clone(),
                                subscriptions: Vec::new(),
                                outbound: outbound_tx.clone(),
                            },
                        );
                        registered = true;
                        state.emit(BrokerEvent::Connected { token: token.clone() });

                        let heart_beat = *state.heart_beat.lock();
                        let reply = Frame::connected("1.2", heart_beat);
                        if sink.send(Message::text(reply.encode())).await.is_err() {
                            break;
                        }
                    }
                    Command::Subscribe => {
                        let destination = frame.header("destination").unwrap_or_default().to_string();
                        let subscription = frame.header("id").unwrap_or_default().to_string();
                        if let Some(session) = state.sessions.lock().get_mut(&id) {
                            session.subscriptions.push((subscription, destination.clone()));
                        }
                        state.emit(BrokerEvent::Subscribed {
                            token: token.clone(),
                            destination,
                        });
                    }
                    Command::Unsubscribe => {
                        let subscription = frame.header("id").unwrap_or_default();
                        if let Some(session) = state.sessions.lock().get_mut(&id) {
                            session.subscriptions.retain(|(s, _)| s != subscription);
                        }
                    }
                    Command::Disconnect => {
                        if let Some(receipt) = frame.header("receipt") {
                            let reply = Frame::new(Command::Receipt).with_header("receipt-id", receipt);
                            let _ = sink.send(Message::text(reply.encode())).await;
                        }
                        break;
                    }
                    other => debug!(command = %other, "Ignoring client frame"),
                }
            }
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Frame(text)) => {
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Drop) | None => {
                    let _ = sink.send(Message::close()).await;
                    break;
                }
            }
        }
    }

    if registered {
        state.sessions.lock().remove(&id);
        state.emit(BrokerEvent::Disconnected { token });
    }
}
