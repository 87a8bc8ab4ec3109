/*
[INPUT]:  Test configuration and mock server requirements
[OUTPUT]: In-process push server, static token provider and delivery recorders
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for kucoin-ws-adapter tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use kucoin_ws_adapter::{
    Endpoint, SubscriptionHandler, TopicMessage, TokenProvider, WsClientConfig, WsError, WsToken,
    handler_fn,
};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use wiremock::MockServer;

pub const WAIT: Duration = Duration::from_secs(5);

/// Setup a mock HTTP server for testing
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

/// Token endpoint body in the exchange envelope
pub fn bullet_body(endpoint: &str) -> Value {
    json!({
        "code": "200000",
        "data": {
            "token": "2neAiuYvAU61ZDXANAGAsiL4-iAExhsBXZxftpOeh_55i3Ysy2q2LEsEWU64mdzUOPusi34M_wGoSf7iNyEWJ4aBZXpWhrmY9jKtqkdWoFa75w3istPvPtiYB9J6i9GjsxUuhPw3BlrzazF6ghq4L_iFlOzjPjgMs8Uxh1Zb-H0=.WNQmhZQeUKIkh97KYgU0Lg==",
            "instanceServers": [{
                "endpoint": endpoint,
                "encrypt": true,
                "protocol": "websocket",
                "pingInterval": 18000,
                "pingTimeout": 10000
            }]
        }
    })
}

/// Engine settings with short timers
pub fn fast_config() -> WsClientConfig {
    WsClientConfig {
        reconnect_interval: Duration::from_millis(50),
        dial_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

/// How the mock server answers client frames
#[derive(Debug, Clone)]
pub struct Behavior {
    pub send_welcome: bool,
    pub auto_ack: bool,
    pub auto_pong: bool,
    /// Subscribe requests for these topics get an `error` frame
    pub reject_topics: Vec<String>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            send_welcome: true,
            auto_ack: true,
            auto_pong: true,
            reject_topics: Vec::new(),
        }
    }
}

/// A frame the server received
#[derive(Debug, Clone)]
pub struct Received {
    pub conn_id: usize,
    pub frame: Value,
}

impl Received {
    pub fn kind(&self) -> &str {
        self.frame["type"].as_str().unwrap_or("")
    }

    pub fn topic(&self) -> &str {
        self.frame["topic"].as_str().unwrap_or("")
    }
}

enum ServerCmd {
    Text(String),
    Drop,
}

struct ServerState {
    behavior: Mutex<Behavior>,
    received: Mutex<Vec<Received>>,
    accepted: AtomicUsize,
    live: Mutex<HashMap<usize, mpsc::UnboundedSender<ServerCmd>>>,
}

impl ServerState {
    fn behavior(&self) -> Behavior {
        self.behavior.lock().unwrap().clone()
    }

    /// Record a client frame and build the protocol reply, if any
    fn handle(&self, conn_id: usize, text: &str) -> Option<String> {
        let frame: Value = serde_json::from_str(text).ok()?;
        self.received.lock().unwrap().push(Received {
            conn_id,
            frame: frame.clone(),
        });

        let behavior = self.behavior();
        let id = frame["id"].clone();
        match frame["type"].as_str()? {
            "ping" if behavior.auto_pong => Some(json!({"id": id, "type": "pong"}).to_string()),
            "subscribe" if behavior.auto_ack => {
                let topic = frame["topic"].as_str().unwrap_or("");
                if behavior.reject_topics.iter().any(|t| t == topic) {
                    Some(
                        json!({
                            "id": id,
                            "type": "error",
                            "code": 404,
                            "data": format!("topic {topic} is not found")
                        })
                        .to_string(),
                    )
                } else {
                    Some(json!({"id": id, "type": "ack"}).to_string())
                }
            }
            "unsubscribe" if behavior.auto_ack => {
                Some(json!({"id": id, "type": "ack"}).to_string())
            }
            _ => None,
        }
    }
}

/// In-process push server speaking the welcome/ping/ack protocol
pub struct MockPushServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
}

impl MockPushServer {
    pub async fn spawn() -> Self {
        Self::spawn_with(Behavior::default()).await
    }

    pub async fn spawn_with(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState {
            behavior: Mutex::new(behavior),
            received: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            live: Mutex::new(HashMap::new()),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_id = accept_state.accepted.fetch_add(1, Ordering::SeqCst) + 1;
                let (tx, rx) = mpsc::unbounded_channel();
                accept_state.live.lock().unwrap().insert(conn_id, tx);
                tokio::spawn(serve(conn_id, stream, rx, accept_state.clone()));
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/endpoint", self.addr)
    }

    pub fn update(&self, change: impl FnOnce(&mut Behavior)) {
        change(&mut self.state.behavior.lock().unwrap());
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn live_connections(&self) -> usize {
        self.state.live.lock().unwrap().len()
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().unwrap().clone()
    }

    /// Frames of `kind` for `topic`, optionally restricted to one connection
    pub fn count(&self, kind: &str, topic: &str, conn_id: Option<usize>) -> usize {
        self.received()
            .iter()
            .filter(|r| r.kind() == kind && r.topic() == topic)
            .filter(|r| conn_id.is_none_or(|id| r.conn_id == id))
            .count()
    }

    /// Push a `message` frame to every live connection
    pub fn publish(&self, topic: &str, subject: &str, data: Value) {
        let frame = json!({
            "type": "message",
            "topic": topic,
            "subject": subject,
            "data": data
        })
        .to_string();
        for tx in self.state.live.lock().unwrap().values() {
            let _ = tx.send(ServerCmd::Text(frame.clone()));
        }
    }

    /// Send an arbitrary frame to every live connection
    pub fn send_raw(&self, frame: Value) {
        let text = frame.to_string();
        for tx in self.state.live.lock().unwrap().values() {
            let _ = tx.send(ServerCmd::Text(text.clone()));
        }
    }

    /// Client pings received so far
    pub fn pings(&self) -> usize {
        self.received().iter().filter(|r| r.kind() == "ping").count()
    }

    /// Cut every live connection without a close handshake
    pub fn drop_all(&self) {
        for tx in self.state.live.lock().unwrap().values() {
            let _ = tx.send(ServerCmd::Drop);
        }
    }
}

async fn serve(
    conn_id: usize,
    stream: TcpStream,
    mut commands: mpsc::UnboundedReceiver<ServerCmd>,
    state: Arc<ServerState>,
) {
    let Ok(ws) = accept_async(stream).await else {
        state.live.lock().unwrap().remove(&conn_id);
        return;
    };
    let (mut sink, mut stream) = ws.split();

    if state.behavior().send_welcome {
        let welcome = json!({"id": format!("welcome-{conn_id}"), "type": "welcome"}).to_string();
        if sink.send(Message::Text(welcome.into())).await.is_err() {
            state.live.lock().unwrap().remove(&conn_id);
            return;
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ServerCmd::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(ServerCmd::Drop) | None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = state.handle(conn_id, text.as_str())
                        && sink.send(Message::Text(reply.into())).await.is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.live.lock().unwrap().remove(&conn_id);
}

/// Token provider returning a fixed endpoint; can be switched to failing
pub struct StaticTokenProvider {
    endpoint: Endpoint,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl StaticTokenProvider {
    pub fn new(url: String) -> Arc<Self> {
        Self::with_ping(url, Duration::from_secs(18), Duration::from_secs(10))
    }

    pub fn with_ping(url: String, ping_interval: Duration, ping_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            endpoint: Endpoint {
                url,
                ping_interval,
                ping_timeout,
                encrypt: false,
            },
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self, _private: bool) -> kucoin_ws_adapter::Result<WsToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(WsError::DialFailure("token service unavailable".to_string()));
        }
        Ok(WsToken {
            token: "test-token".to_string(),
            endpoints: vec![self.endpoint.clone()],
        })
    }
}

/// What a recording handler observed
#[derive(Debug, Clone, PartialEq)]
pub enum Delivered {
    Message {
        subscription_id: String,
        subject: String,
        data: Value,
    },
    Error(String),
}

/// Handler forwarding every callback into a channel
pub fn recording_handler() -> (impl SubscriptionHandler, mpsc::UnboundedReceiver<Delivered>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let errors = tx.clone();
    let handler = handler_fn(move |message: TopicMessage| {
        let _ = tx.send(Delivered::Message {
            subscription_id: message.subscription_id,
            subject: message.subject,
            data: (*message.data).clone(),
        });
        Ok(())
    })
    .with_error(move |err: &WsError| {
        let _ = errors.send(Delivered::Error(err.to_string()));
    });
    (handler, rx)
}

pub async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<Delivered>) -> Delivered {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no delivery in time")
        .expect("handler dropped")
}

pub async fn assert_no_delivery(rx: &mut mpsc::UnboundedReceiver<Delivered>, wait: Duration) {
    if let Ok(Some(delivered)) = tokio::time::timeout(wait, rx.recv()).await {
        panic!("unexpected delivery: {delivered:?}");
    }
}

/// Poll `condition` until it holds or the wait budget is spent
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met in time: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
