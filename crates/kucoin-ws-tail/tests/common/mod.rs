/*
[INPUT]:  Test configuration and mock server requirements
[OUTPUT]: Token endpoint mock plus an in-process push server
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use kucoin_ws_adapter::MarketFeed;
use kucoin_ws_tail::{FeedConfig, TailConfig, WsSettings};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const WAIT: Duration = Duration::from_secs(5);

/// Token endpoint answering bullet-public with `endpoint`
pub async fn token_server(endpoint: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/bullet-public"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": "200000",
            "data": {
                "token": "tail-test-token",
                "instanceServers": [{
                    "endpoint": endpoint,
                    "encrypt": false,
                    "protocol": "websocket",
                    "pingInterval": 18000,
                    "pingTimeout": 10000
                }]
            }
        })))
        .mount(&server)
        .await;
    server
}

pub fn feed(id: &str, topics: &[&str], rest_base_url: &str) -> FeedConfig {
    FeedConfig {
        id: id.to_string(),
        feed: MarketFeed::SpotPublic,
        topics: topics.iter().map(|topic| topic.to_string()).collect(),
        rest_base_url: Some(rest_base_url.to_string()),
    }
}

pub fn tail_config(feeds: Vec<FeedConfig>) -> TailConfig {
    TailConfig {
        feeds,
        ws: WsSettings {
            reconnect_interval_ms: 50,
            dial_timeout_ms: 2_000,
            write_timeout_ms: 1_000,
            ..WsSettings::default()
        },
    }
}

enum ServerCmd {
    Text(String),
    Drop,
}

#[derive(Default)]
struct ServerState {
    subscribes: Mutex<Vec<String>>,
    accepted: AtomicUsize,
    live: Mutex<HashMap<usize, mpsc::UnboundedSender<ServerCmd>>>,
}

/// Push server that welcomes, acks every request and answers pings
pub struct PushServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
}

impl PushServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());

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

    pub fn connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.state
            .subscribes
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.as_str() == topic)
            .count()
    }

    pub fn publish(&self, topic: &str, data: Value) {
        let frame = json!({
            "type": "message",
            "topic": topic,
            "subject": "trade.ticker",
            "data": data
        })
        .to_string();
        for tx in self.state.live.lock().unwrap().values() {
            let _ = tx.send(ServerCmd::Text(frame.clone()));
        }
    }

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
    let welcome = json!({"id": format!("welcome-{conn_id}"), "type": "welcome"}).to_string();
    if sink.send(Message::Text(welcome.into())).await.is_err() {
        state.live.lock().unwrap().remove(&conn_id);
        return;
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
                    let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    let id = frame["id"].clone();
                    let reply = match frame["type"].as_str() {
                        Some("ping") => json!({"id": id, "type": "pong"}),
                        Some("subscribe") => {
                            let topic = frame["topic"].as_str().unwrap_or("").to_string();
                            state.subscribes.lock().unwrap().push(topic);
                            json!({"id": id, "type": "ack"})
                        }
                        Some("unsubscribe") => json!({"id": id, "type": "ack"}),
                        _ => continue,
                    };
                    if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
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
