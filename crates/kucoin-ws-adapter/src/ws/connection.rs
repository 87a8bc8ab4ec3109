/*
[INPUT]:  Endpoint, connection token and write/dial tunables
[OUTPUT]: One open socket with serialized writes, a frame stream and keepalive bookkeeping
[POS]:    WebSocket layer - physical connection and ping/pong watchdog
[UPDATE]: When changing handshake, framing or keepalive behavior
*/

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, timeout, timeout_at};
use tokio_tungstenite::tungstenite::Error as TungsteniteError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::client::truncate_for_log;
use crate::http::{Endpoint, Result, WsError};
use crate::types::ConnectionState;
use crate::ws::config::WsClientConfig;
use crate::ws::message::{MessageType, WsMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketWriter = SplitSink<Socket, Message>;
type SocketReader = SplitStream<Socket>;

const RAW_LOG_MAX_BYTES: usize = 1024;
const PARSE_FAIL_LOG_LIMIT: usize = 3;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

static PARSE_FAIL_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Reported by a connection's reader/writer tasks to the engine worker
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Frame { generation: u64, frame: WsMessage },
    Closed { generation: u64, reason: String },
}

/// One physical socket
pub(crate) struct Connection {
    generation: u64,
    endpoint: Endpoint,
    state: ConnectionState,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    /// Dial `endpoint` and wait for the welcome frame, all within `dial_timeout`
    pub(crate) async fn open(
        endpoint: &Endpoint,
        token: &str,
        connect_id: &str,
        generation: u64,
        config: &WsClientConfig,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Self> {
        let url = endpoint.connect_url(token, connect_id)?;
        let deadline = Instant::now() + config.dial_timeout;
        debug!(endpoint = %endpoint.url, connect_id, generation, "ws dialing");

        let socket = match timeout_at(deadline, connect_async(url.as_str())).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(err)) => return Err(handshake_error(err)),
            Err(_) => {
                return Err(WsError::DialFailure(format!(
                    "connect to {} timed out after {}ms",
                    endpoint.url,
                    config.dial_timeout.as_millis()
                )));
            }
        };

        let (writer, mut reader) = socket.split();
        await_welcome(&mut reader, deadline).await?;

        let (outbound, outbound_rx) = mpsc::channel(config.write_message_buffer.max(1));
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(run_writer(
            writer,
            outbound_rx,
            cancel.clone(),
            config.write_timeout,
            generation,
            events.clone(),
        ));
        let reader = tokio::spawn(run_reader(reader, cancel.clone(), generation, events));

        info!(
            endpoint = %endpoint.url,
            generation,
            ping_interval_ms = endpoint.ping_interval.as_millis() as u64,
            ping_timeout_ms = endpoint.ping_timeout.as_millis() as u64,
            "ws connected"
        );
        Ok(Self {
            generation,
            endpoint: endpoint.clone(),
            state: ConnectionState::Connected,
            outbound,
            cancel,
            writer: Some(writer),
            reader: Some(reader),
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Queue a frame for the writer task
    pub(crate) fn send(&self, frame: &WsMessage) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(WsError::NotConnected);
        }
        let text = frame.encode()?;
        match self.outbound.try_send(Message::Text(text.into())) {
            Ok(()) => {
                debug!(
                    generation = self.generation,
                    kind = frame.kind.as_str(),
                    id = frame.id.as_deref().unwrap_or(""),
                    "ws frame queued"
                );
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(WsError::WriteBufferFull),
            Err(TrySendError::Closed(_)) => Err(WsError::NotConnected),
        }
    }

    /// Stop both tasks and close the socket; safe to call repeatedly
    pub(crate) async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.cancel.cancel();

        if let Some(writer) = self.writer.take()
            && timeout(CLOSE_GRACE, writer).await.is_err()
        {
            debug!(generation = self.generation, "ws writer did not finish in time");
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        info!(generation = self.generation, endpoint = %self.endpoint.url, "ws connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn handshake_error(err: TungsteniteError) -> WsError {
    if let TungsteniteError::Http(response) = &err {
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return WsError::AuthFailure {
                message: format!("websocket handshake rejected with {status}"),
            };
        }
    }
    WsError::DialFailure(err.to_string())
}

async fn await_welcome(reader: &mut SocketReader, deadline: Instant) -> Result<()> {
    loop {
        let next = timeout_at(deadline, reader.next())
            .await
            .map_err(|_| WsError::DialFailure("welcome frame not received in time".to_string()))?;

        let text = match next {
            Some(Ok(Message::Text(text))) => text.as_str().to_string(),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Some(Ok(Message::Close(frame))) => {
                return Err(WsError::DialFailure(format!(
                    "server closed before welcome: {frame:?}"
                )));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(WsError::DialFailure(err.to_string())),
            None => {
                return Err(WsError::DialFailure(
                    "stream ended before welcome".to_string(),
                ));
            }
        };

        match WsMessage::decode(&text) {
            Ok(frame) if frame.kind == MessageType::Welcome => {
                debug!(id = frame.id.as_deref().unwrap_or(""), "ws welcome received");
                return Ok(());
            }
            Ok(frame) if frame.kind == MessageType::Error => {
                let (code, message) = frame.error_detail();
                return Err(WsError::AuthFailure {
                    message: format!("server rejected session (code {code}): {message}"),
                });
            }
            Ok(frame) => {
                debug!(kind = frame.kind.as_str(), "ws frame before welcome ignored");
            }
            Err(err) => log_parse_fail_once(&err, &text),
        }
    }
}

async fn run_writer(
    mut writer: SocketWriter,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    write_timeout: Duration,
    generation: u64,
    events: mpsc::Sender<ConnectionEvent>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = timeout(write_timeout, writer.send(Message::Close(None))).await;
                return;
            }
            next = outbound.recv() => {
                let Some(message) = next else {
                    return;
                };
                let reason = match timeout(write_timeout, writer.send(message)).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => format!("write failed: {err}"),
                    Err(_) => format!("write timed out after {}ms", write_timeout.as_millis()),
                };
                warn!(generation, %reason, "ws writer stopped");
                let _ = events.send(ConnectionEvent::Closed { generation, reason }).await;
                return;
            }
        }
    }
}

async fn run_reader(
    mut reader: SocketReader,
    cancel: CancellationToken,
    generation: u64,
    events: mpsc::Sender<ConnectionEvent>,
) {
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = reader.next() => next,
        };

        let text = match next {
            Some(Ok(Message::Text(text))) => text.as_str().to_string(),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(generation, "ws binary frame is not utf-8, dropped");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => break format!("closed by server: {frame:?}"),
            Some(Ok(_)) => continue,
            Some(Err(err)) => break format!("read failed: {err}"),
            None => break "stream ended".to_string(),
        };

        let frame = match WsMessage::decode(&text) {
            Ok(frame) => frame,
            Err(err) => {
                log_parse_fail_once(&err, &text);
                continue;
            }
        };
        if events
            .send(ConnectionEvent::Frame { generation, frame })
            .await
            .is_err()
        {
            return;
        }
    };

    if cancel.is_cancelled() {
        return;
    }
    warn!(generation, %reason, "ws reader stopped");
    let _ = events.send(ConnectionEvent::Closed { generation, reason }).await;
}

fn log_parse_fail_once(err: &WsError, raw: &str) {
    let count = PARSE_FAIL_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < PARSE_FAIL_LOG_LIMIT {
        warn!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            bytes = raw.len(),
            "ws frame parse failed"
        );
        debug!(
            message = %truncate_for_log(raw, RAW_LOG_MAX_BYTES),
            "ws frame parse failed"
        );
    }
}

/// Client ping schedule plus the pong watchdog for one connection
pub(crate) struct Keepalive {
    ticker: Interval,
    ping_timeout: Duration,
    outstanding: VecDeque<(String, Instant)>,
}

impl Keepalive {
    pub(crate) fn new(ping_interval: Duration, ping_timeout: Duration) -> Self {
        let period = ping_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker,
            ping_timeout,
            outstanding: VecDeque::new(),
        }
    }

    pub(crate) fn for_endpoint(endpoint: &Endpoint) -> Self {
        Self::new(endpoint.ping_interval, endpoint.ping_timeout)
    }

    pub(crate) async fn tick(&mut self) -> Instant {
        self.ticker.tick().await
    }

    /// Start the watchdog for a ping just sent
    fn ping_sent(&mut self, id: String) {
        self.outstanding
            .push_back((id, Instant::now() + self.ping_timeout));
    }

    /// Hand a ping frame to `send`; the watchdog only covers pings that were queued
    pub(crate) fn ping(
        &mut self,
        id: String,
        send: impl FnOnce(&WsMessage) -> Result<()>,
    ) -> Result<()> {
        send(&WsMessage::ping(id.clone()))?;
        self.ping_sent(id);
        Ok(())
    }

    /// Cancel the watchdog for `id` and any older ping; a pong without id clears all
    pub(crate) fn pong_received(&mut self, id: Option<&str>) -> bool {
        let Some(id) = id else {
            let had_any = !self.outstanding.is_empty();
            self.outstanding.clear();
            return had_any;
        };
        match self.outstanding.iter().position(|(sent, _)| sent == id) {
            Some(index) => {
                self.outstanding.drain(..=index);
                true
            }
            None => false,
        }
    }

    /// Earliest pong deadline, if any ping is unanswered
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.outstanding.front().map(|(_, deadline)| *deadline)
    }
}
