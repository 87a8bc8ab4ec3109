/*
[INPUT]:  start/stop/subscribe/unsubscribe calls from market facades
[OUTPUT]: Subscription ids, per-subscription delivery, lifecycle state and events
[POS]:    WebSocket layer - engine facade and its single worker task
[UPDATE]: When changing lifecycle, ack handling, reconnect or replay flow
*/

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::http::{Result, TokenProvider, WsError};
use crate::types::ConnectionState;
use crate::ws::config::WsClientConfig;
use crate::ws::connection::{Connection, ConnectionEvent, Keepalive};
use crate::ws::dispatcher::{self, AckKind, PendingAck, PendingAcks, Route, Waiter};
use crate::ws::event::{EventSink, WsEvent};
use crate::ws::handler::SubscriptionHandler;
use crate::ws::message::WsMessage;
use crate::ws::reconnect::{Dialer, ReconnectPolicy};
use crate::ws::registry::{SubscriptionRegistry, WireState};

enum Command {
    Subscribe {
        topic: String,
        handler: Arc<dyn SubscriptionHandler>,
        reply: oneshot::Sender<Result<String>>,
    },
    Unsubscribe {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

enum Lifecycle {
    Idle,
    Running {
        commands: mpsc::UnboundedSender<Command>,
        shutdown: CancellationToken,
        worker: JoinHandle<()>,
    },
}

struct Shared {
    config: WsClientConfig,
    private_channel: bool,
    provider: Arc<dyn TokenProvider>,
    lifecycle: Mutex<Lifecycle>,
    state: Arc<watch::Sender<ConnectionState>>,
    events: EventSink,
}

/// Push engine for one feed: one connection shared by many subscriptions.
///
/// Cloning is cheap; clones drive the same connection. Dropping every clone
/// without calling [`WsEngine::stop`] still shuts the worker down.
#[derive(Clone)]
pub struct WsEngine {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsEngine")
            .field("private_channel", &self.shared.private_channel)
            .field("state", &self.state())
            .finish()
    }
}

impl WsEngine {
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        private_channel: bool,
        config: WsClientConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                private_channel,
                provider,
                lifecycle: Mutex::new(Lifecycle::Idle),
                state: Arc::new(state),
                events: EventSink::new(),
            }),
        }
    }

    /// Fetch a token, dial and wait for welcome. Calling it while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        self.shared.config.validate()?;

        let mut lifecycle = self.shared.lifecycle.lock().await;
        if let Lifecycle::Running { worker, .. } = &*lifecycle
            && !worker.is_finished()
        {
            debug!("ws engine already running");
            return Ok(());
        }

        let shared = &self.shared;
        shared.state.send_replace(ConnectionState::Connecting);
        let (conn_tx, conn_rx) = mpsc::channel(shared.config.read_message_buffer.max(1));
        let mut dialer = Dialer::new(
            shared.provider.clone(),
            shared.private_channel,
            shared.config.clone(),
        );

        let connection = match dialer.dial(1, &conn_tx).await {
            Ok(connection) => connection,
            Err(err) => {
                shared.state.send_replace(ConnectionState::Idle);
                warn!(error = %err, "ws engine start failed");
                return Err(err);
            }
        };

        shared.state.send_replace(ConnectionState::Connected);
        shared.events.emit(WsEvent::Connected);
        info!(private = shared.private_channel, "ws engine started");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let worker = Worker {
            config: shared.config.clone(),
            private_channel: shared.private_channel,
            state: shared.state.clone(),
            events: shared.events.clone(),
            dialer,
            keepalive: Some(Keepalive::for_endpoint(connection.endpoint())),
            generation: connection.generation(),
            connection: Some(connection),
            conn_tx,
            conn_rx,
            commands: command_rx,
            shutdown: shutdown.clone(),
            registry: SubscriptionRegistry::new(
                shared.config.read_message_buffer,
                shared.events.clone(),
            ),
            pending: PendingAcks::default(),
            parked: HashMap::new(),
            policy: ReconnectPolicy::new(&shared.config),
            reconnect_at: None,
            resubscribe_failures: HashMap::new(),
            timed_out: HashMap::new(),
            exit: None,
        };

        *lifecycle = Lifecycle::Running {
            commands,
            shutdown,
            worker: tokio::spawn(worker.run()),
        };
        Ok(())
    }

    /// Cancel reconnects, reject in-flight requests, close the socket and forget
    /// every subscription. Safe at any time, including during backoff.
    pub async fn stop(&self) {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        let Lifecycle::Running {
            shutdown, worker, ..
        } = std::mem::replace(&mut *lifecycle, Lifecycle::Idle)
        else {
            // A start() dropped mid-dial leaves Connecting behind
            self.shared.state.send_if_modified(|state| {
                let stale = *state == ConnectionState::Connecting;
                if stale {
                    *state = ConnectionState::Idle;
                }
                stale
            });
            debug!("ws engine stop requested while idle");
            return;
        };

        shutdown.cancel();
        if let Err(err) = worker.await {
            warn!(error = %err, "ws engine worker ended abnormally");
            self.shared.state.send_replace(ConnectionState::Closed);
        }
    }

    /// Subscribe `handler` to `topic`; resolves with the subscription id once
    /// the server acked (or at once when the topic is already on the wire)
    pub async fn subscribe<H>(&self, topic: impl Into<String>, handler: H) -> Result<String>
    where
        H: SubscriptionHandler,
    {
        self.subscribe_shared(topic, Arc::new(handler)).await
    }

    pub async fn subscribe_shared(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<String> {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(WsError::Config("topic must not be empty".to_string()));
        }

        let commands = self.commands().await?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Subscribe {
                topic,
                handler,
                reply,
            })
            .map_err(|_| WsError::Stopped)?;
        rx.await.map_err(|_| WsError::Stopped)?
    }

    /// Remove one subscription; the wire unsubscribe only goes out for the last
    /// subscriber of its topic
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        let commands = self.commands().await?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Unsubscribe {
                id: id.to_string(),
                reply,
            })
            .map_err(|_| WsError::Stopped)?;
        rx.await.map_err(|_| WsError::Stopped)?
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Lifecycle notifications; a lagging receiver skips events, it never blocks the engine
    pub fn events(&self) -> broadcast::Receiver<WsEvent> {
        self.shared.events.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        matches!(
            &*self.shared.lifecycle.lock().await,
            Lifecycle::Running { worker, .. } if !worker.is_finished()
        )
    }

    pub fn is_private(&self) -> bool {
        self.shared.private_channel
    }

    async fn commands(&self) -> Result<mpsc::UnboundedSender<Command>> {
        match &*self.shared.lifecycle.lock().await {
            Lifecycle::Idle => Err(WsError::NotStarted),
            Lifecycle::Running { commands, .. } => Ok(commands.clone()),
        }
    }
}

/// Cap on remembered timed-out subscribe requests per connection
const TIMED_OUT_LIMIT: usize = 1024;

enum Exit {
    Stopped,
    Fatal(WsError),
}

/// Sole owner of the connection, registry and ack table
struct Worker {
    config: WsClientConfig,
    private_channel: bool,
    state: Arc<watch::Sender<ConnectionState>>,
    events: EventSink,
    dialer: Dialer,
    connection: Option<Connection>,
    keepalive: Option<Keepalive>,
    generation: u64,
    conn_tx: mpsc::Sender<ConnectionEvent>,
    conn_rx: mpsc::Receiver<ConnectionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    registry: SubscriptionRegistry,
    pending: PendingAcks,
    /// Subscribe callers waiting for the next connection, by topic
    parked: HashMap<String, Vec<Waiter>>,
    policy: ReconnectPolicy,
    reconnect_at: Option<Instant>,
    resubscribe_failures: HashMap<String, u32>,
    /// Timed-out subscribe request ids and their topics, for late acks
    timed_out: HashMap<String, String>,
    exit: Option<Exit>,
}

impl Worker {
    async fn run(mut self) {
        let exit = loop {
            let ack_deadline = self.pending.next_deadline();
            let pong_deadline = self.keepalive.as_ref().and_then(Keepalive::deadline);
            let reconnect_at = self.reconnect_at;

            // Timers and commands are polled ahead of inbound frames
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Exit::Stopped,
                _ = sleep_until_opt(pong_deadline) => self.check_pong_deadline().await,
                _ = next_tick(&mut self.keepalive) => self.send_ping(),
                _ = sleep_until_opt(ack_deadline) => {
                    self.drain_queued_frames().await;
                    self.expire_acks();
                }
                _ = sleep_until_opt(reconnect_at) => self.attempt_reconnect().await,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break Exit::Stopped,
                },
                event = self.conn_rx.recv() => {
                    if let Some(event) = event {
                        self.on_connection_event(event).await;
                    }
                }
            }

            if let Some(exit) = self.exit.take() {
                break exit;
            }
        };
        self.finish(exit).await;
    }

    /// Handle frames already read before acting on an expired deadline; a
    /// pong or ack may be sitting behind a burst of push messages
    async fn drain_queued_frames(&mut self) {
        for _ in 0..self.config.read_message_buffer {
            if self.connection.is_none() || self.exit.is_some() {
                return;
            }
            match self.conn_rx.try_recv() {
                Ok(event) => self.on_connection_event(event).await,
                Err(_) => return,
            }
        }
    }

    async fn check_pong_deadline(&mut self) {
        self.drain_queued_frames().await;
        let expired = self
            .keepalive
            .as_ref()
            .and_then(Keepalive::deadline)
            .is_some_and(|deadline| deadline <= Instant::now());
        if expired {
            warn!(generation = self.generation, "ws pong not received in time");
            self.on_disconnect(WsError::PingTimeout).await;
        }
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame { generation, frame } if generation == self.generation => {
                self.on_frame(frame);
            }
            ConnectionEvent::Closed { generation, reason }
                if generation == self.generation && self.connection.is_some() =>
            {
                self.on_disconnect(WsError::ConnectionLost(reason)).await;
            }
            ConnectionEvent::Frame { generation, .. } | ConnectionEvent::Closed { generation, .. } => {
                debug!(generation, current = self.generation, "stale connection event dropped");
            }
        }
    }

    fn on_frame(&mut self, frame: WsMessage) {
        match dispatcher::route(frame, &mut self.pending) {
            Route::Welcome => debug!("ws welcome on established connection ignored"),
            Route::Ping { id } => {
                let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
                if let Err(err) = self.send(&WsMessage::pong(id)) {
                    warn!(error = %err, "ws pong reply failed");
                }
            }
            Route::Pong { id } => {
                if let Some(keepalive) = self.keepalive.as_mut()
                    && !keepalive.pong_received(id.as_deref())
                {
                    debug!(id = id.as_deref().unwrap_or(""), "ws pong for unknown ping");
                }
            }
            Route::Ack(ack) => self.on_ack(ack),
            Route::Rejected { ack, code, message } => {
                warn!(
                    request_id = %ack.request_id,
                    topic = ack.kind.topic(),
                    %code,
                    %message,
                    "ws request rejected by server"
                );
                self.fail_ack(ack, &dispatcher::server_error(&code, &message));
            }
            Route::ServerError { code, message } => {
                warn!(%code, %message, "ws server error");
                self.events.emit(WsEvent::ErrorReceived {
                    message: format!("code {code}: {message}"),
                });
            }
            Route::Message {
                topic,
                subject,
                sn,
                data,
            } => {
                self.registry.dispatch(&topic, &subject, sn, data);
            }
            Route::Late { id } => self.on_late_ack(id),
            Route::Ignored(kind) => debug!(kind = kind.as_str(), "ws frame ignored"),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                topic,
                handler,
                reply,
            } => self.subscribe(topic, handler, reply),
            Command::Unsubscribe { id, reply } => self.unsubscribe(id, reply),
        }
    }

    fn subscribe(
        &mut self,
        topic: String,
        handler: Arc<dyn SubscriptionHandler>,
        reply: oneshot::Sender<Result<String>>,
    ) {
        let added = self.registry.add(&topic, self.private_channel, handler);
        let waiter = Waiter {
            subscription_id: added.id.clone(),
            reply,
        };
        let wire = if added.wire_subscribe_required {
            WireState::Idle
        } else {
            self.registry
                .entry(&topic)
                .map(|entry| entry.wire.clone())
                .unwrap_or(WireState::Idle)
        };

        match wire {
            WireState::Subscribed => waiter.resolve(Ok(added.id)),
            WireState::Pending(request_id) => {
                if let Err(waiter) = self.pending.attach(&request_id, waiter) {
                    self.send_subscribe(topic, vec![waiter], false);
                }
            }
            WireState::Idle if self.connection.is_some() => {
                self.send_subscribe(topic, vec![waiter], false);
            }
            WireState::Idle => {
                debug!(%topic, subscription_id = %added.id, "subscribe parked until reconnect");
                self.parked.entry(topic).or_default().push(waiter);
            }
        }
    }

    fn send_subscribe(&mut self, topic: String, waiters: Vec<Waiter>, replay: bool) {
        let request_id = Uuid::new_v4().to_string();
        let frame = WsMessage::subscribe(&request_id, &topic, self.private_channel);

        if let Err(err) = self.send(&frame) {
            warn!(%topic, error = %err, "ws subscribe frame not sent");
            let ack = PendingAck {
                request_id,
                kind: AckKind::Subscribe { topic, replay },
                deadline: Instant::now(),
                waiters,
            };
            self.fail_ack(ack, &err);
            return;
        }

        self.registry
            .set_wire(&topic, WireState::Pending(request_id.clone()));
        self.pending.insert(PendingAck {
            request_id,
            kind: AckKind::Subscribe { topic, replay },
            deadline: Instant::now() + self.config.ack_timeout(),
            waiters,
        });
    }

    fn unsubscribe(&mut self, id: String, reply: oneshot::Sender<Result<()>>) {
        let Some(removed) = self.registry.remove(&id) else {
            let _ = reply.send(Err(WsError::UnknownSubscription(id)));
            return;
        };

        if !removed.wire_unsubscribe_required
            || removed.wire == WireState::Idle
            || self.connection.is_none()
        {
            let _ = reply.send(Ok(()));
            return;
        }

        self.resubscribe_failures.remove(&removed.topic);
        let request_id = Uuid::new_v4().to_string();
        let frame = WsMessage::unsubscribe(&request_id, &removed.topic, removed.private_channel);
        if let Err(err) = self.send(&frame) {
            warn!(topic = %removed.topic, error = %err, "ws unsubscribe frame not sent");
            let _ = reply.send(Err(err));
            return;
        }
        self.pending.insert(PendingAck {
            request_id,
            kind: AckKind::Unsubscribe {
                topic: removed.topic,
                reply: Some(reply),
            },
            deadline: Instant::now() + self.config.ack_timeout(),
            waiters: Vec::new(),
        });
    }

    fn on_ack(&mut self, ack: PendingAck) {
        match ack.kind {
            AckKind::Subscribe { topic, replay } => {
                let still_pending = self
                    .registry
                    .entry(&topic)
                    .is_some_and(|entry| entry.wire == WireState::Pending(ack.request_id.clone()));
                if still_pending {
                    self.registry.set_wire(&topic, WireState::Subscribed);
                }
                if replay {
                    self.resubscribe_failures.remove(&topic);
                    self.events.emit(WsEvent::ResubscribeOk {
                        topic: topic.clone(),
                    });
                }
                debug!(%topic, request_id = %ack.request_id, waiters = ack.waiters.len(), "ws subscribe acked");

                for waiter in ack.waiters {
                    let id = waiter.subscription_id.clone();
                    if self.registry.contains(&id) {
                        waiter.resolve(Ok(id));
                    } else {
                        waiter.resolve(Err(WsError::UnknownSubscription(id)));
                    }
                }
            }
            AckKind::Unsubscribe { topic, reply } => {
                debug!(%topic, request_id = %ack.request_id, "ws unsubscribe acked");
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    /// Reject a request: its callers get `err`, subscriptions that were already
    /// live on the topic go through the bounded resubscribe retry
    fn fail_ack(&mut self, ack: PendingAck, err: &WsError) {
        match ack.kind {
            AckKind::Subscribe { topic, .. } => {
                for waiter in ack.waiters {
                    self.registry.remove(&waiter.subscription_id);
                    waiter.resolve(Err(err.replicate()));
                }

                let Some(entry) = self.registry.entry(&topic) else {
                    return;
                };
                if entry.wire != WireState::Pending(ack.request_id.clone())
                    && entry.wire != WireState::Idle
                {
                    return;
                }
                self.registry.set_wire(&topic, WireState::Idle);
                self.retry_resubscribe(topic, err);
            }
            AckKind::Unsubscribe { topic, reply } => {
                debug!(%topic, error = %err, "ws unsubscribe failed");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err.replicate()));
                }
            }
        }
    }

    fn retry_resubscribe(&mut self, topic: String, err: &WsError) {
        let failures = self.resubscribe_failures.entry(topic.clone()).or_insert(0);
        *failures += 1;
        let failures = *failures;

        if failures <= self.config.auto_resubscribe_max_attempts && self.connection.is_some() {
            warn!(%topic, attempt = failures, error = %err, "ws resubscribe failed, retrying");
            self.send_subscribe(topic, Vec::new(), true);
            return;
        }

        self.resubscribe_failures.remove(&topic);
        let message = err.to_string();
        error!(%topic, attempts = failures, %message, "ws resubscribe gave up");
        self.events.emit(WsEvent::ResubscribeError {
            topic: topic.clone(),
            message: message.clone(),
        });
        let failure = Arc::new(WsError::ResubscribeFailed {
            topic: topic.clone(),
            message,
        });
        for id in self.registry.subscriber_ids(&topic) {
            self.registry.notify(&id, failure.clone());
            self.registry.remove(&id);
        }
    }

    /// A subscribe acked after its caller gave up leaves the topic on the wire
    /// with nobody holding it; take it off again
    fn on_late_ack(&mut self, id: Option<String>) {
        let Some(topic) = id.as_deref().and_then(|id| self.timed_out.remove(id)) else {
            debug!(id = id.as_deref().unwrap_or(""), "ws late ack dropped");
            return;
        };
        if self.registry.entry(&topic).is_some() {
            debug!(%topic, "ws late ack for topic that is live again");
            return;
        }

        let request_id = Uuid::new_v4().to_string();
        let frame = WsMessage::unsubscribe(&request_id, &topic, self.private_channel);
        if let Err(err) = self.send(&frame) {
            warn!(%topic, error = %err, "ws unsubscribe after late ack not sent");
            return;
        }
        info!(%topic, "ws topic acked after timeout, unsubscribing");
        self.pending.insert(PendingAck {
            request_id,
            kind: AckKind::Unsubscribe { topic, reply: None },
            deadline: Instant::now() + self.config.ack_timeout(),
            waiters: Vec::new(),
        });
    }

    fn expire_acks(&mut self) {
        let timeout_ms = self.config.ack_timeout().as_millis() as u64;
        for ack in self.pending.expire(Instant::now()) {
            if let AckKind::Subscribe { topic, .. } = &ack.kind
                && self.timed_out.len() < TIMED_OUT_LIMIT
            {
                self.timed_out.insert(ack.request_id.clone(), topic.clone());
            }
            warn!(
                request_id = %ack.request_id,
                topic = ack.kind.topic(),
                timeout_ms,
                "ws ack timed out"
            );
            let err = WsError::AckTimeout {
                request_id: ack.request_id.clone(),
                timeout_ms,
            };
            self.fail_ack(ack, &err);
        }
    }

    fn send_ping(&mut self) {
        let Some(keepalive) = self.keepalive.as_mut() else {
            return;
        };
        let id = Uuid::new_v4().simple().to_string();
        let connection = &self.connection;
        let result = keepalive.ping(id, |frame| match connection {
            Some(connection) => connection.send(frame),
            None => Err(WsError::NotConnected),
        });
        if let Err(err) = result {
            warn!(error = %err, "ws ping not sent");
        }
    }

    fn send(&self, frame: &WsMessage) -> Result<()> {
        match &self.connection {
            Some(connection) => connection.send(frame),
            None => Err(WsError::NotConnected),
        }
    }

    async fn on_disconnect(&mut self, reason: WsError) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        self.keepalive = None;

        let message = reason.reason();
        warn!(generation = self.generation, reason = %message, "ws disconnected");
        self.events.emit(WsEvent::Disconnected {
            reason: message.clone(),
        });

        let lost = WsError::ConnectionLost(message.clone());
        for ack in self.pending.drain() {
            self.reject_on_loss(ack, &lost);
        }
        self.registry.mark_all_idle();
        self.resubscribe_failures.clear();
        self.timed_out.clear();

        if !self.config.reconnect {
            self.exit = Some(Exit::Fatal(lost));
            return;
        }

        let now = Instant::now();
        self.policy.begin_outage(now);
        if !self.policy.can_attempt(now) {
            self.exit = Some(Exit::Fatal(WsError::ReconnectExhausted { attempts: 0 }));
            return;
        }
        self.state.send_replace(ConnectionState::Reconnecting);
        self.reconnect_at = Some(now);
    }

    /// In-flight requests fail; topics that were live stay for replay
    fn reject_on_loss(&mut self, ack: PendingAck, lost: &WsError) {
        match ack.kind {
            AckKind::Subscribe { .. } => {
                for waiter in ack.waiters {
                    self.registry.remove(&waiter.subscription_id);
                    waiter.resolve(Err(lost.replicate()));
                }
            }
            AckKind::Unsubscribe { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(lost.replicate()));
                }
            }
        }
    }

    async fn attempt_reconnect(&mut self) {
        self.reconnect_at = None;
        let attempt = self.policy.start_attempt();
        self.generation += 1;
        info!(attempt, generation = self.generation, "ws reconnecting");
        self.events.emit(WsEvent::TryReconnect { attempt });

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            result = self.dialer.dial(self.generation, &self.conn_tx) => result,
        };

        match result {
            Ok(connection) => self.on_reconnected(connection),
            Err(err) if err.is_fatal() => {
                error!(attempt, error = %err, "ws reconnect hit a fatal error");
                self.exit = Some(Exit::Fatal(err));
            }
            Err(err) => {
                let now = Instant::now();
                match self.policy.next_delay(now) {
                    Some(delay) => {
                        warn!(
                            attempt,
                            error = %err,
                            retry_in_ms = delay.as_millis() as u64,
                            "ws reconnect attempt failed"
                        );
                        self.reconnect_at = Some(now + delay);
                    }
                    None => {
                        error!(attempt, error = %err, "ws reconnect budget exhausted");
                        self.exit = Some(Exit::Fatal(WsError::ReconnectExhausted {
                            attempts: self.policy.attempts(),
                        }));
                    }
                }
            }
        }
    }

    fn on_reconnected(&mut self, connection: Connection) {
        let attempts = self.policy.attempts();
        self.keepalive = Some(Keepalive::for_endpoint(connection.endpoint()));
        self.connection = Some(connection);
        self.policy.reset();
        self.state.send_replace(ConnectionState::Connected);
        self.events.emit(WsEvent::Connected);
        info!(attempts, generation = self.generation, "ws reconnected");

        let topics = self.registry.snapshot();
        info!(topics = topics.len(), "ws replaying subscriptions");
        for topic in topics {
            let waiters = self.parked.remove(&topic).unwrap_or_default();
            self.send_subscribe(topic, waiters, true);
        }
        for (topic, waiters) in self.parked.drain() {
            debug!(%topic, "parked subscribe has no live topic");
            for waiter in waiters {
                let id = waiter.subscription_id.clone();
                waiter.resolve(Err(WsError::UnknownSubscription(id)));
            }
        }
    }

    async fn finish(mut self, exit: Exit) {
        self.reconnect_at = None;
        self.keepalive = None;

        let err = match &exit {
            Exit::Stopped => WsError::Stopped,
            Exit::Fatal(err) => err.replicate(),
        };
        for ack in self.pending.drain() {
            self.reject_on_loss(ack, &err);
        }
        for (_, waiters) in self.parked.drain() {
            for waiter in waiters {
                waiter.resolve(Err(err.replicate()));
            }
        }
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }

        match exit {
            Exit::Stopped => {
                let dropped = self.registry.len();
                self.registry.clear();
                self.state.send_replace(ConnectionState::Closed);
                self.events.emit(WsEvent::ClientShutdown);
                info!(subscriptions = dropped, "ws engine stopped");
            }
            Exit::Fatal(err) => {
                let message = err.to_string();
                let notified = self.registry.fail_all(Arc::new(err));
                self.state.send_replace(ConnectionState::Closed);
                self.events.emit(WsEvent::ClientFail {
                    message: message.clone(),
                });
                error!(subscriptions = notified, %message, "ws engine failed");
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(keepalive: &mut Option<Keepalive>) -> Instant {
    match keepalive {
        Some(keepalive) => keepalive.tick().await,
        None => std::future::pending().await,
    }
}
