/*
[INPUT]:  TailConfig + WsEngine (per feed), CancellationToken
[OUTPUT]: Tokio tasks tailing push topics (start -> subscribe -> log -> stop)
[POS]:    Execution layer - per-feed supervision
[UPDATE]: When changing startup/shutdown guarantees or supervision semantics
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use kucoin_ws_adapter::{
    ClientConfig, TopicMessage, WsClientConfig, WsEngine, WsError, WsEvent, WsService, handler_fn,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{FeedConfig, TailConfig};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedRuntimeStatus {
    Running,
    Finished,
}

/// Counters updated by a feed's callbacks and event loop
#[derive(Debug, Default)]
pub struct FeedStats {
    messages: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
}

impl FeedStats {
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of one feed, as logged by the binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedReport {
    pub feed_id: String,
    pub status: FeedRuntimeStatus,
    pub messages: u64,
    pub errors: u64,
    pub reconnects: u64,
}

#[derive(Debug)]
struct ManagedFeed {
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
    stats: Arc<FeedStats>,
}

/// Feed manager that runs one engine per configured feed.
#[derive(Debug)]
pub struct TailManager {
    feeds: HashMap<String, ManagedFeed>,
    shutdown: CancellationToken,
}

impl TailManager {
    pub fn new() -> Self {
        Self {
            feeds: HashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn runtime_status(&self, feed_id: &str) -> Option<FeedRuntimeStatus> {
        self.feeds.get(feed_id).map(|feed| status_of(&feed.handle))
    }

    pub fn runtime_status_snapshot(&self) -> HashMap<String, FeedRuntimeStatus> {
        self.feeds
            .iter()
            .map(|(feed_id, feed)| (feed_id.clone(), status_of(&feed.handle)))
            .collect()
    }

    pub fn stats(&self, feed_id: &str) -> Option<Arc<FeedStats>> {
        self.feeds.get(feed_id).map(|feed| feed.stats.clone())
    }

    /// Per-feed counters and status, ordered by feed id.
    pub fn report(&self) -> Vec<FeedReport> {
        let mut report: Vec<FeedReport> = self
            .feeds
            .iter()
            .map(|(feed_id, feed)| FeedReport {
                feed_id: feed_id.clone(),
                status: status_of(&feed.handle),
                messages: feed.stats.messages(),
                errors: feed.stats.errors(),
                reconnects: feed.stats.reconnects(),
            })
            .collect();
        report.sort_by(|a, b| a.feed_id.cmp(&b.feed_id));
        report
    }

    /// True once no feed is left running (vacuously true with no feeds).
    pub fn all_finished(&self) -> bool {
        self.feeds
            .values()
            .all(|feed| status_of(&feed.handle) == FeedRuntimeStatus::Finished)
    }

    /// Spawn feeds from configuration using REST token endpoints.
    pub async fn spawn_from_config(&mut self, config: TailConfig) -> Result<()> {
        let ws = config.ws.to_client_config();
        self.spawn_from_config_with_engine_builder(config, move |feed| build_engine(feed, &ws))
            .await
    }

    /// Spawn feeds using a custom engine builder.
    ///
    /// Tests use this to inject engines bound to a local push server.
    pub async fn spawn_from_config_with_engine_builder<F>(
        &mut self,
        config: TailConfig,
        build_engine: F,
    ) -> Result<()>
    where
        F: Fn(&FeedConfig) -> Result<WsEngine>,
    {
        for feed_config in config.feeds {
            if self.feeds.contains_key(&feed_config.id) {
                return Err(anyhow!("duplicate feed id in TailConfig: {}", feed_config.id));
            }

            let engine = build_engine(&feed_config)
                .with_context(|| format!("build engine for feed_id={}", feed_config.id))?;
            let shutdown = self.shutdown.child_token();
            let stats = Arc::new(FeedStats::default());
            let feed_id = feed_config.id.clone();

            let feed = Feed {
                config: feed_config,
                engine,
                shutdown: shutdown.clone(),
                stats: stats.clone(),
            };
            let handle = tokio::spawn(feed.run());
            self.feeds.insert(
                feed_id,
                ManagedFeed {
                    shutdown,
                    handle,
                    stats,
                },
            );
        }

        Ok(())
    }

    pub async fn stop_feed(&mut self, feed_id: &str) -> Result<()> {
        let Some(feed) = self.feeds.remove(feed_id) else {
            return Err(anyhow!("feed_id not found: {feed_id}"));
        };

        feed.shutdown.cancel();
        let mut handle = feed.handle;

        tokio::select! {
            res = &mut handle => join_result(feed_id, res),
            _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
                handle.abort();
                Err(anyhow!("stop_feed timed out after {SHUTDOWN_TIMEOUT:?} feed_id={feed_id}"))
            }
        }
    }

    /// Request graceful shutdown and wait for all feeds to exit.
    ///
    /// Bounded by 30s; feeds still running after that are aborted.
    pub async fn shutdown_and_wait(&mut self) -> Result<()> {
        self.shutdown.cancel();
        self.join_all_with_deadline(SHUTDOWN_TIMEOUT).await
    }

    async fn join_all_with_deadline(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        let mut feeds: Vec<(String, ManagedFeed)> =
            std::mem::take(&mut self.feeds).into_iter().collect();

        while let Some((feed_id, feed)) = feeds.pop() {
            let mut handle = feed.handle;

            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = join_result(&feed_id, res) {
                        abort_all(feeds);
                        return Err(err);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    handle.abort();
                    abort_all(feeds);
                    return Err(anyhow!("shutdown timed out after {timeout:?}"));
                }
            }
        }

        Ok(())
    }
}

impl Default for TailManager {
    fn default() -> Self {
        Self::new()
    }
}

fn status_of(handle: &JoinHandle<Result<()>>) -> FeedRuntimeStatus {
    if handle.is_finished() {
        FeedRuntimeStatus::Finished
    } else {
        FeedRuntimeStatus::Running
    }
}

fn join_result(
    feed_id: &str,
    res: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err).with_context(|| format!("feed returned error feed_id={feed_id}")),
        Err(join_err) if join_err.is_panic() => {
            Err(anyhow!("feed panicked feed_id={feed_id}: {join_err}"))
        }
        Err(join_err) => Err(anyhow!("feed join error feed_id={feed_id}: {join_err}")),
    }
}

fn abort_all(feeds: Vec<(String, ManagedFeed)>) {
    for (feed_id, feed) in feeds {
        debug!(feed_id = %feed_id, "aborting feed");
        feed.handle.abort();
    }
}

fn build_engine(feed: &FeedConfig, ws: &WsClientConfig) -> Result<WsEngine> {
    let mut service = WsService::new(ClientConfig::default(), ws.clone());
    if let Some(base_url) = &feed.rest_base_url {
        service = service.with_base_url(feed.feed.domain(), base_url.clone());
    }
    Ok(service.engine(feed.feed)?)
}

/// One feed: an engine plus the topics it tails.
struct Feed {
    config: FeedConfig,
    engine: WsEngine,
    shutdown: CancellationToken,
    stats: Arc<FeedStats>,
}

impl Feed {
    async fn run(self) -> Result<()> {
        let feed_id = self.config.id.clone();
        let mut events = self.engine.events();

        let result = self.start_and_follow(&mut events).await;
        self.engine.stop().await;

        match &result {
            Ok(()) => info!(feed_id = %feed_id, "feed stopped"),
            Err(err) => {
                let message = format!("{err:#}");
                error!(feed_id = %feed_id, error = %message, "feed failed");
            }
        }
        result
    }

    async fn start_and_follow(
        &self,
        events: &mut tokio::sync::broadcast::Receiver<WsEvent>,
    ) -> Result<()> {
        let feed_id = self.config.id.as_str();

        tokio::select! {
            res = self.engine.start() => res.with_context(|| format!("start engine feed_id={feed_id}"))?,
            _ = self.shutdown.cancelled() => return Ok(()),
        }
        info!(feed_id, feed = %self.config.feed, "feed connected");

        for topic in &self.config.topics {
            let id = self
                .engine
                .subscribe(topic.clone(), self.handler())
                .await
                .with_context(|| format!("subscribe topic={topic} feed_id={feed_id}"))?;
            info!(feed_id, topic = %topic, subscription_id = %id, "subscribed");
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Ok(event) => self.on_event(event)?,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(feed_id, skipped, "event stream lagged");
                    }
                    Err(RecvError::Closed) => {
                        return Err(anyhow!("event stream closed feed_id={feed_id}"));
                    }
                },
            }
        }
    }

    fn on_event(&self, event: WsEvent) -> Result<()> {
        let feed_id = self.config.id.as_str();
        match event {
            WsEvent::Connected => info!(feed_id, "connected"),
            WsEvent::Disconnected { reason } => warn!(feed_id, reason = %reason, "disconnected"),
            WsEvent::TryReconnect { attempt } => {
                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                info!(feed_id, attempt, "reconnecting");
            }
            WsEvent::ResubscribeOk { topic } => info!(feed_id, topic = %topic, "resubscribed"),
            WsEvent::ResubscribeError { topic, message } => {
                warn!(feed_id, topic = %topic, error = %message, "resubscribe failed");
            }
            WsEvent::ErrorReceived { message } => warn!(feed_id, error = %message, "server error"),
            WsEvent::CallbackError {
                subscription_id,
                message,
            } => warn!(feed_id, subscription_id = %subscription_id, error = %message, "callback failed"),
            WsEvent::ClientFail { message } => {
                return Err(anyhow!("engine failed feed_id={feed_id}: {message}"));
            }
            WsEvent::ClientShutdown => debug!(feed_id, "engine shut down"),
        }
        Ok(())
    }

    fn handler(&self) -> impl kucoin_ws_adapter::SubscriptionHandler {
        let feed_id = self.config.id.clone();
        let error_feed_id = feed_id.clone();
        let stats = self.stats.clone();
        let error_stats = self.stats.clone();

        handler_fn(move |message: TopicMessage| {
            stats.messages.fetch_add(1, Ordering::Relaxed);
            info!(
                feed_id = %feed_id,
                topic = %message.topic,
                subject = %message.subject,
                data = %message.data,
                "push"
            );
            Ok(())
        })
        .with_error(move |err: &WsError| {
            error_stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!(feed_id = %error_feed_id, error = %err, "subscription error");
        })
    }
}
