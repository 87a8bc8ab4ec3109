/*
[INPUT]:  Reconnect tunables, token provider and connection failures
[OUTPUT]: Backoff decisions and freshly dialed connections
[POS]:    WebSocket layer - reconnect supervision (policy + dialer)
[UPDATE]: When changing backoff, attempt budgets or endpoint selection
*/

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::http::{Result, TokenProvider, WsError};
use crate::ws::config::{BackoffStrategy, WsClientConfig};
use crate::ws::connection::{Connection, ConnectionEvent};

/// Budget and delay schedule for one outage
#[derive(Debug, Clone)]
pub(crate) struct ReconnectPolicy {
    max_attempts: Option<u32>,
    interval: Duration,
    backoff: BackoffStrategy,
    max_duration: Option<Duration>,
    attempts: u32,
    outage_started: Option<Instant>,
}

impl ReconnectPolicy {
    pub(crate) fn new(config: &WsClientConfig) -> Self {
        Self {
            max_attempts: u32::try_from(config.reconnect_attempts).ok(),
            interval: config.reconnect_interval,
            backoff: config.backoff,
            max_duration: config.max_reconnect_duration,
            attempts: 0,
            outage_started: None,
        }
    }

    /// A connection was lost; start counting a new outage
    pub(crate) fn begin_outage(&mut self, now: Instant) {
        self.attempts = 0;
        self.outage_started = Some(now);
    }

    /// Whether another attempt fits in the attempt and duration budgets
    pub(crate) fn can_attempt(&self, now: Instant) -> bool {
        if let Some(max) = self.max_attempts
            && self.attempts >= max
        {
            return false;
        }
        if let (Some(limit), Some(started)) = (self.max_duration, self.outage_started)
            && now.saturating_duration_since(started) >= limit
        {
            return false;
        }
        true
    }

    /// Count an attempt that is about to start; returns its 1-based number
    pub(crate) fn start_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Delay before the next attempt, or `None` once the budget is spent
    pub(crate) fn next_delay(&self, now: Instant) -> Option<Duration> {
        if !self.can_attempt(now) {
            return None;
        }
        let delay = match self.backoff {
            BackoffStrategy::Fixed => self.interval,
            BackoffStrategy::Exponential { max_interval } => {
                let exponent = self.attempts.saturating_sub(1).min(16);
                self.interval
                    .saturating_mul(1u32 << exponent)
                    .min(max_interval)
            }
        };
        Some(delay)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
        self.outage_started = None;
    }
}

/// Fetches a token and opens a connection, rotating through endpoints
pub(crate) struct Dialer {
    provider: Arc<dyn TokenProvider>,
    private_channel: bool,
    config: WsClientConfig,
    cursor: usize,
}

impl Dialer {
    pub(crate) fn new(
        provider: Arc<dyn TokenProvider>,
        private_channel: bool,
        config: WsClientConfig,
    ) -> Self {
        Self {
            provider,
            private_channel,
            config,
            cursor: 0,
        }
    }

    pub(crate) async fn dial(
        &mut self,
        generation: u64,
        events: &mpsc::Sender<ConnectionEvent>,
    ) -> Result<Connection> {
        let token = self.provider.fetch_token(self.private_channel).await?;
        if token.endpoints.is_empty() {
            return Err(WsError::InvalidResponse(
                "token response lists no instance servers".to_string(),
            ));
        }

        let index = self.cursor % token.endpoints.len();
        self.cursor = self.cursor.wrapping_add(1);
        let endpoint = &token.endpoints[index];
        let connect_id = Uuid::new_v4().simple().to_string();
        debug!(
            generation,
            endpoint = %endpoint.url,
            candidates = token.endpoints.len(),
            "dial selected endpoint"
        );

        let connection = Connection::open(
            endpoint,
            &token.token,
            &connect_id,
            generation,
            &self.config,
            events.clone(),
        )
        .await?;
        info!(generation, connect_id = %connect_id, "dial succeeded");
        Ok(connection)
    }
}
