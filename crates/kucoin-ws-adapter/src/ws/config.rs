/*
[INPUT]:  Caller-provided connection tunables
[OUTPUT]: WsClientConfig consumed by connection, reconnect and engine layers
[POS]:    WebSocket layer - configuration surface
[UPDATE]: When adding connection options or changing defaults
*/

use std::time::Duration;

use crate::http::{Result, WsError};

/// Unlimited reconnect attempts
pub const UNLIMITED_ATTEMPTS: i32 = -1;

/// Delay growth between failed reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Always wait `reconnect_interval`
    Fixed,
    /// Double from `reconnect_interval` up to `max_interval`
    Exponential { max_interval: Duration },
}

/// WebSocket client configuration
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Reconnect automatically after an unexpected disconnect
    pub reconnect: bool,
    /// Max failed reconnect attempts per outage; `-1` = unlimited
    pub reconnect_attempts: i32,
    /// Base wait between reconnect attempts
    pub reconnect_interval: Duration,
    pub backoff: BackoffStrategy,
    /// Give up an outage after this long, regardless of attempts
    pub max_reconnect_duration: Option<Duration>,
    /// Socket open + welcome deadline
    pub dial_timeout: Duration,
    /// Single frame write deadline; also bounds subscribe/unsubscribe acks
    pub write_timeout: Duration,
    /// Inbound queue size (frames)
    pub read_message_buffer: usize,
    /// Outbound queue size (frames)
    pub write_message_buffer: usize,
    /// Retries for each topic replayed after a reconnect
    pub auto_resubscribe_max_attempts: u32,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_attempts: UNLIMITED_ATTEMPTS,
            reconnect_interval: Duration::from_secs(5),
            backoff: BackoffStrategy::Fixed,
            max_reconnect_duration: None,
            dial_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            read_message_buffer: 1024,
            write_message_buffer: 256,
            auto_resubscribe_max_attempts: 3,
        }
    }
}

impl WsClientConfig {
    /// Ack deadline for subscribe/unsubscribe requests
    pub fn ack_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconnect_attempts < UNLIMITED_ATTEMPTS {
            return Err(WsError::Config(format!(
                "reconnect_attempts must be >= -1, got {}",
                self.reconnect_attempts
            )));
        }
        if self.dial_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(WsError::Config(
                "dial_timeout and write_timeout must be non-zero".to_string(),
            ));
        }
        if self.read_message_buffer == 0 || self.write_message_buffer == 0 {
            return Err(WsError::Config(
                "message buffers must hold at least one frame".to_string(),
            ));
        }
        if let BackoffStrategy::Exponential { max_interval } = self.backoff
            && max_interval < self.reconnect_interval
        {
            return Err(WsError::Config(
                "exponential max_interval is below reconnect_interval".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WsClientConfig::default();
        assert!(config.reconnect);
        assert_eq!(config.reconnect_attempts, UNLIMITED_ATTEMPTS);
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.read_message_buffer, 1024);
        assert_eq!(config.write_message_buffer, 256);
        assert_eq!(config.auto_resubscribe_max_attempts, 3);
        assert!(config.max_reconnect_duration.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = WsClientConfig {
            reconnect_attempts: -2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(WsError::Config(_))));

        let config = WsClientConfig {
            write_message_buffer: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = WsClientConfig {
            backoff: BackoffStrategy::Exponential {
                max_interval: Duration::from_secs(1),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
