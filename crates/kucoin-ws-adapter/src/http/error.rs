/*
[INPUT]:  Error sources (token REST call, socket, protocol frames, callbacks)
[OUTPUT]: Structured error types with retry and fatality hints
[POS]:    Error handling layer - unified error types for entire crate
[UPDATE]: When adding new error sources or changing reconnect classification
*/

use reqwest::StatusCode;
use thiserror::Error;

/// Main error type for the push feed adapter
#[derive(Error, Debug)]
pub enum WsError {
    /// HTTP request for the connection token failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Token endpoint returned a non-success envelope
    #[error("API error (code {code}): {message}")]
    Api { code: String, message: String },

    /// Credentials or token rejected; retrying will not help
    #[error("Authentication failed: {message}")]
    AuthFailure { message: String },

    /// Socket could not be opened or the welcome frame never arrived
    #[error("Dial failed: {0}")]
    DialFailure(String),

    /// No ack for a subscribe/unsubscribe frame within the ack timeout
    #[error("Ack timeout for request {request_id} after {timeout_ms}ms")]
    AckTimeout { request_id: String, timeout_ms: u64 },

    /// Keepalive pong not received in time
    #[error("Ping timeout, no pong received")]
    PingTimeout,

    /// The shared connection went away
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Reconnect budget used up; the engine is closed
    #[error("Reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Server answered a request with an `error` frame
    #[error("Server error (code {code}): {message}")]
    Server { code: String, message: String },

    /// Frame written while the connection is not in the connected state
    #[error("WebSocket not connected")]
    NotConnected,

    /// Engine used before `start()`
    #[error("Engine not started")]
    NotStarted,

    /// Engine stopped while the request was in flight
    #[error("Engine stopped")]
    Stopped,

    /// Unsubscribe for an id the engine does not know
    #[error("Unknown subscription id: {0}")]
    UnknownSubscription(String),

    /// Outbound frame queue is full
    #[error("WebSocket write buffer full")]
    WriteBufferFull,

    /// Topic could not be subscribed again after a reconnect
    #[error("Resubscribe failed for {topic}: {message}")]
    ResubscribeFailed { topic: String, message: String },

    /// A subscription callback returned an error or panicked
    #[error("Callback error: {0}")]
    Callback(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Invalid response from server
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Token endpoint codes that mean the credentials themselves are wrong.
const AUTH_ERROR_CODES: &[&str] = &[
    "400001", "400002", "400003", "400004", "400005", "400006", "400007", "411100",
];

impl WsError {
    /// Check if a reconnect attempt that hit this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WsError::Http(_)
                | WsError::Api { .. }
                | WsError::DialFailure(_)
                | WsError::PingTimeout
                | WsError::ConnectionLost(_)
                | WsError::InvalidResponse(_)
                | WsError::Serialization(_)
        )
    }

    /// Check if error indicates authentication failure
    pub fn is_auth_error(&self) -> bool {
        matches!(self, WsError::AuthFailure { .. })
    }

    /// Errors after which the engine must not try to recover by itself
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WsError::AuthFailure { .. }
                | WsError::ReconnectExhausted { .. }
                | WsError::Config(_)
                | WsError::UrlParse(_)
        )
    }

    /// Create an error from a failed HTTP status
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return WsError::AuthFailure { message };
        }
        WsError::Api {
            code: status.as_u16().to_string(),
            message,
        }
    }

    /// Create an error from a non-success REST envelope code
    pub fn from_api_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        if AUTH_ERROR_CODES.contains(&code.as_str()) {
            return WsError::AuthFailure {
                message: format!("{message} (code {code})"),
            };
        }
        WsError::Api { code, message }
    }

    /// Short reason string used in lifecycle events
    pub(crate) fn reason(&self) -> String {
        match self {
            WsError::ConnectionLost(reason) => reason.clone(),
            other => other.to_string(),
        }
    }

    /// Copy of this error for fan-out to several waiters.
    ///
    /// Variants wrapping foreign error types are not `Clone`; they become
    /// `ConnectionLost` carrying the rendered message.
    pub(crate) fn replicate(&self) -> WsError {
        match self {
            WsError::Api { code, message } => WsError::Api {
                code: code.clone(),
                message: message.clone(),
            },
            WsError::AuthFailure { message } => WsError::AuthFailure {
                message: message.clone(),
            },
            WsError::DialFailure(reason) => WsError::DialFailure(reason.clone()),
            WsError::AckTimeout {
                request_id,
                timeout_ms,
            } => WsError::AckTimeout {
                request_id: request_id.clone(),
                timeout_ms: *timeout_ms,
            },
            WsError::PingTimeout => WsError::PingTimeout,
            WsError::ConnectionLost(reason) => WsError::ConnectionLost(reason.clone()),
            WsError::ReconnectExhausted { attempts } => WsError::ReconnectExhausted {
                attempts: *attempts,
            },
            WsError::Server { code, message } => WsError::Server {
                code: code.clone(),
                message: message.clone(),
            },
            WsError::NotConnected => WsError::NotConnected,
            WsError::NotStarted => WsError::NotStarted,
            WsError::Stopped => WsError::Stopped,
            WsError::UnknownSubscription(id) => WsError::UnknownSubscription(id.clone()),
            WsError::WriteBufferFull => WsError::WriteBufferFull,
            WsError::ResubscribeFailed { topic, message } => WsError::ResubscribeFailed {
                topic: topic.clone(),
                message: message.clone(),
            },
            WsError::Callback(message) => WsError::Callback(message.clone()),
            WsError::InvalidResponse(message) => WsError::InvalidResponse(message.clone()),
            WsError::Config(message) => WsError::Config(message.clone()),
            WsError::Http(_) | WsError::Serialization(_) | WsError::UrlParse(_) => {
                WsError::ConnectionLost(self.to_string())
            }
        }
    }
}

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, WsError>;
