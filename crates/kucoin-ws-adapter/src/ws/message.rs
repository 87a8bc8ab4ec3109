/*
[INPUT]:  Raw WebSocket text frames
[OUTPUT]: Parsed WsMessage frames and per-subscription TopicMessage payloads
[POS]:    WebSocket layer - wire frame model and parsing
[UPDATE]: When adding new frame types or changing the frame format
*/

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use crate::http::Result;

/// Frame kind carried in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Welcome,
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
    Ack,
    Message,
    Error,
    Notice,
    Command,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Welcome => "welcome",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::Ack => "ack",
            MessageType::Message => "message",
            MessageType::Error => "error",
            MessageType::Notice => "notice",
            MessageType::Command => "command",
            MessageType::Unknown => "unknown",
        }
    }
}

/// One JSON frame in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMessage {
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sn: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_channel: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl WsMessage {
    fn new(kind: MessageType, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            kind,
            sn: None,
            topic: None,
            subject: None,
            private_channel: None,
            response: None,
            code: None,
            data: None,
        }
    }

    pub fn ping(id: impl Into<String>) -> Self {
        Self::new(MessageType::Ping, id)
    }

    pub fn pong(id: impl Into<String>) -> Self {
        Self::new(MessageType::Pong, id)
    }

    pub fn subscribe(id: impl Into<String>, topic: impl Into<String>, private_channel: bool) -> Self {
        Self {
            topic: Some(topic.into()),
            private_channel: Some(private_channel),
            response: Some(true),
            ..Self::new(MessageType::Subscribe, id)
        }
    }

    pub fn unsubscribe(
        id: impl Into<String>,
        topic: impl Into<String>,
        private_channel: bool,
    ) -> Self {
        Self {
            topic: Some(topic.into()),
            private_channel: Some(private_channel),
            response: Some(true),
            ..Self::new(MessageType::Unsubscribe, id)
        }
    }

    /// Parse a text frame
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize for the socket
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// `(code, message)` of an `error` frame
    pub fn error_detail(&self) -> (String, String) {
        let code = match &self.code {
            Some(serde_json::Value::String(code)) => code.clone(),
            Some(other) => other.to_string(),
            None => "unknown".to_string(),
        };
        let message = match &self.data {
            Some(serde_json::Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        };
        (code, message)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

/// A push message as delivered to one subscription
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    pub subscription_id: String,
    pub topic: String,
    pub subject: String,
    pub sn: Option<u64>,
    /// Raw `data` payload shared by every subscriber of the topic
    pub data: Arc<serde_json::Value>,
}
