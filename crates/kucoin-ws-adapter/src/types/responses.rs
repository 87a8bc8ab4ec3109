/*
[INPUT]:  Token endpoint JSON schema
[OUTPUT]: Typed Rust response structs with serialization support
[POS]:    Data layer - REST envelope and connection token types
[UPDATE]: When the token endpoint schema changes
*/

use serde::{Deserialize, Serialize};

/// Success code carried by every REST envelope
pub const RESULT_CODE_SUCCESS: &str = "200000";

/// Generic REST envelope `{code, data, msg}`
#[derive(Debug, Clone, Deserialize)]
pub struct RestEnvelope<T> {
    pub code: String,
    pub data: Option<T>,
    #[serde(rename = "msg", default)]
    pub message: Option<String>,
}

/// Body of the bullet-public / bullet-private response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    #[serde(rename = "instanceServers", default)]
    pub instance_servers: Vec<InstanceServer>,
}

/// One candidate push server returned with the token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceServer {
    pub endpoint: String,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Milliseconds between client pings
    #[serde(rename = "pingInterval")]
    pub ping_interval: u64,
    /// Milliseconds to wait for a pong
    #[serde(rename = "pingTimeout")]
    pub ping_timeout: u64,
}

fn default_protocol() -> String {
    "websocket".to_string()
}
