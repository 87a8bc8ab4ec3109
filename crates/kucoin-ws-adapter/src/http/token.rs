/*
[INPUT]:  REST client, feed visibility (public/private)
[OUTPUT]: One-time connection token plus candidate push endpoints
[POS]:    HTTP layer - token collaborator consumed once per connect cycle
[UPDATE]: When token endpoints or the instance server schema change
*/

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use tracing::{debug, info};

use crate::http::{RestClient, Result, WsError};
use crate::types::{InstanceServer, TokenResponse};

const PATH_PUBLIC: &str = "/api/v1/bullet-public";
const PATH_PRIVATE: &str = "/api/v1/bullet-private";

/// Connection token and the servers it is valid for
#[derive(Debug, Clone, PartialEq)]
pub struct WsToken {
    pub token: String,
    pub endpoints: Vec<Endpoint>,
}

/// One candidate push server
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub url: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub encrypt: bool,
}

impl Endpoint {
    /// Socket URL carrying the token and a unique connect id
    pub fn connect_url(&self, token: &str, connect_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        url.query_pairs_mut()
            .append_pair("token", token)
            .append_pair("connectId", connect_id);
        Ok(url)
    }
}

impl TryFrom<InstanceServer> for Endpoint {
    type Error = WsError;

    fn try_from(server: InstanceServer) -> Result<Self> {
        if server.ping_interval == 0 || server.ping_timeout == 0 {
            return Err(WsError::InvalidResponse(format!(
                "instance server {} has zero ping interval/timeout",
                server.endpoint
            )));
        }
        Ok(Self {
            url: server.endpoint,
            ping_interval: Duration::from_millis(server.ping_interval),
            ping_timeout: Duration::from_millis(server.ping_timeout),
            encrypt: server.encrypt,
        })
    }
}

/// Obtains a fresh connection token. Tokens are single use, so the engine
/// calls this on every connect and reconnect; retries belong to the caller.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self, private: bool) -> Result<WsToken>;
}

/// Token provider backed by the bullet REST endpoints
#[derive(Debug, Clone)]
pub struct RestTokenProvider {
    client: RestClient,
}

impl RestTokenProvider {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &RestClient {
        &self.client
    }
}

#[async_trait]
impl TokenProvider for RestTokenProvider {
    async fn fetch_token(&self, private: bool) -> Result<WsToken> {
        let builder = if private {
            self.client.signed_request(Method::POST, PATH_PRIVATE, "")?
        } else {
            self.client.request(Method::POST, PATH_PUBLIC)?
        };

        let response: TokenResponse = self.client.send_json(builder).await?;
        let token = validate_token(response)?;
        info!(
            private,
            endpoints = token.endpoints.len(),
            "ws connection token acquired"
        );
        Ok(token)
    }
}

fn validate_token(response: TokenResponse) -> Result<WsToken> {
    if response.token.is_empty() {
        return Err(WsError::InvalidResponse("empty connection token".to_string()));
    }
    if response.instance_servers.is_empty() {
        return Err(WsError::InvalidResponse("empty instance server list".to_string()));
    }

    let endpoints = response
        .instance_servers
        .into_iter()
        .map(Endpoint::try_from)
        .collect::<Result<Vec<_>>>()?;
    debug!(count = endpoints.len(), "instance servers validated");

    Ok(WsToken {
        token: response.token,
        endpoints,
    })
}
