/*
[INPUT]:  HTTP configuration (base URL, timeouts, optional request signer)
[OUTPUT]: Configured reqwest client and decoded REST envelopes
[POS]:    HTTP layer - core client implementation
[UPDATE]: When adding connection options or changing envelope handling
*/

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::http::{RequestSigner, Result, WsError};
use crate::types::{Domain, RESULT_CODE_SUCCESS, RestEnvelope};

const ERROR_BODY_MAX_BYTES: usize = 512;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// REST client bound to one domain base URL
#[derive(Clone)]
pub struct RestClient {
    http_client: Client,
    base_url: Url,
    signer: Option<Arc<dyn RequestSigner>>,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url.as_str())
            .field("signed", &self.signer.is_some())
            .finish()
    }
}

impl RestClient {
    /// Create a new client for a domain with default configuration
    pub fn new(domain: Domain) -> Result<Self> {
        Self::with_config(ClientConfig::default(), domain)
    }

    /// Create a new client for a domain with custom configuration
    pub fn with_config(config: ClientConfig, domain: Domain) -> Result<Self> {
        Self::with_config_and_base_url(config, domain.default_base_url())
    }

    /// Create a new client against an explicit base URL
    pub fn with_config_and_base_url(config: ClientConfig, base_url: &str) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            http_client,
            base_url: Url::parse(base_url)?,
            signer: None,
        })
    }

    /// Set the signer used for authenticated requests
    pub fn set_signer(&mut self, signer: Arc<dyn RequestSigner>) {
        self.signer = Some(signer);
    }

    pub fn has_signer(&self) -> bool {
        self.signer.is_some()
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build request builder for an endpoint path
    pub(crate) fn request(&self, method: Method, endpoint: &str) -> Result<RequestBuilder> {
        let url = self.base_url.join(endpoint)?;
        Ok(self.http_client.request(method, url))
    }

    /// Build request builder carrying the signer's headers
    pub(crate) fn signed_request(
        &self,
        method: Method,
        endpoint: &str,
        body: &str,
    ) -> Result<RequestBuilder> {
        let signer = self.signer.as_ref().ok_or_else(|| WsError::AuthFailure {
            message: format!("no request signer configured for {endpoint}"),
        })?;

        let headers = signer.sign(method.as_str(), endpoint, body)?;
        let mut builder = self.request(method, endpoint)?;
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        Ok(builder)
    }

    /// Send a request and unwrap the `{code, data, msg}` envelope
    pub(crate) async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(status = status.as_u16(), bytes = body.len(), "rest response received");

        if !status.is_success() {
            // Some gateways still return an envelope on 4xx; prefer its code.
            if let Ok(envelope) = serde_json::from_str::<RestEnvelope<serde_json::Value>>(&body)
                && envelope.code != RESULT_CODE_SUCCESS
                && !status.is_server_error()
            {
                let message = envelope.message.unwrap_or_default();
                return Err(match WsError::from_api_code(envelope.code, message.clone()) {
                    WsError::Api { .. } => WsError::from_status(status, message),
                    auth => auth,
                });
            }
            return Err(WsError::from_status(
                status,
                truncate_for_log(&body, ERROR_BODY_MAX_BYTES),
            ));
        }

        let envelope: RestEnvelope<T> = serde_json::from_str(&body)?;
        if envelope.code != RESULT_CODE_SUCCESS {
            return Err(WsError::from_api_code(
                envelope.code,
                envelope.message.unwrap_or_default(),
            ));
        }

        envelope
            .data
            .ok_or_else(|| WsError::InvalidResponse("envelope without data".to_string()))
    }
}

pub(crate) fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut cut = max_len;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = String::with_capacity(cut + 3);
    out.push_str(&value[..cut]);
    out.push_str("...");
    out
}
