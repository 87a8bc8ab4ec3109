/*
[INPUT]:  REST/WS configuration, optional request signer, feed selection
[OUTPUT]: Unstarted WsEngine instances bound to the right token endpoint
[POS]:    Service layer - per-feed engine factory used by market facades
[UPDATE]: When adding feeds or changing how engines are wired
*/

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::http::{ClientConfig, RequestSigner, RestClient, RestTokenProvider, Result, WsError};
use crate::types::{Domain, MarketFeed};
use crate::ws::{WsClientConfig, WsEngine};

/// Builds one engine per market feed from shared settings
#[derive(Clone, Default)]
pub struct WsService {
    rest: ClientConfig,
    ws: WsClientConfig,
    signer: Option<Arc<dyn RequestSigner>>,
    base_urls: HashMap<Domain, String>,
}

impl std::fmt::Debug for WsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsService")
            .field("rest", &self.rest)
            .field("ws", &self.ws)
            .field("signed", &self.signer.is_some())
            .field("base_urls", &self.base_urls)
            .finish()
    }
}

impl WsService {
    pub fn new(rest: ClientConfig, ws: WsClientConfig) -> Self {
        Self {
            rest,
            ws,
            signer: None,
            base_urls: HashMap::new(),
        }
    }

    /// Signer used for private token requests
    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Override the REST base URL of a domain (testnets, proxies)
    pub fn with_base_url(mut self, domain: Domain, base_url: impl Into<String>) -> Self {
        self.base_urls.insert(domain, base_url.into());
        self
    }

    pub fn ws_config(&self) -> &WsClientConfig {
        &self.ws
    }

    /// Engine for `feed`, not yet started
    pub fn engine(&self, feed: MarketFeed) -> Result<WsEngine> {
        if feed.is_private() && self.signer.is_none() {
            return Err(WsError::Config(format!(
                "{feed} needs a request signer for its private token"
            )));
        }
        self.ws.validate()?;

        let domain = feed.domain();
        let base_url = self
            .base_urls
            .get(&domain)
            .map(String::as_str)
            .unwrap_or(domain.default_base_url());
        let mut client = RestClient::with_config_and_base_url(self.rest.clone(), base_url)?;
        if let Some(signer) = &self.signer {
            client.set_signer(signer.clone());
        }

        debug!(%feed, base_url, "ws engine created");
        Ok(WsEngine::new(
            Arc::new(RestTokenProvider::new(client)),
            feed.is_private(),
            self.ws.clone(),
        ))
    }
}
