/*
[INPUT]:  Exchange domain layout and feed visibility
[OUTPUT]: Typed Rust enums with serialization support
[POS]:    Data layer - feed and domain selection
[UPDATE]: When the exchange adds a domain or a new feed family
*/

use serde::{Deserialize, Serialize};

/// REST domain a token request is sent to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Spot,
    Futures,
}

impl Domain {
    /// Default REST base URL for the domain
    pub fn default_base_url(self) -> &'static str {
        match self {
            Domain::Spot => "https://api.kucoin.com",
            Domain::Futures => "https://api-futures.kucoin.com",
        }
    }
}

/// One push feed: a market family plus public/private visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketFeed {
    SpotPublic,
    SpotPrivate,
    MarginPublic,
    MarginPrivate,
    FuturesPublic,
    FuturesPrivate,
}

impl MarketFeed {
    /// Margin feeds share the spot domain
    pub fn domain(self) -> Domain {
        match self {
            MarketFeed::SpotPublic
            | MarketFeed::SpotPrivate
            | MarketFeed::MarginPublic
            | MarketFeed::MarginPrivate => Domain::Spot,
            MarketFeed::FuturesPublic | MarketFeed::FuturesPrivate => Domain::Futures,
        }
    }

    pub fn is_private(self) -> bool {
        matches!(
            self,
            MarketFeed::SpotPrivate | MarketFeed::MarginPrivate | MarketFeed::FuturesPrivate
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MarketFeed::SpotPublic => "spot_public",
            MarketFeed::SpotPrivate => "spot_private",
            MarketFeed::MarginPublic => "margin_public",
            MarketFeed::MarginPrivate => "margin_private",
            MarketFeed::FuturesPublic => "futures_public",
            MarketFeed::FuturesPrivate => "futures_private",
        }
    }
}

impl std::fmt::Display for MarketFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of the engine's current connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}
