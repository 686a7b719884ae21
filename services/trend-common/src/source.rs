//! Identifiers for data providers and completeness sources.
//!
//! Providers are the live collaborators the router can call. Sources are the
//! four presence flags tracked per symbol; the two broker sources map onto
//! providers, the other two are filled by offline imports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A live market-data provider known to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    PrimaryBroker,
    SecondaryBroker,
}

impl ProviderId {
    pub const ALL: [ProviderId; 2] = [ProviderId::PrimaryBroker, ProviderId::SecondaryBroker];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryBroker => "primary_broker",
            Self::SecondaryBroker => "secondary_broker",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "primary_broker" => Some(Self::PrimaryBroker),
            "secondary_broker" => Some(Self::SecondaryBroker),
            _ => None,
        }
    }

    /// Completeness source fed by this provider.
    pub fn source(&self) -> SourceId {
        match self {
            Self::PrimaryBroker => SourceId::PrimaryBroker,
            Self::SecondaryBroker => SourceId::SecondaryBroker,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the four per-symbol data sources counted by completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    /// Screener import (fundamentals, moving averages)
    Finviz,
    /// Options analytics import (IVR, relative volume)
    MarketOptions,
    PrimaryBroker,
    SecondaryBroker,
}

impl SourceId {
    pub const ALL: [SourceId; 4] = [
        SourceId::Finviz,
        SourceId::MarketOptions,
        SourceId::PrimaryBroker,
        SourceId::SecondaryBroker,
    ];

    /// Number of sources a symbol needs for 100% coverage.
    pub const COUNT: usize = 4;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finviz => "finviz",
            Self::MarketOptions => "market_options",
            Self::PrimaryBroker => "primary_broker",
            Self::SecondaryBroker => "secondary_broker",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "finviz" => Some(Self::Finviz),
            "market_options" => Some(Self::MarketOptions),
            "primary_broker" => Some(Self::PrimaryBroker),
            "secondary_broker" => Some(Self::SecondaryBroker),
            _ => None,
        }
    }

    /// Position in fixed-size flag arrays.
    pub fn index(&self) -> usize {
        match self {
            Self::Finviz => 0,
            Self::MarketOptions => 1,
            Self::PrimaryBroker => 2,
            Self::SecondaryBroker => 3,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
