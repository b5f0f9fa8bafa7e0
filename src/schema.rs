use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util;

/// Canonical quote record used across the whole pipeline.
///
/// A quote travels from:
/// - Platform connectors (raw feed rates such as `PF1_USDTRY`)
/// - The calculator (derived rates such as `USDTRY`)
/// - The rate cache
/// - The outbound publisher
///
/// IDENTITY:
/// - The "latest resolved" view is keyed by `instrument_name` alone.
/// - Per-source lookups use `(source_platform, instrument_name)`.
///
/// `ask > bid` is a producer invariant and is not re-validated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Instrument identifier, e.g. `PF1_USDTRY` or `USDTRY`
    pub instrument_name: String,

    /// Upstream platform name; empty for derived instruments
    pub source_platform: String,

    pub bid: f64,
    pub ask: f64,

    /// Producer-supplied or collector-stamped observation time
    pub observed_at: DateTime<Utc>,

    pub is_derived: bool,
}

impl Quote {
    /// Builds a quote observed directly on an upstream platform.
    pub fn raw(
        platform: &str,
        instrument: &str,
        bid: f64,
        ask: f64,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument_name: instrument.to_string(),
            source_platform: platform.to_string(),
            bid,
            ask,
            observed_at,
            is_derived: false,
        }
    }

    /// Builds a quote computed from other cached quotes.
    pub fn derived(instrument: &str, bid: f64, ask: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            instrument_name: instrument.to_string(),
            source_platform: String::new(),
            bid,
            ask,
            observed_at,
            is_derived: true,
        }
    }

    /// Applies a partial update while keeping identity and the derived flag.
    pub fn with_delta(&self, delta: &QuoteDelta) -> Self {
        Self {
            instrument_name: self.instrument_name.clone(),
            source_platform: self.source_platform.clone(),
            bid: delta.bid,
            ask: delta.ask,
            observed_at: delta.observed_at,
            is_derived: self.is_derived,
        }
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] bid={} ask={} at={}{}",
            self.instrument_name,
            if self.source_platform.is_empty() { "-" } else { self.source_platform.as_str() },
            self.bid,
            self.ask,
            util::format_timestamp(&self.observed_at),
            if self.is_derived { " (derived)" } else { "" },
        )
    }
}

// ------------------------------------------------------------
// Partial update
// ------------------------------------------------------------
//
// Emitted by connectors for every observation after the first.
// The coordinator rebuilds a full Quote from the cached entry.
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteDelta {
    pub bid: f64,
    pub ask: f64,
    pub observed_at: DateTime<Utc>,
}

/// Availability reported per `(platform, instrument)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityStatus {
    Available,
    Unavailable,
    Stale,
    Error,
}

impl AvailabilityStatus {
    /// `Unavailable` and `Error` evict the pair's cached entry.
    pub fn evicts(self) -> bool {
        matches!(self, Self::Unavailable | Self::Error)
    }
}

impl fmt::Display for AvailabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "AVAILABLE"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
            Self::Stale => write!(f, "STALE"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}
