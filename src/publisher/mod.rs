//! Outbound distribution of accepted rates
//!
//! The coordinator only sees `RatePublisher`; the transport behind it
//! is chosen at startup:
//! - `LogPublisher`:   demo mode, payloads are only logged
//! - `RateStreamPool`: persistent WebSocket connections to the
//!   distribution endpoint

pub mod stream;

use std::sync::Arc;

use log::info;
use serde_json::{Value, json};

use crate::config::PublisherConfig;
use crate::metrics::{METRICS, incr};
use crate::schema::Quote;
use crate::util;

pub use stream::RateStreamPool;

/// Fire-and-forget sink for accepted rates.
///
/// CONTRACT:
/// - Must never block the caller (connector tasks call this inline)
/// - Failures are logged and counted, never returned
pub trait RatePublisher: Send + Sync {
    fn send_rate(&self, quote: &Quote);
}

/// Wire payload: `<instrumentName>|<bid>|<ask>|<timestamp>`.
pub fn encode(quote: &Quote) -> String {
    format!(
        "{}|{}|{}|{}",
        quote.instrument_name,
        quote.bid,
        quote.ask,
        util::format_timestamp(&quote.observed_at)
    )
}

/// Keyed frame sent on the stream: the key keeps one instrument's
/// updates on one partition downstream.
pub fn frame(quote: &Quote) -> Value {
    json!({
        "key": quote.instrument_name,
        "value": encode(quote),
    })
}

/// Demo publisher: logs every payload, sends nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl RatePublisher for LogPublisher {
    fn send_rate(&self, quote: &Quote) {
        info!("DEMO -> {}", encode(quote));
        incr(&METRICS.rates_published);
    }
}

/// Builds the configured publisher.
///
/// LOGIN FORMAT:
/// - key=<KEY>&role=coordinator
pub fn build_publisher(cfg: &PublisherConfig, debug: bool) -> Arc<dyn RatePublisher> {
    if cfg.demo.unwrap_or(false) {
        info!("Publisher running in DEMO mode");
        return Arc::new(LogPublisher);
    }

    let login = format!("key={}&role=coordinator", cfg.key);
    Arc::new(RateStreamPool::new(
        cfg.url.clone(),
        login,
        debug,
        cfg.connections.max(1),
    ))
}
