//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rate_coordinator::collector::CoordinatorCallback;
use rate_coordinator::publisher::RatePublisher;
use rate_coordinator::{AvailabilityStatus, Quote, QuoteDelta};

/// Connector events as seen by the coordinator side.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connect(bool),
    Disconnect(bool),
    Available(String, f64, f64),
    Update(String, f64, f64),
    Status(String, AvailabilityStatus),
}

/// Callback that records every event it receives.
#[derive(Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<Event>>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| matches(e)).count()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl CoordinatorCallback for RecordingCallback {
    async fn on_connect(&self, _platform: &str, success: bool) {
        self.push(Event::Connect(success));
    }

    async fn on_disconnect(&self, _platform: &str, success: bool) {
        self.push(Event::Disconnect(success));
    }

    async fn on_rate_available(&self, _platform: &str, instrument: &str, quote: Quote) {
        self.push(Event::Available(instrument.to_string(), quote.bid, quote.ask));
    }

    async fn on_rate_update(&self, _platform: &str, instrument: &str, delta: QuoteDelta) {
        self.push(Event::Update(instrument.to_string(), delta.bid, delta.ask));
    }

    async fn on_rate_status(&self, _platform: &str, instrument: &str, status: AvailabilityStatus) {
        self.push(Event::Status(instrument.to_string(), status));
    }
}

/// Publisher that keeps every quote it was handed.
#[derive(Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<Quote>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Quote> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_for(&self, instrument: &str) -> Vec<Quote> {
        self.sent()
            .into_iter()
            .filter(|q| q.instrument_name == instrument)
            .collect()
    }
}

impl RatePublisher for RecordingPublisher {
    fn send_rate(&self, quote: &Quote) {
        self.sent.lock().unwrap().push(quote.clone());
    }
}

/// Polls `condition` every 10ms until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;

    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    condition()
}

pub fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
