use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{MissedTickBehavior, interval, sleep};

use super::base::{Collector, CollectorBase, HealthCheck, STOP_TIMEOUT, cancelled, spawn_health_check};
use super::{CoordinatorCallback, Credentials, PlatformConnector};
use crate::config::PlatformConfig;
use crate::metrics::{METRICS, incr};
use crate::schema::AvailabilityStatus;
use crate::util::{self, read, write};

/// Errors raised while fetching one instrument.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Not connected")]
    NotConnected,

    #[error("Unexpected HTTP status {0}")]
    Status(StatusCode),

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed body: {0}")]
    Body(String),
}

impl FetchError {
    /// A non-200 answer means the platform does not serve the instrument
    /// right now; anything else is an error.
    pub fn status(&self) -> AvailabilityStatus {
        match self {
            FetchError::Status(_) => AvailabilityStatus::Unavailable,
            _ => AvailabilityStatus::Error,
        }
    }
}

/// Body of `GET <baseUrl>/<instrument>`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateResponse {
    #[serde(default)]
    rate_name: Option<String>,
    bid: f64,
    ask: f64,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RestSettings {
    /// Candidate base URLs in priority order
    pub base_urls: Vec<String>,
    pub retry_count: u32,
    pub retry_interval: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub health: HealthCheck,
    pub credentials: Credentials,
}

impl RestSettings {
    pub fn new(base_urls: Vec<String>) -> Self {
        Self {
            base_urls,
            retry_count: 5,
            retry_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            health: HealthCheck::default(),
            credentials: Credentials::default(),
        }
    }

    pub fn from_config(cfg: &PlatformConfig) -> Self {
        Self {
            base_urls: cfg.base_urls.clone(),
            retry_count: cfg.retry_count,
            retry_interval: cfg.retry_interval(),
            poll_interval: cfg.poll_interval(),
            request_timeout: cfg.request_timeout(),
            health: HealthCheck {
                interval: cfg.health_check_interval(),
                timeout: cfg.health_timeout(),
            },
            credentials: Credentials {
                user: cfg.user.clone(),
                password: cfg.password.clone(),
            },
        }
    }
}

/// Polling connector over stateless HTTP.
///
/// - `connect` probes the candidate base URLs in priority order; the
///   first one answering 200 is pinned for the connector's lifetime
/// - `subscribe` fetches the instrument immediately
/// - a scheduler re-fetches every subscription each `poll_interval`
///
/// A failed fetch reports a status for that instrument only; siblings
/// in the same tick are unaffected.
pub struct RestConnector {
    base: CollectorBase,
    settings: RestSettings,
    client: Client,

    pinned: RwLock<Option<String>>,
    connected: AtomicBool,
    connecting: AsyncMutex<()>,
}

impl RestConnector {
    pub fn new(platform: &str, settings: RestSettings) -> Arc<Self> {
        Arc::new(Self {
            base: CollectorBase::new(platform, settings.credentials.clone(), settings.health),
            settings,
            client: Client::new(),
            pinned: RwLock::new(None),
            connected: AtomicBool::new(false),
            connecting: AsyncMutex::new(()),
        })
    }

    pub fn from_config(cfg: &PlatformConfig) -> Arc<Self> {
        Self::new(&cfg.name, RestSettings::from_config(cfg))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Base URL chosen by the first successful probe.
    pub fn pinned_url(&self) -> Option<String> {
        read(&self.pinned).clone()
    }

    async fn probe(&self, url: &str) -> bool {
        match self
            .client
            .get(url)
            .timeout(self.settings.request_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status() == StatusCode::OK => true,
            Ok(resp) => {
                warn!("[{}] probe {} answered {}", self.base.platform(), url, resp.status());
                false
            }
            Err(e) => {
                warn!("[{}] probe {} failed: {}", self.base.platform(), url, e);
                false
            }
        }
    }

    async fn fetch(&self, instrument: &str) -> Result<(f64, f64, DateTime<Utc>), FetchError> {
        let base_url = self.pinned_url().ok_or(FetchError::NotConnected)?;
        let url = format!("{}/{}", base_url.trim_end_matches('/'), instrument);

        let resp = self
            .client
            .get(&url)
            .timeout(self.settings.request_timeout)
            .send()
            .await?;

        if resp.status() != StatusCode::OK {
            return Err(FetchError::Status(resp.status()));
        }

        let body = resp.text().await?;
        let rate: RateResponse =
            serde_json::from_str(&body).map_err(|e| FetchError::Body(e.to_string()))?;

        if !rate.bid.is_finite() || !rate.ask.is_finite() {
            return Err(FetchError::Body(format!("non-finite price in {}", body)));
        }

        if let Some(name) = rate.rate_name.as_deref() {
            if name != instrument {
                debug!(
                    "[{}] asked for {}, body names {}",
                    self.base.platform(),
                    instrument,
                    name
                );
            }
        }

        let observed_at = match rate.timestamp.as_deref() {
            Some(raw) => util::parse_timestamp_or_now(raw, instrument),
            None => util::now(),
        };

        Ok((rate.bid, rate.ask, observed_at))
    }

    /// Fetches one instrument and reports either the quote or a status.
    async fn fetch_and_emit(&self, instrument: &str) -> bool {
        match self.fetch(instrument).await {
            Ok((bid, ask, observed_at)) => {
                self.base.emit_quote(instrument, bid, ask, observed_at).await;
                true
            }
            Err(e) => {
                incr(&METRICS.fetch_errors);
                warn!("[{}] fetch {} failed: {}", self.base.platform(), instrument, e);
                self.base.report_status(instrument, e.status()).await;
                false
            }
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let credentials = self.base.credentials().clone();
        let mut shutdown = self.base.shutdown_signal();

        tokio::select! {
            _ = self.connect(&credentials) => {}
            _ = cancelled(&mut shutdown) => return,
        }

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancelled(&mut shutdown) => break,
            }

            if !self.is_connected() {
                continue;
            }

            let tick = async {
                for instrument in self.base.subscriptions() {
                    self.fetch_and_emit(&instrument).await;
                }
            };

            tokio::select! {
                _ = tick => {}
                _ = cancelled(&mut shutdown) => break,
            }
        }

        debug!("[{}] poll loop stopped", self.base.platform());
    }
}

impl Collector for RestConnector {
    fn base(&self) -> &CollectorBase {
        &self.base
    }
}

#[async_trait]
impl PlatformConnector for RestConnector {
    fn platform_name(&self) -> &str {
        self.base.platform()
    }

    fn set_callback(&self, callback: Weak<dyn CoordinatorCallback>) {
        self.base.set_callback(callback);
    }

    async fn connect(&self, _credentials: &Credentials) -> bool {
        let _guard = self.connecting.lock().await;
        let platform = self.base.platform();

        if self.is_connected() {
            debug!("[{}] already connected", platform);
            return true;
        }

        let candidates = match self.pinned_url() {
            Some(url) => vec![url],
            None => self.settings.base_urls.clone(),
        };

        let attempts = self.settings.retry_count.max(1);
        let mut shutdown = self.base.shutdown_signal();

        for attempt in 1..=attempts {
            for url in &candidates {
                info!("[{}] probing {} (attempt {}/{})", platform, url, attempt, attempts);

                if self.probe(url).await {
                    write(&self.pinned).get_or_insert_with(|| url.clone());
                    self.connected.store(true, Ordering::Release);
                    self.base.touch();

                    info!("[{}] connected via {}", platform, url);
                    self.base.report_connect(true).await;
                    return true;
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = sleep(self.settings.retry_interval) => {}
                    _ = cancelled(&mut shutdown) => break,
                }
            }
        }

        error!("[{}] no reachable endpoint after {} attempt(s)", platform, attempts);
        self.base.report_connect(false).await;
        false
    }

    async fn disconnect(&self, _credentials: &Credentials) -> bool {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!("[{}] disconnected", self.base.platform());
            self.base.report_disconnect(true).await;
        }
        true
    }

    async fn subscribe(&self, instrument: &str) -> bool {
        if instrument.trim().is_empty() {
            return false;
        }

        if !self.base.add_subscription(instrument) {
            debug!("[{}] already subscribed to {}", self.base.platform(), instrument);
            return true;
        }

        if self.is_connected() {
            self.fetch_and_emit(instrument).await;
        }
        true
    }

    async fn unsubscribe(&self, instrument: &str) -> bool {
        self.base.remove_subscription(instrument)
    }

    fn subscriptions(&self) -> Vec<String> {
        self.base.subscriptions()
    }

    fn start(self: Arc<Self>) -> bool {
        if !self.base.begin() {
            warn!("[{}] already running", self.base.platform());
            return false;
        }

        info!(
            "[{}] starting polling connector (every {:?})",
            self.base.platform(),
            self.settings.poll_interval
        );

        self.base.track(tokio::spawn(self.clone().poll_loop()));
        self.base.track(spawn_health_check(self.clone()));
        true
    }

    async fn stop(&self) {
        info!("[{}] stopping polling connector", self.base.platform());

        self.base.signal_stop();
        self.base.clear_subscriptions();

        let credentials = self.base.credentials().clone();
        self.disconnect(&credentials).await;
        self.base.finish(STOP_TIMEOUT).await;

        info!("[{}] polling connector stopped", self.base.platform());
    }

    fn terminate(&self) {
        self.base.abort_all();
        self.connected.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_200_is_unavailable_other_failures_are_errors() {
        assert_eq!(
            FetchError::Status(StatusCode::NOT_FOUND).status(),
            AvailabilityStatus::Unavailable
        );
        assert_eq!(FetchError::Body("x".into()).status(), AvailabilityStatus::Error);
        assert_eq!(FetchError::NotConnected.status(), AvailabilityStatus::Error);
    }

    #[test]
    fn parses_simulator_body() {
        let body = r#"{"rateName":"PF2_USDTRY","bid":34.44,"ask":35.45,"timestamp":"2024-12-16T16:07:15.504"}"#;
        let rate: RateResponse = serde_json::from_str(body).unwrap();

        assert_eq!(rate.rate_name.as_deref(), Some("PF2_USDTRY"));
        assert_eq!(rate.bid, 34.44);
        assert_eq!(rate.ask, 35.45);
        assert!(rate.timestamp.is_some());
    }

    #[tokio::test]
    async fn unreachable_candidates_exhaust_retries() {
        let connector = RestConnector::new(
            "PF2",
            RestSettings {
                retry_count: 2,
                retry_interval: Duration::from_millis(10),
                request_timeout: Duration::from_millis(200),
                ..RestSettings::new(vec!["http://127.0.0.1:1/api/rates".into()])
            },
        );

        assert!(!connector.connect(&Credentials::default()).await);
        assert!(!connector.is_connected());
        assert!(connector.pinned_url().is_none());

        // subscriptions are recorded even while disconnected
        assert!(connector.subscribe("PF2_USDTRY").await);
        assert_eq!(connector.subscriptions(), vec!["PF2_USDTRY".to_string()]);
        assert!(connector.disconnect(&Credentials::default()).await);
    }
}
