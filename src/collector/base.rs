use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};

use super::{CoordinatorCallback, Credentials, PlatformConnector};
use crate::metrics::{METRICS, incr};
use crate::schema::{AvailabilityStatus, Quote, QuoteDelta};
use crate::util::{lock, read, write};

/// Bounded wait for spawned tasks during `stop`.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Health-check timer settings.
#[derive(Debug, Clone, Copy)]
pub struct HealthCheck {
    /// How often the idle time is compared against `timeout`
    pub interval: Duration,

    /// Idle time after which the connector is considered stale
    pub timeout: Duration,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Shared state composed into every concrete connector.
///
/// Responsibilities:
/// - Track the subscription set (survives reconnects)
/// - Track which instruments were already reported as available
/// - Record the time of the last upstream response
/// - Hold the callback, the shutdown signal and spawned task handles
///
/// LOCKS:
/// - All locks are std locks held for short, non-async sections only
/// - Never hold a lock across an `.await`
pub struct CollectorBase {
    platform: String,
    credentials: Credentials,
    health: HealthCheck,

    callback: RwLock<Option<Weak<dyn CoordinatorCallback>>>,

    subscriptions: Mutex<BTreeSet<String>>,
    observed: Mutex<HashSet<String>>,
    last_response: Mutex<Instant>,

    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Access to the shared base of a concrete connector.
pub trait Collector: PlatformConnector + 'static {
    fn base(&self) -> &CollectorBase;
}

impl CollectorBase {
    pub fn new(platform: &str, credentials: Credentials, health: HealthCheck) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            platform: platform.to_string(),
            credentials,
            health,
            callback: RwLock::new(None),
            subscriptions: Mutex::new(BTreeSet::new()),
            observed: Mutex::new(HashSet::new()),
            last_response: Mutex::new(Instant::now()),
            running: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn health(&self) -> HealthCheck {
        self.health
    }

    pub fn set_callback(&self, callback: Weak<dyn CoordinatorCallback>) {
        *write(&self.callback) = Some(callback);
    }

    fn callback(&self) -> Option<Arc<dyn CoordinatorCallback>> {
        read(&self.callback).as_ref().and_then(Weak::upgrade)
    }

    // --------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------

    /// Marks the connector running. Returns `false` if it already was.
    pub fn begin(&self) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.shutdown.send_replace(false);
        self.touch();
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signals every task to wind down without waiting for them.
    pub fn signal_stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// `true` between `signal_stop` (or `finish`) and the next `begin`.
    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Keeps `handle` for `finish`; finished handles are dropped here.
    pub fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Signals shutdown and joins every tracked task, aborting the
    /// ones still alive after `timeout`.
    pub async fn finish(&self, timeout: Duration) {
        self.shutdown.send_replace(true);

        let handles = std::mem::take(&mut *lock(&self.tasks));
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
            warn!(
                "[{}] tasks did not stop within {:?}, aborting",
                self.platform, timeout
            );
            aborts.iter().for_each(|a| a.abort());
        }

        self.running.store(false, Ordering::Release);
    }

    /// Aborts every tracked task immediately.
    pub fn abort_all(&self) {
        self.shutdown.send_replace(true);

        for handle in std::mem::take(&mut *lock(&self.tasks)) {
            handle.abort();
        }

        self.running.store(false, Ordering::Release);
    }

    // --------------------------------------------------------
    // Subscriptions
    // --------------------------------------------------------

    /// Direct access for callers that must act atomically with the set.
    pub fn lock_subscriptions(&self) -> MutexGuard<'_, BTreeSet<String>> {
        lock(&self.subscriptions)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).iter().cloned().collect()
    }

    pub fn is_subscribed(&self, instrument: &str) -> bool {
        lock(&self.subscriptions).contains(instrument)
    }

    pub fn add_subscription(&self, instrument: &str) -> bool {
        lock(&self.subscriptions).insert(instrument.to_string())
    }

    pub fn remove_subscription(&self, instrument: &str) -> bool {
        let removed = lock(&self.subscriptions).remove(instrument);
        self.forget(instrument);
        removed
    }

    pub fn clear_subscriptions(&self) -> Vec<String> {
        let drained = std::mem::take(&mut *lock(&self.subscriptions));
        self.forget_all();
        drained.into_iter().collect()
    }

    // --------------------------------------------------------
    // Observation tracking
    // --------------------------------------------------------

    /// Returns `true` on the first sighting since the last `forget`.
    fn observe(&self, instrument: &str) -> bool {
        lock(&self.observed).insert(instrument.to_string())
    }

    pub fn forget(&self, instrument: &str) {
        lock(&self.observed).remove(instrument);
    }

    pub fn forget_all(&self) {
        lock(&self.observed).clear();
    }

    pub fn touch(&self) {
        *lock(&self.last_response) = Instant::now();
    }

    pub fn since_last_response(&self) -> Duration {
        lock(&self.last_response).elapsed()
    }

    // --------------------------------------------------------
    // Event reporting
    // --------------------------------------------------------

    /// Reports one observation: "available" on first sight, "update"
    /// afterwards.
    pub async fn emit_quote(&self, instrument: &str, bid: f64, ask: f64, observed_at: DateTime<Utc>) {
        self.touch();
        incr(&METRICS.quotes_received);

        let Some(callback) = self.callback() else {
            debug!("[{}] no callback bound, dropping {}", self.platform, instrument);
            return;
        };

        if self.observe(instrument) {
            let quote = Quote::raw(&self.platform, instrument, bid, ask, observed_at);
            callback.on_rate_available(&self.platform, instrument, quote).await;
        } else {
            let delta = QuoteDelta { bid, ask, observed_at };
            callback.on_rate_update(&self.platform, instrument, delta).await;
        }
    }

    /// Reports a status; evicting statuses also reset first-sight tracking
    /// so the next good sample is reported as available again.
    pub async fn report_status(&self, instrument: &str, status: AvailabilityStatus) {
        if status.evicts() {
            self.forget(instrument);
        }

        if let Some(callback) = self.callback() {
            callback.on_rate_status(&self.platform, instrument, status).await;
        }
    }

    pub async fn report_unavailable_all(&self) {
        self.forget_all();

        for instrument in self.subscriptions() {
            self.report_status(&instrument, AvailabilityStatus::Unavailable).await;
        }
    }

    pub async fn report_connect(&self, success: bool) {
        if let Some(callback) = self.callback() {
            callback.on_connect(&self.platform, success).await;
        }
    }

    pub async fn report_disconnect(&self, success: bool) {
        if let Some(callback) = self.callback() {
            callback.on_disconnect(&self.platform, success).await;
        }
    }
}

/// Resolves once shutdown is signalled (or the signal is gone).
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Spawns the periodic health check for `connector`.
///
/// On every tick the idle time since the last upstream response is
/// compared against the configured timeout. When exceeded:
/// - every subscription is reported `Unavailable`
/// - the connector is disconnected and reconnected
///
/// A connector without subscriptions is never considered stale.
pub fn spawn_health_check<C: Collector>(connector: Arc<C>) -> JoinHandle<()> {
    let mut shutdown = connector.base().shutdown_signal();

    tokio::spawn(async move {
        let health = connector.base().health();
        let mut ticker = interval(health.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancelled(&mut shutdown) => break,
            }

            let base = connector.base();

            if base.lock_subscriptions().is_empty() {
                base.touch();
                continue;
            }

            let idle = base.since_last_response();
            if idle < health.timeout {
                continue;
            }

            warn!(
                "[{}] no data for {:?} (timeout {:?}), reconnecting",
                base.platform(),
                idle,
                health.timeout
            );
            incr(&METRICS.reconnects);

            base.report_unavailable_all().await;

            let credentials = base.credentials().clone();
            tokio::select! {
                _ = async {
                    connector.disconnect(&credentials).await;
                    connector.connect(&credentials).await;
                } => {}
                _ = cancelled(&mut shutdown) => break,
            }

            base.touch();
        }

        info!("[{}] health check stopped", connector.base().platform());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct Recorder {
        events: AsyncMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl CoordinatorCallback for Recorder {
        async fn on_connect(&self, platform: &str, success: bool) {
            self.events.lock().await.push(format!("connect {} {}", platform, success));
        }

        async fn on_disconnect(&self, platform: &str, success: bool) {
            self.events.lock().await.push(format!("disconnect {} {}", platform, success));
        }

        async fn on_rate_available(&self, _: &str, instrument: &str, _: Quote) {
            self.events.lock().await.push(format!("available {}", instrument));
        }

        async fn on_rate_update(&self, _: &str, instrument: &str, _: QuoteDelta) {
            self.events.lock().await.push(format!("update {}", instrument));
        }

        async fn on_rate_status(&self, _: &str, instrument: &str, status: AvailabilityStatus) {
            self.events.lock().await.push(format!("status {} {}", instrument, status));
        }
    }

    fn bound() -> (CollectorBase, Arc<Recorder>) {
        let base = CollectorBase::new("PF1", Credentials::default(), HealthCheck::default());
        let recorder = Arc::new(Recorder::default());
        let callback: Arc<dyn CoordinatorCallback> = recorder.clone();
        base.set_callback(Arc::downgrade(&callback));
        (base, recorder)
    }

    #[tokio::test]
    async fn first_sighting_is_available_then_update() {
        let (base, recorder) = bound();

        base.emit_quote("PF1_USDTRY", 30.0, 30.2, crate::util::now()).await;
        base.emit_quote("PF1_USDTRY", 30.1, 30.3, crate::util::now()).await;

        assert_eq!(
            *recorder.events.lock().await,
            vec!["available PF1_USDTRY", "update PF1_USDTRY"]
        );
    }

    #[tokio::test]
    async fn eviction_resets_first_sighting() {
        let (base, recorder) = bound();
        base.add_subscription("PF1_USDTRY");

        base.emit_quote("PF1_USDTRY", 30.0, 30.2, crate::util::now()).await;
        base.report_unavailable_all().await;
        base.emit_quote("PF1_USDTRY", 30.0, 30.2, crate::util::now()).await;

        assert_eq!(
            *recorder.events.lock().await,
            vec![
                "available PF1_USDTRY",
                "status PF1_USDTRY UNAVAILABLE",
                "available PF1_USDTRY"
            ]
        );
    }

    #[tokio::test]
    async fn dropped_callback_is_ignored() {
        let base = CollectorBase::new("PF1", Credentials::default(), HealthCheck::default());
        {
            let recorder: Arc<dyn CoordinatorCallback> = Arc::new(Recorder::default());
            base.set_callback(Arc::downgrade(&recorder));
        }

        // must not panic
        base.emit_quote("PF1_USDTRY", 30.0, 30.2, crate::util::now()).await;
        base.report_connect(true).await;
    }

    #[test]
    fn begin_is_exclusive() {
        let base = CollectorBase::new("PF1", Credentials::default(), HealthCheck::default());

        assert!(base.begin());
        assert!(!base.begin());
        base.abort_all();
        assert!(base.begin());
    }

    #[tokio::test]
    async fn finish_signals_and_joins_tasks() {
        let base = CollectorBase::new("PF1", Credentials::default(), HealthCheck::default());
        base.begin();

        let mut shutdown = base.shutdown_signal();
        base.track(tokio::spawn(async move {
            cancelled(&mut shutdown).await;
        }));
        base.track(tokio::spawn(futures_util::future::pending::<()>()));

        base.finish(Duration::from_millis(200)).await;
        assert!(!base.is_running());
    }
}
