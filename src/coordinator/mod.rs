//! Rate-aggregation coordinator
//!
//! Owns the connector registry, the dependency graph of derived
//! instruments and the tolerance filter, and drives the cache, the
//! calculator and the publisher on every connector event.
//!
//! Event path:
//! connector -> callback -> tolerance filter -> cache -> publish
//!           -> dependents -> calculator -> tolerance filter -> cache -> publish
//!
//! The coordinator has no task of its own (apart from the optional
//! recalculation timer); callbacks run on the calling connector's task.

pub mod dependency;
pub mod tolerance;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use crate::cache::RateCache;
use crate::calculator::RateCalculator;
use crate::collector::{CoordinatorCallback, PlatformConnector};
use crate::config::Config;
use crate::metrics::{METRICS, incr};
use crate::publisher::RatePublisher;
use crate::schema::{AvailabilityStatus, Quote, QuoteDelta};
use crate::util::{self, lock, read, write};

pub use dependency::DependencyGraph;
pub use tolerance::{ToleranceFilter, Verdict};

/// Runtime knobs of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Maximum relative change accepted between consecutive quotes
    pub tolerance: f64,

    /// Hard limit for connector shutdown before forced termination
    pub shutdown_timeout: Duration,

    /// Periodic recalculation of every derived instrument
    pub recalculate_interval: Option<Duration>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            tolerance: 0.01,
            shutdown_timeout: Duration::from_secs(10),
            recalculate_interval: None,
        }
    }
}

impl CoordinatorOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            tolerance: cfg.tolerance.threshold,
            shutdown_timeout: cfg.coordinator.shutdown_timeout(),
            recalculate_interval: cfg.coordinator.recalculate_interval(),
        }
    }
}

pub struct Coordinator {
    me: Weak<Coordinator>,

    connectors: RwLock<BTreeMap<String, Arc<dyn PlatformConnector>>>,
    graph: DependencyGraph,
    tolerance: ToleranceFilter,

    /// Serializes check-and-write per key across connector tasks
    key_locks: DashMap<String, Arc<AsyncMutex<()>>>,

    cache: Arc<dyn RateCache>,
    calculator: Arc<dyn RateCalculator>,
    publisher: Arc<dyn RatePublisher>,

    options: CoordinatorOptions,
    running: AtomicBool,
    recalculation: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        cache: Arc<dyn RateCache>,
        calculator: Arc<dyn RateCalculator>,
        publisher: Arc<dyn RatePublisher>,
        graph: DependencyGraph,
        options: CoordinatorOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connectors: RwLock::new(BTreeMap::new()),
            graph,
            tolerance: ToleranceFilter::new(options.tolerance),
            key_locks: DashMap::new(),
            cache,
            calculator,
            publisher,
            options,
            running: AtomicBool::new(false),
            recalculation: Mutex::new(None),
        })
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn tolerance(&self) -> &ToleranceFilter {
        &self.tolerance
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // --------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------

    /// Starts every registered connector and the optional
    /// recalculation timer.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("Coordinator already running");
            return;
        }

        info!("Starting coordinator");

        for connector in self.connectors() {
            if connector.clone().start() {
                METRICS.connectors_active.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(period) = self.options.recalculate_interval {
            let me = self.me.clone();
            let handle = tokio::spawn(recalculation_loop(me, period));
            *lock(&self.recalculation) = Some(handle);
        }
    }

    /// Stops every connector in parallel.
    ///
    /// Returns once all connectors confirmed shutdown, or after the
    /// configured hard timeout, at which point the stragglers are
    /// terminated.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        info!("Stopping coordinator");

        if let Some(handle) = lock(&self.recalculation).take() {
            handle.abort();
        }

        let connectors = self.connectors();
        let stops = connectors.iter().map(|c| c.stop());

        if tokio::time::timeout(self.options.shutdown_timeout, join_all(stops))
            .await
            .is_err()
        {
            warn!(
                "Connectors did not stop within {:?}, terminating",
                self.options.shutdown_timeout
            );
            connectors.iter().for_each(|c| c.terminate());
        }

        METRICS.connectors_active.store(0, Ordering::Relaxed);
        info!("Coordinator stopped");
    }

    // --------------------------------------------------------
    // Connector registry
    // --------------------------------------------------------

    /// Registers `connector` and binds this coordinator as its callback.
    /// A connector added while running is started immediately.
    ///
    /// A connector already registered for the same platform is
    /// terminated so its tasks stop reporting.
    pub fn add_connector(&self, connector: Arc<dyn PlatformConnector>) {
        let platform = connector.platform_name().to_string();
        info!("Adding connector for platform {}", platform);

        let callback: Weak<dyn CoordinatorCallback> = self.me.clone();
        connector.set_callback(callback);

        let previous = write(&self.connectors).insert(platform.clone(), connector.clone());
        if let Some(previous) = previous {
            warn!("Replaced existing connector for platform {}, terminating it", platform);
            previous.terminate();
            if self.is_running() {
                METRICS.connectors_active.fetch_sub(1, Ordering::Relaxed);
            }
        }

        if self.is_running() && connector.start() {
            METRICS.connectors_active.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Deregisters and stops the connector for `platform`.
    pub async fn remove_connector(&self, platform: &str) -> bool {
        info!("Removing connector for platform {}", platform);

        let Some(connector) = write(&self.connectors).remove(platform) else {
            warn!("Platform {} not found", platform);
            return false;
        };

        connector.stop().await;
        if self.is_running() {
            METRICS.connectors_active.fetch_sub(1, Ordering::Relaxed);
        }
        true
    }

    pub fn connectors(&self) -> Vec<Arc<dyn PlatformConnector>> {
        read(&self.connectors).values().cloned().collect()
    }

    pub fn connector(&self, platform: &str) -> Option<Arc<dyn PlatformConnector>> {
        read(&self.connectors).get(platform).cloned()
    }

    pub fn platform_names(&self) -> BTreeSet<String> {
        read(&self.connectors).keys().cloned().collect()
    }

    // --------------------------------------------------------
    // Subscriptions
    // --------------------------------------------------------

    /// Subscribes `instrument` on every platform; returns the platforms
    /// that accepted.
    pub async fn subscribe_rate(&self, instrument: &str) -> BTreeSet<String> {
        info!("Subscribing to {} on all platforms", instrument);

        let mut accepted = BTreeSet::new();
        for connector in self.connectors() {
            if connector.subscribe(instrument).await {
                accepted.insert(connector.platform_name().to_string());
            }
        }
        accepted
    }

    pub async fn subscribe_rate_on(&self, platform: &str, instrument: &str) -> bool {
        info!("Subscribing to {} on platform {}", instrument, platform);

        match self.connector(platform) {
            Some(connector) => connector.subscribe(instrument).await,
            None => {
                warn!("Platform {} not found", platform);
                false
            }
        }
    }

    pub async fn unsubscribe_rate(&self, instrument: &str) -> BTreeSet<String> {
        info!("Unsubscribing from {} on all platforms", instrument);

        let mut accepted = BTreeSet::new();
        for connector in self.connectors() {
            if connector.unsubscribe(instrument).await {
                accepted.insert(connector.platform_name().to_string());
            }
        }
        accepted
    }

    pub async fn unsubscribe_rate_on(&self, platform: &str, instrument: &str) -> bool {
        info!("Unsubscribing from {} on platform {}", instrument, platform);

        match self.connector(platform) {
            Some(connector) => connector.unsubscribe(instrument).await,
            None => {
                warn!("Platform {} not found", platform);
                false
            }
        }
    }

    // --------------------------------------------------------
    // Read accessors
    // --------------------------------------------------------

    pub async fn rate(&self, instrument: &str) -> Option<Quote> {
        self.cache.get(instrument).await.unwrap_or_else(|e| {
            error!("Cache read of {} failed: {}", instrument, e);
            None
        })
    }

    pub async fn rate_from(&self, platform: &str, instrument: &str) -> Option<Quote> {
        self.cache.get_from(platform, instrument).await.unwrap_or_else(|e| {
            error!("Cache read of {}/{} failed: {}", platform, instrument, e);
            None
        })
    }

    pub async fn rate_names(&self) -> BTreeSet<String> {
        self.cache.instrument_names().await.unwrap_or_else(|e| {
            error!("Cache listing failed: {}", e);
            BTreeSet::new()
        })
    }

    // --------------------------------------------------------
    // Accept path
    // --------------------------------------------------------

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.key_locks.entry(key.to_string()).or_default().clone()
    }

    /// Tolerance filter, then cache write, then publish.
    ///
    /// Caller holds the lock of `key`. Returns `true` when the quote is
    /// now the cached value.
    async fn accept(&self, key: &str, quote: Quote) -> bool {
        match self.tolerance.check(key, &quote) {
            Verdict::Rejected { bid_change, ask_change } => {
                incr(&METRICS.tolerance_rejections);
                warn!(
                    "Rejected {}: bid change {:.4}%, ask change {:.4}% exceed {:.4}%; keeping previous value",
                    quote,
                    bid_change * 100.0,
                    ask_change * 100.0,
                    self.tolerance.threshold() * 100.0
                );
                return false;
            }
            Verdict::Unchecked => {
                debug!("Previous value for {} had a zero side, change not checked", key);
            }
            Verdict::First | Verdict::Accepted => {}
        }

        if let Err(e) = self.cache.put(&quote).await {
            incr(&METRICS.cache_errors);
            incr(&METRICS.updates_dropped);
            error!("Cache write of {} failed, update dropped: {}", quote, e);
            return false;
        }

        incr(&METRICS.quotes_accepted);
        self.publisher.send_rate(&quote);
        true
    }

    /// Recalculates every derived instrument affected by `instrument`.
    async fn trigger_dependents(&self, instrument: &str) {
        for target in self.graph.downstream(instrument) {
            self.calculate_rate(&target).await;
        }
    }

    /// Calculates `target` from the cached values of its dependencies.
    ///
    /// Returns `false` without side effects when a dependency is not
    /// cached yet, when no rule exists, or when the result is rejected.
    pub async fn calculate_rate(&self, target: &str) -> bool {
        let Some(dependencies) = self.graph.dependencies(target) else {
            warn!("No dependency rule for {}", target);
            return false;
        };

        // inputs are read under the lock so the last calculation sees the newest values
        let slot = self.key_lock(target);
        let _held = slot.lock().await;

        let mut inputs = HashMap::with_capacity(dependencies.len());
        for name in dependencies {
            match self.cache.get(name).await {
                Ok(Some(quote)) => {
                    inputs.insert(name.clone(), quote);
                }
                Ok(None) => {
                    debug!("{} not cached yet, skipping {}", name, target);
                    return false;
                }
                Err(e) => {
                    incr(&METRICS.cache_errors);
                    error!("Cache read of {} for {} failed: {}", name, target, e);
                    return false;
                }
            }
        }

        let calculator = self.calculator.clone();
        let calculated = catch_unwind(AssertUnwindSafe(|| calculator.calculate(target, &inputs)));

        let quote = match calculated {
            Ok(Some(quote)) => quote,
            Ok(None) => {
                debug!("Calculator produced nothing for {}", target);
                return false;
            }
            Err(_) => {
                incr(&METRICS.updates_dropped);
                error!("Calculator panicked for {}, update dropped", target);
                return false;
            }
        };

        // an unchanged recalculation is not a new rate
        if let Some(previous) = self.tolerance.last_accepted(target) {
            if previous.bid == quote.bid && previous.ask == quote.ask {
                debug!("{} unchanged, not republished", target);
                return true;
            }
        }

        let accepted = self.accept(target, quote).await;
        if accepted {
            incr(&METRICS.derived_calculated);
            debug!("Calculated {}", target);
        }
        accepted
    }

    /// Recalculates every derived instrument, dependencies first.
    pub async fn recalculate_all(&self) -> usize {
        let mut calculated = 0;
        for target in self.graph.targets() {
            if self.calculate_rate(target).await {
                calculated += 1;
            }
        }
        calculated
    }

    // --------------------------------------------------------
    // Connector events
    // --------------------------------------------------------

    pub async fn handle_rate_available(&self, platform: &str, instrument: &str, quote: Quote) {
        debug!("{} available from {}", instrument, platform);

        let key = util::qualified_key(platform, instrument);
        let accepted = {
            let slot = self.key_lock(&key);
            let _held = slot.lock().await;
            self.accept(&key, quote).await
        };

        if accepted {
            self.trigger_dependents(instrument).await;
        }
    }

    /// Applies `delta` on top of the platform's cached entry.
    ///
    /// After an eviction the cached entry is gone while the connector
    /// may already consider the instrument seen; the last accepted value
    /// then serves as the base so the instrument recovers on the next
    /// sane tick.
    pub async fn handle_rate_update(&self, platform: &str, instrument: &str, delta: QuoteDelta) {
        let key = util::qualified_key(platform, instrument);
        let slot = self.key_lock(&key);
        let held = slot.lock().await;

        let existing = match self.cache.get_from(platform, instrument).await {
            Ok(Some(existing)) => existing,
            Ok(None) => match self.tolerance.last_accepted(&key) {
                Some(previous) => {
                    debug!("{} from {} not cached, rebuilding from last accepted value", instrument, platform);
                    previous
                }
                None => {
                    incr(&METRICS.updates_dropped);
                    warn!("Update for unknown {} from {}, dropped", instrument, platform);
                    return;
                }
            },
            Err(e) => {
                incr(&METRICS.cache_errors);
                incr(&METRICS.updates_dropped);
                error!("Cache read of {}/{} failed, update dropped: {}", platform, instrument, e);
                return;
            }
        };

        let accepted = self.accept(&key, existing.with_delta(&delta)).await;
        drop(held);

        if accepted {
            self.trigger_dependents(instrument).await;
        }
    }

    /// `Unavailable` / `Error` evict the platform's entry only; the
    /// resolved entry survives while another platform still has data.
    pub async fn handle_rate_status(&self, platform: &str, instrument: &str, status: AvailabilityStatus) {
        info!("{} status from {}: {}", instrument, platform, status);

        if !status.evicts() {
            return;
        }

        match self.cache.remove_from(platform, instrument).await {
            Ok(true) => debug!("Evicted {} from {}", instrument, platform),
            Ok(false) => {}
            Err(e) => {
                incr(&METRICS.cache_errors);
                error!("Eviction of {}/{} failed: {}", platform, instrument, e);
            }
        }
    }
}

#[async_trait]
impl CoordinatorCallback for Coordinator {
    async fn on_connect(&self, platform: &str, success: bool) {
        if success {
            info!("Platform {} connected", platform);
        } else {
            warn!("Platform {} failed to connect", platform);
        }
    }

    async fn on_disconnect(&self, platform: &str, success: bool) {
        if success {
            info!("Platform {} disconnected", platform);
        } else {
            warn!("Platform {} dropped its connection", platform);
        }
    }

    async fn on_rate_available(&self, platform: &str, instrument: &str, quote: Quote) {
        self.handle_rate_available(platform, instrument, quote).await;
    }

    async fn on_rate_update(&self, platform: &str, instrument: &str, delta: QuoteDelta) {
        self.handle_rate_update(platform, instrument, delta).await;
    }

    async fn on_rate_status(&self, platform: &str, instrument: &str, status: AvailabilityStatus) {
        self.handle_rate_status(platform, instrument, status).await;
    }
}

async fn recalculation_loop(coordinator: Weak<Coordinator>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };

        let calculated = coordinator.recalculate_all().await;
        debug!("Recalculation tick: {} derived rate(s) updated", calculated);
    }
}
