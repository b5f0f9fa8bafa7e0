/// Collector module
///
/// This module groups all logic responsible for:
/// - Connecting to upstream rate platforms
/// - Managing subscriptions and session lifecycles per platform
/// - Reporting observations to the coordinator callback
///
/// Layout:
/// - `base`:     shared subscription / health-check / lifecycle state
/// - `tcp`:      streaming connector (persistent line-oriented session)
/// - `protocol`: wire grammar of the streaming connector
/// - `rest`:     polling connector (periodic HTTP GET)
/// - `registry`: compile-time mapping of platform kind to constructor
///
/// Design notes:
/// - Connectors never touch the cache; all state changes flow through
///   `CoordinatorCallback`
/// - Every connector owns its own recovery loop
pub mod base;
pub mod protocol;
pub mod registry;
pub mod rest;
pub mod tcp;

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::schema::{AvailabilityStatus, Quote, QuoteDelta};

/// Event surface a connector reports into.
///
/// THREADING:
/// - Called concurrently from every connector task
/// - Implementations must never panic back into the caller
///
#[async_trait]
pub trait CoordinatorCallback: Send + Sync {
    /// Result of a connect attempt (`false` after retries are exhausted).
    async fn on_connect(&self, platform: &str, success: bool);

    /// Session teardown; `success` is `false` for an unexpected drop.
    async fn on_disconnect(&self, platform: &str, success: bool);

    /// First observation of `instrument` on this connector.
    async fn on_rate_available(&self, platform: &str, instrument: &str, quote: Quote);

    /// Every later observation of `instrument`.
    async fn on_rate_update(&self, platform: &str, instrument: &str, delta: QuoteDelta);

    async fn on_rate_status(&self, platform: &str, instrument: &str, status: AvailabilityStatus);
}

/// Login material passed to `connect` / `disconnect`.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

/// PlatformConnector is the capability set every upstream transport
/// implements.
///
/// CONTRACT:
/// - `connect` is idempotent when already connected
/// - `disconnect` is always safe to call
/// - `subscribe` / `unsubscribe` return `true` when the request is
///   accepted; data flows asynchronously afterwards
/// - `start` spawns the run loop and the health-check timer and
///   returns `false` if the connector is already running
/// - `stop` unsubscribes everything, tears the session down and waits
///   for the spawned tasks with a bounded timeout
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - Connector instances are shared between the coordinator and the
///   connector's own tasks
///
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    /// Canonical platform name (e.g. "PF1").
    fn platform_name(&self) -> &str;

    /// Binds the event target. Held weakly so a connector never keeps
    /// the coordinator alive.
    fn set_callback(&self, callback: Weak<dyn CoordinatorCallback>);

    async fn connect(&self, credentials: &Credentials) -> bool;

    async fn disconnect(&self, credentials: &Credentials) -> bool;

    async fn subscribe(&self, instrument: &str) -> bool;

    async fn unsubscribe(&self, instrument: &str) -> bool;

    /// Currently requested instruments.
    fn subscriptions(&self) -> Vec<String>;

    fn start(self: Arc<Self>) -> bool;

    async fn stop(&self);

    /// Aborts every spawned task without waiting.
    fn terminate(&self);
}
