//! Polling connector and coordinator against an HTTP rate simulator.

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;

use rate_coordinator::cache::{LocalRateCache, RateCache};
use rate_coordinator::calculator::DefaultRateCalculator;
use rate_coordinator::collector::rest::{RestConnector, RestSettings};
use rate_coordinator::collector::{CoordinatorCallback, Credentials, PlatformConnector};
use rate_coordinator::coordinator::{CoordinatorOptions, DependencyGraph};
use rate_coordinator::{AvailabilityStatus, Coordinator};

use common::{Event, RecordingCallback, RecordingPublisher, close, wait_until};

const LIMIT: Duration = Duration::from_secs(5);

type Rates = Arc<Mutex<HashMap<String, (f64, f64)>>>;

// ============================================================================
// Simulator
// ============================================================================

async fn list(State(rates): State<Rates>) -> Json<Vec<String>> {
    Json(rates.lock().unwrap().keys().cloned().collect())
}

async fn rate(State(rates): State<Rates>, Path(name): Path<String>) -> Response {
    let found = rates.lock().unwrap().get(&name).copied();

    match found {
        Some((bid, ask)) => Json(json!({
            "rateName": name,
            "bid": bid,
            "ask": ask,
            "timestamp": "2024-12-16T16:07:15.504",
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Starts a simulator serving `rates`; returns its base URL.
async fn start_simulator(initial: &[(&str, f64, f64)]) -> (String, Rates) {
    let rates: Rates = Arc::new(Mutex::new(
        initial
            .iter()
            .map(|(name, bid, ask)| (name.to_string(), (*bid, *ask)))
            .collect(),
    ));

    let app = Router::new()
        .route("/api/rates", get(list))
        .route("/api/rates/{name}", get(rate))
        .with_state(rates.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/api/rates", addr), rates)
}

async fn dead_url() -> String {
    let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    format!("http://{}/api/rates", addr)
}

fn settings(base_urls: Vec<String>) -> RestSettings {
    RestSettings {
        retry_count: 3,
        retry_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(100),
        request_timeout: Duration::from_secs(1),
        ..RestSettings::new(base_urls)
    }
}

fn with_callback(connector: &Arc<RestConnector>) -> Arc<RecordingCallback> {
    let callback = RecordingCallback::new();
    let weak: Weak<dyn CoordinatorCallback> = Arc::<RecordingCallback>::downgrade(&callback);
    connector.set_callback(weak);
    callback
}

// ============================================================================
// Connector
// ============================================================================

#[tokio::test]
async fn first_reachable_candidate_is_pinned() {
    let (second, _) = start_simulator(&[]).await;
    let (third, _) = start_simulator(&[]).await;

    let connector = RestConnector::new(
        "PF2",
        RestSettings {
            retry_count: 1,
            ..settings(vec![dead_url().await, second.clone(), third])
        },
    );
    let callback = with_callback(&connector);

    assert!(connector.connect(&Credentials::default()).await);
    assert!(connector.is_connected());
    assert_eq!(connector.pinned_url(), Some(second));
    assert_eq!(callback.events(), vec![Event::Connect(true)]);
}

#[tokio::test]
async fn missing_instrument_does_not_affect_its_sibling() {
    let (url, rates) = start_simulator(&[("PF2_USDTRY", 29.95, 30.05)]).await;

    let connector = RestConnector::new("PF2", settings(vec![url]));
    let callback = with_callback(&connector);

    assert!(connector.subscribe("PF2_USDTRY").await);
    assert!(connector.subscribe("PF2_EURUSD").await);
    assert!(connector.clone().start());

    let unavailable = Event::Status("PF2_EURUSD".into(), AvailabilityStatus::Unavailable);
    assert!(wait_until(LIMIT, || callback.events().contains(&unavailable)).await);
    assert!(
        wait_until(LIMIT, || callback
            .count(|e| matches!(e, Event::Update(name, ..) if name == "PF2_USDTRY"))
            >= 1)
        .await
    );
    assert_eq!(
        callback.count(|e| matches!(e, Event::Status(name, _) if name == "PF2_USDTRY")),
        0
    );

    // the instrument shows up later and is reported as a first sighting
    rates.lock().unwrap().insert("PF2_EURUSD".into(), (1.08, 1.09));
    let available = Event::Available("PF2_EURUSD".into(), 1.08, 1.09);
    assert!(wait_until(LIMIT, || callback.events().contains(&available)).await);

    connector.stop().await;
    assert!(!connector.is_connected());
    assert!(connector.subscriptions().is_empty());
}

#[tokio::test]
async fn unreachable_platform_reports_failed_connect() {
    let connector = RestConnector::new(
        "PF2",
        RestSettings {
            retry_count: 2,
            ..settings(vec![dead_url().await])
        },
    );
    let callback = with_callback(&connector);

    assert!(!connector.connect(&Credentials::default()).await);
    assert!(connector.pinned_url().is_none());
    assert_eq!(callback.events(), vec![Event::Connect(false)]);
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn two_platforms_produce_one_derived_rate() {
    let (pf1_url, _) = start_simulator(&[("PF1_USDTRY", 29.90, 30.10)]).await;
    let (pf2_url, _) = start_simulator(&[("PF2_USDTRY", 29.95, 30.05)]).await;

    let cache = Arc::new(LocalRateCache::new());
    let publisher = RecordingPublisher::new();
    let coordinator = Coordinator::new(
        cache.clone(),
        Arc::new(DefaultRateCalculator::new()),
        publisher.clone(),
        DependencyGraph::builtin(),
        CoordinatorOptions::default(),
    );

    coordinator.add_connector(RestConnector::new("PF1", settings(vec![pf1_url])));
    coordinator.add_connector(RestConnector::new("PF2", settings(vec![pf2_url])));
    coordinator.start();

    assert!(coordinator.subscribe_rate_on("PF1", "PF1_USDTRY").await);
    assert!(coordinator.subscribe_rate_on("PF2", "PF2_USDTRY").await);

    assert!(wait_until(LIMIT, || !publisher.sent_for("USDTRY").is_empty()).await);

    // let a few more poll ticks deliver identical values
    tokio::time::sleep(Duration::from_millis(400)).await;

    let usdtry = coordinator.rate("USDTRY").await.unwrap();
    assert!(close(usdtry.bid, 29.925));
    assert!(close(usdtry.ask, 30.075));
    assert!(usdtry.is_derived);

    assert_eq!(publisher.sent_for("USDTRY").len(), 1);
    assert!(cache.get_from("PF1", "PF1_USDTRY").await.unwrap().is_some());
    assert!(coordinator.rate_names().await.contains("PF2_USDTRY"));

    coordinator.stop().await;
    assert!(!coordinator.is_running());
}
