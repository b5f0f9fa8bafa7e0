//! Streaming connector against a scripted line server.

mod common;

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

use rate_coordinator::AvailabilityStatus;
use rate_coordinator::collector::base::HealthCheck;
use rate_coordinator::collector::tcp::{ConnectionState, TcpConnector, TcpSettings};
use rate_coordinator::collector::{CoordinatorCallback, PlatformConnector};

use common::{Event, RecordingCallback, wait_until};

const LIMIT: Duration = Duration::from_secs(3);

const USDTRY_TICK: &str = "PF1_USDTRY|22:number:30.0|25:number:30.2|5:timestamp:2024-12-15T11:31:34.509\n";
const USDTRY_NEXT: &str = "PF1_USDTRY|22:number:30.1|25:number:30.3|5:timestamp:2024-12-15T11:31:35.509\n";

struct Peer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(LIMIT, listener.accept()).await.unwrap().unwrap();
        let (read, write) = stream.into_split();

        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn line(&mut self) -> String {
        timeout(LIMIT, self.lines.next_line())
            .await
            .expect("timed out waiting for a command")
            .unwrap()
            .expect("connection closed")
    }

    async fn lines(&mut self, n: usize) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        for _ in 0..n {
            seen.insert(self.line().await);
        }
        seen
    }

    async fn quiet_for(&mut self, period: Duration) -> bool {
        timeout(period, self.lines.next_line()).await.is_err()
    }

    async fn send(&mut self, line: &str) {
        self.write.write_all(line.as_bytes()).await.unwrap();
    }
}

fn settings(endpoint: String) -> TcpSettings {
    TcpSettings {
        retry_count: 5,
        retry_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(500),
        ..TcpSettings::new(endpoint)
    }
}

async fn connector_with_callback() -> (TcpListener, Arc<TcpConnector>, Arc<RecordingCallback>) {
    connector_with_settings(settings).await
}

async fn connector_with_settings(
    settings: impl FnOnce(String) -> TcpSettings,
) -> (TcpListener, Arc<TcpConnector>, Arc<RecordingCallback>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let connector = TcpConnector::new("PF1", settings(addr.to_string()));
    let callback = RecordingCallback::new();
    let weak: Weak<dyn CoordinatorCallback> = Arc::<RecordingCallback>::downgrade(&callback);
    connector.set_callback(weak);

    (listener, connector, callback)
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn first_record_is_available_then_updates() {
    let (listener, connector, callback) = connector_with_callback().await;

    assert!(connector.subscribe("PF1_USDTRY").await);
    assert!(connector.clone().start());

    let mut peer = Peer::accept(&listener).await;
    assert_eq!(peer.line().await, "subscribe|PF1_USDTRY");

    peer.send("Subscribed to PF1_USDTRY\n").await;
    peer.send(USDTRY_TICK).await;
    peer.send("PF1_USDTRY|22:number:abc|25:number:30.3\n").await;
    peer.send("PF1_GBPUSD|22:number:1.27|25:number:1.28\n").await;
    peer.send(USDTRY_NEXT).await;

    let expected_update = Event::Update("PF1_USDTRY".into(), 30.1, 30.3);
    assert!(wait_until(LIMIT, || callback.events().contains(&expected_update)).await);

    let rates: Vec<Event> = callback
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Available(..) | Event::Update(..)))
        .collect();

    // malformed and unsubscribed lines produce nothing
    assert_eq!(
        rates,
        vec![Event::Available("PF1_USDTRY".into(), 30.0, 30.2), expected_update]
    );
    assert!(callback.events().contains(&Event::Connect(true)));

    connector.stop().await;
}

#[tokio::test]
async fn dropped_session_resubscribes_every_instrument_once() {
    let (listener, connector, callback) = connector_with_callback().await;

    assert!(connector.subscribe("PF1_USDTRY").await);
    assert!(connector.subscribe("PF1_EURUSD").await);
    assert!(connector.clone().start());

    let mut first = Peer::accept(&listener).await;
    assert_eq!(
        first.lines(2).await,
        set(&["subscribe|PF1_EURUSD", "subscribe|PF1_USDTRY"])
    );
    first.send(USDTRY_TICK).await;
    assert!(wait_until(LIMIT, || callback.count(|e| matches!(e, Event::Available(..))) == 1).await);

    // server side drops the connection
    drop(first);

    let mut second = Peer::accept(&listener).await;
    assert_eq!(
        second.lines(2).await,
        set(&["subscribe|PF1_EURUSD", "subscribe|PF1_USDTRY"])
    );
    assert!(second.quiet_for(Duration::from_millis(200)).await);

    assert!(wait_until(LIMIT, || connector.state() == ConnectionState::Connected).await);
    assert!(callback.events().contains(&Event::Disconnect(false)));
    for instrument in ["PF1_USDTRY", "PF1_EURUSD"] {
        let status = Event::Status(instrument.into(), AvailabilityStatus::Unavailable);
        assert_eq!(callback.count(|e| *e == status), 1);
    }

    // first tick after the drop counts as a new sighting
    second.send(USDTRY_TICK).await;
    assert!(wait_until(LIMIT, || callback.count(|e| matches!(e, Event::Available(..))) == 2).await);

    connector.stop().await;
}

#[tokio::test]
async fn silent_platform_is_marked_unavailable_and_reconnected() {
    let (listener, connector, callback) = connector_with_settings(|endpoint| TcpSettings {
        health: HealthCheck {
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(200),
        },
        ..settings(endpoint)
    })
    .await;

    assert!(connector.subscribe("PF1_USDTRY").await);
    assert!(connector.subscribe("PF1_EURUSD").await);
    assert!(connector.clone().start());

    let mut first = Peer::accept(&listener).await;
    assert_eq!(
        first.lines(2).await,
        set(&["subscribe|PF1_EURUSD", "subscribe|PF1_USDTRY"])
    );
    first.send(USDTRY_TICK).await;

    // the peer keeps the connection open but goes quiet
    let mut second = Peer::accept(&listener).await;
    assert_eq!(
        second.lines(2).await,
        set(&["subscribe|PF1_EURUSD", "subscribe|PF1_USDTRY"])
    );

    for instrument in ["PF1_USDTRY", "PF1_EURUSD"] {
        let status = Event::Status(instrument.into(), AvailabilityStatus::Unavailable);
        assert!(callback.count(|e| *e == status) >= 1);
    }
    assert!(callback.events().contains(&Event::Disconnect(true)));

    // the old session was closed by the connector
    let eof = timeout(LIMIT, first.lines.next_line()).await.unwrap().unwrap();
    assert!(eof.is_none());

    second.send(USDTRY_TICK).await;
    assert!(wait_until(LIMIT, || callback.count(|e| matches!(e, Event::Available(..))) == 2).await);

    connector.stop().await;
    drop(first);
}

#[tokio::test]
async fn stop_unsubscribes_then_quits() {
    let (listener, connector, _callback) = connector_with_callback().await;

    assert!(connector.clone().start());
    let mut peer = Peer::accept(&listener).await;
    assert!(wait_until(LIMIT, || connector.state() == ConnectionState::Connected).await);

    assert!(connector.subscribe("PF1_USDTRY").await);
    assert!(connector.subscribe("PF1_EURUSD").await);
    assert_eq!(
        peer.lines(2).await,
        set(&["subscribe|PF1_EURUSD", "subscribe|PF1_USDTRY"])
    );

    assert!(connector.unsubscribe("PF1_EURUSD").await);
    assert!(!connector.unsubscribe("PF1_EURUSD").await);
    assert_eq!(peer.line().await, "unsubscribe|PF1_EURUSD");

    connector.stop().await;

    assert_eq!(peer.line().await, "unsubscribe|PF1_USDTRY");
    assert_eq!(peer.line().await, "quit");
    let eof = timeout(LIMIT, peer.lines.next_line()).await.unwrap().unwrap();
    assert!(eof.is_none());

    assert_eq!(connector.state(), ConnectionState::Disconnected);
    assert!(connector.subscriptions().is_empty());

    // nothing reconnects after stop
    assert!(timeout(Duration::from_millis(300), listener.accept()).await.is_err());
}
