use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::random_range;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{RatePublisher, frame};
use crate::metrics::{METRICS, incr};
use crate::schema::Quote;
use crate::util::lock;

/// Per-connection queue capacity; frames beyond it are dropped.
const QUEUE_CAPACITY: usize = 10_000;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// ============================================================
/// RateStream
/// ============================================================
///
/// A **single persistent WebSocket connection** to the distribution
/// endpoint.
///
/// Responsibilities:
/// - Perform login handshake
/// - Send JSON frames from an internal queue
/// - Send periodic JSON pings
/// - Reconnect automatically
///
/// Design constraints:
/// - Must never block connector tasks
/// - Must drop data gracefully under backpressure
#[derive(Clone)]
struct RateStream {
    /// Replaced on every reconnect; frames queued on a dead
    /// connection's sender are lost with it.
    queue: Arc<Mutex<mpsc::Sender<Value>>>,
}

impl RateStream {
    /// Starts the reconnect loop. All errors are handled internally.
    fn connect_loop(url: String, login: String, debug: bool) -> Self {
        let (tx, _) = mpsc::channel::<Value>(1);
        let queue = Arc::new(Mutex::new(tx));

        tokio::spawn({
            let queue = queue.clone();

            async move {
                loop {
                    let (tx, rx) = mpsc::channel::<Value>(QUEUE_CAPACITY);
                    *lock(&queue) = tx;

                    if let Err(e) = Self::try_connect(&url, &login, debug, rx).await {
                        warn!("Publisher connection lost: {}", e);
                    }

                    incr(&METRICS.reconnects);
                    sleep(RECONNECT_BACKOFF).await;
                }
            }
        });

        Self { queue }
    }

    /// One connection: login, then the writer loop until the
    /// connection closes.
    async fn try_connect(
        url: &str,
        login: &str,
        debug: bool,
        mut rx: mpsc::Receiver<Value>,
    ) -> Result<()> {
        let (ws, _) = connect_async(url).await?;
        let (mut write, mut read) = ws.split();

        let closed = Arc::new(Notify::new());

        write.send(Message::Text(login.to_string().into())).await?;
        info!("Publisher connected to {}", url);
        if debug {
            info!("Login message sent: {}", login);
        }

        let mut ping_interval = tokio::time::interval(PING_INTERVAL);

        // reader: only detects EOF
        tokio::spawn({
            let closed = closed.clone();

            async move {
                while let Some(Ok(msg)) = read.next().await {
                    if let Message::Text(text) = msg {
                        if debug {
                            debug!("[Publisher RECV] {}", text);
                        }
                    }
                }

                closed.notify_one();
            }
        });

        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    let json = serde_json::to_string(&msg)?;
                    if debug {
                        info!("[Publisher SEND] {}", json);
                    }
                    write.send(Message::Text(json.into())).await?;
                    incr(&METRICS.rates_published);
                }

                _ = ping_interval.tick() => {
                    write.send(Message::Text(r#"{"op":"ping"}"#.into())).await?;
                }

                _ = closed.notified() => {
                    return Err(anyhow::anyhow!("Distribution endpoint closed connection"));
                }
            }
        }
    }

    /// Non-blocking enqueue. Hands the frame back when it cannot be queued.
    fn try_send(&self, frame: Value) -> Result<(), Value> {
        let tx = lock(&self.queue);
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(v) | mpsc::error::TrySendError::Closed(v) => v,
        })
    }
}

/// ============================================================
/// RateStreamPool
/// ============================================================
///
/// Manages several `RateStream` connections.
///
/// ROUTING:
/// - A frame goes to the connection chosen by hashing its key, so one
///   instrument's updates keep their order
/// - If that queue is full or down, one random other connection is
///   tried before the frame is dropped
pub struct RateStreamPool {
    streams: Vec<RateStream>,
}

impl RateStreamPool {
    /// Must be called inside a tokio runtime.
    pub fn new(url: String, login: String, debug: bool, count: usize) -> Self {
        let streams = (0..count.max(1))
            .map(|_| RateStream::connect_loop(url.clone(), login.clone(), debug))
            .collect();

        Self { streams }
    }

    fn route(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.streams.len() as u64) as usize
    }
}

impl RatePublisher for RateStreamPool {
    fn send_rate(&self, quote: &Quote) {
        let primary = self.route(&quote.instrument_name);

        let Err(rejected) = self.streams[primary].try_send(frame(quote)) else {
            return;
        };

        if self.streams.len() > 1 {
            let mut fallback = random_range(0..self.streams.len() - 1);
            if fallback >= primary {
                fallback += 1;
            }
            if self.streams[fallback].try_send(rejected).is_ok() {
                return;
            }
        }

        incr(&METRICS.publish_dropped);
        debug!("Publisher busy, dropped {}", quote.instrument_name);
    }
}
