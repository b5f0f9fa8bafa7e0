use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout};

use super::base::{Collector, CollectorBase, HealthCheck, STOP_TIMEOUT, cancelled, spawn_health_check};
use super::protocol::{Command, Response, parse_line};
use super::{CoordinatorCallback, Credentials, PlatformConnector};
use crate::config::PlatformConfig;
use crate::metrics::{METRICS, incr};
use crate::util::lock;

/// Capacity of the outbound command queue.
const COMMAND_QUEUE: usize = 1_024;

/// Session state of the streaming connector.
///
/// `Disconnected -> Connecting -> Connected -> (Degraded <-> Connected) -> Disconnected`
///
/// `Degraded` means the session dropped unexpectedly and recovery
/// has not finished yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

#[derive(Debug, Clone)]
pub struct TcpSettings {
    /// `host:port`
    pub endpoint: String,
    pub retry_count: u32,
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
    pub health: HealthCheck,
    pub credentials: Credentials,
}

impl TcpSettings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            retry_count: 5,
            retry_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            health: HealthCheck::default(),
            credentials: Credentials::default(),
        }
    }

    pub fn from_config(cfg: &PlatformConfig) -> Self {
        let host = cfg.host.as_deref().unwrap_or("localhost");
        let port = cfg.port.unwrap_or(8081);

        Self {
            endpoint: format!("{}:{}", host, port),
            retry_count: cfg.retry_count,
            retry_interval: cfg.retry_interval(),
            connect_timeout: cfg.connect_timeout(),
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

/// One live TCP session.
struct Session {
    generation: u64,
    writer: OwnedWriteHalf,
    reader: AbortHandle,
}

/// Result of handing one command to the session.
enum Delivery {
    Sent,
    NoSession,
    Broken(u64, std::io::Error),
}

/// Streaming connector over a persistent, line-oriented TCP session.
///
/// Tasks while running:
/// - response reader (one per session, respawned on reconnect)
/// - command sender draining the bounded command queue
/// - health check timer
///
/// RECOVERY:
/// - A read error or end of stream drops the session, reports every
///   subscription `Unavailable`, reconnects and re-subscribes the whole
///   subscription set
/// - A failed command write re-queues the command and does the same
/// - Reconnect gives up after `retry_count` attempts; the health check
///   retries later
pub struct TcpConnector {
    me: Weak<TcpConnector>,
    base: CollectorBase,
    settings: TcpSettings,

    state: Mutex<ConnectionState>,
    session: AsyncMutex<Option<Session>>,
    generation: AtomicU64,
    connecting: AsyncMutex<()>,

    commands: mpsc::Sender<Command>,
    command_rx: AsyncMutex<mpsc::Receiver<Command>>,
}

impl TcpConnector {
    pub fn new(platform: &str, settings: TcpSettings) -> Arc<Self> {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            base: CollectorBase::new(platform, settings.credentials.clone(), settings.health),
            settings,
            state: Mutex::new(ConnectionState::Disconnected),
            session: AsyncMutex::new(None),
            generation: AtomicU64::new(0),
            connecting: AsyncMutex::new(()),
            commands,
            command_rx: AsyncMutex::new(command_rx),
        })
    }

    pub fn from_config(cfg: &PlatformConfig) -> Arc<Self> {
        Self::new(&cfg.name, TcpSettings::from_config(cfg))
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("[{}] {:?} -> {:?}", self.base.platform(), *current, state);
            *current = state;
        }
    }

    fn enqueue(&self, command: Command) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(command)) => {
                warn!("[{}] command queue full, dropping '{}'", self.base.platform(), command);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    // --------------------------------------------------------
    // Session management
    // --------------------------------------------------------

    /// Installs a freshly connected stream: spawns its reader and
    /// re-subscribes every known instrument.
    async fn open_session(&self, stream: TcpStream) {
        let Some(me) = self.me.upgrade() else {
            return;
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("[{}] set_nodelay failed: {}", self.base.platform(), e);
        }

        let (read, writer) = stream.into_split();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        {
            // hold the slot so the reader cannot observe a half-installed session
            let mut slot = self.session.lock().await;
            let handle = tokio::spawn(me.read_loop(read, generation));
            let reader = handle.abort_handle();
            self.base.track(handle);

            *slot = Some(Session {
                generation,
                writer,
                reader,
            });
            METRICS.sessions_active.fetch_add(1, Ordering::Relaxed);
            self.set_state(ConnectionState::Connected);
        }

        self.base.touch();

        let instruments = self.base.subscriptions();
        if !instruments.is_empty() {
            info!(
                "[{}] re-subscribing {} instrument(s)",
                self.base.platform(),
                instruments.len()
            );
        }
        for instrument in instruments {
            self.enqueue(Command::Subscribe(instrument));
        }
    }

    /// Removes the session if it is still `generation` (any session for `None`).
    async fn take_session(&self, generation: Option<u64>) -> Option<Session> {
        let mut slot = self.session.lock().await;

        match (slot.as_ref(), generation) {
            (Some(current), Some(expected)) if current.generation != expected => None,
            _ => slot.take().inspect(|_| {
                METRICS.sessions_active.fetch_sub(1, Ordering::Relaxed);
            }),
        }
    }

    /// Handles an unexpected session drop. Only the first caller for a
    /// given generation acts on it.
    async fn session_lost(&self, generation: u64, reason: &str, from_reader: bool) {
        let Some(mut session) = self.take_session(Some(generation)).await else {
            return;
        };

        if !from_reader {
            session.reader.abort();
        }
        let _ = session.writer.shutdown().await;
        drop(session);

        warn!("[{}] session lost: {}", self.base.platform(), reason);
        self.set_state(ConnectionState::Degraded);
        incr(&METRICS.reconnects);

        self.base.report_disconnect(false).await;
        self.base.report_unavailable_all().await;

        if self.base.is_running() && !self.base.is_stopping() {
            let credentials = self.base.credentials().clone();
            self.connect(&credentials).await;
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    // --------------------------------------------------------
    // Response reader
    // --------------------------------------------------------

    async fn read_loop(self: Arc<Self>, read: OwnedReadHalf, generation: u64) {
        let mut lines = BufReader::new(read).lines();
        let mut shutdown = self.base.shutdown_signal();

        let reason = loop {
            let next = tokio::select! {
                line = lines.next_line() => line,
                _ = cancelled(&mut shutdown) => return,
            };

            match next {
                Ok(Some(line)) => self.handle_line(&line).await,
                Ok(None) => break "end of stream".to_string(),
                Err(e) => break format!("read error: {}", e),
            }
        };

        self.session_lost(generation, &reason, true).await;
    }

    async fn handle_line(&self, line: &str) {
        let platform = self.base.platform();

        if line.trim().is_empty() {
            return;
        }

        match parse_line(line) {
            Ok(Response::Record(record)) => {
                if !self.base.is_subscribed(&record.instrument) {
                    debug!("[{}] ignoring unsubscribed {}", platform, record.instrument);
                    self.base.touch();
                    return;
                }

                self.base
                    .emit_quote(&record.instrument, record.bid, record.ask, record.observed_at)
                    .await;
            }
            Ok(Response::Subscribed(instrument)) => {
                self.base.touch();
                info!("[{}] subscribed to {}", platform, instrument);
            }
            Ok(Response::Unsubscribed(instrument)) => {
                self.base.touch();
                info!("[{}] unsubscribed from {}", platform, instrument);
            }
            Ok(Response::Error(message)) => {
                self.base.touch();
                error!("[{}] platform error: {}", platform, message);
            }
            Ok(Response::Goodbye) => {
                info!("[{}] server said goodbye", platform);
            }
            Ok(Response::Info(text)) => {
                self.base.touch();
                debug!("[{}] {}", platform, text);
            }
            Err(e) => {
                incr(&METRICS.parse_errors);
                warn!("[{}] dropping malformed line '{}': {}", platform, line, e);
            }
        }
    }

    // --------------------------------------------------------
    // Command sender
    // --------------------------------------------------------

    async fn write_line(&self, line: &str) -> Delivery {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return Delivery::NoSession;
        };

        let payload = format!("{}\n", line);
        match session.writer.write_all(payload.as_bytes()).await {
            Ok(()) => Delivery::Sent,
            Err(e) => Delivery::Broken(session.generation, e),
        }
    }

    async fn command_loop(self: Arc<Self>) {
        let mut rx = self.command_rx.lock().await;
        let mut shutdown = self.base.shutdown_signal();
        let mut pending: Option<Command> = None;

        loop {
            let command = match pending.take() {
                Some(command) => command,
                None => tokio::select! {
                    next = rx.recv() => match next {
                        Some(command) => command,
                        None => break,
                    },
                    _ = cancelled(&mut shutdown) => break,
                },
            };

            match self.write_line(&command.encode()).await {
                Delivery::Sent => {
                    incr(&METRICS.commands_sent);
                    debug!("[{}] sent '{}'", self.base.platform(), command);
                }
                Delivery::NoSession => {
                    // a new session starts empty and re-subscribes on its own
                    debug!(
                        "[{}] no session, discarding '{}'",
                        self.base.platform(),
                        command
                    );
                }
                Delivery::Broken(generation, e) => {
                    warn!(
                        "[{}] write of '{}' failed ({}), re-queuing",
                        self.base.platform(),
                        command,
                        e
                    );
                    pending = Some(command);

                    let reason = e.to_string();
                    tokio::select! {
                        _ = self.session_lost(generation, &reason, false) => {}
                        _ = cancelled(&mut shutdown) => break,
                    }

                    if self.state() != ConnectionState::Connected {
                        tokio::select! {
                            _ = sleep(self.settings.retry_interval) => {}
                            _ = cancelled(&mut shutdown) => break,
                        }
                    }
                }
            }
        }

        debug!("[{}] command sender stopped", self.base.platform());
    }
}

impl Collector for TcpConnector {
    fn base(&self) -> &CollectorBase {
        &self.base
    }
}

#[async_trait]
impl PlatformConnector for TcpConnector {
    fn platform_name(&self) -> &str {
        self.base.platform()
    }

    fn set_callback(&self, callback: Weak<dyn CoordinatorCallback>) {
        self.base.set_callback(callback);
    }

    /// Opens the session with up to `retry_count` attempts, each bounded
    /// by `connect_timeout` and separated by `retry_interval`.
    async fn connect(&self, _credentials: &Credentials) -> bool {
        let _guard = self.connecting.lock().await;
        let platform = self.base.platform();

        if self.session.lock().await.is_some() {
            debug!("[{}] already connected", platform);
            return true;
        }

        self.set_state(ConnectionState::Connecting);
        let attempts = self.settings.retry_count.max(1);
        let mut shutdown = self.base.shutdown_signal();

        for attempt in 1..=attempts {
            info!(
                "[{}] connecting to {} (attempt {}/{})",
                platform, self.settings.endpoint, attempt, attempts
            );

            match timeout(
                self.settings.connect_timeout,
                TcpStream::connect(&self.settings.endpoint),
            )
            .await
            {
                Ok(Ok(stream)) if self.base.is_stopping() => {
                    // stop() ran while this attempt was in flight
                    drop(stream);
                    info!("[{}] stopping, discarding new connection", platform);
                    self.set_state(ConnectionState::Disconnected);
                    return false;
                }
                Ok(Ok(stream)) => {
                    self.open_session(stream).await;
                    info!("[{}] connected to {}", platform, self.settings.endpoint);
                    self.base.report_connect(true).await;
                    return true;
                }
                Ok(Err(e)) => warn!("[{}] connect failed: {}", platform, e),
                Err(_) => warn!(
                    "[{}] connect timed out after {:?}",
                    platform, self.settings.connect_timeout
                ),
            }

            if attempt < attempts {
                tokio::select! {
                    _ = sleep(self.settings.retry_interval) => {}
                    _ = cancelled(&mut shutdown) => break,
                }
            }
        }

        error!(
            "[{}] giving up on {} after {} attempt(s)",
            platform, self.settings.endpoint, attempts
        );
        self.set_state(ConnectionState::Disconnected);
        self.base.report_connect(false).await;
        false
    }

    async fn disconnect(&self, _credentials: &Credentials) -> bool {
        let Some(mut session) = self.take_session(None).await else {
            self.set_state(ConnectionState::Disconnected);
            return true;
        };

        session.reader.abort();
        if let Err(e) = session.writer.shutdown().await {
            debug!("[{}] shutdown error: {}", self.base.platform(), e);
        }

        self.set_state(ConnectionState::Disconnected);
        info!("[{}] disconnected", self.base.platform());
        self.base.report_disconnect(true).await;
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

        if self.state() == ConnectionState::Connected {
            return self.enqueue(Command::Subscribe(instrument.to_string()));
        }

        debug!(
            "[{}] {} recorded, sent once connected",
            self.base.platform(),
            instrument
        );
        true
    }

    async fn unsubscribe(&self, instrument: &str) -> bool {
        if !self.base.remove_subscription(instrument) {
            return false;
        }

        if self.state() == ConnectionState::Connected {
            self.enqueue(Command::Unsubscribe(instrument.to_string()));
        }
        true
    }

    fn subscriptions(&self) -> Vec<String> {
        self.base.subscriptions()
    }

    fn start(self: Arc<Self>) -> bool {
        if !self.base.begin() {
            warn!("[{}] already running", self.base.platform());
            return false;
        }

        info!("[{}] starting streaming connector", self.base.platform());

        let runner = self.clone();
        self.base.track(tokio::spawn(async move {
            let credentials = runner.base.credentials().clone();
            runner.connect(&credentials).await;
        }));
        self.base.track(tokio::spawn(self.clone().command_loop()));
        self.base.track(spawn_health_check(self.clone()));

        true
    }

    /// Writes `unsubscribe` for every subscription and `quit` straight
    /// to the live session, then closes it and joins every task.
    async fn stop(&self) {
        let platform = self.base.platform();
        info!("[{}] stopping streaming connector", platform);

        // reader and sender exit first so the farewell cannot trigger a reconnect
        self.base.signal_stop();
        let instruments = self.base.clear_subscriptions();

        let farewell = async {
            for instrument in &instruments {
                let line = Command::Unsubscribe(instrument.clone()).encode();
                if !matches!(self.write_line(&line).await, Delivery::Sent) {
                    return;
                }
            }
            let _ = self.write_line(&Command::Quit.encode()).await;
        };
        if timeout(STOP_TIMEOUT, farewell).await.is_err() {
            warn!("[{}] farewell commands timed out", platform);
        }

        let credentials = self.base.credentials().clone();
        self.disconnect(&credentials).await;
        self.base.finish(STOP_TIMEOUT).await;

        info!("[{}] streaming connector stopped", platform);
    }

    fn terminate(&self) {
        self.base.abort_all();
        self.set_state(ConnectionState::Disconnected);
    }
}
