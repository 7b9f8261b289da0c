//! Connection lifecycle, reconnection and message dispatch
//!
//! ```text
//!   Closed ──connect()──▶ Connecting ──handshake──▶ Open
//!     ▲                       │                      │
//!     │                       │ failure/timeout      │ error / disconnect()
//!     │                       ▼                      ▼
//!     └──────────────────── Closed ◀──────────── Closing
//!            (reconnect timer, unless disconnect() was called)
//! ```
//!
//! All state lives behind one mutex that is never held across an await.
//! Every socket attempt gets a generation number; anything reported by a
//! superseded socket is ignored.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{
    ChannelEvent, ConnectionState, Connector, PendingLink, SocketEvent, SocketLink, Transport,
    WireMessage,
};
use crate::constants::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_RECONNECT_DELAY_MS, DEFAULT_SERVER_URL};
use crate::error::TransportError;
use crate::protocol::{InboundControl, OutboundControl};

/// Channel tuning
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub url: String,
    /// Delay before an automatic reconnect
    pub reconnect_delay: Duration,
    /// Handshake deadline
    pub connect_timeout: Duration,
    /// Ping interval while open
    pub keepalive: Option<Duration>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_SERVER_URL.to_string(),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            keepalive: None,
        }
    }
}

/// Channel counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub sockets_opened: u64,
    pub reconnects_scheduled: u64,
    pub invalid_messages: u64,
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    sockets_opened: AtomicU64,
    reconnects_scheduled: AtomicU64,
    invalid_messages: AtomicU64,
}

struct ReconnectTimer {
    id: u64,
    task: JoinHandle<()>,
    deadline: Instant,
}

struct Connection {
    lifecycle: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<WireMessage>>,
    reconnect: Option<ReconnectTimer>,
    next_timer: u64,
    auto_reconnect: bool,
    /// `connect()` arrived while the previous socket was still closing
    connect_after_close: bool,
    waiters: VecDeque<(u64, oneshot::Sender<bool>)>,
    next_waiter: u64,
}

struct Shared {
    settings: ChannelSettings,
    connector: Arc<dyn Connector>,
    conn: Mutex<Connection>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    counters: Counters,
}

/// The single connection to the voice endpoint
#[derive(Clone)]
pub struct TransportChannel {
    shared: Arc<Shared>,
}

impl TransportChannel {
    /// Create a closed channel and the receiver for its events
    pub fn new(
        settings: ChannelSettings,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            settings,
            connector,
            conn: Mutex::new(Connection {
                lifecycle: ConnectionState::Closed,
                generation: 0,
                outbound: None,
                reconnect: None,
                next_timer: 0,
                auto_reconnect: false,
                connect_after_close: false,
                waiters: VecDeque::new(),
                next_waiter: 0,
            }),
            events,
            counters: Counters::default(),
        });
        (Self { shared }, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.conn.lock().lifecycle
    }

    pub fn url(&self) -> &str {
        &self.shared.settings.url
    }

    /// When the pending reconnect attempt fires, if one is scheduled
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.shared
            .conn
            .lock()
            .reconnect
            .as_ref()
            .filter(|timer| !timer.task.is_finished())
            .map(|timer| timer.deadline)
    }

    pub fn stats(&self) -> ChannelStats {
        let c = &self.shared.counters;
        ChannelStats {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            sockets_opened: c.sockets_opened.load(Ordering::Relaxed),
            reconnects_scheduled: c.reconnects_scheduled.load(Ordering::Relaxed),
            invalid_messages: c.invalid_messages.load(Ordering::Relaxed),
        }
    }
}

impl Transport for TransportChannel {
    fn connect(&self) -> Result<(), TransportError> {
        let mut conn = self.shared.conn.lock();
        conn.auto_reconnect = true;
        Shared::start_connect(&self.shared, &mut conn)
    }

    fn disconnect(&self) {
        let mut conn = self.shared.conn.lock();
        conn.auto_reconnect = false;
        conn.connect_after_close = false;
        if let Some(timer) = conn.reconnect.take() {
            timer.task.abort();
        }
        if matches!(conn.lifecycle, ConnectionState::Open | ConnectionState::Connecting) {
            tracing::info!("Disconnecting from {}", self.shared.settings.url);
            conn.lifecycle = ConnectionState::Closing;
            conn.outbound = None;
        }
    }

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn wait_until_connected(&self, timeout: Duration) -> BoxFuture<'static, bool> {
        let (id, rx) = {
            let mut conn = self.shared.conn.lock();
            if conn.lifecycle == ConnectionState::Open {
                return futures_util::future::ready(true).boxed();
            }
            let id = conn.next_waiter;
            conn.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            conn.waiters.push_back((id, tx));
            (id, rx)
        };

        let shared = self.shared.clone();
        async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(opened)) => opened,
                _ => {
                    shared.conn.lock().waiters.retain(|(waiter, _)| *waiter != id);
                    false
                }
            }
        }
        .boxed()
    }

    fn send(&self, frame: Bytes) {
        let conn = self.shared.conn.lock();
        let delivered = match (&conn.outbound, conn.lifecycle) {
            (Some(tx), ConnectionState::Open) => tx.send(WireMessage::Binary(frame)).is_ok(),
            _ => false,
        };
        drop(conn);

        if delivered {
            self.shared.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Dropping audio frame, channel not open");
        }
    }

    fn send_control(&self, message: &OutboundControl) {
        self.shared.send_text(message.to_json());
    }
}

impl Shared {
    fn start_connect(shared: &Arc<Shared>, conn: &mut Connection) -> Result<(), TransportError> {
        if matches!(conn.lifecycle, ConnectionState::Connecting | ConnectionState::Open) {
            tracing::debug!("Connect ignored, already {:?}", conn.lifecycle);
            return Ok(());
        }

        // One socket at a time: wait for the old one to finish closing
        if conn.lifecycle == ConnectionState::Closing {
            tracing::debug!("Connect deferred until the current socket has closed");
            conn.connect_after_close = true;
            return Ok(());
        }

        if let Some(timer) = conn.reconnect.take() {
            timer.task.abort();
        }

        let pending = shared.connector.open(&shared.settings.url)?;

        conn.generation += 1;
        conn.lifecycle = ConnectionState::Connecting;
        shared.counters.sockets_opened.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Connecting to {}", shared.settings.url);

        let generation = conn.generation;
        let shared = Arc::clone(shared);
        tokio::spawn(async move { shared.drive(generation, pending).await });
        Ok(())
    }

    /// Run one socket from handshake to close
    async fn drive(self: Arc<Self>, generation: u64, pending: PendingLink) {
        let link = match tokio::time::timeout(self.settings.connect_timeout, pending).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                tracing::warn!("Connection attempt failed: {}", e);
                self.handle_close(generation);
                return;
            }
            Err(_) => {
                tracing::warn!("Connection attempt failed: {}", TransportError::Timeout);
                self.handle_close(generation);
                return;
            }
        };

        let SocketLink {
            outbound,
            mut inbound,
        } = link;

        if !self.handle_open(generation, outbound) {
            self.handle_close(generation);
            return;
        }

        let mut keepalive = self.settings.keepalive.map(|period| {
            tokio::time::interval_at(Instant::now() + period, period)
        });

        loop {
            let event = tokio::select! {
                event = inbound.recv() => event,
                _ = tick(&mut keepalive) => {
                    self.send_text(OutboundControl::Ping.to_json());
                    continue;
                }
            };

            match event {
                Some(SocketEvent::Message(message)) => {
                    if self.is_current(generation) {
                        self.dispatch(message);
                    }
                }
                Some(SocketEvent::Error(e)) => {
                    tracing::warn!("Socket error: {}", e);
                    self.force_close(generation);
                }
                None => break,
            }
        }

        self.handle_close(generation);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.conn.lock().generation == generation
    }

    fn handle_open(&self, generation: u64, outbound: mpsc::UnboundedSender<WireMessage>) -> bool {
        let waiters = {
            let mut conn = self.conn.lock();
            if conn.generation != generation || conn.lifecycle != ConnectionState::Connecting {
                return false;
            }
            conn.lifecycle = ConnectionState::Open;
            conn.outbound = Some(outbound);
            std::mem::take(&mut conn.waiters)
        };

        tracing::info!("Connected to {}", self.settings.url);
        let _ = self.events.send(ChannelEvent::Opened);
        for (_, waiter) in waiters {
            let _ = waiter.send(true);
        }
        true
    }

    fn force_close(&self, generation: u64) {
        let mut conn = self.conn.lock();
        if conn.generation == generation
            && matches!(conn.lifecycle, ConnectionState::Open | ConnectionState::Connecting)
        {
            conn.lifecycle = ConnectionState::Closing;
            conn.outbound = None;
        }
    }

    fn handle_close(self: &Arc<Self>, generation: u64) {
        let connect_now = {
            let mut conn = self.conn.lock();
            if conn.generation != generation || conn.lifecycle == ConnectionState::Closed {
                return;
            }
            conn.lifecycle = ConnectionState::Closed;
            conn.outbound = None;
            let connect_now = std::mem::take(&mut conn.connect_after_close);
            if conn.auto_reconnect && !connect_now {
                self.schedule_reconnect(&mut conn);
            }
            connect_now
        };

        tracing::info!("Connection to {} closed", self.settings.url);
        let _ = self.events.send(ChannelEvent::Closed);

        // Closed is reported before the next socket can report Opened
        if connect_now {
            let mut conn = self.conn.lock();
            if let Err(e) = Shared::start_connect(self, &mut conn) {
                tracing::error!("Deferred connect failed: {}", e);
            }
        }
    }

    /// Arm the single reconnect slot, replacing any earlier timer
    fn schedule_reconnect(self: &Arc<Self>, conn: &mut Connection) {
        if let Some(previous) = conn.reconnect.take() {
            previous.task.abort();
        }

        let delay = self.settings.reconnect_delay;
        let deadline = Instant::now() + delay;
        let id = conn.next_timer;
        conn.next_timer += 1;
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let mut conn = shared.conn.lock();
            // A replacement may have been armed while this task waited for the lock
            if conn.reconnect.as_ref().map(|timer| timer.id) != Some(id) {
                return;
            }
            conn.reconnect = None;
            if !conn.auto_reconnect {
                return;
            }
            tracing::info!("Reconnecting to {}", shared.settings.url);
            if let Err(e) = Shared::start_connect(&shared, &mut conn) {
                tracing::error!("Reconnect abandoned: {}", e);
            }
        });

        self.counters.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Reconnect scheduled in {:?}", delay);
        conn.reconnect = Some(ReconnectTimer { id, task, deadline });
    }

    fn dispatch(&self, message: WireMessage) {
        match message {
            WireMessage::Binary(data) => {
                if !data.is_empty() {
                    let _ = self.events.send(ChannelEvent::Binary(data));
                }
            }
            WireMessage::Text(text) => match InboundControl::parse(&text) {
                Ok(control) => {
                    let _ = self.events.send(ChannelEvent::Control(control));
                }
                Err(e) => {
                    self.counters.invalid_messages.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("{}", e);
                }
            },
        }
    }

    fn send_text(&self, text: String) {
        let conn = self.conn.lock();
        match (&conn.outbound, conn.lifecycle) {
            (Some(tx), ConnectionState::Open) => {
                let _ = tx.send(WireMessage::Text(text));
            }
            _ => tracing::debug!("Dropping control message, channel not open"),
        }
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
