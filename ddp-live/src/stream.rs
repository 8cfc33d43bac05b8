//! Connection stream: one self-healing WebSocket to the server.
//!
//! ```text
//!             open                    close / error / timeout
//! connecting ──────► connected ─────────────────────────────► offline
//!     ▲                  │ reconnect(force)                      │
//!     │                  ▼                                       │ backoff
//!     └─────────────  waiting  ◄─────────────────────────────────┘ elapsed
//!
//! disconnect() ──► offline (final)      fail(reason) ──► failed (final)
//! ```
//!
//! [`StreamMachine`] holds the states, timers and backoff math and is driven
//! purely by events; [`ConnectionStream`] runs it on a tokio task that owns
//! the socket. Frames sent while not connected are dropped; the owner
//! retransmits what it needs on `reset`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::{ReconnectPolicy, StreamConfig};

/// Externally visible connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStatus {
    Connecting,
    Connected,
    Failed,
    Waiting,
    Offline,
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Waiting => "waiting",
            Self::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Status plus retry bookkeeping, published on every status change.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub status: StreamStatus,
    pub connected: bool,
    pub retry_count: u32,
    /// When the next automatic attempt fires, if one is scheduled
    pub retry_at: Option<Instant>,
    /// Why the stream failed, for `failed`
    pub reason: Option<String>,
}

/// Why a transport went away.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connect attempt timed out")]
    ConnectTimeout,
    #[error("no frames received within the idle timeout")]
    IdleTimeout,
    #[error("closed by peer")]
    Closed,
    #[error("heartbeat timed out")]
    HeartbeatTimeout,
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamAction {
    /// Start a new transport attempt, dropping any previous one
    Open,
    /// Drop the current transport
    Close,
    Status(StatusSnapshot),
    /// The transport just opened; the owner should (re)send its state
    Reset,
    Disconnected(Option<StreamError>),
}

/// Backoff delay before retry number `count + 1`. `unit` is a uniform
/// sample in `[0, 1)` used for fuzzing.
pub fn backoff_delay(config: &StreamConfig, count: u32, unit: f64) -> Duration {
    if count < config.retry_min_count {
        return Duration::from_millis(config.retry_min_timeout_ms);
    }
    let raw = config.retry_base_timeout_ms as f64 * config.retry_exponent.powi(count as i32);
    let capped = raw.min(config.retry_max_timeout_ms as f64);
    let fuzzed = capped * (unit * config.retry_fuzz + (1.0 - config.retry_fuzz / 2.0));
    Duration::from_millis(fuzzed.max(0.0) as u64)
}

/// Sans-IO connection state machine.
#[derive(Debug)]
pub struct StreamMachine {
    config: StreamConfig,
    status: StreamStatus,
    retry_count: u32,
    retry_at: Option<Instant>,
    connect_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    reason: Option<String>,
    destroyed: bool,
    /// The attempt in flight was triggered by a network-online signal
    online_attempt: bool,
    /// The owner has handled the last `Reset`; outbound frames may flow
    reset_handled: bool,
    last_published: Option<StreamStatus>,
}

impl StreamMachine {
    /// Start in `connecting` with a transport attempt under way.
    pub fn new(config: StreamConfig, now: Instant) -> (Self, Vec<StreamAction>) {
        let mut machine = Self {
            config,
            status: StreamStatus::Connecting,
            retry_count: 0,
            retry_at: None,
            connect_deadline: None,
            idle_deadline: None,
            reason: None,
            destroyed: false,
            online_attempt: false,
            reset_handled: false,
            last_published: None,
        };
        let mut actions = Vec::new();
        machine.set_status(StreamStatus::Connecting, &mut actions);
        machine.launch(now, &mut actions);
        (machine, actions)
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == StreamStatus::Connected
    }

    /// Whether an outbound frame may go out now. Frames the owner queued
    /// before handling the latest `Reset` belong to a previous transport
    /// and would precede the handshake.
    pub fn can_send(&self) -> bool {
        self.is_connected() && self.reset_handled
    }

    /// The owner has processed `Reset` and queued its handshake.
    pub fn on_reset_handled(&mut self) {
        if self.is_connected() {
            self.reset_handled = true;
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status,
            connected: self.status == StreamStatus::Connected,
            retry_count: self.retry_count,
            retry_at: self.retry_at,
            reason: self.reason.clone(),
        }
    }

    /// Earliest timer the driver must wake up for.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.connect_deadline, self.idle_deadline, self.retry_at]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn on_open(&mut self, now: Instant) -> Vec<StreamAction> {
        let mut actions = Vec::new();
        if self.destroyed {
            actions.push(StreamAction::Close);
            return actions;
        }
        self.connect_deadline = None;
        if self.status == StreamStatus::Connected {
            return actions;
        }
        self.retry_count = 0;
        self.retry_at = None;
        self.online_attempt = false;
        self.idle_deadline = Some(now + self.config.transport_idle_timeout());
        self.reset_handled = false;
        self.set_status(StreamStatus::Connected, &mut actions);
        // Reset comes after the status flip so the owner can send from it.
        actions.push(StreamAction::Reset);
        actions
    }

    /// Any inbound frame proves the transport alive.
    pub fn on_frame(&mut self, now: Instant) {
        if self.status == StreamStatus::Connected && !self.destroyed {
            self.idle_deadline = Some(now + self.config.transport_idle_timeout());
        }
    }

    pub fn on_transport_lost(&mut self, error: StreamError, now: Instant) -> Vec<StreamAction> {
        let mut actions = Vec::new();
        if self.destroyed
            || !matches!(self.status, StreamStatus::Connecting | StreamStatus::Connected)
        {
            return actions;
        }
        log::debug!("Connection lost: {error}");
        self.lost_connection(Some(error), now, &mut actions);
        actions
    }

    /// Fire whichever timers have expired.
    pub fn on_tick(&mut self, now: Instant) -> Vec<StreamAction> {
        let mut actions = Vec::new();
        if self.destroyed {
            return actions;
        }
        if self.connect_deadline.is_some_and(|d| d <= now) {
            log::debug!("Connect attempt timed out after {:?}", self.config.connect_timeout());
            self.lost_connection(Some(StreamError::ConnectTimeout), now, &mut actions);
        } else if self.idle_deadline.is_some_and(|d| d <= now) {
            log::debug!("Connection timeout. No frames received.");
            self.lost_connection(Some(StreamError::IdleTimeout), now, &mut actions);
        } else if self.retry_at.is_some_and(|d| d <= now) {
            self.retry_at = None;
            self.retry_now(true, now, &mut actions);
        }
        actions
    }

    /// Reconnect now. Connected streams only reconnect when forced.
    pub fn reconnect(&mut self, force: bool, now: Instant) -> Vec<StreamAction> {
        let mut actions = Vec::new();
        if self.destroyed {
            log::debug!("Ignoring reconnect on a closed stream");
            return actions;
        }
        self.online_attempt = false;
        match self.status {
            StreamStatus::Connected => {
                if !force {
                    return actions;
                }
                self.drop_transport(&mut actions);
                actions.push(StreamAction::Disconnected(None));
                self.set_status(StreamStatus::Waiting, &mut actions);
                self.retry_now(false, now, &mut actions);
            }
            StreamStatus::Connecting => {
                self.drop_transport(&mut actions);
                self.retry_now(false, now, &mut actions);
            }
            StreamStatus::Offline | StreamStatus::Waiting | StreamStatus::Failed => {
                self.retry_at = None;
                self.retry_now(false, now, &mut actions);
            }
        }
        actions
    }

    /// The host reports that the network came back.
    pub fn network_online(&mut self, now: Instant) -> Vec<StreamAction> {
        let mut actions = Vec::new();
        if self.destroyed || self.status != StreamStatus::Offline {
            return actions;
        }
        self.online_attempt = self.config.reconnect_policy == ReconnectPolicy::HoldAfterOnlineSignal;
        self.retry_at = None;
        self.retry_now(false, now, &mut actions);
        actions
    }

    /// Close for good. No further reconnects.
    pub fn disconnect(&mut self) -> Vec<StreamAction> {
        let mut actions = Vec::new();
        if self.destroyed {
            return actions;
        }
        self.destroyed = true;
        self.drop_transport(&mut actions);
        self.retry_at = None;
        self.set_status(StreamStatus::Offline, &mut actions);
        actions
    }

    /// Close for good, reporting a failure reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Vec<StreamAction> {
        let mut actions = Vec::new();
        if self.destroyed {
            return actions;
        }
        self.destroyed = true;
        self.drop_transport(&mut actions);
        self.retry_at = None;
        self.retry_count = 0;
        self.reason = Some(reason.into());
        self.set_status(StreamStatus::Failed, &mut actions);
        actions
    }

    fn lost_connection(&mut self, error: Option<StreamError>, now: Instant, actions: &mut Vec<StreamAction>) {
        self.drop_transport(actions);
        actions.push(StreamAction::Disconnected(error));
        self.retry_later(now, actions);
    }

    fn retry_later(&mut self, now: Instant, actions: &mut Vec<StreamAction>) {
        if self.online_attempt {
            self.online_attempt = false;
            self.retry_at = None;
            log::info!("Online-signal attempt failed; holding until an explicit reconnect");
            self.set_status(StreamStatus::Offline, actions);
            return;
        }
        let delay = backoff_delay(&self.config, self.retry_count, rand::random::<f64>());
        log::debug!("Retrying in {delay:?} (attempt {})", self.retry_count + 1);
        self.retry_at = Some(now + delay);
        self.set_status(StreamStatus::Offline, actions);
    }

    fn retry_now(&mut self, counted: bool, now: Instant, actions: &mut Vec<StreamAction>) {
        if self.destroyed {
            return;
        }
        if counted {
            self.retry_count += 1;
        }
        self.set_status(StreamStatus::Connecting, actions);
        self.launch(now, actions);
    }

    fn launch(&mut self, now: Instant, actions: &mut Vec<StreamAction>) {
        self.connect_deadline = Some(now + self.config.connect_timeout());
        actions.push(StreamAction::Open);
    }

    fn drop_transport(&mut self, actions: &mut Vec<StreamAction>) {
        self.connect_deadline = None;
        self.idle_deadline = None;
        actions.push(StreamAction::Close);
    }

    fn set_status(&mut self, status: StreamStatus, actions: &mut Vec<StreamAction>) {
        self.status = status;
        if self.last_published == Some(status) {
            return;
        }
        self.last_published = Some(status);
        actions.push(StreamAction::Status(self.snapshot()));
    }
}

/// Normalize a server URL to the WebSocket endpoint.
///
/// `http(s)://` becomes `ws(s)://`, bare hosts get `ws://`, and
/// `ddp+sockjs://` / `ddpi+sockjs://` map to `wss://` / `ws://` with any `*`
/// in the host replaced by a random digit. The path gets `/websocket`
/// appended unless it already ends with it.
pub fn to_websocket_url(url: &str) -> String {
    let (scheme, rest) = if let Some(rest) = url.strip_prefix("ddp+sockjs://") {
        ("wss", randomize_host(rest))
    } else if let Some(rest) = url.strip_prefix("ddpi+sockjs://") {
        ("ws", randomize_host(rest))
    } else if let Some(rest) = url.strip_prefix("https://") {
        ("wss", rest.to_string())
    } else if let Some(rest) = url.strip_prefix("http://") {
        ("ws", rest.to_string())
    } else if let Some(rest) = url.strip_prefix("wss://") {
        ("wss", rest.to_string())
    } else if let Some(rest) = url.strip_prefix("ws://") {
        ("ws", rest.to_string())
    } else {
        ("ws", url.to_string())
    };

    let trimmed = rest.trim_end_matches('/');
    if trimmed.ends_with("/websocket") {
        format!("{scheme}://{trimmed}")
    } else {
        format!("{scheme}://{trimmed}/websocket")
    }
}

fn randomize_host(rest: &str) -> String {
    let split = rest.find('/').unwrap_or(rest.len());
    let (host, path) = rest.split_at(split);
    let host: String = host
        .chars()
        .map(|c| {
            if c == '*' {
                char::from(b'0' + rand::random::<u8>() % 10)
            } else {
                c
            }
        })
        .collect();
    format!("{host}{path}")
}

// ─── Async driver ───────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture =
    Pin<Box<dyn Future<Output = Result<WsStream, tokio_tungstenite::tungstenite::Error>> + Send>>;

/// Events delivered to the stream's owner, in order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Status(StatusSnapshot),
    Reset,
    Message(String),
    Disconnected(Option<StreamError>),
}

#[derive(Debug)]
enum StreamCommand {
    Send(String),
    Reconnect { force: bool },
    NetworkOnline,
    Disconnect,
    Fail(String),
    Lost(StreamError),
    ResetHandled,
}

/// Handle to a stream task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectionStream {
    cmd_tx: mpsc::UnboundedSender<StreamCommand>,
    status_rx: watch::Receiver<StatusSnapshot>,
}

impl ConnectionStream {
    /// Spawn the stream task and start connecting to `url`.
    pub fn connect(url: &str, config: StreamConfig, capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let url = to_websocket_url(url);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
        let (machine, initial) = StreamMachine::new(config, Instant::now());
        let (status_tx, status_rx) = watch::channel(machine.snapshot());

        log::info!("Connecting to {url}");
        tokio::spawn(run_stream(url, machine, initial, cmd_rx, event_tx, status_tx));

        (Self { cmd_tx, status_rx }, event_rx)
    }

    /// Send a text frame. Dropped when not connected, or when the owner
    /// has not yet acknowledged the current transport's `Reset`.
    pub fn send(&self, text: String) {
        let _ = self.cmd_tx.send(StreamCommand::Send(text));
    }

    /// Acknowledge a `Reset` event. Frames sent before this call are
    /// dropped, frames sent after it go out on the new transport.
    pub fn reset_handled(&self) {
        let _ = self.cmd_tx.send(StreamCommand::ResetHandled);
    }

    pub fn reconnect(&self, force: bool) {
        let _ = self.cmd_tx.send(StreamCommand::Reconnect { force });
    }

    pub fn network_online(&self) {
        let _ = self.cmd_tx.send(StreamCommand::NetworkOnline);
    }

    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(StreamCommand::Disconnect);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.cmd_tx.send(StreamCommand::Fail(reason.into()));
    }

    /// Drop the current transport as if it had died and retry with backoff.
    pub fn report_lost(&self, error: StreamError) {
        let _ = self.cmd_tx.send(StreamCommand::Lost(error));
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status_rx.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_rx.clone()
    }
}

struct StreamIo {
    url: String,
    pending: Option<ConnectFuture>,
    sink: Option<SplitSink<WsStream, WsMessage>>,
    source: Option<SplitStream<WsStream>>,
}

impl StreamIo {
    fn open(&mut self) {
        let url = self.url.clone();
        self.pending = Some(Box::pin(async move {
            tokio_tungstenite::connect_async(url).await.map(|(ws, _)| ws)
        }));
    }

    async fn close(&mut self) {
        self.pending = None;
        self.source = None;
        if let Some(mut sink) = self.sink.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
        }
    }

    async fn send(&mut self, text: String) -> Result<(), StreamError> {
        match self.sink.as_mut() {
            Some(sink) => sink
                .send(WsMessage::Text(text.into()))
                .await
                .map_err(|e| StreamError::Transport(e.to_string())),
            None => Ok(()),
        }
    }
}

async fn next_connect(pending: &mut Option<ConnectFuture>) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
    let Some(fut) = pending.as_mut() else {
        return std::future::pending().await;
    };
    let result = fut.await;
    *pending = None;
    result
}

async fn next_frame(
    source: &mut Option<SplitStream<WsStream>>,
) -> Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>> {
    match source.as_mut() {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn run_stream(
    url: String,
    mut machine: StreamMachine,
    initial: Vec<StreamAction>,
    mut cmd_rx: mpsc::UnboundedReceiver<StreamCommand>,
    events: mpsc::Sender<StreamEvent>,
    status_tx: watch::Sender<StatusSnapshot>,
) {
    let mut io = StreamIo {
        url,
        pending: None,
        sink: None,
        source: None,
    };
    let mut alive = apply(initial, &mut io, &events, &status_tx).await;

    while alive {
        let deadline = machine.next_deadline();
        let actions = tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(StreamCommand::Send(text)) => {
                    if machine.can_send() {
                        match io.send(text).await {
                            Ok(()) => Vec::new(),
                            Err(e) => machine.on_transport_lost(e, Instant::now()),
                        }
                    } else {
                        log::trace!("Dropping frame while {}", machine.status());
                        Vec::new()
                    }
                }
                Some(StreamCommand::Reconnect { force }) => machine.reconnect(force, Instant::now()),
                Some(StreamCommand::NetworkOnline) => machine.network_online(Instant::now()),
                Some(StreamCommand::Fail(reason)) => machine.fail(reason),
                Some(StreamCommand::Lost(error)) => machine.on_transport_lost(error, Instant::now()),
                Some(StreamCommand::ResetHandled) => {
                    machine.on_reset_handled();
                    Vec::new()
                }
                Some(StreamCommand::Disconnect) | None => machine.disconnect(),
            },
            result = next_connect(&mut io.pending) => match result {
                Ok(ws) => {
                    let (sink, source) = ws.split();
                    io.sink = Some(sink);
                    io.source = Some(source);
                    machine.on_open(Instant::now())
                }
                Err(e) => machine.on_transport_lost(StreamError::Connect(e.to_string()), Instant::now()),
            },
            frame = next_frame(&mut io.source) => {
                let now = Instant::now();
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        machine.on_frame(now);
                        if events.send(StreamEvent::Message(text.as_str().to_string())).await.is_err() {
                            machine.disconnect()
                        } else {
                            Vec::new()
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => machine.on_transport_lost(StreamError::Closed, now),
                    Some(Ok(_)) => {
                        machine.on_frame(now);
                        Vec::new()
                    }
                    Some(Err(e)) => machine.on_transport_lost(StreamError::Transport(e.to_string()), now),
                }
            },
            _ = sleep_until_opt(deadline) => machine.on_tick(Instant::now()),
        };

        alive = apply(actions, &mut io, &events, &status_tx).await;
        if machine.is_destroyed() {
            break;
        }
    }

    io.close().await;
    log::debug!("Stream task finished ({})", machine.status());
}

/// Perform the machine's side effects. Returns false once the owner is gone.
async fn apply(
    actions: Vec<StreamAction>,
    io: &mut StreamIo,
    events: &mpsc::Sender<StreamEvent>,
    status_tx: &watch::Sender<StatusSnapshot>,
) -> bool {
    let mut alive = true;
    for action in actions {
        let event = match action {
            StreamAction::Open => {
                io.close().await;
                io.open();
                continue;
            }
            StreamAction::Close => {
                io.close().await;
                continue;
            }
            StreamAction::Status(snapshot) => {
                log::info!("Stream status: {}", snapshot.status);
                status_tx.send_replace(snapshot.clone());
                StreamEvent::Status(snapshot)
            }
            StreamAction::Reset => StreamEvent::Reset,
            StreamAction::Disconnected(error) => StreamEvent::Disconnected(error),
        };
        if events.send(event).await.is_err() {
            alive = false;
        }
    }
    alive
}
