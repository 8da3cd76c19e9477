//! Session transport: one logical STOMP-over-websocket connection.
//!
//! A background worker owns the socket. It performs the STOMP handshake,
//! keeps heart-beats flowing in both directions and, after an unexpected
//! drop, reconnects on a timer until the transport is disconnected. Nothing is
//! queued across connections: outbound frames are stamped with the epoch of
//! the connection they were published against and dropped if that connection
//! is gone.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::{with_timeout, ReconnectPolicy};
use crate::stream::frame::{is_heartbeat, Command, Frame, FrameError, HeartBeat, NegotiatedHeartBeat};
use crate::stream::proto::EncodeError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Raw websocket endpoint of a local whiteboard broker.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/ws/websocket";

/// Timings used when a [`TransportConfig`] field is not set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransportDefaults;

impl TransportDefaults {
    /// Heart-beat offered in both directions.
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(4000);
    /// Fixed wait between reconnect attempts.
    pub const RECONNECT_DELAY: Duration = Duration::from_millis(5000);
    /// Bound on one connection attempt.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Settings for one session transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Websocket URL of the broker.
    pub endpoint: String,
    /// Virtual host sent in CONNECT. Derived from `endpoint` when unset.
    pub host: Option<String>,
    /// Heart-beat period offered in both directions. Zero disables heart-beats.
    pub heartbeat_interval: Duration,
    /// Delay policy between reconnect attempts.
    pub reconnect: ReconnectPolicy,
    /// Upper bound for one websocket + STOMP handshake.
    pub connect_timeout: Duration,
}

impl TransportConfig {
    /// Config with the three knobs every caller sets; the rest keeps its
    /// defaults.
    pub fn new(
        endpoint: impl Into<String>,
        heartbeat_interval: Duration,
        reconnect_delay: Duration,
    ) -> Self {
        Self::default()
            .with_endpoint(endpoint)
            .with_heartbeat_interval(heartbeat_interval)
            .with_reconnect_policy(ReconnectPolicy::fixed(reconnect_delay))
    }

    /// Sets the broker websocket URL. Trailing whitespace is trimmed.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim_end().to_string();
        self
    }

    /// Overrides the CONNECT `host` header.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the heart-beat period offered to the broker.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the delay policy used between reconnect attempts.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Bounds each connection attempt, handshake included.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Host header value used in the CONNECT frame.
    pub fn host(&self) -> &str {
        match self.host.as_deref() {
            Some(host) => host,
            None => host_from_endpoint(&self.endpoint),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            host: None,
            heartbeat_interval: TransportDefaults::HEARTBEAT_INTERVAL,
            reconnect: ReconnectPolicy::fixed(TransportDefaults::RECONNECT_DELAY),
            connect_timeout: TransportDefaults::CONNECT_TIMEOUT,
        }
    }
}

fn host_from_endpoint(endpoint: &str) -> &str {
    let rest = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let authority = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);
    if let Some(bracketed) = authority.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed);
    }
    authority.split(':').next().unwrap_or(authority)
}

/// Lifecycle state of the transport worker.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum TransportState {
    /// Not started, stopped by `disconnect`, or first attempt failed.
    #[default]
    Disconnected,
    /// Websocket and STOMP handshake in flight.
    Connecting,
    /// Handshake done and subscriptions written.
    Connected,
    /// Waiting out the reconnect delay after a loss.
    ReconnectWait,
}

/// Snapshot of the transport state. `epoch` counts successful handshakes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnectionStatus {
    /// Current lifecycle state.
    pub state: TransportState,
    /// Number of handshakes completed so far.
    pub epoch: u64,
}

impl ConnectionStatus {
    /// True while frames can be published.
    pub fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
    }
}

/// Errors reported by the initial connect.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Broker answered CONNECT with an ERROR frame.
    #[error("connection rejected by broker: {0}")]
    Rejected(String),

    /// Attempt exceeded the configured connect timeout.
    #[error("handshake did not complete within {0:?}")]
    Timeout(Duration),

    /// Broker broke the handshake contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake reply was not a valid STOMP frame.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Username is blank or contains `/`.
    #[error("username must be non-empty and must not contain '/'")]
    InvalidUsername,

    /// Transport was disconnected before the handshake finished.
    #[error("connect cancelled")]
    Cancelled,

    /// Worker task ended without reporting a result.
    #[error("transport worker stopped before initial connect")]
    WorkerStopped,
}

/// Why a live connection was lost. Never surfaced to callers; the worker
/// logs it and reconnects.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Nothing arrived within twice the negotiated incoming period.
    #[error("no heart-beat received within {0:?}")]
    HeartbeatTimeout(Duration),

    /// Peer closed the websocket.
    #[error("socket closed by peer")]
    Closed,

    /// Websocket read failed.
    #[error("socket error: {0}")]
    Socket(String),

    /// Broker sent an ERROR frame on a live connection.
    #[error("broker error: {0}")]
    BrokerError(String),

    /// Writing to the websocket failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Errors produced when publishing a frame.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Transport is not in the connected state; the frame was dropped.
    #[error("not connected")]
    NotConnected,

    /// Outbound queue has been closed.
    #[error("transport worker is gone")]
    QueueClosed,

    /// Payload could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

/// Hooks the transport calls on its worker task.
///
/// Calls for one transport never overlap.
pub trait TransportListener: Send + Sync + 'static {
    /// Frames written right after each successful handshake, before the
    /// connection is reported as connected.
    fn on_connected(&self) -> Vec<Frame>;

    /// Inbound MESSAGE frame.
    fn on_message(&self, frame: &Frame);

    fn on_status(&self, _status: ConnectionStatus) {}
}

#[derive(Debug)]
struct Outbound {
    epoch: u64,
    frame: Frame,
}

/// Cloneable handle for writing frames to the live connection.
#[derive(Clone, Debug)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<Outbound>,
    status: watch::Receiver<ConnectionStatus>,
}

impl Publisher {
    /// True while the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    /// Latest transport status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Queues `frame` for the current connection without waiting for
    /// delivery. Fails immediately when not connected.
    pub fn send(&self, frame: Frame) -> Result<(), PublishError> {
        let status = *self.status.borrow();
        if !status.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.tx
            .send(Outbound {
                epoch: status.epoch,
                frame,
            })
            .map_err(|_| PublishError::QueueClosed)
    }
}

/// Owns exactly one logical broker connection.
#[derive(Debug)]
pub struct SessionTransport {
    config: TransportConfig,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    cancel: CancellationToken,
}

impl SessionTransport {
    /// Creates an idle transport. Nothing touches the network until
    /// [`SessionTransport::connect`].
    pub fn new(config: TransportConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            config,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            status: Arc::new(status),
            cancel: CancellationToken::new(),
        }
    }

    /// Settings this transport was built with.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Handle for queueing frames; usable from any thread.
    pub fn publisher(&self) -> Publisher {
        Publisher {
            tx: self.outbound_tx.clone(),
            status: self.status.subscribe(),
        }
    }

    /// Receiver that observes every state change.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Status at the time of the call.
    pub fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Establishes the connection and starts the worker.
    ///
    /// Resolves once the first handshake succeeds and `listener`'s
    /// `on_connected` frames have been written, or with the first attempt's
    /// error. Later drops are handled by the worker and never surface here.
    pub async fn connect(
        &mut self,
        listener: Arc<dyn TransportListener>,
    ) -> Result<(), ConnectError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }
        let outbound_rx = self
            .outbound_rx
            .take()
            .ok_or_else(|| ConnectError::Protocol("transport was already started".to_string()))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = TransportWorker {
            config: self.config.clone(),
            listener,
            outbound_rx,
            status: Arc::clone(&self.status),
            cancel: self.cancel.clone(),
            epoch: 0,
            notified: TransportState::Disconnected,
        };
        tokio::spawn(worker.run(ready_tx));

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::WorkerStopped),
        }
    }

    /// Tears the connection down and cancels any pending reconnect.
    ///
    /// Idempotent. The status flips to `Disconnected` before this returns,
    /// so no publish issued afterwards reaches the broker.
    pub fn disconnect(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.status
            .send_modify(|status| status.state = TransportState::Disconnected);
        debug!(event = "transport_disconnect_requested", endpoint = %self.config.endpoint);
    }

    /// True once [`SessionTransport::disconnect`] has been called.
    pub fn is_disconnected(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

enum SessionOutcome {
    Shutdown,
    Lost(DisconnectReason),
}

struct TransportWorker {
    config: TransportConfig,
    listener: Arc<dyn TransportListener>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    cancel: CancellationToken,
    epoch: u64,
    notified: TransportState,
}

impl TransportWorker {
    async fn run(mut self, ready_tx: oneshot::Sender<Result<(), ConnectError>>) {
        let mut ready_tx = Some(ready_tx);
        let mut failures = 0usize;

        loop {
            self.set_state(TransportState::Connecting);
            let timeout = self.config.connect_timeout;
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => Err(ConnectError::Cancelled),
                result = with_timeout(timeout, self.establish()) => {
                    result.unwrap_or(Err(ConnectError::Timeout(timeout)))
                }
            };

            match attempt {
                Ok((socket, heart_beat)) => {
                    failures = 0;
                    match self.run_connected(socket, heart_beat, &mut ready_tx).await {
                        SessionOutcome::Shutdown => break,
                        SessionOutcome::Lost(reason) => {
                            warn!(
                                event = "transport_lost",
                                endpoint = %self.config.endpoint,
                                epoch = self.epoch,
                                reason = %reason
                            );
                        }
                    }
                }
                Err(err) => {
                    if let Some(tx) = ready_tx.take() {
                        warn!(event = "connect_failed", endpoint = %self.config.endpoint, error = %err);
                        let _ = tx.send(Err(err));
                        self.set_state(TransportState::Disconnected);
                        return;
                    }
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    failures += 1;
                    warn!(
                        event = "reconnect_attempt_failed",
                        endpoint = %self.config.endpoint,
                        attempt = failures,
                        error = %err
                    );
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            let delay = self.config.reconnect.delay_for_attempt(failures.max(1));
            self.set_state(TransportState::ReconnectWait);
            debug!(
                event = "reconnect_scheduled",
                delay_ms = delay.as_millis() as u64
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.discard_outbound();
        self.set_state(TransportState::Disconnected);
        info!(event = "transport_stopped", endpoint = %self.config.endpoint);
    }

    async fn establish(&self) -> Result<(Socket, NegotiatedHeartBeat), ConnectError> {
        debug!(event = "transport_connecting", endpoint = %self.config.endpoint);
        let (mut socket, _) = connect_async(self.config.endpoint.as_str()).await?;

        let offer = HeartBeat::symmetric(self.config.heartbeat_interval);
        send_frame(&mut socket, &Frame::connect(self.config.host(), offer)).await?;

        let reply = recv_handshake_frame(&mut socket).await?;
        match reply.command {
            Command::Connected => {
                let server = match reply.header("heart-beat") {
                    Some(value) => value.parse()?,
                    None => HeartBeat::default(),
                };
                Ok((socket, HeartBeat::negotiate(offer, server)))
            }
            Command::Error => Err(ConnectError::Rejected(reply.error_message())),
            other => Err(ConnectError::Protocol(format!(
                "expected CONNECTED, got {other}"
            ))),
        }
    }

    async fn run_connected(
        &mut self,
        mut socket: Socket,
        heart_beat: NegotiatedHeartBeat,
        ready_tx: &mut Option<oneshot::Sender<Result<(), ConnectError>>>,
    ) -> SessionOutcome {
        self.epoch += 1;

        for frame in self.listener.on_connected() {
            if let Err(err) = send_frame(&mut socket, &frame).await {
                return setup_write_failed(ready_tx, err);
            }
        }

        self.set_state(TransportState::Connected);
        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Ok(()));
        }
        info!(
            event = "transport_connected",
            endpoint = %self.config.endpoint,
            epoch = self.epoch,
            outgoing_heartbeat_ms = heart_beat.outgoing.map_or(0, |d| d.as_millis() as u64),
            incoming_heartbeat_ms = heart_beat.incoming.map_or(0, |d| d.as_millis() as u64)
        );

        let mut send_tick = heart_beat.outgoing.map(ticker);
        let mut check_tick = heart_beat.incoming.map(ticker);
        let dead_after = heart_beat.incoming.map(|period| period.saturating_mul(2));
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.flush_outbound(&mut socket).await;
                    close_gracefully(&mut socket).await;
                    return SessionOutcome::Shutdown;
                }
                maybe_outbound = self.outbound_rx.recv() => {
                    let Some(outbound) = maybe_outbound else {
                        close_gracefully(&mut socket).await;
                        return SessionOutcome::Shutdown;
                    };
                    let Some(frame) = self.current_frame(outbound) else {
                        continue;
                    };
                    if let Err(err) = send_frame(&mut socket, &frame).await {
                        return SessionOutcome::Lost(DisconnectReason::SendFailed(err.to_string()));
                    }
                }
                maybe_inbound = socket.next() => {
                    let message = match maybe_inbound {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => {
                            return SessionOutcome::Lost(DisconnectReason::Socket(err.to_string()));
                        }
                        None => return SessionOutcome::Lost(DisconnectReason::Closed),
                    };
                    last_seen = Instant::now();
                    match message {
                        Message::Ping(payload) => {
                            if let Err(err) = socket.send(Message::Pong(payload)).await {
                                return SessionOutcome::Lost(DisconnectReason::SendFailed(err.to_string()));
                            }
                        }
                        Message::Close(_) => return SessionOutcome::Lost(DisconnectReason::Closed),
                        Message::Text(_) | Message::Binary(_) => {
                            if let Some(reason) = self.handle_inbound(&message) {
                                return SessionOutcome::Lost(reason);
                            }
                        }
                        _ => {}
                    }
                }
                _ = next_tick(send_tick.as_mut()) => {
                    if let Err(err) = socket.send(Message::Text(String::from("\n").into())).await {
                        return SessionOutcome::Lost(DisconnectReason::SendFailed(err.to_string()));
                    }
                }
                _ = next_tick(check_tick.as_mut()) => {
                    if let Some(limit) = dead_after {
                        if last_seen.elapsed() > limit {
                            return SessionOutcome::Lost(DisconnectReason::HeartbeatTimeout(limit));
                        }
                    }
                }
            }
        }
    }

    /// Unwraps a queued frame if it was published against the live
    /// connection.
    fn current_frame(&self, outbound: Outbound) -> Option<Frame> {
        if outbound.epoch == self.epoch {
            return Some(outbound.frame);
        }
        warn!(
            event = "stale_frame_dropped",
            frame_epoch = outbound.epoch,
            epoch = self.epoch,
            destination = outbound.frame.header("destination").unwrap_or_default()
        );
        None
    }

    /// Writes frames accepted before a disconnect so they precede DISCONNECT.
    async fn flush_outbound(&mut self, socket: &mut Socket) {
        while let Ok(outbound) = self.outbound_rx.try_recv() {
            let Some(frame) = self.current_frame(outbound) else {
                continue;
            };
            if let Err(err) = send_frame(socket, &frame).await {
                log_dropped(&frame, &err.to_string());
                break;
            }
        }
        self.discard_outbound();
    }

    /// Drops whatever is still queued, logging each frame.
    fn discard_outbound(&mut self) {
        while let Ok(outbound) = self.outbound_rx.try_recv() {
            log_dropped(&outbound.frame, "transport stopped");
        }
    }

    fn handle_inbound(&self, message: &Message) -> Option<DisconnectReason> {
        let Some(text) = message_text(message) else {
            warn!(event = "inbound_frame_dropped", error = "payload is not utf-8");
            return None;
        };
        if is_heartbeat(text) {
            return None;
        }

        // Brokers may pack several frames into one websocket message.
        for parsed in Frame::parse_all(text) {
            let frame = match parsed {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(event = "inbound_frame_dropped", error = %err);
                    return None;
                }
            };
            match frame.command {
                Command::Message => self.listener.on_message(&frame),
                Command::Error => {
                    return Some(DisconnectReason::BrokerError(frame.error_message()));
                }
                Command::Receipt => {}
                other => debug!(event = "unexpected_frame_ignored", command = %other),
            }
        }
        None
    }

    fn set_state(&mut self, state: TransportState) {
        let epoch = self.epoch;
        let cancel = &self.cancel;
        let mut applied = false;
        self.status.send_if_modified(|status| {
            if cancel.is_cancelled() && state != TransportState::Disconnected {
                return false;
            }
            applied = true;
            let changed = status.state != state || status.epoch != epoch;
            *status = ConnectionStatus { state, epoch };
            changed
        });

        if applied && self.notified != state {
            self.notified = state;
            self.listener.on_status(ConnectionStatus { state, epoch });
        }
    }
}

/// A failed setup write on the first connection fails `connect`; on later
/// connections it is an ordinary loss.
fn setup_write_failed(
    ready_tx: &mut Option<oneshot::Sender<Result<(), ConnectError>>>,
    err: WsError,
) -> SessionOutcome {
    match ready_tx.take() {
        Some(tx) => {
            warn!(event = "connect_failed", error = %err, stage = "setup");
            let _ = tx.send(Err(ConnectError::WebSocket(err)));
            SessionOutcome::Shutdown
        }
        None => SessionOutcome::Lost(DisconnectReason::SendFailed(err.to_string())),
    }
}

fn log_dropped(frame: &Frame, reason: &str) {
    warn!(
        event = "publish_dropped",
        destination = frame.header("destination").unwrap_or_default(),
        reason = %reason
    );
}

async fn recv_handshake_frame(socket: &mut Socket) -> Result<Frame, ConnectError> {
    loop {
        let message = match socket.next().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => return Err(ConnectError::WebSocket(err)),
            None => {
                return Err(ConnectError::Protocol(
                    "socket ended before CONNECTED".to_string(),
                ));
            }
        };
        match message {
            Message::Ping(payload) => socket.send(Message::Pong(payload)).await?,
            Message::Close(_) => {
                return Err(ConnectError::Protocol(
                    "socket closed before CONNECTED".to_string(),
                ));
            }
            Message::Text(_) | Message::Binary(_) => {
                let text = message_text(&message).ok_or_else(|| {
                    ConnectError::Protocol("received non utf-8 frame before CONNECTED".to_string())
                })?;
                if is_heartbeat(text) {
                    continue;
                }
                return Ok(Frame::parse(text)?);
            }
            _ => {}
        }
    }
}

async fn send_frame(socket: &mut Socket, frame: &Frame) -> Result<(), WsError> {
    socket.send(Message::Text(frame.to_text().into())).await
}

async fn close_gracefully(socket: &mut Socket) {
    let _ = send_frame(socket, &Frame::disconnect()).await;
    let _ = socket.close(None).await;
}

fn message_text(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
