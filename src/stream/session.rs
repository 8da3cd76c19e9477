//! Public whiteboard session API.
//!
//! `WhiteboardClient::connect` wires a fresh transport, router and history
//! replay together and returns an owned [`WhiteboardSession`]. Sessions share
//! no state, so several whiteboards can run side by side in one process.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::stream::client::{
    ConnectError, ConnectionStatus, PublishError, SessionTransport, TransportConfig,
    TransportListener,
};
use crate::stream::frame::Frame;
use crate::stream::history::{HistoryReplay, HistoryState};
use crate::stream::proto::DrawEvent;
use crate::stream::router::{Channel, ChannelMap, TopicRouter};

/// Callback invoked on every transport state change.
pub type StatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Entry point for opening whiteboard sessions.
#[derive(Clone, Default)]
pub struct WhiteboardClient {
    config: TransportConfig,
    channels: ChannelMap,
    status_handler: Option<StatusHandler>,
}

impl WhiteboardClient {
    /// Client with the default endpoint, timings and channel map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the broker websocket endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config = self.config.with_endpoint(endpoint);
        self
    }

    /// Replaces the whole transport configuration.
    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Selects the broker destination naming, e.g. [`ChannelMap::spring_stomp`].
    pub fn with_channels(mut self, channels: ChannelMap) -> Self {
        self.channels = channels;
        self
    }

    /// Observes connection state changes, including silent reconnects.
    pub fn with_status_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.status_handler = Some(Arc::new(handler));
        self
    }

    /// Transport configuration used for new sessions.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Channel map used for new sessions.
    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// Connects as `username`.
    ///
    /// `on_draw` receives every live event from the broadcast channel.
    /// `on_history` receives the history snapshot, at most once per session.
    /// Resolves after the subscriptions and the join request have been
    /// written; only this first attempt's failure is reported.
    pub async fn connect<D, H>(
        &self,
        username: impl Into<String>,
        on_draw: D,
        on_history: H,
    ) -> Result<WhiteboardSession, ConnectError>
    where
        D: Fn(DrawEvent) + Send + Sync + 'static,
        H: Fn(Vec<DrawEvent>) + Send + Sync + 'static,
    {
        let username = username.into();
        if username.trim().is_empty() || username.contains('/') {
            return Err(ConnectError::InvalidUsername);
        }

        let mut transport = SessionTransport::new(self.config.clone());
        let router = Arc::new(TopicRouter::new(
            self.channels.clone(),
            transport.publisher(),
        ));
        let history = Arc::new(HistoryReplay::new(
            username.as_str(),
            &self.channels,
            on_history,
        ));

        router.subscribe(&Channel::Broadcast, on_draw);
        let replay = Arc::clone(&history);
        router.subscribe_batch(&Channel::HistoryBatch(username.clone()), move |batch| {
            replay.deliver(batch);
        });

        let listener = Arc::new(SessionListener {
            router: Arc::clone(&router),
            history: Arc::clone(&history),
            status_handler: self.status_handler.clone(),
        });
        transport.connect(listener).await?;
        info!(event = "session_joined", username = %username, endpoint = %self.config.endpoint);

        Ok(WhiteboardSession {
            username,
            router,
            history,
            transport,
        })
    }
}

impl fmt::Debug for WhiteboardClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhiteboardClient")
            .field("config", &self.config)
            .field("channels", &self.channels)
            .field("status_handler", &self.status_handler.is_some())
            .finish()
    }
}

struct SessionListener {
    router: Arc<TopicRouter>,
    history: Arc<HistoryReplay>,
    status_handler: Option<StatusHandler>,
}

impl TransportListener for SessionListener {
    fn on_connected(&self) -> Vec<Frame> {
        // Subscribe first so the history reply has somewhere to land.
        let mut frames = self.router.subscribe_frames();
        frames.extend(self.history.join_frame());
        frames
    }

    fn on_message(&self, frame: &Frame) {
        self.router.dispatch(frame);
    }

    fn on_status(&self, status: ConnectionStatus) {
        if let Some(handler) = &self.status_handler {
            handler(status);
        }
    }
}

/// One joined whiteboard session. Dropping it disconnects.
#[derive(Debug)]
pub struct WhiteboardSession {
    username: String,
    router: Arc<TopicRouter>,
    history: Arc<HistoryReplay>,
    transport: SessionTransport,
}

impl WhiteboardSession {
    /// Name this session joined with.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Receiver that observes transport state changes.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.transport.status()
    }

    /// True while events can be sent.
    pub fn is_connected(&self) -> bool {
        self.transport.current_status().is_connected()
    }

    /// Progress of the one-time history replay.
    pub fn history_state(&self) -> HistoryState {
        self.history.state()
    }

    /// Router for registering additional subscriptions.
    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// Publishes a draw event. Fire-and-forget: while disconnected the event
    /// is dropped and a warning is logged.
    pub fn send_draw_event(&self, event: DrawEvent) -> Result<(), PublishError> {
        self.router.publish(&Channel::Draw, &event)
    }

    /// Asks every participant to clear the canvas.
    pub fn send_clear_event(&self, username: &str) -> Result<(), PublishError> {
        self.router.publish(&Channel::Clear, &DrawEvent::clear(username))
    }

    /// Leaves the session. Safe to call repeatedly.
    pub fn disconnect(&self) {
        if self.transport.is_disconnected() {
            return;
        }
        self.transport.disconnect();
        info!(event = "session_left", username = %self.username);
    }
}
