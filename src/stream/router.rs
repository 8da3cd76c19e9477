//! Topic router: maps logical channels to broker destinations and inbound
//! messages to handlers.
//!
//! Subscriptions live here rather than on the connection, so they are replayed
//! on every successful (re)connect through [`TopicRouter::subscribe_frames`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::stream::client::{PublishError, Publisher};
use crate::stream::frame::Frame;
use crate::stream::proto::{decode, decode_batch, DrawEvent, HistoryBatch};

const USERNAME_PLACEHOLDER: &str = "{username}";
const SUBSCRIPTION_PREFIX: &str = "sub-";

/// Logical whiteboard channel.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Channel {
    /// Fan-out of live draw and clear events to every participant.
    Broadcast,
    /// Where outbound draw events are published.
    Draw,
    /// Client to server clear trigger.
    Clear,
    /// Client to server history request.
    Join,
    /// Private history delivery for one user.
    HistoryBatch(String),
}

/// Broker destination for every [`Channel`].
///
/// `history_batch` is a template; `{username}` is replaced with the user the
/// channel belongs to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelMap {
    pub broadcast: String,
    pub draw: String,
    pub clear: String,
    pub join: String,
    pub history_batch: String,
}

impl ChannelMap {
    /// Broker-agnostic channel names. Draw events go straight to the
    /// broadcast channel.
    pub fn logical() -> Self {
        Self {
            broadcast: "whiteboard.broadcast".to_string(),
            draw: "whiteboard.broadcast".to_string(),
            clear: "whiteboard.clear".to_string(),
            join: "whiteboard.join".to_string(),
            history_batch: "whiteboard.history.batch.{username}".to_string(),
        }
    }

    /// Destinations of a Spring simple broker with `/app` application and
    /// `/user` user prefixes.
    pub fn spring_stomp() -> Self {
        Self {
            broadcast: "/topic/whiteboard".to_string(),
            draw: "/app/whiteboard.draw".to_string(),
            clear: "/app/whiteboard.clear".to_string(),
            join: "/app/whiteboard.join".to_string(),
            history_batch: "/user/{username}/queue/whiteboard.history.batch".to_string(),
        }
    }

    pub fn resolve(&self, channel: &Channel) -> String {
        match channel {
            Channel::Broadcast => self.broadcast.clone(),
            Channel::Draw => self.draw.clone(),
            Channel::Clear => self.clear.clone(),
            Channel::Join => self.join.clone(),
            Channel::HistoryBatch(username) => {
                self.history_batch.replace(USERNAME_PLACEHOLDER, username)
            }
        }
    }
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::logical()
    }
}

/// Callback for single draw events.
pub type EventHandler = Arc<dyn Fn(DrawEvent) + Send + Sync>;
/// Callback for history batches.
pub type BatchHandler = Arc<dyn Fn(HistoryBatch) + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Event(EventHandler),
    Batch(BatchHandler),
}

/// Identifier of one registered subscription, sent as the STOMP `id`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn from_header(value: &str) -> Option<Self> {
        value
            .strip_prefix(SUBSCRIPTION_PREFIX)
            .and_then(|n| n.parse().ok())
            .map(SubscriptionId)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SUBSCRIPTION_PREFIX}{}", self.0)
    }
}

struct Subscription {
    id: SubscriptionId,
    destination: String,
    handler: Handler,
}

pub struct TopicRouter {
    channels: ChannelMap,
    publisher: Publisher,
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl TopicRouter {
    pub fn new(channels: ChannelMap, publisher: Publisher) -> Self {
        Self {
            channels,
            publisher,
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// Registers a draw event handler for `channel`.
    ///
    /// Payloads that fail to decode are logged and never reach `handler`.
    pub fn subscribe<F>(&self, channel: &Channel, handler: F) -> SubscriptionId
    where
        F: Fn(DrawEvent) + Send + Sync + 'static,
    {
        self.register(channel, Handler::Event(Arc::new(handler)))
    }

    /// Registers a history batch handler for `channel`.
    pub fn subscribe_batch<F>(&self, channel: &Channel, handler: F) -> SubscriptionId
    where
        F: Fn(HistoryBatch) + Send + Sync + 'static,
    {
        self.register(channel, Handler::Batch(Arc::new(handler)))
    }

    /// Removes a subscription. Returns false when `id` is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut subscriptions = self.write();
            let before = subscriptions.len();
            subscriptions.retain(|subscription| subscription.id != id);
            subscriptions.len() != before
        };
        if removed && self.publisher.is_connected() {
            if let Err(err) = self.publisher.send(Frame::unsubscribe(&id.to_string())) {
                debug!(event = "unsubscribe_not_sent", subscription = %id, error = %err);
            }
        }
        removed
    }

    pub fn subscription_count(&self) -> usize {
        self.read().len()
    }

    /// Encodes `event` and publishes it to `channel`.
    ///
    /// Fire-and-forget: when the transport is not connected the event is
    /// dropped with a warning and the error is returned for inspection.
    pub fn publish(&self, channel: &Channel, event: &DrawEvent) -> Result<(), PublishError> {
        let destination = self.channels.resolve(channel);
        let result = event
            .to_text()
            .map_err(PublishError::from)
            .and_then(|body| self.publisher.send(Frame::send(&destination, body)));
        if let Err(err) = &result {
            warn!(
                event = "publish_dropped",
                destination = %destination,
                kind = ?event.kind,
                error = %err
            );
        }
        result
    }

    /// SUBSCRIBE frames for every registered subscription, in registration
    /// order.
    pub fn subscribe_frames(&self) -> Vec<Frame> {
        self.read()
            .iter()
            .map(|subscription| {
                Frame::subscribe(&subscription.id.to_string(), &subscription.destination)
            })
            .collect()
    }

    /// Routes an inbound MESSAGE frame to its handler.
    ///
    /// Matches on the `subscription` header first and falls back to
    /// `destination`. Returns true when a handler was invoked.
    pub fn dispatch(&self, frame: &Frame) -> bool {
        let matched = {
            let subscriptions = self.read();
            let by_id = frame
                .header("subscription")
                .and_then(SubscriptionId::from_header)
                .and_then(|id| subscriptions.iter().find(|s| s.id == id));
            let by_destination = || {
                frame.header("destination").and_then(|destination| {
                    subscriptions.iter().find(|s| s.destination == destination)
                })
            };
            by_id
                .or_else(by_destination)
                .map(|s| (s.id, s.handler.clone()))
        };

        let Some((id, handler)) = matched else {
            debug!(
                event = "message_without_subscription",
                destination = frame.header("destination").unwrap_or_default()
            );
            return false;
        };

        let body = frame.body.as_bytes();
        match handler {
            Handler::Event(handler) => match decode(body) {
                Ok(event) => {
                    handler(event);
                    true
                }
                Err(err) => {
                    warn!(event = "inbound_decode_failed", subscription = %id, error = %err);
                    false
                }
            },
            Handler::Batch(handler) => match decode_batch(body) {
                Ok(batch) => {
                    handler(batch);
                    true
                }
                Err(err) => {
                    warn!(event = "inbound_decode_failed", subscription = %id, error = %err);
                    false
                }
            },
        }
    }

    fn register(&self, channel: &Channel, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let destination = self.channels.resolve(channel);
        self.write().push(Subscription {
            id,
            destination: destination.clone(),
            handler,
        });
        debug!(event = "subscription_registered", subscription = %id, destination = %destination);

        // Already connected: the next on_connected replay would be too late.
        if self.publisher.is_connected() {
            if let Err(err) = self.publisher.send(Frame::subscribe(&id.to_string(), &destination)) {
                debug!(event = "subscribe_not_sent", subscription = %id, error = %err);
            }
        }
        id
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRouter")
            .field("channels", &self.channels)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{Channel, ChannelMap, TopicRouter};
    use crate::stream::client::{PublishError, SessionTransport, TransportConfig};
    use crate::stream::frame::{Command, Frame};
    use crate::stream::proto::{DrawEvent, DrawEventType, HistoryBatch};

    fn router() -> TopicRouter {
        let transport = SessionTransport::new(TransportConfig::default());
        TopicRouter::new(ChannelMap::logical(), transport.publisher())
    }

    fn message(subscription: &str, destination: &str, body: &str) -> Frame {
        Frame::new(Command::Message)
            .with_header("subscription", subscription)
            .with_header("destination", destination)
            .with_body(body)
    }

    #[test]
    fn resolves_logical_and_spring_destinations() {
        let logical = ChannelMap::logical();
        assert_eq!(logical.resolve(&Channel::Draw), "whiteboard.broadcast");
        assert_eq!(
            logical.resolve(&Channel::HistoryBatch("alice".to_string())),
            "whiteboard.history.batch.alice"
        );

        let spring = ChannelMap::spring_stomp();
        assert_eq!(spring.resolve(&Channel::Broadcast), "/topic/whiteboard");
        assert_eq!(spring.resolve(&Channel::Join), "/app/whiteboard.join");
        assert_eq!(
            spring.resolve(&Channel::HistoryBatch("bob".to_string())),
            "/user/bob/queue/whiteboard.history.batch"
        );
    }

    #[test]
    fn subscribe_frames_replay_in_registration_order() {
        let router = router();
        router.subscribe(&Channel::Broadcast, |_| {});
        router.subscribe_batch(&Channel::HistoryBatch("alice".to_string()), |_| {});

        let frames = router.subscribe_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].header("id"), Some("sub-0"));
        assert_eq!(frames[0].header("destination"), Some("whiteboard.broadcast"));
        assert_eq!(frames[1].header("id"), Some("sub-1"));
        assert_eq!(
            frames[1].header("destination"),
            Some("whiteboard.history.batch.alice")
        );
        assert_eq!(router.subscribe_frames(), frames);
    }

    #[test]
    fn dispatches_by_subscription_then_destination() {
        let router = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        router.subscribe(&Channel::Broadcast, move |event| {
            sink.lock().expect("lock").push(event);
        });

        let event = DrawEvent::stroke("alice", DrawEventType::Draw, 0.5, 0.5, "#000", 2.0);
        let body = event.to_text().expect("encode");
        assert!(router.dispatch(&message("sub-0", "ignored", &body)));

        let by_destination = Frame::new(Command::Message)
            .with_header("destination", "whiteboard.broadcast")
            .with_body(body.as_str());
        assert!(router.dispatch(&by_destination));
        assert!(!router.dispatch(&message("sub-9", "elsewhere", &body)));

        assert_eq!(*seen.lock().expect("lock"), vec![event.clone(), event]);
    }

    #[test]
    fn decode_failures_are_swallowed() {
        let router = router();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        router.subscribe(&Channel::Broadcast, move |_| {
            *counter.lock().expect("lock") += 1;
        });

        assert!(!router.dispatch(&message("sub-0", "whiteboard.broadcast", "{not json")));
        assert!(!router.dispatch(&message(
            "sub-0",
            "whiteboard.broadcast",
            r#"{"username":"a","type":"SPIN","x":0,"y":0,"color":"","lineWidth":1,"isEraser":false}"#
        )));
        assert_eq!(*calls.lock().expect("lock"), 0);
    }

    #[test]
    fn batch_subscription_receives_whole_batch() {
        let router = router();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        router.subscribe_batch(&Channel::HistoryBatch("alice".to_string()), move |batch| {
            sink.lock().expect("lock").push(batch);
        });

        let batch = HistoryBatch::new(vec![
            DrawEvent::stroke("x", DrawEventType::Start, 0.1, 0.1, "#1", 1.0),
            DrawEvent::clear("y"),
        ]);
        let body = batch.to_text().expect("encode");
        assert!(router.dispatch(&message("sub-0", "whiteboard.history.batch.alice", &body)));
        assert_eq!(*batches.lock().expect("lock"), vec![batch]);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let router = router();
        let id = router.subscribe(&Channel::Broadcast, |_| {});
        assert_eq!(router.subscription_count(), 1);
        assert!(router.unsubscribe(id));
        assert!(!router.unsubscribe(id));
        assert!(router.subscribe_frames().is_empty());
    }

    #[test]
    fn publish_while_disconnected_drops_event() {
        let router = router();
        let result = router.publish(&Channel::Draw, &DrawEvent::clear("alice"));
        assert!(matches!(result, Err(PublishError::NotConnected)));

        let mut bad = DrawEvent::clear("alice");
        bad.y = f64::NAN;
        assert!(matches!(
            router.publish(&Channel::Draw, &bad),
            Err(PublishError::Encode(_))
        ));
    }
}
