//! History replay for a joining client.
//!
//! After the connection comes up the client announces itself on the join
//! channel; the broker answers with one history batch on the user's private
//! channel. The batch is handed to the caller exactly once, as a unit, so the
//! consumer sees a consistent snapshot before live events interleave.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::stream::frame::Frame;
use crate::stream::proto::{DrawEvent, HistoryBatch};
use crate::stream::router::{Channel, ChannelMap};

/// Progress of a session's history request.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HistoryState {
    /// No join request sent yet.
    #[default]
    Idle,
    /// Join sent, batch not yet received.
    AwaitingHistory,
    /// Batch handed to the caller; later batches are ignored.
    Delivered,
}

type HistoryHandler = Box<dyn Fn(Vec<DrawEvent>) + Send + Sync>;

/// Requests history on join and hands the reply to the caller once.
pub struct HistoryReplay {
    username: String,
    join_destination: String,
    state: Mutex<HistoryState>,
    handler: HistoryHandler,
}

impl HistoryReplay {
    /// `handler` receives the replayed events in broker order.
    pub fn new<F>(username: impl Into<String>, channels: &ChannelMap, handler: F) -> Self
    where
        F: Fn(Vec<DrawEvent>) + Send + Sync + 'static,
    {
        Self {
            username: username.into(),
            join_destination: channels.resolve(&Channel::Join),
            state: Mutex::new(HistoryState::Idle),
            handler: Box::new(handler),
        }
    }

    /// User the join request is sent for.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Current replay state.
    pub fn state(&self) -> HistoryState {
        *self.lock()
    }

    /// Join request to write after a (re)connect.
    ///
    /// Returns `None` once history has been delivered; until then every
    /// connection re-sends the request, since a batch addressed to a dropped
    /// connection is lost.
    pub fn join_frame(&self) -> Option<Frame> {
        let mut state = self.lock();
        if *state == HistoryState::Delivered {
            return None;
        }

        let body = match DrawEvent::join(&self.username).to_text() {
            Ok(body) => body,
            Err(err) => {
                warn!(event = "join_request_not_encoded", username = %self.username, error = %err);
                return None;
            }
        };
        *state = HistoryState::AwaitingHistory;
        debug!(event = "join_requested", username = %self.username);
        Some(Frame::send(&self.join_destination, body))
    }

    /// Hands a received batch to the caller unless one was already delivered.
    ///
    /// Returns true when the handler ran.
    pub fn deliver(&self, batch: HistoryBatch) -> bool {
        {
            let mut state = self.lock();
            if *state == HistoryState::Delivered {
                debug!(
                    event = "duplicate_history_ignored",
                    username = %self.username,
                    events = batch.events.len()
                );
                return false;
            }
            *state = HistoryState::Delivered;
        }

        info!(
            event = "history_delivered",
            username = %self.username,
            events = batch.events.len()
        );
        (self.handler)(batch.events);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HistoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for HistoryReplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryReplay")
            .field("username", &self.username)
            .field("join_destination", &self.join_destination)
            .field("state", &self.state())
            .finish()
    }
}
