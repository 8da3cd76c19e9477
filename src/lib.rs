//! Realtime transport client for collaborative whiteboard sessions.
//!
//! The crate is organized by concern:
//! - `stream`: broker connection, topic routing, history replay and the
//!   session facade the rendering layer calls.
//! - `retry`: reconnect delay policy and timeout helpers.

/// Reconnect delay and timeout helpers.
pub mod retry;
/// Realtime whiteboard transport, protocol types, and session API.
pub mod stream;

pub use stream::proto::{DrawEvent, DrawEventType, HistoryBatch};
pub use stream::session::{WhiteboardClient, WhiteboardSession};
