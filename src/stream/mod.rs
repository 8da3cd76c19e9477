//! Realtime whiteboard modules.
//!
//! - `frame`: STOMP frames and heart-beat negotiation.
//! - `proto`: draw event and history batch wire codec.
//! - `client`: websocket transport with heart-beats and reconnects.
//! - `router`: channel destinations and inbound dispatch.
//! - `history`: one-shot history replay after joining.
//! - `session`: public connect/send/disconnect API.

/// Session transport and connection state.
pub mod client;
/// STOMP frame codec.
pub mod frame;
/// History replay state machine.
pub mod history;
/// Whiteboard payloads.
pub mod proto;
/// Topic routing.
pub mod router;
/// Client facade.
pub mod session;
