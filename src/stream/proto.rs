//! Whiteboard payloads and their JSON wire codec.
//!
//! Every draw event carries the same seven fields regardless of its type, so
//! the wire shape stays flat and the codec is a direct serde mapping.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag value of the history batch envelope.
pub const HISTORY_BATCH_TYPE: &str = "HISTORY_BATCH";

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrawEventType {
    Start,
    Draw,
    Erase,
    End,
    Clear,
}

/// Atomic whiteboard state change.
///
/// `x` and `y` are fractions of the canvas width and height. Fields that are
/// meaningless for a given `kind` (coordinates on `Clear`, color on erase
/// control events) are still present on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawEvent {
    pub username: String,
    #[serde(rename = "type")]
    pub kind: DrawEventType,
    pub x: f64,
    pub y: f64,
    pub color: String,
    pub line_width: f64,
    #[serde(alias = "eraser")]
    pub is_eraser: bool,
}

impl DrawEvent {
    /// Pen stroke event (`Start`, `Draw` or `End`).
    pub fn stroke(
        username: impl Into<String>,
        kind: DrawEventType,
        x: f64,
        y: f64,
        color: impl Into<String>,
        line_width: f64,
    ) -> Self {
        Self {
            username: username.into(),
            kind,
            x,
            y,
            color: color.into(),
            line_width,
            is_eraser: false,
        }
    }

    /// Eraser movement at `(x, y)`.
    pub fn erase(username: impl Into<String>, x: f64, y: f64, line_width: f64) -> Self {
        Self {
            username: username.into(),
            kind: DrawEventType::Erase,
            x,
            y,
            color: String::new(),
            line_width,
            is_eraser: true,
        }
    }

    /// Canvas clear request; all other fields are placeholders.
    pub fn clear(username: impl Into<String>) -> Self {
        Self::placeholder(username, DrawEventType::Clear)
    }

    /// Join signal sent to request history. Only `username` is meaningful.
    pub fn join(username: impl Into<String>) -> Self {
        Self::placeholder(username, DrawEventType::Start)
    }

    fn placeholder(username: impl Into<String>, kind: DrawEventType) -> Self {
        Self {
            username: username.into(),
            kind,
            x: 0.0,
            y: 0.0,
            color: String::new(),
            line_width: 0.0,
            is_eraser: false,
        }
    }

    pub fn to_text(&self) -> Result<String, EncodeError> {
        self.check_finite()?;
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, DecodeError> {
        decode(text.as_bytes())
    }

    fn check_finite(&self) -> Result<(), EncodeError> {
        for (field, value) in [("x", self.x), ("y", self.y), ("lineWidth", self.line_width)] {
            if !value.is_finite() {
                return Err(EncodeError::NonFinite(field));
            }
        }
        Ok(())
    }
}

/// Ordered snapshot of prior events delivered in one message after a join.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistoryBatch {
    pub events: Vec<DrawEvent>,
}

impl HistoryBatch {
    pub fn new(events: Vec<DrawEvent>) -> Self {
        Self { events }
    }

    pub fn to_text(&self) -> Result<String, EncodeError> {
        for event in &self.events {
            event.check_finite()?;
        }
        let envelope = BatchEnvelope::HistoryBatch {
            events: self.events.clone(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    pub fn from_text(text: &str) -> Result<Self, DecodeError> {
        decode_batch(text.as_bytes())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum BatchEnvelope {
    #[serde(rename = "HISTORY_BATCH")]
    HistoryBatch { events: Vec<DrawEvent> },
}

/// Inbound payload could not be turned into a whiteboard value.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outbound value cannot be represented on the wire.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("field `{0}` must be a finite number")]
    NonFinite(&'static str),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes a draw event to its JSON wire bytes.
pub fn encode(event: &DrawEvent) -> Result<Vec<u8>, EncodeError> {
    event.check_finite()?;
    Ok(serde_json::to_vec(event)?)
}

/// Parses a draw event from wire bytes.
///
/// Fails on malformed JSON, missing fields, or an unknown `type`.
pub fn decode(bytes: &[u8]) -> Result<DrawEvent, DecodeError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Parses a history batch envelope, preserving event order.
pub fn decode_batch(bytes: &[u8]) -> Result<HistoryBatch, DecodeError> {
    let BatchEnvelope::HistoryBatch { events } = serde_json::from_slice(bytes)?;
    Ok(HistoryBatch { events })
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn sample() -> DrawEvent {
        DrawEvent::stroke("alice", DrawEventType::Draw, 0.25, 0.7512, "#ff0000", 3.5)
    }

    #[test]
    fn wire_shape_has_all_seven_fields() {
        let value: Value = serde_json::from_slice(&encode(&sample()).expect("encode")).expect("json");
        assert_eq!(
            value,
            json!({
                "username": "alice",
                "type": "DRAW",
                "x": 0.25,
                "y": 0.7512,
                "color": "#ff0000",
                "lineWidth": 3.5,
                "isEraser": false
            })
        );

        let clear: Value =
            serde_json::from_str(&DrawEvent::clear("bob").to_text().expect("encode")).expect("json");
        assert_eq!(clear.as_object().map(|o| o.len()), Some(7));
        assert_eq!(clear["type"], "CLEAR");
    }

    #[test]
    fn round_trip_preserves_every_variant() {
        let events = [
            DrawEvent::stroke("alice", DrawEventType::Start, 0.0, 1.0, "#000", 1.0),
            sample(),
            DrawEvent::stroke("alice", DrawEventType::End, 0.1 + 0.2, 1.0 / 3.0, "blue", 12.0),
            DrawEvent::erase("bob", 0.5, 0.5, 20.0),
            DrawEvent::clear("carol"),
        ];
        for event in events {
            let bytes = encode(&event).expect("encode");
            assert_eq!(decode(&bytes).expect("decode"), event);
        }
    }

    #[test]
    fn accepts_eraser_alias_from_server() {
        let text = r##"{"username":"bob","type":"ERASE","x":0.1,"y":0.2,"color":"#ffffff","lineWidth":8,"eraser":true}"##;
        let event = DrawEvent::from_text(text).expect("decode");
        assert!(event.is_eraser);
        assert_eq!(event.kind, DrawEventType::Erase);
    }

    #[test]
    fn rejects_unknown_type_and_malformed_input() {
        let unknown = r#"{"username":"a","type":"ROTATE","x":0,"y":0,"color":"","lineWidth":1,"isEraser":false}"#;
        assert!(decode(unknown.as_bytes()).is_err());
        assert!(decode(b"not json").is_err());
        assert!(decode(b"").is_err());
        assert!(decode(&[0xff, 0xfe, 0x00]).is_err());
        let missing = r#"{"username":"a","type":"DRAW","x":0,"y":0}"#;
        assert!(decode(missing.as_bytes()).is_err());
    }

    #[test]
    fn encode_rejects_non_finite_numbers() {
        let mut event = sample();
        event.x = f64::NAN;
        assert!(matches!(encode(&event), Err(EncodeError::NonFinite("x"))));
        event.x = 0.5;
        event.line_width = f64::INFINITY;
        assert!(matches!(
            event.to_text(),
            Err(EncodeError::NonFinite("lineWidth"))
        ));
    }

    #[test]
    fn join_event_is_a_start_placeholder() {
        let join = DrawEvent::join("alice");
        assert_eq!(join.kind, DrawEventType::Start);
        assert_eq!(join.username, "alice");
        assert_eq!(join.color, "");
        assert_eq!(join.line_width, 0.0);
    }

    #[test]
    fn history_batch_keeps_order() {
        let events = vec![
            DrawEvent::stroke("a", DrawEventType::Start, 0.1, 0.1, "#111", 1.0),
            DrawEvent::stroke("b", DrawEventType::Draw, 0.2, 0.2, "#222", 2.0),
            DrawEvent::stroke("c", DrawEventType::End, 0.3, 0.3, "#333", 3.0),
        ];
        let text = HistoryBatch::new(events.clone()).to_text().expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["type"], HISTORY_BATCH_TYPE);

        let decoded = decode_batch(text.as_bytes()).expect("decode");
        assert_eq!(decoded.events, events);
    }

    #[test]
    fn history_batch_requires_its_tag() {
        assert!(HistoryBatch::from_text(r#"{"type":"OTHER","events":[]}"#).is_err());
        assert!(HistoryBatch::from_text(r#"{"events":[]}"#).is_err());
        assert!(HistoryBatch::from_text(r#"{"type":"HISTORY_BATCH","events":[{"bad":1}]}"#).is_err());
        let empty = HistoryBatch::from_text(r#"{"type":"HISTORY_BATCH","events":[]}"#).expect("decode");
        assert!(empty.events.is_empty());
    }
}
