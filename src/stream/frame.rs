//! STOMP 1.2 text frames as exchanged with the whiteboard broker.
//!
//! Only the subset the client needs is modelled: text bodies, header escaping,
//! optional `content-length`, and heart-beat negotiation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Protocol versions offered during the handshake.
pub const ACCEPT_VERSION: &str = "1.2";
/// Content type attached to every published payload.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// STOMP frame command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
}

impl Command {
    /// Wire spelling of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
        }
    }

    // CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let command = match value {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

/// Errors produced while parsing a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("malformed header line `{0}`")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header `{0}`")]
    InvalidEscape(String),

    #[error("invalid content-length `{0}`")]
    InvalidContentLength(String),

    #[error("frame is truncated")]
    Truncated,

    #[error("frame body is not NUL terminated")]
    MissingTerminator,
}

/// One STOMP frame with a UTF-8 body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    /// Creates a frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Appends a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replaces the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the first value for `name`; repeated headers keep the first
    /// occurrence.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// CONNECT frame opening a session against `host`.
    pub fn connect(host: &str, heart_beat: HeartBeat) -> Self {
        Frame::new(Command::Connect)
            .with_header("accept-version", ACCEPT_VERSION)
            .with_header("host", host)
            .with_header("heart-beat", heart_beat.to_string())
    }

    /// SEND frame carrying a JSON payload to `destination`.
    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        let body = body.into();
        Frame::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", JSON_CONTENT_TYPE)
            .with_header("content-length", body.len().to_string())
            .with_body(body)
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).with_header("id", id)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// Human readable reason carried by an ERROR frame.
    pub fn error_message(&self) -> String {
        match self.header("message") {
            Some(message) if !message.is_empty() => message.to_string(),
            _ if !self.body.is_empty() => self.body.clone(),
            _ => "broker returned an ERROR frame".to_string(),
        }
    }

    /// Serializes the frame to its wire text, including the trailing NUL.
    pub fn to_text(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                push_escaped(&mut out, name);
                out.push(':');
                push_escaped(&mut out, value);
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parses one frame from websocket text.
    ///
    /// Leading EOLs (heart-beats written ahead of the frame) are skipped.
    /// Anything after the frame's NUL terminator is ignored; use
    /// [`Frame::parse_all`] when a message may carry several frames.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Self::parse_next(text).map(|(frame, _)| frame)
    }

    /// Iterates over every frame in `text`.
    ///
    /// Heart-beat EOLs between frames are skipped. Iteration stops after the
    /// first malformed frame.
    pub fn parse_all(text: &str) -> Frames<'_> {
        Frames { rest: text }
    }

    /// Parses the first frame and returns it with the number of bytes it
    /// consumed, leading EOLs and terminator included.
    fn parse_next(text: &str) -> Result<(Self, usize), FrameError> {
        let trimmed = text.trim_start_matches(['\r', '\n']);
        let skipped = text.len() - trimmed.len();
        let text = trimmed;
        if text.is_empty() {
            return Err(FrameError::Empty);
        }

        let mut pos = 0;
        let command_line = next_line(text, &mut pos)?;
        let command: Command = command_line.parse()?;
        let escape = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let line = next_line(text, &mut pos)?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if escape {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let rest = &text[pos..];
        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .map(|(_, value)| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::InvalidContentLength(value.clone()))
            })
            .transpose()?;

        let (body, body_len) = match content_length {
            Some(len) => {
                let body = rest.get(..len).ok_or(FrameError::Truncated)?;
                if !rest[len..].starts_with('\0') {
                    return Err(FrameError::MissingTerminator);
                }
                (body, len)
            }
            None => {
                let end = rest.find('\0').ok_or(FrameError::MissingTerminator)?;
                (&rest[..end], end)
            }
        };

        let frame = Self {
            command,
            headers,
            body: body.to_string(),
        };
        Ok((frame, skipped + pos + body_len + 1))
    }
}

/// Frames packed into one websocket message. See [`Frame::parse_all`].
#[derive(Clone, Debug)]
pub struct Frames<'a> {
    rest: &'a str,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.trim_start_matches(['\r', '\n']).is_empty() {
            return None;
        }
        match Frame::parse_next(self.rest) {
            Ok((frame, consumed)) => {
                self.rest = &self.rest[consumed..];
                Some(Ok(frame))
            }
            Err(err) => {
                self.rest = "";
                Some(Err(err))
            }
        }
    }
}

/// Returns true when `text` consists only of EOLs, i.e. a heart-beat.
pub fn is_heartbeat(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c == '\n' || c == '\r')
}

/// Heart-beat header value: `send_ms,recv_ms`.
///
/// `send_ms` is the smallest interval at which the sender can emit
/// heart-beats, `recv_ms` the interval it would like to receive them at.
/// Zero disables the direction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HeartBeat {
    pub send_ms: u64,
    pub recv_ms: u64,
}

impl HeartBeat {
    /// Symmetric heart-beat offer derived from a single interval.
    pub fn symmetric(interval: Duration) -> Self {
        let ms = interval.as_millis().min(u64::MAX as u128) as u64;
        Self {
            send_ms: ms,
            recv_ms: ms,
        }
    }

    /// Resolves the intervals agreed between a client offer and the broker's
    /// CONNECTED reply.
    pub fn negotiate(client: HeartBeat, server: HeartBeat) -> NegotiatedHeartBeat {
        NegotiatedHeartBeat {
            outgoing: agreed(client.send_ms, server.recv_ms),
            incoming: agreed(server.send_ms, client.recv_ms),
        }
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.send_ms, self.recv_ms)
    }
}

impl FromStr for HeartBeat {
    type Err = FrameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || FrameError::MalformedHeader(format!("heart-beat:{value}"));
        let (send, recv) = value.split_once(',').ok_or_else(invalid)?;
        Ok(Self {
            send_ms: send.trim().parse().map_err(|_| invalid())?,
            recv_ms: recv.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// Heart-beat periods in effect for one connection; `None` means disabled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NegotiatedHeartBeat {
    pub outgoing: Option<Duration>,
    pub incoming: Option<Duration>,
}

fn agreed(offer: u64, wanted: u64) -> Option<Duration> {
    if offer == 0 || wanted == 0 {
        None
    } else {
        Some(Duration::from_millis(offer.max(wanted)))
    }
}

fn next_line<'a>(text: &'a str, pos: &mut usize) -> Result<&'a str, FrameError> {
    let rest = &text[*pos..];
    let end = rest.find('\n').ok_or(FrameError::Truncated)?;
    *pos += end + 1;
    let line = &rest[..end];
    Ok(line.strip_suffix('\r').unwrap_or(line))
}

fn push_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape(value: &str) -> Result<String, FrameError> {
    if !value.contains('\\') {
        return Ok(value.to_string());
    }
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}
