//! Private STOMP 1.2 frame codec for the notification channel client
//!
//! This crate encodes and decodes the text frames a STOMP broker exchanges
//! over a WebSocket. It knows nothing about sockets: callers hand it the text
//! of one WebSocket message and get a [`Frame`] back, or render a [`Frame`]
//! into the text to send.
//!
//! ```
//! use stomp_frame::{Command, Frame, HeartBeat};
//!
//! let connect = Frame::connect("broker.local", HeartBeat::new(10_000, 10_000));
//! let wire = connect.encode();
//! assert!(wire.starts_with("CONNECT\n"));
//!
//! let decoded = Frame::decode(&wire).unwrap();
//! assert_eq!(decoded.command, Command::Connect);
//! assert_eq!(decoded.header("heart-beat"), Some("10000,10000"));
//! ```

mod error;

pub use error::FrameError;

use std::fmt;
use std::str::FromStr;

/// STOMP frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
    Ack,
    Nack,
}

impl Command {
    /// The command as it appears on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
        }
    }

    /// Header escaping does not apply to the connection frames
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heart-beat intervals in milliseconds, as carried by the `heart-beat` header
///
/// `outgoing_ms` is how often this side promises to send something,
/// `incoming_ms` is how often it wants to hear from the peer. Zero means "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub outgoing_ms: u64,
    pub incoming_ms: u64,
}

impl HeartBeat {
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self {
            outgoing_ms,
            incoming_ms,
        }
    }

    /// No heart-beating in either direction
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Parse a `heart-beat` header value (`"cx,cy"`)
    pub fn parse(value: &str) -> Option<Self> {
        let (out, inc) = value.split_once(',')?;
        Some(Self {
            outgoing_ms: out.trim().parse().ok()?,
            incoming_ms: inc.trim().parse().ok()?,
        })
    }

    /// Negotiate intervals between a client and the server's answer.
    ///
    /// Returns `(send_every_ms, expect_every_ms)` from the client's point of
    /// view. A side that sends 0 disables that direction.
    pub fn negotiate(client: HeartBeat, server: HeartBeat) -> (u64, u64) {
        let send = if client.outgoing_ms == 0 || server.incoming_ms == 0 {
            0
        } else {
            client.outgoing_ms.max(server.incoming_ms)
        };
        let expect = if client.incoming_ms == 0 || server.outgoing_ms == 0 {
            0
        } else {
            client.incoming_ms.max(server.outgoing_ms)
        };
        (send, expect)
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.outgoing_ms, self.incoming_ms)
    }
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order. Duplicates are kept; lookups return the first.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header, builder style
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Client `CONNECT` frame
    pub fn connect(host: &str, heart_beat: HeartBeat) -> Self {
        Frame::new(Command::Connect)
            .with_header("accept-version", "1.2,1.1")
            .with_header("host", host)
            .with_header("heart-beat", heart_beat.to_string())
    }

    /// Broker `CONNECTED` answer
    pub fn connected(version: &str, heart_beat: HeartBeat) -> Self {
        Frame::new(Command::Connected)
            .with_header("version", version)
            .with_header("heart-beat", heart_beat.to_string())
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

    pub fn disconnect(receipt: &str) -> Self {
        Frame::new(Command::Disconnect).with_header("receipt", receipt)
    }

    /// Broker `MESSAGE` delivering `body` on a subscription
    pub fn message(destination: &str, subscription: &str, message_id: &str, body: &str) -> Self {
        Frame::new(Command::Message)
            .with_header("destination", destination)
            .with_header("subscription", subscription)
            .with_header("message-id", message_id)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    /// Broker `ERROR` frame
    pub fn error(message: &str, body: &str) -> Self {
        Frame::new(Command::Error)
            .with_header("message", message)
            .with_body(body)
    }

    /// Render the frame as STOMP wire text, NUL terminated
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode one frame from the text of a WebSocket message.
    ///
    /// Leading EOLs (heart-beats preceding the frame) and `\r\n` line endings
    /// are accepted. Without `content-length` the body runs up to the first NUL.
    pub fn decode(text: &str) -> Result<Frame, FrameError> {
        let text = text.trim_start_matches(['\n', '\r']);
        if text.is_empty() {
            return Err(FrameError::Empty);
        }

        let (command_line, mut rest) = next_line(text);
        let command: Command = command_line.parse()?;
        let escape = command.escapes_headers();

        let mut headers = Vec::new();
        while !rest.is_empty() {
            let (line, after) = next_line(rest);
            rest = after;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if escape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let mut frame = Frame {
            command,
            headers,
            body: String::new(),
        };

        frame.body = match frame.header("content-length") {
            Some(len) => {
                let len: usize = len
                    .trim()
                    .parse()
                    .map_err(|_| FrameError::InvalidContentLength)?;
                rest.get(..len)
                    .ok_or(FrameError::InvalidContentLength)?
                    .to_string()
            }
            None => match rest.find('\0') {
                Some(end) => rest[..end].to_string(),
                None => rest.to_string(),
            },
        };

        Ok(frame)
    }
}

/// True when a WebSocket message carries only heart-beat EOLs
pub fn is_heartbeat(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c == '\n' || c == '\r')
}

fn next_line(text: &str) -> (&str, &str) {
    match text.find('\n') {
        Some(i) => (text[..i].trim_end_matches('\r'), &text[i + 1..]),
        None => (text.trim_end_matches(['\r', '\0']), ""),
    }
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, FrameError> {
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
