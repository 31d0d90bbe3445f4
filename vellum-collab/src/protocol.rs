//! Wire protocol for the collaboration socket.
//!
//! Frames are a STOMP 1.2-compatible subset carried as text messages:
//!
//! ```text
//! COMMAND
//! header-name:header-value
//! ...
//!
//! body^@
//! ```
//!
//! A bare line feed is a heartbeat. Header values are escaped on every
//! command except `CONNECT`/`CONNECTED` (per the protocol, for backward
//! compatibility). Frame bodies are opaque text here; the subscription
//! layer decodes them as JSON.

/// Frame commands understood by the client and the relay used in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
    /// Not a real command: a bare EOL on the wire.
    Heartbeat,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
            Command::Heartbeat => "",
        }
    }

    fn from_line(line: &str) -> Result<Self, ProtocolError> {
        match line {
            "CONNECT" => Ok(Command::Connect),
            "CONNECTED" => Ok(Command::Connected),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "SEND" => Ok(Command::Send),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            "DISCONNECT" => Ok(Command::Disconnect),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// CONNECT/CONNECTED headers travel unescaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

/// One protocol frame. Headers preserve arrival order; lookups return the
/// first match as the protocol requires.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: Command,
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

    /// Connect handshake skeleton; auth headers are appended by the caller.
    pub fn connect(heart_beat_ms: u64) -> Self {
        Frame::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("heart-beat", format!("{heart_beat_ms},{heart_beat_ms}"))
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

    pub fn send(destination: &str, body: String) -> Self {
        let mut frame = Frame::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json");
        frame.body = body;
        frame
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// Handshake acknowledgement, sent by the peer.
    pub fn connected() -> Self {
        Frame::new(Command::Connected).with_header("version", "1.2")
    }

    /// Message delivery for a subscription, sent by the peer.
    pub fn message(destination: &str, subscription: &str, message_id: &str, body: String) -> Self {
        let mut frame = Frame::new(Command::Message)
            .with_header("destination", destination)
            .with_header("subscription", subscription)
            .with_header("message-id", message_id);
        frame.body = body;
        frame
    }

    pub fn receipt(receipt_id: &str) -> Self {
        Frame::new(Command::Receipt).with_header("receipt-id", receipt_id)
    }

    pub fn error(message: &str) -> Self {
        Frame::new(Command::Error).with_header("message", message)
    }

    pub fn heartbeat() -> Self {
        Frame::new(Command::Heartbeat)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header with the given name, as the protocol requires.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn destination(&self) -> Option<&str> {
        self.header("destination")
    }

    pub fn subscription(&self) -> Option<&str> {
        self.header("subscription")
    }

    pub fn is_heartbeat(&self) -> bool {
        self.command == Command::Heartbeat
    }

    /// Serializes the frame to its wire form.
    pub fn encode(&self) -> String {
        if self.command == Command::Heartbeat {
            return "\n".to_string();
        }

        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
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
        if !self.body.is_empty() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parses one wire message into a frame.
    ///
    /// Lenient on the frame tail: a missing NUL terminator and trailing
    /// EOL padding after it are both accepted, since the socket already
    /// delimits messages.
    pub fn parse(input: &str) -> Result<Frame, ProtocolError> {
        if input.is_empty() || input == "\n" || input == "\r\n" {
            return Ok(Frame::heartbeat());
        }

        let (command_line, mut rest) = split_line(input);
        let command = Command::from_line(command_line)?;
        let unescape_headers = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let (line, after) = split_line(rest);
            rest = after;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::MalformedFrame(format!("header without colon: {line:?}")))?;
            if unescape_headers {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let trimmed = rest.trim_end_matches(['\n', '\r']);
        let body = trimmed.strip_suffix('\0').unwrap_or(trimmed);

        Ok(Frame {
            command,
            headers,
            body: body.to_string(),
        })
    }
}

/// Splits off the first line, tolerating CRLF line endings.
fn split_line(input: &str) -> (&str, &str) {
    match input.find('\n') {
        Some(idx) => {
            let line = input[..idx].strip_suffix('\r').unwrap_or(&input[..idx]);
            (line, &input[idx + 1..])
        }
        None => (input.strip_suffix('\r').unwrap_or(input), ""),
    }
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => {
                return Err(ProtocolError::BadHeaderEscape(format!(
                    "\\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Codec-level failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    UnknownCommand(String),
    MalformedFrame(String),
    BadHeaderEscape(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::UnknownCommand(cmd) => write!(f, "unknown frame command: {cmd:?}"),
            ProtocolError::MalformedFrame(msg) => write!(f, "malformed frame: {msg}"),
            ProtocolError::BadHeaderEscape(seq) => write!(f, "bad header escape sequence: {seq}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
