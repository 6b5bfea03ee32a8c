use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbound channel a frame belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Thought,
    Data,
    Error,
}

impl Channel {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Thought => "THOUGHT: ",
            Self::Data => "DATA: ",
            Self::Error => "ERROR: ",
        }
    }
}

/// Ephemeral progress message. `seq` is assigned by the request's thought
/// queue and increases in push order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThoughtEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub text: String,
}

/// Final output fragment produced by a chat path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub at: DateTime<Utc>,
    pub text: String,
}

impl OutputEvent {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            text: text.into(),
        }
    }
}

/// What a producer pushes onto the result channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProducerMessage {
    Output(OutputEvent),
    /// Terminal: the producer finished normally.
    Complete,
    /// Terminal: the producer failed; the text is user-visible.
    Error(String),
}

impl ProducerMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error(_))
    }
}

/// One frame of the multiplexed outbound stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamFrame {
    Thought(ThoughtEvent),
    Data(OutputEvent),
    Error(String),
}

impl StreamFrame {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Thought(_) => Channel::Thought,
            Self::Data(_) => Channel::Data,
            Self::Error(_) => Channel::Error,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Thought(t) => &t.text,
            Self::Data(d) => &d.text,
            Self::Error(e) => e,
        }
    }

    /// Render as one wire line (including the trailing newline). Embedded
    /// backslashes and newlines are escaped so a frame never spans lines.
    pub fn to_line(&self) -> String {
        format!("{}{}\n", self.channel().prefix(), escape_line(self.text()))
    }
}

fn escape_line(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

/// Inverse of the line rendering, for clients and tests.
pub fn parse_line(line: &str) -> Option<(Channel, String)> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let (channel, rest) = [Channel::Thought, Channel::Data, Channel::Error]
        .into_iter()
        .find_map(|c| line.strip_prefix(c.prefix()).map(|rest| (c, rest)))?;

    let mut out = String::with_capacity(rest.len());
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    Some((channel, out))
}
