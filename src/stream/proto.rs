use std::fmt;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

use crate::stream::transport::TransportError;

/// Route prefix for per-target event streams.
pub const SSE_PATH_PREFIX: &str = "/sse/";
/// Labelled event channel relayed alongside the default channel.
pub const TICK_EVENT: &str = "tick";
/// Event type the SSE wire format assigns to unlabelled events.
pub const DEFAULT_EVENT: &str = "message";

// Characters left unescaped by a URI component encoder.
const TARGET_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Builds the stream path for a subscription target.
pub fn sse_path(target: &str) -> String {
    format!(
        "{SSE_PATH_PREFIX}{}",
        utf8_percent_encode(target, TARGET_ESCAPE)
    )
}

/// Connection status observed by session consumers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel an inbound payload arrived on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EventChannel {
    /// Unlabelled events.
    Default,
    /// Events carrying an explicit `event:` label.
    Named(String),
}

impl EventChannel {
    /// Maps an SSE event type onto a channel. Empty and `message` types are
    /// the default channel.
    pub fn from_event_name(name: &str) -> Self {
        if name.is_empty() || name == DEFAULT_EVENT {
            Self::Default
        } else {
            Self::Named(name.to_string())
        }
    }
}

/// Notification delivered by a transport handle.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection is established and the stream is flowing.
    Opened,
    /// A payload arrived on `channel`.
    Data { channel: EventChannel, data: String },
    /// The connection failed or was closed by the remote side.
    Failed(TransportError),
}
