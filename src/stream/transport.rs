//! Transport seam between the session and a push-connection provider.
//!
//! A [`Transport`] opens one connection per call and reports what happens on
//! it through the [`TransportEvents`] sink it was handed. Every sink is
//! stamped with the command epoch it was opened under and the generation of
//! the attempt it belongs to, so the session can tell a superseded
//! connection's callbacks apart from the current one.

use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::stream::proto::{EventChannel, TransportEvent};
use crate::stream::session::Dispatch;

/// Factory for push connections addressed by path (`/sse/<target>`).
pub trait Transport: Send + Sync + 'static {
    /// Starts a connection attempt to `path`.
    ///
    /// The returned handle is owned by the session until it is closed or
    /// superseded. Progress is reported through `events`. Returning an error
    /// is equivalent to reporting [`TransportEvents::failed`] immediately.
    fn open(
        &self,
        path: &str,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// Live connection owned by the session.
pub trait TransportHandle: Send {
    /// Closes the connection. Failures are logged and otherwise ignored.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Errors reported by a transport. The session treats all of them as
/// transient.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request could not be sent or its body could not be read.
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    /// Stream URL could not be built from the endpoint and path.
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),

    /// Server answered with a non-success status.
    #[error("http status {0}")]
    HttpStatus(StatusCode),

    /// Server answered with something other than an event stream.
    #[error("unexpected content type: {0}")]
    ContentType(String),

    /// Event stream framing or protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Remote side ended the stream.
    #[error("stream closed by server")]
    Closed,
}

/// Generation-tagged sink for a single connection attempt.
///
/// Cloneable so a transport can hand it to a background reader task. All
/// methods return `false` once the owning session has shut down.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    epoch: u64,
    generation: u64,
    inbox: mpsc::UnboundedSender<Dispatch>,
}

impl TransportEvents {
    pub(crate) fn new(
        epoch: u64,
        generation: u64,
        inbox: mpsc::UnboundedSender<Dispatch>,
    ) -> Self {
        Self {
            epoch,
            generation,
            inbox,
        }
    }

    /// Generation of the attempt this sink reports for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reports that the connection is open.
    pub fn opened(&self) -> bool {
        self.send(TransportEvent::Opened)
    }

    /// Reports a payload on the default channel.
    pub fn message(&self, data: impl Into<String>) -> bool {
        self.data(EventChannel::Default, data)
    }

    /// Reports a payload on a labelled channel.
    pub fn named(&self, event: impl Into<String>, data: impl Into<String>) -> bool {
        self.data(EventChannel::Named(event.into()), data)
    }

    /// Reports a payload on an explicit channel.
    pub fn data(&self, channel: EventChannel, data: impl Into<String>) -> bool {
        self.send(TransportEvent::Data {
            channel,
            data: data.into(),
        })
    }

    /// Reports that the connection failed.
    pub fn failed(&self, error: TransportError) -> bool {
        self.send(TransportEvent::Failed(error))
    }

    /// Returns true when the owning session no longer accepts events.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    fn send(&self, event: TransportEvent) -> bool {
        self.inbox
            .send(Dispatch::Transport {
                epoch: self.epoch,
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}
