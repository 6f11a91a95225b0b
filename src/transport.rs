//! Transport Abstraction
//!
//! Single responsibility: The contract between the session and whatever moves
//! text frames to the server. No knowledge of message kinds, authentication or
//! queueing.
//!
//! # Contract
//!
//! Calls are non-blocking. `connect()` starts a connection attempt and returns;
//! completion, failure, closure and inbound frames arrive later as
//! `TransportEvent`s pushed into the `EventSink` handed over at creation.
//!
//! Every transport gets a `TransportId`. The session drops events whose id is
//! not its current transport, so a superseded transport can never act on it.

use std::fmt;
use tokio::sync::mpsc;

use crate::error::Result;

/// Close code reported when the peer sent no status.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Identity of one transport instance within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport-{}", self.0)
    }
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    ConnectionError(String),
    Closed {
        status_code: u16,
        reason: String,
        was_clean: bool,
    },
    Message(String),
}

/// A transport event tagged with the transport that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEnvelope {
    pub transport: TransportId,
    pub event: TransportEvent,
}

pub type EnvelopeSender = mpsc::UnboundedSender<TransportEnvelope>;
pub type EnvelopeReceiver = mpsc::UnboundedReceiver<TransportEnvelope>;

/// Where a transport reports events. Cheap to clone into I/O tasks.
#[derive(Debug, Clone)]
pub struct EventSink {
    id: TransportId,
    tx: EnvelopeSender,
}

impl EventSink {
    pub fn new(id: TransportId, tx: EnvelopeSender) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Push an event. Returns false once the session is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TransportEnvelope {
                transport: self.id,
                event,
            })
            .is_ok()
    }

    pub fn connected(&self) -> bool {
        self.emit(TransportEvent::Connected)
    }

    pub fn connection_error(&self, message: impl Into<String>) -> bool {
        self.emit(TransportEvent::ConnectionError(message.into()))
    }

    pub fn closed(&self, status_code: u16, reason: impl Into<String>, was_clean: bool) -> bool {
        self.emit(TransportEvent::Closed {
            status_code,
            reason: reason.into(),
            was_clean,
        })
    }

    pub fn message(&self, text: impl Into<String>) -> bool {
        self.emit(TransportEvent::Message(text.into()))
    }
}

/// Everything needed to build a transport to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub url: String,
    /// WebSocket subprotocol to request, if any
    pub subprotocol: Option<String>,
    /// Extra upgrade headers
    pub headers: Vec<(String, String)>,
}

/// A streaming text transport.
pub trait Transport: Send {
    /// Start connecting. A no-op while an attempt or connection is already active.
    fn connect(&mut self);

    /// Start closing. Completion is reported as `TransportEvent::Closed`.
    fn close(&mut self);

    /// Queue a text frame.
    ///
    /// # Errors
    /// Returns `LinkError::NotConnected` if there is no open connection.
    fn send(&mut self, text: String) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Builds transports. Injected into the session at construction.
pub trait TransportFactory: Send + Sync {
    fn create(&self, request: TransportRequest, events: EventSink) -> Result<Box<dyn Transport>>;
}
