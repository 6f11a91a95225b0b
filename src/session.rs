//! Game Server Session
//!
//! Single responsibility: The connection state machine. Owns connection intent,
//! authentication, liveness, the outbound queue and clock sync, and reacts to
//! transport events and application calls.
//!
//! # States
//!
//! ```text
//! Idle ─► Connecting ─► Connected(not live) ─► Connected(live) ─► Connected(authenticated)
//!                                    │                                     │
//!                                    └──────────────► Closed ◄─────────────┘
//! ```
//!
//! `shutting_down` sits beside these states and never clears.
//!
//! # The Outbound Gate
//!
//! Queued messages go out only when all of these hold:
//! 1. The application still wants a connection
//! 2. A transport exists and reports connected
//! 3. The session is live (a message has arrived since the last ping)
//!
//! Two messages bypass the gate: the authentication request sent on connect,
//! and pings. Both exist to make the gate open.
//!
//! # No Hidden Retries
//!
//! `Session` never schedules anything. Reconnection happens when a caller
//! flushes or pings while the transport is down; the driver in `client` does
//! that on a timer. Every method is synchronous and non-blocking, so all
//! mutation can be serialized through one task.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, ClockSync, SystemClock};
use crate::error::{LinkError, Result};
use crate::events::{EventNotifier, SessionEvent};
use crate::protocol::{
    self, decode_payload, Message, MessageKind, PingPayload, PlayerAuthenticatedPayload,
    PongPayload, RequestAuthenticationPayload,
};
use crate::queue::OutboundQueue;
use crate::transport::{
    EnvelopeReceiver, EnvelopeSender, EventSink, Transport, TransportEnvelope, TransportEvent,
    TransportFactory, TransportId, TransportRequest,
};

/// Connection settings the session needs to build transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Game server WebSocket URL
    pub server_url: String,
    /// WebSocket subprotocol to request
    pub subprotocol: Option<String>,
    /// User-Agent upgrade header (omitted when empty)
    pub user_agent: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080".to_string(),
            subprotocol: None,
            user_agent: format!("gamelink/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Who we are to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub player_name: String,
    pub player_id: String,
    pub game_version: String,
}

impl Identity {
    fn auth_payload(&self) -> RequestAuthenticationPayload {
        RequestAuthenticationPayload {
            player_name: self.player_name.clone(),
            player_id: self.player_id.clone(),
            game_version: self.game_version.clone(),
        }
    }
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub want_connected: bool,
    pub connected: bool,
    pub authenticated: bool,
    pub live: bool,
    pub shutting_down: bool,
    pub queued: usize,
    pub latency_estimate: TimeDelta,
    pub clock_offset_estimate: TimeDelta,
}

struct ActiveTransport {
    id: TransportId,
    inner: Box<dyn Transport>,
    /// Cleared by `disconnect_from_server`; close events are then ignored.
    close_handler: bool,
}

/// The client side of one logical connection to the game server.
pub struct Session {
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    events_tx: EnvelopeSender,
    transport: Option<ActiveTransport>,
    next_transport_id: u64,
    identity: Option<Identity>,
    want_connected: bool,
    authenticated: bool,
    live: bool,
    shutting_down: bool,
    clock_sync: ClockSync,
    queue: OutboundQueue,
    notifier: EventNotifier,
    clock: Arc<dyn Clock>,
    last_message_len: usize,
}

impl Session {
    /// Create a session that builds its transports with `factory`.
    ///
    /// Returns the session and the receiver its transports report into. Feed
    /// every envelope from that receiver to `handle_transport_event`.
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        notifier: EventNotifier,
    ) -> (Self, EnvelopeReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = Self {
            config,
            factory,
            events_tx,
            transport: None,
            next_transport_id: 1,
            identity: None,
            want_connected: true,
            authenticated: false,
            live: false,
            shutting_down: false,
            clock_sync: ClockSync::new(),
            queue: OutboundQueue::new(),
            notifier,
            clock: Arc::new(SystemClock),
            last_message_len: 0,
        };

        (session, events_rx)
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Set the player identity and open a transport to the server.
    ///
    /// Calling this while a transport exists supersedes it: the old transport
    /// is closed and its events are ignored from then on.
    ///
    /// # Errors
    /// - The session is shutting down
    /// - No server URL is configured
    /// - The transport factory fails
    ///
    /// Setup failures are also reported as `SessionEvent::InternalError`.
    pub fn initialise(
        &mut self,
        player_name: &str,
        player_id: &str,
        game_version: &str,
    ) -> Result<()> {
        if self.shutting_down {
            warn!("initialise called during shutdown, ignoring");
            return Err(LinkError::ShutDown);
        }

        self.want_connected = true;
        self.identity = Some(Identity {
            player_name: player_name.to_string(),
            player_id: player_id.to_string(),
            game_version: game_version.to_string(),
        });

        if self.config.server_url.trim().is_empty() {
            let err = LinkError::Config("No server URL configured".into());
            warn!(error = %err, "Cannot initialise session");
            self.notifier.internal_error(err.to_string());
            return Err(err);
        }

        if let Some(mut previous) = self.transport.take() {
            info!(transport = %previous.id, "Superseding existing transport");
            if previous.inner.is_connected() {
                previous.inner.close();
            }
        }
        self.authenticated = false;
        self.live = false;

        let id = TransportId(self.next_transport_id);
        self.next_transport_id += 1;

        let mut headers = Vec::new();
        if !self.config.user_agent.is_empty() {
            headers.push(("User-Agent".to_string(), self.config.user_agent.clone()));
        }
        let request = TransportRequest {
            url: self.config.server_url.clone(),
            subprotocol: self.config.subprotocol.clone(),
            headers,
        };

        debug!(url = %request.url, transport = %id, "Creating transport");
        let mut inner = match self
            .factory
            .create(request, EventSink::new(id, self.events_tx.clone()))
        {
            Ok(inner) => inner,
            Err(e) => {
                warn!(error = %e, "Failed to create transport");
                self.notifier
                    .internal_error(format!("Failed to create websocket object: {e}"));
                return Err(e);
            }
        };

        info!(
            url = %self.config.server_url,
            player_name = %player_name,
            transport = %id,
            "Attempting to connect"
        );
        inner.connect();

        self.transport = Some(ActiveTransport {
            id,
            inner,
            close_handler: true,
        });
        Ok(())
    }

    /// Stop wanting a connection and close the transport if it is open.
    ///
    /// The queue is kept; a later `initialise` delivers what is still in it.
    pub fn disconnect_from_server(&mut self) {
        info!("Disconnecting from server");
        self.want_connected = false;
        self.authenticated = false;

        if let Some(active) = self.transport.as_mut() {
            active.close_handler = false;
            if active.inner.is_connected() {
                active.inner.close();
            }
        }
    }

    /// Disconnect for good. Every later transport event is ignored.
    pub fn begin_destroy(&mut self) {
        self.disconnect_from_server();
        info!("Session shutting down");
        self.shutting_down = true;
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Queue a pre-encoded wire frame and try to flush.
    ///
    /// Sending while no connection is wanted drops the message and disconnects.
    pub fn send_raw(&mut self, raw: impl Into<String>) {
        if !self.want_connected {
            debug!("Send while disconnected, dropping message");
            self.disconnect_from_server();
            return;
        }

        self.queue.enqueue(raw.into());
        self.flush_outbound_queue();
    }

    /// Encode, queue and try to flush.
    pub fn send_message(&mut self, message: &Message) {
        match message.encode() {
            Ok(raw) => self.send_raw(raw),
            Err(e) => {
                warn!(kind = %message.kind(), error = %e, "Failed to encode message");
                self.notifier
                    .internal_error(format!("Failed to encode {} message: {e}", message.kind()));
            }
        }
    }

    /// Send a kind with no payload.
    pub fn send_kind(&mut self, kind: MessageKind) {
        self.send_raw(protocol::encode_empty(kind));
    }

    /// Re-authenticate through the normal queue.
    pub fn request_authentication(&mut self, payload: RequestAuthenticationPayload) {
        self.send_message(&Message::RequestAuthentication(payload));
    }

    /// Send every queued message if the outbound gate is open.
    ///
    /// Otherwise moves one step towards opening it: (re)initialising a missing
    /// transport or reconnecting a closed one.
    pub fn flush_outbound_queue(&mut self) {
        if !self.want_connected {
            self.disconnect_from_server();
            return;
        }

        trace!(queued = self.queue.len(), "Attempting to flush the outbound queue");
        if !self.transport_ready() {
            return;
        }

        if !self.live {
            debug!(queued = self.queue.len(), "Connection is not live, holding queue");
            return;
        }

        if self.queue.is_empty() {
            trace!("No messages to flush");
            return;
        }

        let Some(active) = self.transport.as_mut() else {
            return;
        };

        let entries = self.queue.drain_all();
        for (index, raw) in entries.iter().enumerate() {
            if let Err(e) = active.inner.send(raw.clone()) {
                warn!(error = %e, unsent = entries.len() - index, "Send failed, keeping messages queued");
                self.queue.restore_front(entries[index..].to_vec());
                self.notifier
                    .internal_error(format!("Failed to send message: {e}"));
                return;
            }
            debug!(message = %raw, "Sent queued message");
            self.notifier.message_sent(raw, self.clock.now());
        }
    }

    /// Probe the server. Revokes liveness until the pong arrives.
    pub fn ping_server(&mut self) {
        if !self.want_connected {
            self.disconnect_from_server();
            return;
        }

        trace!("Pinging server");
        self.live = false;

        if !self.transport_ready() {
            return;
        }

        let now = self.clock.now();
        let ping = Message::Ping(PingPayload {
            ping_time: now,
            ping_ms: now.timestamp_subsec_millis() as i32,
            current_latency_estimate: self.clock_sync.latency(),
            current_server_time_offset_estimate: self.clock_sync.offset(),
        });
        let raw = match ping.encode() {
            Ok(raw) => raw,
            Err(e) => {
                self.notifier
                    .internal_error(format!("Failed to encode Ping message: {e}"));
                return;
            }
        };

        self.send_direct(raw);
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    /// Apply an event reported by a transport.
    pub fn handle_transport_event(&mut self, envelope: TransportEnvelope) {
        if self.shutting_down {
            trace!(transport = %envelope.transport, "Shutting down, ignoring transport event");
            return;
        }

        let current = self.transport.as_ref().map(|active| active.id);
        if current != Some(envelope.transport) {
            debug!(transport = %envelope.transport, "Ignoring event from superseded transport");
            return;
        }

        match envelope.event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::ConnectionError(message) => self.on_connection_error(&message),
            TransportEvent::Closed {
                status_code,
                reason,
                was_clean,
            } => self.on_closed(status_code, reason, was_clean),
            TransportEvent::Message(text) => self.handle_inbound_message(&text),
        }
    }

    /// Process one inbound wire frame.
    pub fn handle_inbound_message(&mut self, raw: &str) {
        if self.shutting_down {
            return;
        }
        if !self.want_connected {
            self.disconnect_from_server();
            return;
        }

        // Any message at all proves the round trip works
        self.live = true;
        self.last_message_len = raw.len();

        let frame = protocol::split(raw);
        if frame.kind != MessageKind::Pong {
            debug!(length = raw.len(), message = %raw, "Message received");
        }

        self.notifier.message_received(raw, self.clock.now());

        match frame.kind {
            MessageKind::PlayerAuthenticated => self.on_player_authenticated(frame.payload),
            MessageKind::Pong => {
                self.on_pong(frame.payload);
                // The ping that preceded this pong may have held the queue back
                self.flush_outbound_queue();
            }
            MessageKind::WarningMessage => {
                warn!(message = %frame.payload, "Warning message from server");
                self.notifier.emit(SessionEvent::Warning {
                    message: frame.payload.to_string(),
                });
            }
            MessageKind::ErrorMessage => {
                warn!(message = %frame.payload, "Error message from server");
                self.notifier.emit(SessionEvent::Error {
                    message: frame.payload.to_string(),
                });
            }
            MessageKind::PlayerNotAuthenticated => {
                warn!(message = %frame.payload, "Server refused authentication");
            }
            MessageKind::Invalid => {
                debug!(kind = %frame.kind_name, "Ignoring message of unrecognised kind");
            }
            MessageKind::RequestAuthentication | MessageKind::Ping => {
                trace!(kind = %frame.kind, "No handler for client-bound kind");
            }
        }
    }

    fn on_connected(&mut self) {
        if self.shutting_down {
            debug!("Connected, but shutting down");
            return;
        }
        if !self.want_connected {
            debug!("Connected after disconnect was requested, closing");
            if let Some(active) = self.transport.as_mut() {
                active.inner.close();
            }
            return;
        }

        self.live = false;
        self.notifier.emit(SessionEvent::Connected);

        let Some(identity) = self.identity.as_ref() else {
            warn!("Connected without an identity, cannot authenticate");
            return;
        };

        info!("Connected, requesting authentication");
        match Message::RequestAuthentication(identity.auth_payload()).encode() {
            Ok(raw) => self.send_direct(raw),
            Err(e) => self
                .notifier
                .internal_error(format!("Failed to encode authentication request: {e}")),
        }
    }

    fn on_connection_error(&mut self, message: &str) {
        warn!(error = %message, "Connection error");
        self.notifier
            .internal_error(format!("Websocket connection error: {message}"));
    }

    fn on_closed(&mut self, status_code: u16, reason: String, was_clean: bool) {
        let handler_registered = self
            .transport
            .as_ref()
            .map(|active| active.close_handler)
            .unwrap_or(false);
        if !handler_registered {
            debug!(status_code, "Close after disconnect, ignoring");
            return;
        }

        info!(status_code, reason = %reason, was_clean, "Connection closed");
        self.authenticated = false;
        // The next connection has to prove itself again
        self.live = false;

        self.notifier.emit(SessionEvent::Disconnected {
            status_code,
            reason,
            was_clean,
        });
    }

    fn on_player_authenticated(&mut self, payload: &str) {
        let payload: PlayerAuthenticatedPayload = match decode_payload(payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Malformed PlayerAuthenticated payload");
                self.notifier
                    .internal_error(format!("Failed to decode PlayerAuthenticated payload: {e}"));
                return;
            }
        };

        self.authenticated = true;
        info!(
            player_name = %payload.player_name,
            player_id = %payload.player_id,
            "Player authenticated"
        );
        self.notifier.emit(SessionEvent::PlayerAuthenticated {
            player_name: payload.player_name,
            player_id: payload.player_id,
        });

        // Measure clock offset straight away, then release anything queued
        self.ping_server();
        self.flush_outbound_queue();
    }

    fn on_pong(&mut self, payload: &str) {
        match decode_payload::<PongPayload>(payload) {
            Ok(pong) => {
                let sample = self
                    .clock_sync
                    .record(pong.ping_time, self.clock.now(), pong.pong_time);
                trace!(
                    latency_ms = sample.latency.num_milliseconds(),
                    offset_ms = sample.offset.num_milliseconds(),
                    "Pong received"
                );
            }
            Err(e) => {
                warn!(error = %e, "Malformed Pong payload");
                self.notifier
                    .internal_error(format!("Failed to decode Pong payload: {e}"));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Guards shared by flush and ping: a transport must exist and be connected.
    /// Takes one step towards that when it is not.
    fn transport_ready(&mut self) -> bool {
        if self.transport.is_none() {
            self.initialise_from_identity();
            return false;
        }

        let Some(active) = self.transport.as_mut() else {
            return false;
        };
        if !active.inner.is_connected() {
            debug!(transport = %active.id, "Transport not connected, connecting");
            self.live = false;
            active.inner.connect();
            return false;
        }
        true
    }

    fn initialise_from_identity(&mut self) {
        info!("No transport yet, initialising now");

        let identity = match self.identity.clone() {
            Some(identity)
                if !self.config.server_url.trim().is_empty()
                    && !identity.player_name.is_empty()
                    && !identity.player_id.is_empty() =>
            {
                identity
            }
            _ => {
                warn!("Missing server URL, player name or player ID");
                self.notifier.internal_error(
                    "Cannot connect: server URL, player name or player ID is not set",
                );
                return;
            }
        };

        if let Err(e) = self.initialise(
            &identity.player_name,
            &identity.player_id,
            &identity.game_version,
        ) {
            debug!(error = %e, "Lazy initialise failed");
        }
    }

    /// Send on the current transport, bypassing the queue.
    fn send_direct(&mut self, raw: String) {
        let Some(active) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = active.inner.send(raw) {
            warn!(error = %e, "Direct send failed");
            self.notifier.internal_error(format!("Failed to send message: {e}"));
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            want_connected: self.want_connected,
            connected: self.is_connected(),
            authenticated: self.authenticated,
            live: self.live,
            shutting_down: self.shutting_down,
            queued: self.queue.len(),
            latency_estimate: self.clock_sync.latency(),
            clock_offset_estimate: self.clock_sync.offset(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport
            .as_ref()
            .map(|active| active.inner.is_connected())
            .unwrap_or(false)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn wants_connection(&self) -> bool {
        self.want_connected
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn latency_estimate(&self) -> TimeDelta {
        self.clock_sync.latency()
    }

    pub fn clock_offset_estimate(&self) -> TimeDelta {
        self.clock_sync.offset()
    }

    /// Length of the most recent inbound frame, in bytes.
    pub fn last_message_length(&self) -> usize {
        self.last_message_len
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    /// Current time on the server, by our best estimate.
    pub fn estimated_server_time(&self) -> DateTime<Utc> {
        self.clock_sync.estimated_server_time(self.clock.now())
    }

    /// Server time elapsed since `start`, e.g. the start of a turn.
    pub fn server_time_elapsed_so_far(&self, start: DateTime<Utc>) -> TimeDelta {
        self.clock_sync
            .server_time_elapsed_since(start, self.clock.now())
    }
}
