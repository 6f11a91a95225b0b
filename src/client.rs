//! Session Client
//!
//! Single responsibility: Run a `Session` on its own task and drive it.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                      LinkClient                         │
//! │  - Cheap handle, methods just post commands             │
//! └────────────────────────────────────────────────────────┘
//!                            │ commands
//!                            ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                     session loop                        │
//! │  - Owns the Session; the only code that mutates it      │
//! │  - select! over commands, transport events, timers      │
//! └────────────────────────────────────────────────────────┘
//!                            ▲ transport events
//!                            │
//!                        Transport
//! ```
//!
//! # Driving Policy
//!
//! The session never retries on its own. The loop supplies that:
//! - every ping interval it pings (which also measures clock offset)
//! - every flush interval it flushes, reconnecting a dropped transport
//!
//! Both only run once initialised, while a connection is wanted and before
//! shutdown. Dropping every `LinkClient` shuts the session down.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{LinkError, Result};
use crate::events::{EventNotifier, ObserverHandle, SessionEvent};
use crate::protocol::{Message, MessageKind, RequestAuthenticationPayload};
use crate::session::{Session, SessionConfig, SessionStatus};
use crate::transport::{EnvelopeReceiver, TransportFactory};

/// Configuration for the session client.
#[derive(Debug, Clone)]
pub struct LinkClientConfig {
    pub session: SessionConfig,
    /// Delay between periodic pings
    pub ping_interval: Duration,
    /// Delay between periodic flush attempts
    pub flush_interval: Duration,
    /// Event buffer per subscriber
    pub event_channel_capacity: usize,
}

impl Default for LinkClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            ping_interval: Duration::from_secs(5),
            flush_interval: Duration::from_secs(1),
            event_channel_capacity: 256,
        }
    }
}

impl From<&Config> for LinkClientConfig {
    fn from(config: &Config) -> Self {
        Self {
            session: config.session_config(),
            ping_interval: config.ping_interval(),
            flush_interval: config.flush_interval(),
            event_channel_capacity: config.event_channel_capacity,
        }
    }
}

enum Command {
    Initialise {
        player_name: String,
        player_id: String,
        game_version: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect,
    Ping,
    Flush,
    SendMessage(Message),
    SendKind(MessageKind),
    SendRaw(String),
    RequestAuthentication(RequestAuthenticationPayload),
    Status(oneshot::Sender<SessionStatus>),
    EstimatedServerTime(oneshot::Sender<DateTime<Utc>>),
    ServerTimeElapsed {
        start: DateTime<Utc>,
        reply: oneshot::Sender<TimeDelta>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running session.
///
/// Fire-and-forget methods return as soon as the command is posted; their
/// outcome shows up as `SessionEvent`s.
pub struct LinkClient {
    commands: mpsc::UnboundedSender<Command>,
    notifier: EventNotifier,
    task: JoinHandle<()>,
}

impl LinkClient {
    /// Start the session loop on the current runtime.
    pub fn start(config: LinkClientConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self::start_with(config, factory, None)
    }

    /// Start with a custom time source.
    pub fn start_with_clock(
        config: LinkClientConfig,
        factory: Arc<dyn TransportFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::start_with(config, factory, Some(clock))
    }

    fn start_with(
        config: LinkClientConfig,
        factory: Arc<dyn TransportFactory>,
        clock: Option<Arc<dyn Clock>>,
    ) -> Self {
        let notifier = EventNotifier::new(config.event_channel_capacity);
        let (session, transport_events) =
            Session::new(config.session.clone(), factory, notifier.clone());
        let session = match clock {
            Some(clock) => session.with_clock(clock),
            None => session,
        };

        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(session_loop(
            session,
            command_rx,
            transport_events,
            config.ping_interval,
            config.flush_interval,
        ));

        Self {
            commands,
            notifier,
            task,
        }
    }

    /// Set the player identity and connect.
    ///
    /// # Errors
    /// - The session is shutting down or the loop has stopped
    /// - No server URL is configured
    /// - The transport could not be created
    pub async fn initialise(
        &self,
        player_name: &str,
        player_id: &str,
        game_version: &str,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Initialise {
            player_name: player_name.to_string(),
            player_id: player_id.to_string(),
            game_version: game_version.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| LinkError::ClientClosed)?
    }

    pub fn disconnect(&self) -> Result<()> {
        self.post(Command::Disconnect)
    }

    pub fn ping_server(&self) -> Result<()> {
        self.post(Command::Ping)
    }

    pub fn flush(&self) -> Result<()> {
        self.post(Command::Flush)
    }

    pub fn send_message(&self, message: Message) -> Result<()> {
        self.post(Command::SendMessage(message))
    }

    /// Send a kind with an empty payload.
    pub fn send_kind(&self, kind: MessageKind) -> Result<()> {
        self.post(Command::SendKind(kind))
    }

    /// Send an already-encoded wire frame.
    pub fn send_raw(&self, raw: impl Into<String>) -> Result<()> {
        self.post(Command::SendRaw(raw.into()))
    }

    pub fn request_authentication(&self, payload: RequestAuthenticationPayload) -> Result<()> {
        self.post(Command::RequestAuthentication(payload))
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Status(reply))?;
        rx.await.map_err(|_| LinkError::ClientClosed)
    }

    pub async fn estimated_server_time(&self) -> Result<DateTime<Utc>> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::EstimatedServerTime(reply))?;
        rx.await.map_err(|_| LinkError::ClientClosed)
    }

    pub async fn server_time_elapsed_so_far(&self, start: DateTime<Utc>) -> Result<TimeDelta> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::ServerTimeElapsed { start, reply })?;
        rx.await.map_err(|_| LinkError::ClientClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.notifier.subscribe()
    }

    pub fn observe<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.notifier.observe(callback)
    }

    pub fn unobserve(&self, handle: ObserverHandle) -> bool {
        self.notifier.unobserve(handle)
    }

    /// Disconnect, shut the session down and wait for the loop to exit.
    pub async fn shutdown(self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Shutdown(reply))?;
        rx.await.map_err(|_| LinkError::ClientClosed)?;
        self.task
            .await
            .map_err(|e| LinkError::Internal(format!("Session loop failed: {e}")))
    }

    fn post(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| LinkError::ClientClosed)
    }
}

async fn session_loop(
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut transport_events: EnvelopeReceiver,
    ping_interval: Duration,
    flush_interval: Duration,
) {
    debug!("Session loop started");

    let mut ping_timer = interval_at(Instant::now() + ping_interval, ping_interval);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut flush_timer = interval_at(Instant::now() + flush_interval, flush_interval);
    flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown(reply)) => {
                    session.begin_destroy();
                    let _ = reply.send(());
                    break;
                }
                Some(command) => apply(&mut session, command),
                None => {
                    debug!("All client handles dropped");
                    session.begin_destroy();
                    break;
                }
            },
            Some(envelope) = transport_events.recv() => {
                session.handle_transport_event(envelope);
            }
            _ = ping_timer.tick() => {
                if should_drive(&session) {
                    session.ping_server();
                }
            }
            _ = flush_timer.tick() => {
                if should_drive(&session) {
                    session.flush_outbound_queue();
                }
            }
        }
    }

    info!(queued = session.queued(), "Session loop stopped");
}

fn should_drive(session: &Session) -> bool {
    session.identity().is_some() && session.wants_connection() && !session.is_shutting_down()
}

fn apply(session: &mut Session, command: Command) {
    match command {
        Command::Initialise {
            player_name,
            player_id,
            game_version,
            reply,
        } => {
            let result = session.initialise(&player_name, &player_id, &game_version);
            let _ = reply.send(result);
        }
        Command::Disconnect => session.disconnect_from_server(),
        Command::Ping => session.ping_server(),
        Command::Flush => session.flush_outbound_queue(),
        Command::SendMessage(message) => session.send_message(&message),
        Command::SendKind(kind) => session.send_kind(kind),
        Command::SendRaw(raw) => session.send_raw(raw),
        Command::RequestAuthentication(payload) => session.request_authentication(payload),
        Command::Status(reply) => {
            let _ = reply.send(session.status());
        }
        Command::EstimatedServerTime(reply) => {
            let _ = reply.send(session.estimated_server_time());
        }
        Command::ServerTimeElapsed { start, reply } => {
            let _ = reply.send(session.server_time_elapsed_so_far(start));
        }
        // Handled by the loop
        Command::Shutdown(reply) => {
            session.begin_destroy();
            let _ = reply.send(());
        }
    }
}
