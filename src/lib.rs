//! gamelink - Resilient WebSocket client for a game server
//!
//! Keeps one authenticated, message-typed connection to a game server alive:
//! connects, authenticates the player, queues outbound messages until the
//! connection is proven live, and estimates latency and server clock offset
//! with ping/pong probes.
//!
//! ## Architecture
//!
//! | Module      | Responsibility                                      |
//! |-------------|-----------------------------------------------------|
//! | `protocol`  | `Kind\npayload` wire format, typed payloads          |
//! | `transport` | Transport contract and event plumbing               |
//! | `ws`        | tokio-tungstenite transport                         |
//! | `queue`     | Outbound FIFO                                       |
//! | `clock`     | Latency / clock offset estimation                   |
//! | `events`    | Observer fan-out                                    |
//! | `session`   | The connection state machine                        |
//! | `client`    | Task that owns a session and drives it on timers    |
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use gamelink::{LinkClient, LinkClientConfig, WsTransportFactory};
//!
//! let client = LinkClient::start(LinkClientConfig::default(), Arc::new(WsTransportFactory));
//! let mut events = client.subscribe();
//!
//! client.initialise("Ada", "player-1", "1.0.0").await?;
//! client.send_raw("Chat\n{\"text\":\"hi\"}")?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod transport;
pub mod ws;

// Re-exports
pub use client::{LinkClient, LinkClientConfig};
pub use clock::{Clock, ClockSync, SystemClock};
pub use config::Config;
pub use error::{LinkError, Result};
pub use events::{EventNotifier, ObserverHandle, SessionEvent};
pub use protocol::{Message, MessageKind};
pub use session::{Identity, Session, SessionConfig, SessionStatus};
pub use transport::{Transport, TransportEvent, TransportFactory};
pub use ws::WsTransportFactory;
