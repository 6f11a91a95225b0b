//! Shared test doubles: an in-memory transport and a hand-driven clock.

#![allow(dead_code)]

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use gamelink::clock::Clock;
use gamelink::events::{EventNotifier, SessionEvent};
use gamelink::session::{Session, SessionConfig};
use gamelink::transport::{
    EnvelopeReceiver, EventSink, Transport, TransportFactory, TransportRequest,
};
use gamelink::{LinkError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

// =============================================================================
// Clock
// =============================================================================

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// =============================================================================
// Transport
// =============================================================================

/// What a mock transport has been asked to do.
#[derive(Debug, Default)]
pub struct MockWire {
    pub connected: bool,
    pub sent: Vec<String>,
    pub connect_calls: usize,
    pub close_calls: usize,
    pub fail_sends: bool,
}

pub struct MockTransport {
    wire: Arc<Mutex<MockWire>>,
}

impl Transport for MockTransport {
    fn connect(&mut self) {
        self.wire.lock().unwrap().connect_calls += 1;
    }

    fn close(&mut self) {
        let mut wire = self.wire.lock().unwrap();
        wire.close_calls += 1;
        wire.connected = false;
    }

    fn send(&mut self, text: String) -> Result<()> {
        let mut wire = self.wire.lock().unwrap();
        if !wire.connected {
            return Err(LinkError::NotConnected);
        }
        if wire.fail_sends {
            return Err(LinkError::Transport("wire cut".into()));
        }
        wire.sent.push(text);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.wire.lock().unwrap().connected
    }
}

pub struct CreatedTransport {
    pub request: TransportRequest,
    pub sink: EventSink,
    pub wire: Arc<Mutex<MockWire>>,
}

#[derive(Default)]
pub struct MockFactory {
    pub created: Mutex<Vec<CreatedTransport>>,
    pub fail: AtomicBool,
}

impl MockFactory {
    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn sink(&self, index: usize) -> EventSink {
        self.created.lock().unwrap()[index].sink.clone()
    }

    pub fn wire(&self, index: usize) -> Arc<Mutex<MockWire>> {
        Arc::clone(&self.created.lock().unwrap()[index].wire)
    }

    pub fn request(&self, index: usize) -> TransportRequest {
        self.created.lock().unwrap()[index].request.clone()
    }

    pub fn latest_sink(&self) -> EventSink {
        self.sink(self.count() - 1)
    }

    pub fn latest_wire(&self) -> Arc<Mutex<MockWire>> {
        self.wire(self.count() - 1)
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, request: TransportRequest, events: EventSink) -> Result<Box<dyn Transport>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(LinkError::Connection("factory offline".into()));
        }
        let wire = Arc::new(Mutex::new(MockWire::default()));
        self.created.lock().unwrap().push(CreatedTransport {
            request,
            sink: events,
            wire: Arc::clone(&wire),
        });
        Ok(Box::new(MockTransport { wire }))
    }
}

// =============================================================================
// Session harness
// =============================================================================

pub const PLAYER_AUTHENTICATED: &str =
    "PlayerAuthenticated\n{\"playerName\":\"Ada\",\"playerID\":\"p-1\"}";

/// A session wired to a mock factory, driven by hand.
pub struct Harness {
    pub session: Session,
    pub rx: EnvelopeReceiver,
    pub factory: Arc<MockFactory>,
    pub clock: Arc<ManualClock>,
    pub events: broadcast::Receiver<SessionEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SessionConfig {
            server_url: "ws://game.test/ws".into(),
            subprotocol: None,
            user_agent: "gamelink-test".into(),
        })
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let factory = Arc::new(MockFactory::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let notifier = EventNotifier::new(64);
        let events = notifier.subscribe();
        let (session, rx) = Session::new(config, factory.clone(), notifier);
        let session = session.with_clock(clock.clone());

        Self {
            session,
            rx,
            factory,
            clock,
            events,
        }
    }

    /// Feed every pending transport event to the session.
    pub fn pump(&mut self) {
        while let Ok(envelope) = self.rx.try_recv() {
            self.session.handle_transport_event(envelope);
        }
    }

    pub fn initialise(&mut self) {
        self.session
            .initialise("Ada", "p-1", "1.2.0")
            .expect("initialise");
    }

    /// Initialise, open the mock wire and deliver `Connected`.
    pub fn connect(&mut self) {
        self.initialise();
        self.factory.latest_wire().lock().unwrap().connected = true;
        self.factory.latest_sink().connected();
        self.pump();
    }

    /// Connect and complete authentication, leaving a ping outstanding.
    pub fn authenticate(&mut self) {
        self.connect();
        self.receive(PLAYER_AUTHENTICATED);
    }

    pub fn receive(&mut self, raw: &str) {
        self.factory.latest_sink().message(raw);
        self.pump();
    }

    pub fn sent(&self) -> Vec<String> {
        self.factory.latest_wire().lock().unwrap().sent.clone()
    }

    pub fn sent_kinds(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|raw| raw.split('\n').next().unwrap_or_default().to_string())
            .collect()
    }

    /// The ping time carried by the most recent Ping sent.
    pub fn last_ping_time(&self) -> String {
        let raw = self
            .sent()
            .into_iter()
            .rev()
            .find(|raw| raw.starts_with("Ping\n"))
            .expect("a ping was sent");
        let json: serde_json::Value = serde_json::from_str(&raw["Ping\n".len()..]).unwrap();
        json["pingTime"].as_str().unwrap().to_string()
    }

    /// Answer the outstanding ping.
    pub fn pong(&mut self, pong_time: &str) {
        let raw = format!(
            "Pong\n{{\"pingTime\":\"{}\",\"pongTime\":\"{}\"}}",
            self.last_ping_time(),
            pong_time
        );
        self.receive(&raw);
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
