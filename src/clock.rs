//! Clock Synchronization
//!
//! Single responsibility: Estimate round-trip latency and the server clock offset
//! from ping/pong timestamp pairs.
//!
//! # Estimation
//!
//! ```text
//! latency = (pong_received_at - ping_time) / 2
//! offset  = server_pong_time - (ping_time + latency)
//! ```
//!
//! The round trip is assumed symmetric. Every sample replaces the previous
//! estimate outright.

use chrono::{DateTime, TimeDelta, Utc};

/// Source of "now". Swappable so the session can be driven deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One completed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub latency: TimeDelta,
    pub offset: TimeDelta,
}

/// Current best estimates of latency and server clock offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSync {
    latency: TimeDelta,
    offset: TimeDelta,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSync {
    pub fn new() -> Self {
        Self {
            latency: TimeDelta::zero(),
            offset: TimeDelta::zero(),
        }
    }

    /// Fold in a pong.
    ///
    /// # Arguments
    /// * `ping_time` - When the ping was sent, as echoed by the server
    /// * `received_at` - When the pong arrived locally
    /// * `server_pong_time` - The server's clock when it answered
    pub fn record(
        &mut self,
        ping_time: DateTime<Utc>,
        received_at: DateTime<Utc>,
        server_pong_time: DateTime<Utc>,
    ) -> ClockSample {
        let latency = (received_at - ping_time) / 2;
        let offset = server_pong_time - (ping_time + latency);

        self.latency = latency;
        self.offset = offset;

        ClockSample { latency, offset }
    }

    pub fn latency(&self) -> TimeDelta {
        self.latency
    }

    /// How far the server clock is ahead of ours (negative when behind).
    pub fn offset(&self) -> TimeDelta {
        self.offset
    }

    /// The server's clock as of local time `now`.
    pub fn estimated_server_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.offset
    }

    /// Server time elapsed since `start` (a server-clock timestamp, e.g. a turn start).
    pub fn server_time_elapsed_since(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> TimeDelta {
        self.estimated_server_time(now) - start
    }
}
