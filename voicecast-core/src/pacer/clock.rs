//! Tick sources for the packet pacer.
//!
//! A clock is just a `crossbeam_channel::Receiver<Instant>`: the realtime
//! clock is `crossbeam_channel::tick(period)`, the manual clock is a channel
//! the caller feeds by hand. Dropping the sending side of a manual clock
//! ends the pacer loop.

use std::fmt;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

/// Where the pacer's ticks come from.
pub enum PacingClock {
    /// Wall-clock ticks every `period`.
    Realtime(Duration),
    /// Ticks delivered by a `ManualClock`.
    Manual(Receiver<Instant>),
}

impl PacingClock {
    pub fn realtime(period: Duration) -> Self {
        PacingClock::Realtime(period)
    }

    /// A clock that only advances when the returned `ManualClock` ticks.
    pub fn manual() -> (ManualClock, Self) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (ManualClock { tx }, PacingClock::Manual(rx))
    }

    pub(crate) fn into_ticks(self) -> Receiver<Instant> {
        match self {
            PacingClock::Realtime(period) => crossbeam_channel::tick(period),
            PacingClock::Manual(rx) => rx,
        }
    }
}

impl fmt::Debug for PacingClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacingClock::Realtime(period) => f.debug_tuple("Realtime").field(period).finish(),
            PacingClock::Manual(_) => f.write_str("Manual"),
        }
    }
}

/// Hand-driven tick source.
#[derive(Debug, Clone)]
pub struct ManualClock {
    tx: Sender<Instant>,
}

impl ManualClock {
    /// Deliver one tick. Returns `false` once the pacer has gone away.
    pub fn tick(&self) -> bool {
        self.tx.send(Instant::now()).is_ok()
    }

    /// Deliver `n` ticks.
    pub fn advance(&self, n: usize) -> bool {
        (0..n).all(|_| self.tick())
    }
}
