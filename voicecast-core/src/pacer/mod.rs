//! Clocked packet emission.
//!
//! ## Design
//!
//! Encoding is bursty: the AI session can hand over seconds of audio at
//! once. Transports, and the jitter buffers behind them, want exactly one
//! packet per frame duration. `PacketPacer` sits between the two:
//!
//! ```text
//! encode path ──push──► PacketQueue ──pop one per tick──► PacketSink
//! ```
//!
//! On every tick at most one packet leaves the queue. If the sink is not
//! ready the packet is dropped, never re-queued. An empty queue makes the
//! tick a no-op and ends the current speech burst.
//!
//! The queue and the speaking flag share one `parking_lot::Mutex`, held
//! across the sink call. `interrupt` therefore cannot interleave with a
//! tick: once it returns, no packet queued before it is ever emitted.
//! Sinks must not block.

pub mod clock;

pub use clock::{ManualClock, PacingClock};

use std::collections::VecDeque;
use std::sync::{atomic::Ordering, Arc};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::buffering::frame::EncodedPacket;
use crate::engine::pipeline::PipelineDiagnostics;
use crate::error::{Result, VoicecastError};

/// Log every Nth not-ready drop within one burst (the first is always logged).
const DROP_LOG_EVERY: u64 = 50;

/// Contract for the voice call's packet sink.
pub trait PacketSink: Send + Sync + 'static {
    /// Whether the connection can accept packets right now.
    fn is_ready(&self) -> bool;

    /// Hand one encoded packet to the transport.
    fn send_packet(&self, packet: EncodedPacket) -> Result<()>;

    /// Toggle the transport's speaking indicator.
    fn set_speaking(&self, speaking: bool);
}

/// Result of a single pacing tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A packet was handed to the sink.
    Sent { seq: u64 },
    /// The sink was not ready; the packet was discarded.
    DroppedNotReady { seq: u64 },
    /// Queue ran dry; the speaking indicator was cleared.
    BurstEnded,
    /// Nothing to do.
    Idle,
}

#[derive(Debug, Default)]
struct PacerState {
    queue: VecDeque<EncodedPacket>,
    speaking: bool,
    drops_in_burst: u64,
}

/// Owns the packet queue and the speaking state of one stream.
pub struct PacketPacer {
    state: Mutex<PacerState>,
    sink: Arc<dyn PacketSink>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl PacketPacer {
    pub fn new(sink: Arc<dyn PacketSink>, diagnostics: Arc<PipelineDiagnostics>) -> Self {
        Self {
            state: Mutex::new(PacerState::default()),
            sink,
            diagnostics,
        }
    }

    /// Append packets in production order.
    pub fn enqueue(&self, packets: impl IntoIterator<Item = EncodedPacket>) {
        let mut state = self.state.lock();
        let before = state.queue.len();
        state.queue.extend(packets);
        let added = state.queue.len() - before;
        self.diagnostics
            .packets_queued
            .fetch_add(added, Ordering::Relaxed);
    }

    /// Run one pacing step: emit at most one packet.
    pub fn tick(&self) -> TickOutcome {
        self.diagnostics.ticks.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();

        let Some(packet) = state.queue.pop_front() else {
            if state.speaking {
                state.speaking = false;
                state.drops_in_burst = 0;
                self.sink.set_speaking(false);
                debug!("queue exhausted, speech burst ended");
                return TickOutcome::BurstEnded;
            }
            return TickOutcome::Idle;
        };

        let seq = packet.seq;
        if !self.sink.is_ready() {
            state.drops_in_burst += 1;
            self.diagnostics
                .packets_dropped_not_ready
                .fetch_add(1, Ordering::Relaxed);
            if state.drops_in_burst == 1 || state.drops_in_burst % DROP_LOG_EVERY == 0 {
                warn!(
                    seq,
                    dropped = state.drops_in_burst,
                    queued = state.queue.len(),
                    "transport not ready, dropping packet"
                );
            }
            return TickOutcome::DroppedNotReady { seq };
        }

        if !state.speaking {
            state.speaking = true;
            self.sink.set_speaking(true);
            debug!(seq, queued = state.queue.len(), "speech burst started");
        }

        match self.sink.send_packet(packet) {
            Ok(()) => {
                self.diagnostics.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(seq, "transport rejected packet: {e}");
                self.diagnostics
                    .packets_dropped_not_ready
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        TickOutcome::Sent { seq }
    }

    /// Discard every queued packet and silence the speaking indicator.
    ///
    /// Returns the number of packets discarded.
    pub fn interrupt(&self) -> usize {
        let discarded = self.clear(true);
        self.diagnostics
            .packets_discarded_interrupt
            .fetch_add(discarded, Ordering::Relaxed);
        discarded
    }

    /// Same as `interrupt`, for shutdown: not counted as a barge-in.
    pub fn discard_all(&self) -> usize {
        self.clear(false)
    }

    fn clear(&self, interrupted: bool) -> usize {
        let mut state = self.state.lock();
        let discarded = state.queue.len();
        state.queue.clear();
        state.drops_in_burst = 0;
        if state.speaking {
            state.speaking = false;
            self.sink.set_speaking(false);
            debug!(discarded, interrupted, "speaking cleared");
        }
        discarded
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_speaking(&self) -> bool {
        self.state.lock().speaking
    }

    /// Start ticking on a dedicated thread.
    pub fn spawn(self: &Arc<Self>, clock: PacingClock, name: &str) -> Result<PacerHandle> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let ticks = clock.into_ticks();
        let pacer = Arc::clone(self);

        let thread = std::thread::Builder::new()
            .name(format!("{name}-pacer"))
            .spawn(move || {
                debug!("pacer started");
                loop {
                    crossbeam_channel::select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticks) -> tick => match tick {
                            Ok(_) => {
                                pacer.tick();
                            }
                            Err(_) => {
                                debug!("pacing clock closed");
                                break;
                            }
                        },
                    }
                }
                debug!("pacer stopped");
            })
            .map_err(|e| VoicecastError::WorkerSpawn(format!("pacer thread: {e}")))?;

        info!(pacer = name, "pacing clock running");
        Ok(PacerHandle {
            stop_tx,
            thread: Some(thread),
        })
    }
}

/// Stops and joins the pacer thread; also on drop.
pub struct PacerHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl PacerHandle {
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.stop_tx.try_send(());
        if thread.join().is_err() {
            error!("pacer thread panicked");
        }
    }
}

impl Drop for PacerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
