//! `StreamController`, the public pipeline façade.
//!
//! ## Lifecycle
//!
//! ```text
//! StreamController::new()     → encoder built, pacer thread ticking, active
//!     ├─► write(chunk)*       → resample → frame → encode → queue
//!     ├─► interrupt()*        → queue cleared, speaking = false, still active
//!     └─► stop()              → tail flushed, queue drained (bounded), pacer
//!                               joined, speaking = false, inactive forever
//! ```
//!
//! `stop()` is idempotent. `write()` after `stop()` fails with
//! `VoicecastError::Stopped`.
//!
//! ## Threading
//!
//! Two actors share one controller: whoever calls `write` (the encode path)
//! and the pacer thread. They meet only at the pacer's queue. `write` never
//! waits on the pacing clock.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    audio::{AudioFormat, PcmChunk, DEFAULT_INPUT_FORMAT, DEFAULT_OUTPUT_FORMAT, FRAME_DURATION_MS},
    codec::{create_encoder, EncoderKind, FrameEncoder},
    error::{Result, VoicecastError},
    pacer::{PacerHandle, PacingClock, PacketPacer, PacketSink},
};
use pipeline::{DiagnosticsSnapshot, EncodeStage, PipelineDiagnostics};

/// Poll interval while `stop()` waits for the queue to drain.
const DRAIN_POLL_MS: u64 = 5;

/// Configuration for one `StreamController`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct PipelineConfig {
    /// Format of the PCM handed to `write`. Default: 24 kHz mono.
    pub input: AudioFormat,
    /// Format frames are encoded at. Default: 48 kHz stereo.
    pub output: AudioFormat,
    /// Frame and tick duration. Default: 20.
    pub frame_duration_ms: u32,
    /// Input frames per resampler pass. Default: 480 (20 ms at 24 kHz).
    pub resampler_chunk_frames: usize,
    /// Codec used for every frame. Default: Opus.
    pub encoder: EncoderKind,
    /// Queued audio above which `is_backpressured()` reports true. Default: 500.
    pub backpressure_threshold_ms: u32,
    /// Longest `stop()` waits for queued packets to play out. Default: 2 s.
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: DEFAULT_INPUT_FORMAT,
            output: DEFAULT_OUTPUT_FORMAT,
            frame_duration_ms: FRAME_DURATION_MS,
            resampler_chunk_frames: 480,
            encoder: EncoderKind::default(),
            backpressure_threshold_ms: 500,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.input.validate()?;
        self.output.validate()?;
        if self.frame_duration_ms == 0 || self.output.frames_for_ms(self.frame_duration_ms) == 0 {
            return Err(VoicecastError::UnsupportedFormat(format!(
                "{} ms frames hold no samples at {}",
                self.frame_duration_ms, self.output
            )));
        }
        if self.resampler_chunk_frames == 0 {
            return Err(VoicecastError::UnsupportedFormat(
                "resampler chunk must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }
}

/// Serde helper: `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Coordinates resampling, framing, encoding and pacing for one voice
/// interaction.
///
/// `StreamController` is `Send + Sync`; share it behind an `Arc` if the
/// encode path and the control path live on different threads.
pub struct StreamController {
    config: PipelineConfig,
    stage: Mutex<EncodeStage>,
    pacer: Arc<PacketPacer>,
    pacer_handle: Mutex<Option<PacerHandle>>,
    active: AtomicBool,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl StreamController {
    /// Build the encoder named by `config.encoder` and start pacing.
    ///
    /// # Errors
    /// - `EncoderUnavailable` / `EncoderInit` if the codec cannot be created.
    /// - `UnsupportedFormat` / `Resample` for an invalid configuration.
    pub fn new(config: PipelineConfig, sink: Arc<dyn PacketSink>, clock: PacingClock) -> Result<Self> {
        config.validate()?;
        let encoder = create_encoder(config.encoder, config.output, config.frame_duration_ms)?;
        Self::with_encoder(config, encoder, sink, clock)
    }

    /// Like `new`, with a caller-supplied encoder.
    pub fn with_encoder(
        config: PipelineConfig,
        encoder: Box<dyn FrameEncoder>,
        sink: Arc<dyn PacketSink>,
        clock: PacingClock,
    ) -> Result<Self> {
        config.validate()?;
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let stage = EncodeStage::new(&config, encoder, Arc::clone(&diagnostics))?;
        let pacer = Arc::new(PacketPacer::new(sink, Arc::clone(&diagnostics)));
        let handle = pacer.spawn(clock, "voicecast")?;

        info!(
            input = %config.input,
            output = %config.output,
            frame_ms = config.frame_duration_ms,
            encoder = config.encoder.as_str(),
            "stream controller started"
        );

        Ok(Self {
            config,
            stage: Mutex::new(stage),
            pacer,
            pacer_handle: Mutex::new(Some(handle)),
            active: AtomicBool::new(true),
            diagnostics,
        })
    }

    /// Feed one chunk of AI audio into the pipeline.
    ///
    /// Never waits for the pacing clock. Packets become audible some bounded
    /// time later.
    ///
    /// # Errors
    /// - `Stopped` after `stop()`.
    /// - `FormatMismatch` if the chunk is not at the configured input format.
    /// - The first resample/encode failure of this chunk, after every other
    ///   frame of the chunk has been processed and queued.
    pub fn write(&self, chunk: PcmChunk) -> Result<()> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(VoicecastError::Stopped);
        }
        if chunk.format != self.config.input {
            return Err(VoicecastError::FormatMismatch {
                expected: self.config.input.to_string(),
                got: chunk.format.to_string(),
            });
        }
        if chunk.is_empty() {
            return Ok(());
        }

        let mut stage = self.stage.lock();
        // stop() may have flushed the stage while we waited for the lock.
        if !self.active.load(Ordering::SeqCst) {
            return Err(VoicecastError::Stopped);
        }
        let (packets, result) = stage.process(&chunk).into_result();
        // Enqueue under the stage lock so production order is queue order.
        if !packets.is_empty() {
            debug!(packets = packets.len(), "queued encoded packets");
            self.pacer.enqueue(packets);
        }
        drop(stage);
        result
    }

    /// Barge-in: drop everything not yet sent and clear the speaking state.
    ///
    /// Resampler, accumulator and encoder keep their state, so audio written
    /// afterwards flows without a restart. Returns the discarded packet count.
    pub fn interrupt(&self) -> usize {
        let discarded = self.pacer.interrupt();
        self.diagnostics.interrupts.fetch_add(1, Ordering::Relaxed);
        info!(discarded, "playback interrupted");
        discarded
    }

    /// Flush, drain (bounded by `drain_timeout`), and stop pacing.
    ///
    /// Idempotent: later calls return `Ok(())` without side effects.
    ///
    /// # Errors
    /// A stage failure while flushing the final partial frame. The
    /// controller is stopped regardless.
    pub fn stop(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let (tail, flush_result) = self.stage.lock().finish().into_result();
        if !tail.is_empty() {
            debug!(packets = tail.len(), "queued flushed tail");
            self.pacer.enqueue(tail);
        }

        let drained = self.drain(self.config.drain_timeout);
        if let Some(mut handle) = self.pacer_handle.lock().take() {
            handle.stop();
        }
        let abandoned = self.pacer.discard_all();
        if !drained {
            warn!(abandoned, "drain timed out, remaining packets abandoned");
        }

        let snapshot = self.diagnostics.snapshot();
        info!(
            sent = snapshot.packets_sent,
            dropped = snapshot.packets_dropped_not_ready,
            encoded = snapshot.frames_encoded,
            "stream controller stopped"
        );
        flush_result
    }

    /// `false` only once `stop()` has been called.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_speaking(&self) -> bool {
        self.pacer.is_speaking()
    }

    pub fn queued_packets(&self) -> usize {
        self.pacer.queued()
    }

    /// Audio waiting in the queue.
    pub fn buffered_audio(&self) -> Duration {
        self.config.frame_duration() * self.queued_packets() as u32
    }

    /// Producers should throttle: more than `backpressure_threshold_ms` is queued.
    pub fn is_backpressured(&self) -> bool {
        self.buffered_audio() > Duration::from_millis(self.config.backpressure_threshold_ms as u64)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pacer.queued() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(DRAIN_POLL_MS));
        }
    }
}
