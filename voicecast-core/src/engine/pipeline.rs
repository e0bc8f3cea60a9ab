//! Encode path: resample → frame-align → encode.
//!
//! ## Stages (per write)
//!
//! ```text
//! 1. StreamResampler::process   → interleaved i16 at the output format
//! 2. FrameAccumulator::push     → zero or more complete frames
//! 3. FrameEncoder::encode       → exactly one packet per frame, in order
//! ```
//!
//! Stage errors never abort the write. A failed resample loses that chunk,
//! a failed encode loses that frame; the first error is handed back with
//! whatever packets were produced so the caller can report it upstream.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use serde::Serialize;
use tracing::{debug, error};

use crate::{
    audio::{resample::StreamResampler, PcmChunk},
    buffering::{
        frame::{EncodedPacket, Frame},
        FrameAccumulator,
    },
    codec::FrameEncoder,
    engine::PipelineConfig,
    error::{Result, VoicecastError},
};

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub chunks_in: AtomicUsize,
    pub bytes_in: AtomicUsize,
    pub frames_encoded: AtomicUsize,
    pub encode_errors: AtomicUsize,
    pub packets_queued: AtomicUsize,
    pub packets_sent: AtomicUsize,
    pub packets_dropped_not_ready: AtomicUsize,
    pub packets_discarded_interrupt: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub ticks: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.chunks_in.store(0, Ordering::Relaxed);
        self.bytes_in.store(0, Ordering::Relaxed);
        self.frames_encoded.store(0, Ordering::Relaxed);
        self.encode_errors.store(0, Ordering::Relaxed);
        self.packets_queued.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_dropped_not_ready.store(0, Ordering::Relaxed);
        self.packets_discarded_interrupt.store(0, Ordering::Relaxed);
        self.interrupts.store(0, Ordering::Relaxed);
        self.ticks.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            packets_queued: self.packets_queued.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_dropped_not_ready: self.packets_dropped_not_ready.load(Ordering::Relaxed),
            packets_discarded_interrupt: self.packets_discarded_interrupt.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub chunks_in: usize,
    pub bytes_in: usize,
    pub frames_encoded: usize,
    pub encode_errors: usize,
    pub packets_queued: usize,
    pub packets_sent: usize,
    pub packets_dropped_not_ready: usize,
    pub packets_discarded_interrupt: usize,
    pub interrupts: usize,
    pub ticks: usize,
}

/// Packets produced by one pass through the stage, plus the first error.
#[derive(Debug, Default)]
pub struct StageOutput {
    pub packets: Vec<EncodedPacket>,
    pub error: Option<VoicecastError>,
}

impl StageOutput {
    fn record(&mut self, err: VoicecastError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Split into packets and `Err` for the first stage failure.
    pub fn into_result(self) -> (Vec<EncodedPacket>, Result<()>) {
        let result = match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        };
        (self.packets, result)
    }
}

/// Resampler, accumulator and encoder for one stream.
pub struct EncodeStage {
    resampler: StreamResampler,
    accumulator: FrameAccumulator,
    encoder: Box<dyn FrameEncoder>,
    next_seq: u64,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl EncodeStage {
    pub fn new(
        config: &PipelineConfig,
        encoder: Box<dyn FrameEncoder>,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Result<Self> {
        let resampler =
            StreamResampler::new(config.input, config.output, config.resampler_chunk_frames)?;
        let accumulator = FrameAccumulator::new(config.output, config.frame_duration_ms);
        debug!(
            encoder = encoder.name(),
            frame_len = accumulator.frame_len(),
            passthrough = resampler.is_passthrough(),
            "encode stage ready"
        );
        Ok(Self {
            resampler,
            accumulator,
            encoder,
            next_seq: 0,
            diagnostics,
        })
    }

    /// Push one chunk through every stage.
    pub fn process(&mut self, chunk: &PcmChunk) -> StageOutput {
        let mut out = StageOutput::default();
        if chunk.is_empty() {
            return out;
        }
        self.diagnostics.chunks_in.fetch_add(1, Ordering::Relaxed);
        self.diagnostics
            .bytes_in
            .fetch_add(chunk.data.len(), Ordering::Relaxed);

        match self.resampler.process(&chunk.data) {
            Ok(samples) => {
                let frames = self.accumulator.push(&samples);
                self.encode_frames(frames, &mut out);
            }
            Err(e) => {
                error!("resample failed, chunk lost: {e}");
                out.record(e);
            }
        }
        out
    }

    /// Flush the resampler tail and the zero-padded remainder frame.
    pub fn finish(&mut self) -> StageOutput {
        let mut out = StageOutput::default();
        match self.resampler.finish() {
            Ok(samples) => {
                let frames = self.accumulator.push(&samples);
                self.encode_frames(frames, &mut out);
            }
            Err(e) => {
                error!("resampler flush failed: {e}");
                out.record(e);
            }
        }
        if let Some(last) = self.accumulator.finish() {
            self.encode_frames(vec![last], &mut out);
        }
        out
    }

    fn encode_frames(&mut self, frames: Vec<Frame>, out: &mut StageOutput) {
        for frame in frames {
            match self.encoder.encode(&frame) {
                Ok(data) => {
                    out.packets.push(EncodedPacket::new(self.next_seq, data));
                    self.next_seq += 1;
                    self.diagnostics
                        .frames_encoded
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // The codec's history now has a gap; later frames still encode.
                    error!(encoder = self.encoder.name(), "frame encode failed: {e}");
                    self.diagnostics
                        .encode_errors
                        .fetch_add(1, Ordering::Relaxed);
                    out.record(e);
                }
            }
        }
    }
}
