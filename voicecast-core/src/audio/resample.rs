//! Streaming PCM format conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! Realtime AI sessions emit 24 kHz mono; voice calls want 48 kHz stereo.
//! `StreamResampler` accepts little-endian i16 bytes of any length at the
//! input format and returns interleaved i16 samples at the output format.
//!
//! 1. Bytes that do not complete a sample frame are carried to the next call.
//! 2. Channels are remapped first (mono duplicates, stereo→mono averages).
//! 3. When rates differ, one cubic `FastFixedIn` session runs over all output
//!    channels with a fixed input chunk size. Its output delay is trimmed
//!    from the head of the stream and output is capped at
//!    `round(frames_in × out_rate / in_rate)`.
//! 4. `finish()` pushes the buffered tail and zero history through, so the
//!    total output length equals `round(frames_in × out_rate / in_rate)`
//!    exactly.
//!
//! When rates match, no rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, info};

use crate::audio::{le_bytes_to_samples, AudioFormat};
use crate::error::{Result, VoicecastError};

/// Upper bound on zero-fed rubato passes during `finish()`.
const MAX_FLUSH_PASSES: usize = 8;

/// Converts an i16 PCM stream from one fixed format to another.
pub struct StreamResampler {
    input: AudioFormat,
    output: AudioFormat,
    /// `None` when input rate == output rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// How many input frames rubato expects per process call.
    chunk_size: usize,
    /// Trailing bytes of an incomplete sample frame.
    carry: Vec<u8>,
    /// Planar accumulation buffer, one lane per output channel.
    input_buf: Vec<Vec<f32>>,
    /// Pre-allocated output buffer: `[channels][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    /// Rubato's algorithmic delay in output frames.
    delay: usize,
    /// Output frames still to discard from the head of the stream.
    delay_remaining: usize,
    frames_in: u64,
    frames_out: u64,
}

impl StreamResampler {
    /// Create a new converter.
    ///
    /// # Parameters
    /// - `input`: format of the bytes passed to `process`.
    /// - `output`: format of the returned samples.
    /// - `chunk_size`: input frame count per rubato call (e.g. `480`).
    ///
    /// # Errors
    /// `UnsupportedFormat` for invalid formats, `Resample` if rubato fails
    /// to initialise.
    pub fn new(input: AudioFormat, output: AudioFormat, chunk_size: usize) -> Result<Self> {
        input.validate()?;
        output.validate()?;
        if chunk_size == 0 {
            return Err(VoicecastError::Resample("chunk size must be non-zero".into()));
        }

        let channels = output.channels as usize;
        let mut converter = Self {
            input,
            output,
            resampler: None,
            chunk_size,
            carry: Vec::new(),
            input_buf: vec![Vec::new(); channels],
            output_buf: Vec::new(),
            delay: 0,
            delay_remaining: 0,
            frames_in: 0,
            frames_out: 0,
        };

        if input.sample_rate == output.sample_rate {
            return Ok(converter);
        }

        let ratio = output.sample_rate as f64 / input.sample_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio, no dynamic adjustment
            PolynomialDegree::Cubic,
            chunk_size,
            channels,
        )
        .map_err(|e| VoicecastError::Resample(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        converter.delay = resampler.output_delay();
        converter.delay_remaining = converter.delay;
        converter.output_buf = vec![vec![0f32; max_out]; channels];
        converter.resampler = Some(resampler);

        info!(
            from = %input,
            to = %output,
            chunk_size,
            max_out,
            delay = converter.delay,
            "resampling enabled"
        );

        Ok(converter)
    }

    /// Convert `bytes`, returning interleaved output samples (may be empty).
    ///
    /// Input is accumulated until rubato has a full chunk; the remainder is
    /// kept for the next call. Empty input is a no-op.
    pub fn process(&mut self, bytes: &[u8]) -> Result<Vec<i16>> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }

        let frame_bytes = self.input.bytes_per_frame();
        self.carry.extend_from_slice(bytes);
        let whole = self.carry.len() / frame_bytes * frame_bytes;
        if whole == 0 {
            return Ok(Vec::new());
        }

        let samples = le_bytes_to_samples(&self.carry[..whole]);
        self.carry.drain(..whole);

        let in_channels = self.input.channels as usize;
        let out_channels = self.output.channels as usize;
        let frames = samples.len() / in_channels;
        self.frames_in += frames as u64;
        let remapped = remap_channels(&samples, in_channels, out_channels);

        if self.resampler.is_none() {
            self.frames_out += frames as u64;
            return Ok(remapped);
        }

        for frame in remapped.chunks_exact(out_channels) {
            for (lane, sample) in self.input_buf.iter_mut().zip(frame) {
                lane.push(*sample as f32 / 32768.0);
            }
        }

        let mut out = Vec::new();
        while self.input_buf[0].len() >= self.chunk_size {
            let produced = self.run_full_chunk()?;
            self.collect_output(produced, &mut out);
        }
        Ok(out)
    }

    /// End the stream: return all remaining output and reset for reuse.
    ///
    /// An incomplete trailing sample frame (fewer bytes than one frame) is
    /// discarded.
    pub fn finish(&mut self) -> Result<Vec<i16>> {
        if !self.carry.is_empty() {
            debug!(bytes = self.carry.len(), "discarding incomplete trailing sample frame");
            self.carry.clear();
        }

        let mut out = Vec::new();
        if self.resampler.is_some() {
            if !self.input_buf[0].is_empty() {
                let produced = self.run_partial(true)?;
                self.collect_output(produced, &mut out);
            }

            let expected = self.expected_output();
            let mut passes = 0;
            while self.frames_out < expected && passes < MAX_FLUSH_PASSES {
                let produced = self.run_partial(false)?;
                self.collect_output(produced, &mut out);
                passes += 1;
            }

            if let Some(resampler) = self.resampler.as_mut() {
                resampler.reset();
            }
        }

        self.reset_counters();
        Ok(out)
    }

    /// Returns `true` when input rate == output rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn input_format(&self) -> AudioFormat {
        self.input
    }

    pub fn output_format(&self) -> AudioFormat {
        self.output
    }

    fn expected_output(&self) -> u64 {
        (self.frames_in as f64 * self.output.sample_rate as f64 / self.input.sample_rate as f64)
            .round() as u64
    }

    fn run_full_chunk(&mut self) -> Result<usize> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(0);
        };
        let chunk = self.chunk_size;
        let slices: Vec<&[f32]> = self.input_buf.iter().map(|lane| &lane[..chunk]).collect();
        let (consumed, produced) = resampler
            .process_into_buffer(&slices, &mut self.output_buf, None)
            .map_err(|e| VoicecastError::Resample(format!("process: {e}")))?;
        for lane in &mut self.input_buf {
            lane.drain(..consumed);
        }
        Ok(produced)
    }

    /// Run one partial pass: the buffered tail when `with_input`, else zeros.
    fn run_partial(&mut self, with_input: bool) -> Result<usize> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(0);
        };
        let result = if with_input {
            resampler.process_partial_into_buffer(
                Some(self.input_buf.as_slice()),
                &mut self.output_buf,
                None,
            )
        } else {
            resampler.process_partial_into_buffer(
                None::<&[Vec<f32>]>,
                &mut self.output_buf,
                None,
            )
        };
        let (_consumed, produced) =
            result.map_err(|e| VoicecastError::Resample(format!("flush: {e}")))?;
        for lane in &mut self.input_buf {
            lane.clear();
        }
        Ok(produced)
    }

    /// Interleave `produced` frames from the output buffer into `out`,
    /// trimming the head delay and capping at the expected stream length.
    fn collect_output(&mut self, produced: usize, out: &mut Vec<i16>) {
        let skip = self.delay_remaining.min(produced);
        self.delay_remaining -= skip;

        let room = self.expected_output().saturating_sub(self.frames_out) as usize;
        let end = produced.min(skip + room);
        if end <= skip {
            return;
        }

        out.reserve((end - skip) * self.output_buf.len());
        for i in skip..end {
            for lane in &self.output_buf {
                out.push(to_i16(lane[i]));
            }
        }
        self.frames_out += (end - skip) as u64;
    }

    fn reset_counters(&mut self) {
        self.frames_in = 0;
        self.frames_out = 0;
        self.delay_remaining = self.delay;
        for lane in &mut self.input_buf {
            lane.clear();
        }
    }
}

/// Remap interleaved samples between channel counts.
fn remap_channels(samples: &[i16], from: usize, to: usize) -> Vec<i16> {
    if from == to {
        return samples.to_vec();
    }
    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if from == 1 {
            out.extend(std::iter::repeat(frame[0]).take(to));
        } else {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            let mixed = (sum / from as i32) as i16;
            out.extend(std::iter::repeat(mixed).take(to));
        }
    }
    out
}

fn to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::samples_to_le_bytes;
    use approx::assert_abs_diff_eq;

    fn mono(rate: u32) -> AudioFormat {
        AudioFormat::new(rate, 1)
    }

    fn stereo(rate: u32) -> AudioFormat {
        AudioFormat::new(rate, 2)
    }

    #[test]
    fn passthrough_identity() {
        let mut rs = StreamResampler::new(stereo(48_000), stereo(48_000), 480).unwrap();
        assert!(rs.is_passthrough());
        let samples: Vec<i16> = (0..960).map(|i| i as i16 - 480).collect();
        let out = rs.process(&samples_to_le_bytes(&samples)).unwrap();
        assert_eq!(out, samples);
        assert!(rs.finish().unwrap().is_empty());
    }

    #[test]
    fn mono_to_stereo_duplicates_samples() {
        let mut rs = StreamResampler::new(mono(48_000), stereo(48_000), 480).unwrap();
        let out = rs.process(&samples_to_le_bytes(&[10, -20, 30])).unwrap();
        assert_eq!(out, vec![10, 10, -20, -20, 30, 30]);
    }

    #[test]
    fn stereo_to_mono_averages_channels() {
        let mut rs = StreamResampler::new(stereo(16_000), mono(16_000), 480).unwrap();
        let out = rs.process(&samples_to_le_bytes(&[100, 300, -50, -150])).unwrap();
        assert_eq!(out, vec![200, -100]);
    }

    #[test]
    fn split_sample_is_carried_across_writes() {
        let mut rs = StreamResampler::new(stereo(48_000), stereo(48_000), 480).unwrap();
        let bytes = samples_to_le_bytes(&[0x1234, -2, 7, 8]);
        assert!(rs.process(&bytes[..3]).unwrap().is_empty());
        let out = rs.process(&bytes[3..]).unwrap();
        assert_eq!(out, vec![0x1234, -2, 7, 8]);
    }

    #[test]
    fn empty_write_is_noop() {
        let mut rs = StreamResampler::new(mono(24_000), stereo(48_000), 480).unwrap();
        assert!(rs.process(&[]).unwrap().is_empty());
        assert!(rs.finish().unwrap().is_empty());
    }

    #[test]
    fn upsample_16k_to_48k_exact_length_after_finish() {
        let mut rs = StreamResampler::new(mono(16_000), stereo(48_000), 320).unwrap();
        assert!(!rs.is_passthrough());
        let bytes = samples_to_le_bytes(&vec![0i16; 960]);
        let mut out = rs.process(&bytes).unwrap();
        out.extend(rs.finish().unwrap());
        assert_eq!(out.len(), 2880 * 2);
    }

    #[test]
    fn arbitrary_write_sizes_give_same_total() {
        let samples: Vec<i16> = (0..4410).map(|i| ((i * 37) % 2000) as i16 - 1000).collect();
        let bytes = samples_to_le_bytes(&samples);

        let mut whole = StreamResampler::new(mono(44_100), stereo(48_000), 441).unwrap();
        let mut expected = whole.process(&bytes).unwrap();
        expected.extend(whole.finish().unwrap());
        assert_eq!(expected.len(), 4800 * 2);

        let mut pieces = StreamResampler::new(mono(44_100), stereo(48_000), 441).unwrap();
        let mut got = Vec::new();
        for piece in bytes.chunks(333) {
            got.extend(pieces.process(piece).unwrap());
        }
        got.extend(pieces.finish().unwrap());
        assert_eq!(got, expected);
    }

    #[test]
    fn streaming_output_never_exceeds_expected_length() {
        let mut rs = StreamResampler::new(mono(24_000), stereo(48_000), 480).unwrap();
        let mut produced = 0usize;
        for _ in 0..10 {
            produced += rs.process(&samples_to_le_bytes(&vec![0i16; 480])).unwrap().len() / 2;
            assert!(produced as u64 <= rs.frames_in * 2);
        }
        produced += rs.finish().unwrap().len() / 2;
        assert_eq!(produced, 9600);
    }

    #[test]
    fn constant_signal_survives_resampling() {
        let level = 8_192i16;
        let mut rs = StreamResampler::new(mono(24_000), mono(48_000), 480).unwrap();
        let mut out = rs
            .process(&samples_to_le_bytes(&vec![level; 4_800]))
            .unwrap();
        out.extend(rs.finish().unwrap());
        assert_eq!(out.len(), 9_600);
        let mid = out[4_800];
        assert_abs_diff_eq!(mid as f32, level as f32, epsilon = 64.0);
    }

    #[test]
    fn finish_resets_for_reuse() {
        let mut rs = StreamResampler::new(mono(24_000), stereo(48_000), 480).unwrap();
        let bytes = samples_to_le_bytes(&vec![0i16; 480]);
        let mut first = rs.process(&bytes).unwrap();
        first.extend(rs.finish().unwrap());
        let mut second = rs.process(&bytes).unwrap();
        second.extend(rs.finish().unwrap());
        assert_eq!(first.len(), 960 * 2);
        assert_eq!(second.len(), first.len());
    }
}
