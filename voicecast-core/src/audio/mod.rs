//! PCM formats and chunks exchanged with the AI voice session.
//!
//! All PCM in this crate is signed 16-bit little-endian, interleaved when
//! there is more than one channel. The AI session typically produces 24 kHz
//! mono; voice calls expect 48 kHz stereo. `resample::StreamResampler`
//! bridges the two.

pub mod resample;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoicecastError};

/// Fixed frame duration of the pipeline.
pub const FRAME_DURATION_MS: u32 = 20;

/// Default output format: what a voice call transport expects.
pub const DEFAULT_OUTPUT_FORMAT: AudioFormat = AudioFormat::new(48_000, 2);

/// Default input format: what realtime AI sessions usually emit.
pub const DEFAULT_INPUT_FORMAT: AudioFormat = AudioFormat::new(24_000, 1);

/// Sample rate assumed when a realtime input mime type carries no `rate=`.
const DEFAULT_MIME_RATE: u32 = 16_000;

/// Bytes per 16-bit sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Sample rate and channel count of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Rejects formats the pipeline cannot carry (zero rate, 0 or > 2 channels).
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(VoicecastError::UnsupportedFormat(format!(
                "{self}: sample rate must be non-zero"
            )));
        }
        if self.channels == 0 || self.channels > 2 {
            return Err(VoicecastError::UnsupportedFormat(format!(
                "{self}: only mono and stereo are supported"
            )));
        }
        Ok(())
    }

    /// Size in bytes of one interleaved sample frame (one sample per channel).
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Samples per channel in `duration_ms` at this rate.
    pub fn frames_for_ms(&self, duration_ms: u32) -> usize {
        (self.sample_rate as u64 * duration_ms as u64 / 1000) as usize
    }

    /// Duration of `frames` samples per channel.
    pub fn duration_of(&self, frames: usize) -> Duration {
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz/{}ch", self.sample_rate, self.channels)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        DEFAULT_OUTPUT_FORMAT
    }
}

/// Raw PCM bytes as produced by the AI session.
///
/// Ownership moves into the pipeline on `StreamController::write`. The byte
/// length does not have to be sample aligned; the resampler carries split
/// samples over to the next chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmChunk {
    pub data: Vec<u8>,
    pub format: AudioFormat,
}

impl PcmChunk {
    pub fn new(data: Vec<u8>, format: AudioFormat) -> Self {
        Self { data, format }
    }

    /// Build a chunk from interleaved samples.
    pub fn from_samples(samples: &[i16], format: AudioFormat) -> Self {
        Self::new(samples_to_le_bytes(samples), format)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Duration covered by the complete sample frames in this chunk.
    pub fn duration(&self) -> Duration {
        self.format
            .duration_of(self.data.len() / self.format.bytes_per_frame().max(1))
    }
}

/// Encode interleaved samples as little-endian bytes.
pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decode little-endian bytes into samples. A trailing odd byte is ignored.
pub fn le_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Parse a realtime input mime type such as `audio/pcm;rate=16000`.
///
/// `channels=N` is accepted as an extension parameter; mono is assumed
/// otherwise.
pub fn parse_pcm_mime(mime: &str) -> Result<AudioFormat> {
    let mut parts = mime.split(';').map(str::trim);
    let essence = parts.next().unwrap_or_default().to_ascii_lowercase();
    if essence != "audio/pcm" && essence != "audio/l16" {
        return Err(VoicecastError::InvalidInput(format!(
            "unsupported mime type `{mime}`"
        )));
    }

    let mut format = AudioFormat::new(DEFAULT_MIME_RATE, 1);
    for param in parts {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "rate" => {
                format.sample_rate = value.parse().map_err(|_| {
                    VoicecastError::InvalidInput(format!("invalid rate `{value}` in `{mime}`"))
                })?;
            }
            "channels" => {
                format.channels = value.parse().map_err(|_| {
                    VoicecastError::InvalidInput(format!("invalid channels `{value}` in `{mime}`"))
                })?;
            }
            _ => {}
        }
    }

    format.validate()?;
    Ok(format)
}
