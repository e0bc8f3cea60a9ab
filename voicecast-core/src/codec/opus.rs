//! Opus frame encoder backed by `audiopus` (libopus).
//!
//! Opus accepts 8/12/16/24/48 kHz, mono or stereo, and frame durations of
//! 5, 10, 20, 40 or 60 ms; anything else is rejected at construction.

use audiopus::coder::Encoder;
use audiopus::{Application, Channels, SampleRate};
use tracing::info;

use crate::audio::AudioFormat;
use crate::buffering::frame::Frame;
use crate::codec::{check_frame_len, FrameEncoder};
use crate::error::{Result, VoicecastError};

/// Largest packet libopus can produce for one frame.
const MAX_PACKET_BYTES: usize = 4000;

const VALID_FRAME_MS: [u32; 5] = [5, 10, 20, 40, 60];

pub struct OpusFrameEncoder {
    encoder: Encoder,
    frame_len: usize,
    scratch: Vec<u8>,
}

impl OpusFrameEncoder {
    /// # Errors
    /// `EncoderInit` for formats Opus cannot carry or if libopus fails.
    pub fn new(format: AudioFormat, frame_duration_ms: u32) -> Result<Self> {
        let sample_rate = match format.sample_rate {
            8_000 => SampleRate::Hz8000,
            12_000 => SampleRate::Hz12000,
            16_000 => SampleRate::Hz16000,
            24_000 => SampleRate::Hz24000,
            48_000 => SampleRate::Hz48000,
            other => {
                return Err(VoicecastError::EncoderInit(format!(
                    "opus does not support {other} Hz"
                )))
            }
        };
        let channels = match format.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => {
                return Err(VoicecastError::EncoderInit(format!(
                    "opus does not support {other} channels"
                )))
            }
        };
        if !VALID_FRAME_MS.contains(&frame_duration_ms) {
            return Err(VoicecastError::EncoderInit(format!(
                "opus does not support {frame_duration_ms} ms frames"
            )));
        }

        let encoder = Encoder::new(sample_rate, channels, Application::Audio)
            .map_err(|e| VoicecastError::EncoderInit(format!("opus encoder: {e}")))?;

        let frame_len = format.frames_for_ms(frame_duration_ms) * format.channels as usize;
        info!(%format, frame_duration_ms, "opus encoder ready");

        Ok(Self {
            encoder,
            frame_len,
            scratch: vec![0u8; MAX_PACKET_BYTES],
        })
    }
}

impl FrameEncoder for OpusFrameEncoder {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        check_frame_len(frame, self.frame_len)?;
        let written = self
            .encoder
            .encode(&frame.samples, &mut self.scratch)
            .map_err(|e| VoicecastError::Encode(format!("opus: {e}")))?;
        Ok(self.scratch[..written].to_vec())
    }

    fn name(&self) -> &'static str {
        "opus"
    }
}
