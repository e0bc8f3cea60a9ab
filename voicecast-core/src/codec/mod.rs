//! Frame encoder abstraction.
//!
//! The `FrameEncoder` trait decouples the pipeline from any specific codec
//! (raw passthrough, Opus, ...). `&mut self` on `encode` expresses that
//! codecs carry history from frame to frame, so frames must arrive in
//! temporal order.
//!
//! Codec availability is checked once, in `create_encoder`. A pipeline that
//! asks for a codec the crate was built without fails at construction time
//! rather than mid-stream.

pub mod passthrough;

#[cfg(feature = "opus")]
pub mod opus;

#[cfg(feature = "opus")]
pub use opus::OpusFrameEncoder;
pub use passthrough::PassthroughEncoder;

use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;
use crate::buffering::frame::Frame;
use crate::error::{Result, VoicecastError};

/// Contract for per-frame codecs.
pub trait FrameEncoder: Send + 'static {
    /// Encode exactly one frame into one packet payload.
    ///
    /// # Errors
    /// A per-frame failure. The pipeline reports it and continues with the
    /// next frame.
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>>;

    /// Short codec name for logs.
    fn name(&self) -> &'static str;
}

/// Which codec a pipeline should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// Opus, as voice call transports expect. Requires the `opus` feature.
    #[default]
    Opus,
    /// Raw little-endian PCM frames. Useful for tests and local sinks.
    Passthrough,
}

impl EncoderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EncoderKind::Opus => "opus",
            EncoderKind::Passthrough => "passthrough",
        }
    }

    /// Parse a settings/env value; unknown values yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "opus" => Some(EncoderKind::Opus),
            "passthrough" | "pcm" | "raw" => Some(EncoderKind::Passthrough),
            _ => None,
        }
    }
}

/// Whether this build carries an Opus encoder.
pub const fn opus_available() -> bool {
    cfg!(feature = "opus")
}

/// Build the encoder for `kind`, failing fast if it is not compiled in.
pub fn create_encoder(
    kind: EncoderKind,
    format: AudioFormat,
    frame_duration_ms: u32,
) -> Result<Box<dyn FrameEncoder>> {
    match kind {
        EncoderKind::Passthrough => Ok(Box::new(PassthroughEncoder::new(
            format,
            frame_duration_ms,
        )?)),
        #[cfg(feature = "opus")]
        EncoderKind::Opus => Ok(Box::new(OpusFrameEncoder::new(format, frame_duration_ms)?)),
        #[cfg(not(feature = "opus"))]
        EncoderKind::Opus => Err(VoicecastError::EncoderUnavailable("opus")),
    }
}

/// Check a frame carries exactly `expected` interleaved samples.
pub(crate) fn check_frame_len(frame: &Frame, expected: usize) -> Result<()> {
    if frame.samples.len() != expected {
        return Err(VoicecastError::Encode(format!(
            "frame has {} samples, encoder expects {}",
            frame.samples.len(),
            expected
        )));
    }
    Ok(())
}
