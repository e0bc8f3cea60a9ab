//! `PassthroughEncoder`: emits each frame as raw little-endian PCM.
//!
//! Stands in for a real codec in tests and in sinks that want PCM. It keeps
//! the 1:1 frame/packet contract and rejects misaligned frames just like a
//! real codec would.

use tracing::debug;

use crate::audio::{samples_to_le_bytes, AudioFormat};
use crate::buffering::frame::Frame;
use crate::codec::{check_frame_len, FrameEncoder};
use crate::error::Result;

pub struct PassthroughEncoder {
    frame_len: usize,
}

impl PassthroughEncoder {
    pub fn new(format: AudioFormat, frame_duration_ms: u32) -> Result<Self> {
        format.validate()?;
        let frame_len = format.frames_for_ms(frame_duration_ms) * format.channels as usize;
        debug!(%format, frame_len, "passthrough encoder ready");
        Ok(Self { frame_len })
    }
}

impl FrameEncoder for PassthroughEncoder {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        check_frame_len(frame, self.frame_len)?;
        Ok(samples_to_le_bytes(&frame.samples))
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}
