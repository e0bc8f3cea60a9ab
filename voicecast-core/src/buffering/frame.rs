//! Fixed-size frames and the packets encoded from them.

use crate::audio::AudioFormat;

/// Exactly one frame duration of interleaved PCM at the pipeline's output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Interleaved i16 samples; `len == frames_per_channel × channels`.
    pub samples: Vec<i16>,
    pub format: AudioFormat,
}

impl Frame {
    pub fn new(samples: Vec<i16>, format: AudioFormat) -> Self {
        Self { samples, format }
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channels.max(1) as usize
    }
}

/// One compressed frame, ready for the transport.
///
/// `seq` is assigned in encode order and is only used for diagnostics and
/// tests; the transport sees `data` alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub seq: u64,
    pub data: Vec<u8>,
}

impl EncodedPacket {
    pub fn new(seq: u64, data: Vec<u8>) -> Self {
        Self { seq, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
