//! Frame alignment between variable-sized resampler output and the encoder.
//!
//! `FrameAccumulator` receives interleaved samples in whatever sizes the
//! resampler produces and slices them into frames of exactly
//! `frame_duration × rate` samples per channel. The remainder stays buffered
//! until the next push; `finish` zero-pads it into one last frame.

pub mod frame;

use crate::audio::AudioFormat;
use frame::Frame;

/// Buffers interleaved PCM and yields fixed-size frames in write order.
#[derive(Debug)]
pub struct FrameAccumulator {
    format: AudioFormat,
    /// Interleaved samples per frame (all channels).
    frame_len: usize,
    pending: Vec<i16>,
}

impl FrameAccumulator {
    /// Create an accumulator for `frame_duration_ms` frames at `format`.
    pub fn new(format: AudioFormat, frame_duration_ms: u32) -> Self {
        let frame_len = format.frames_for_ms(frame_duration_ms) * format.channels as usize;
        Self {
            format,
            frame_len,
            pending: Vec::with_capacity(frame_len * 2),
        }
    }

    /// Append samples and return every complete frame now available.
    pub fn push(&mut self, samples: &[i16]) -> Vec<Frame> {
        if samples.is_empty() {
            return Vec::new();
        }
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.frame_len;
        if complete == 0 {
            return Vec::new();
        }

        let mut frames = Vec::with_capacity(complete);
        for chunk in self.pending.chunks_exact(self.frame_len) {
            frames.push(Frame::new(chunk.to_vec(), self.format));
        }
        self.pending.drain(..complete * self.frame_len);
        frames
    }

    /// Emit the buffered remainder as one zero-padded frame, if any.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.pending.is_empty() {
            return None;
        }
        let mut samples = std::mem::take(&mut self.pending);
        samples.resize(self.frame_len, 0);
        Some(Frame::new(samples, self.format))
    }

    /// Samples buffered below one frame.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    /// Interleaved samples per frame.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo48() -> AudioFormat {
        AudioFormat::new(48_000, 2)
    }

    #[test]
    fn frame_len_is_20ms_of_stereo() {
        let acc = FrameAccumulator::new(stereo48(), 20);
        assert_eq!(acc.frame_len(), 1920);
    }

    #[test]
    fn small_pushes_accumulate_into_one_frame() {
        let mut acc = FrameAccumulator::new(stereo48(), 20);
        assert!(acc.push(&vec![1; 1000]).is_empty());
        let frames = acc.push(&vec![2; 1000]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples.len(), 1920);
        assert_eq!(frames[0].samples[999], 1);
        assert_eq!(frames[0].samples[1000], 2);
        assert_eq!(acc.pending_samples(), 80);
    }

    #[test]
    fn large_push_yields_frames_in_order() {
        let mut acc = FrameAccumulator::new(stereo48(), 20);
        let samples: Vec<i16> = (0..(1920 * 3 + 5)).map(|i| (i / 1920) as i16).collect();
        let frames = acc.push(&samples);
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert!(frame.samples.iter().all(|&s| s == i as i16));
            assert_eq!(frame.frames(), 960);
        }
        assert_eq!(acc.pending_samples(), 5);
    }

    #[test]
    fn arbitrary_chunking_matches_floor_of_total() {
        let mut acc = FrameAccumulator::new(stereo48(), 20);
        let sizes = [7usize, 1919, 1, 4000, 333, 2500, 64];
        let total: usize = sizes.iter().sum();
        let mut produced = 0;
        for size in sizes {
            produced += acc.push(&vec![0; size]).len();
        }
        assert_eq!(produced, total / 1920);
        assert_eq!(acc.pending_samples(), total % 1920);
        assert!(acc.finish().is_some());
        assert!(acc.finish().is_none());
    }

    #[test]
    fn finish_zero_pads_remainder() {
        let mut acc = FrameAccumulator::new(stereo48(), 20);
        acc.push(&[5; 10]);
        let last = acc.finish().expect("remainder frame");
        assert_eq!(last.samples.len(), 1920);
        assert!(last.samples[..10].iter().all(|&s| s == 5));
        assert!(last.samples[10..].iter().all(|&s| s == 0));
        assert_eq!(acc.pending_samples(), 0);
    }

    #[test]
    fn finish_without_remainder_emits_nothing() {
        let mut acc = FrameAccumulator::new(stereo48(), 20);
        assert_eq!(acc.push(&vec![0; 1920]).len(), 1);
        assert!(acc.finish().is_none());
    }
}
