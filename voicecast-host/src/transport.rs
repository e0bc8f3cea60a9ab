//! Packet file transport.
//!
//! Stands in for a voice connection: every packet is appended as a
//! big-endian `u16` length followed by the packet bytes. A write failure
//! marks the transport not ready, so later packets are dropped by the
//! dispatcher instead of failing one by one.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error};
use voicecast_core::{EncodedPacket, PacketSink, VoicecastError};

pub struct PacketFileSink<W: Write + Send> {
    writer: Mutex<W>,
    ready: AtomicBool,
    speaking: AtomicBool,
    packets_written: AtomicU64,
    bytes_written: AtomicU64,
}

impl<W: Write + Send> PacketFileSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            ready: AtomicBool::new(true),
            speaking: AtomicBool::new(false),
            packets_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send + 'static> PacketSink for PacketFileSink<W> {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn send_packet(&self, packet: EncodedPacket) -> voicecast_core::Result<()> {
        let len = u16::try_from(packet.len()).map_err(|_| {
            VoicecastError::InvalidInput(format!("packet of {} bytes too large", packet.len()))
        })?;

        let mut writer = self.writer.lock();
        let result = writer
            .write_all(&len.to_be_bytes())
            .and_then(|()| writer.write_all(&packet.data));
        if let Err(e) = result {
            error!(seq = packet.seq, "packet file write failed: {e}");
            self.ready.store(false, Ordering::Relaxed);
            return Err(e.into());
        }

        self.packets_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(2 + packet.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn set_speaking(&self, speaking: bool) {
        if self.speaking.swap(speaking, Ordering::Relaxed) != speaking {
            debug!(speaking, "speaking indicator");
        }
    }
}
