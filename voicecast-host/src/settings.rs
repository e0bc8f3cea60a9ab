//! Persistent host settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use voicecast_core::audio::AudioFormat;
use voicecast_core::codec::opus_available;
use voicecast_core::{EncoderKind, PipelineConfig, SessionConfig};

/// Sample rates libopus accepts.
const OPUS_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct HostSettings {
    pub encoder: String,
    pub output_sample_rate: u32,
    pub output_channels: u16,
    pub backpressure_threshold_ms: u32,
    pub drain_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Size of each `sendRealtimeInput` chunk read from the WAV file.
    pub chunk_ms: u32,
    pub guild_id: String,
    pub channel_id: String,
    pub system_message: Option<String>,
    pub working_directory: Option<PathBuf>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            encoder: "opus".into(),
            output_sample_rate: 48_000,
            output_channels: 2,
            backpressure_threshold_ms: 500,
            drain_timeout_ms: 2_000,
            shutdown_timeout_ms: 3_000,
            chunk_ms: 100,
            guild_id: "local".into(),
            channel_id: "voicecast".into(),
            system_message: None,
            working_directory: None,
        }
    }
}

impl HostSettings {
    pub fn normalize(&mut self) {
        self.encoder = normalize_encoder(&self.encoder);
        self.output_sample_rate = normalize_output_rate(self.output_sample_rate);
        self.output_channels = self.output_channels.clamp(1, 2);
        self.backpressure_threshold_ms = self.backpressure_threshold_ms.clamp(40, 10_000);
        self.drain_timeout_ms = self.drain_timeout_ms.min(30_000);
        self.shutdown_timeout_ms = self.shutdown_timeout_ms.clamp(100, 30_000);
        self.chunk_ms = self.chunk_ms.clamp(10, 1_000);
        if self.guild_id.trim().is_empty() {
            self.guild_id = "local".into();
        }
        if self.channel_id.trim().is_empty() {
            self.channel_id = "voicecast".into();
        }
        self.system_message = self
            .system_message
            .as_ref()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
    }

    /// Apply `VOICECAST_*` environment overrides, then re-normalize.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(encoder) = lookup("VOICECAST_ENCODER") {
            self.encoder = encoder;
        }
        if let Some(rate) = lookup("VOICECAST_OUTPUT_RATE").and_then(|v| v.trim().parse().ok()) {
            self.output_sample_rate = rate;
        }
        if let Some(ms) =
            lookup("VOICECAST_SHUTDOWN_TIMEOUT_MS").and_then(|v| v.trim().parse().ok())
        {
            self.shutdown_timeout_ms = ms;
        }
        self.normalize();
    }

    /// The configured codec, or passthrough when Opus is not compiled in.
    pub fn encoder_kind(&self) -> EncoderKind {
        let kind = EncoderKind::parse(&self.encoder).unwrap_or_default();
        if kind == EncoderKind::Opus && !opus_available() {
            warn!("built without the `opus` feature, writing raw PCM frames instead");
            return EncoderKind::Passthrough;
        }
        kind
    }

    /// Session configuration for audio arriving at `input`.
    pub fn session_config(&self, input: AudioFormat) -> SessionConfig {
        SessionConfig {
            pipeline: PipelineConfig {
                input,
                output: AudioFormat::new(self.output_sample_rate, self.output_channels),
                encoder: self.encoder_kind(),
                backpressure_threshold_ms: self.backpressure_threshold_ms,
                drain_timeout: Duration::from_millis(self.drain_timeout_ms),
                ..PipelineConfig::default()
            },
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            worker_name: "voicecast-session".into(),
        }
    }
}

pub fn normalize_encoder(raw: &str) -> String {
    EncoderKind::parse(raw).unwrap_or_default().as_str().into()
}

/// Snap to the closest rate libopus supports.
pub fn normalize_output_rate(rate: u32) -> u32 {
    OPUS_RATES
        .iter()
        .copied()
        .min_by_key(|r| r.abs_diff(rate))
        .unwrap_or(48_000)
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voicecast")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("voicecast")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> HostSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<HostSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}
