//! Messages exchanged between the host and an isolated voice session.
//!
//! Every message is a JSON object tagged by `type`:
//!
//! | Direction | `type` |
//! |-----------|--------|
//! | host → worker | `init`, `sendRealtimeInput`, `sendTextInput`, `interrupt`, `stop` |
//! | worker → host | `ready`, `assistantOpusPacket`, `assistantStartSpeaking`, `assistantStopSpeaking`, `assistantInterruptSpeaking`, `toolCallCompleted`, `error`, `stopped` |
//!
//! In-process the enums travel over channels unchanged; the serde shape is
//! the contract for any out-of-process host.

use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::audio::{parse_pcm_mime, PcmChunk};
use crate::error::{Result, VoicecastError};

// ---------------------------------------------------------------------------
// Host → worker
// ---------------------------------------------------------------------------

/// Control messages accepted by the isolated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    /// Open the AI session and build the stream pipeline.
    Init(SessionInit),
    /// Forward user audio to the AI session.
    SendRealtimeInput { audio: RealtimeAudio },
    /// Forward user text to the AI session.
    SendTextInput { text: String },
    /// Barge-in: silence the assistant now.
    Interrupt,
    /// Graceful shutdown.
    Stop,
}

impl HostMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HostMessage::Init(_) => "init",
            HostMessage::SendRealtimeInput { .. } => "sendRealtimeInput",
            HostMessage::SendTextInput { .. } => "sendTextInput",
            HostMessage::Interrupt => "interrupt",
            HostMessage::Stop => "stop",
        }
    }
}

/// Payload of the `init` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInit {
    /// Working directory the AI session's tools operate in.
    pub directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    pub guild_id: String,
    pub channel_id: String,
}

/// Base64 PCM as carried by `sendRealtimeInput`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeAudio {
    /// e.g. `audio/pcm;rate=16000`.
    pub mime_type: String,
    /// Base64 of little-endian i16 PCM.
    pub data: String,
}

impl RealtimeAudio {
    pub fn from_pcm(chunk: &PcmChunk) -> Self {
        let mut mime_type = format!("audio/pcm;rate={}", chunk.format.sample_rate);
        if chunk.format.channels != 1 {
            mime_type.push_str(&format!(";channels={}", chunk.format.channels));
        }
        Self {
            mime_type,
            data: STANDARD.encode(&chunk.data),
        }
    }

    /// Decode the payload back into a PCM chunk.
    ///
    /// # Errors
    /// `InvalidInput` for an unsupported mime type or malformed base64.
    pub fn decode(&self) -> Result<PcmChunk> {
        let format = parse_pcm_mime(&self.mime_type)?;
        let data = STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| VoicecastError::InvalidInput(format!("audio data is not base64: {e}")))?;
        Ok(PcmChunk::new(data, format))
    }
}

// ---------------------------------------------------------------------------
// Worker → host
// ---------------------------------------------------------------------------

/// Events emitted by the isolated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// Initialised; input may be sent.
    Ready,
    /// One paced packet. Ownership passes to the host.
    AssistantOpusPacket { packet: Vec<u8> },
    AssistantStartSpeaking,
    AssistantStopSpeaking,
    AssistantInterruptSpeaking,
    ToolCallCompleted(ToolCallResult),
    Error { error: String },
    /// Final message of a graceful shutdown.
    Stopped,
}

impl WorkerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        WorkerMessage::Error {
            error: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Ready => "ready",
            WorkerMessage::AssistantOpusPacket { .. } => "assistantOpusPacket",
            WorkerMessage::AssistantStartSpeaking => "assistantStartSpeaking",
            WorkerMessage::AssistantStopSpeaking => "assistantStopSpeaking",
            WorkerMessage::AssistantInterruptSpeaking => "assistantInterruptSpeaking",
            WorkerMessage::ToolCallCompleted(_) => "toolCallCompleted",
            WorkerMessage::Error { .. } => "error",
            WorkerMessage::Stopped => "stopped",
        }
    }
}

/// Outcome of a tool call the AI session ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub session_id: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of one isolated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionLifecycle {
    /// Worker running, `init` not yet received.
    Uninitialized,
    /// AI session open, no input sent yet.
    Ready,
    /// Input has flowed.
    Active,
    /// `stop` received; draining.
    Stopping,
    /// Drained or force-terminated.
    Stopped,
}

impl SessionLifecycle {
    /// Next state after `msg`, or the protocol error to report.
    ///
    /// `interrupt` is valid in `ready`/`active` and never changes the state.
    /// Everything after `stop` is rejected.
    pub fn on_message(self, msg: &HostMessage) -> Result<SessionLifecycle> {
        use SessionLifecycle::*;

        match (self, msg) {
            (Stopping | Stopped, _) => Err(VoicecastError::Protocol(format!(
                "`{}` rejected: session is {}",
                msg.kind(),
                self.as_str()
            ))),
            (_, HostMessage::Stop) => Ok(Stopping),
            (Uninitialized, HostMessage::Init(_)) => Ok(Ready),
            (Uninitialized, _) => Err(VoicecastError::NotInitialized),
            (Ready | Active, HostMessage::Init(_)) => Err(VoicecastError::Protocol(
                "`init` rejected: session already initialised".into(),
            )),
            (Ready | Active, HostMessage::SendRealtimeInput { .. })
            | (Ready | Active, HostMessage::SendTextInput { .. }) => Ok(Active),
            (state, HostMessage::Interrupt) => Ok(state),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionLifecycle::Stopping | SessionLifecycle::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionLifecycle::Uninitialized => "uninitialized",
            SessionLifecycle::Ready => "ready",
            SessionLifecycle::Active => "active",
            SessionLifecycle::Stopping => "stopping",
            SessionLifecycle::Stopped => "stopped",
        }
    }
}

/// Published by the host handle whenever the mirrored lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub lifecycle: SessionLifecycle,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;

    fn init() -> HostMessage {
        HostMessage::Init(SessionInit {
            directory: PathBuf::from("/work/project"),
            system_message: None,
            guild_id: "g1".into(),
            channel_id: "c1".into(),
        })
    }

    #[test]
    fn init_serializes_flat_with_camel_case_ids() {
        let json = serde_json::to_value(init()).expect("serialize init");
        assert_eq!(json["type"], "init");
        assert_eq!(json["directory"], "/work/project");
        assert_eq!(json["guildId"], "g1");
        assert_eq!(json["channelId"], "c1");
        assert!(json.get("systemMessage").is_none());

        let parsed: HostMessage = serde_json::from_str(
            r#"{"type":"init","directory":"/tmp","systemMessage":"be brief","guildId":"1","channelId":"2"}"#,
        )
        .expect("deserialize init");
        match parsed {
            HostMessage::Init(init) => {
                assert_eq!(init.system_message.as_deref(), Some("be brief"));
                assert_eq!(init.channel_id, "2");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unit_messages_are_bare_type_objects() {
        assert_eq!(
            serde_json::to_string(&HostMessage::Interrupt).unwrap(),
            r#"{"type":"interrupt"}"#
        );
        assert_eq!(
            serde_json::to_string(&WorkerMessage::AssistantInterruptSpeaking).unwrap(),
            r#"{"type":"assistantInterruptSpeaking"}"#
        );
        let stop: HostMessage = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(stop, HostMessage::Stop);
    }

    #[test]
    fn realtime_input_carries_mime_and_base64() {
        let json = r#"{"type":"sendRealtimeInput","audio":{"mimeType":"audio/pcm;rate=16000","data":"AQACAA=="}}"#;
        let msg: HostMessage = serde_json::from_str(json).unwrap();
        let HostMessage::SendRealtimeInput { audio } = msg else {
            panic!("expected sendRealtimeInput");
        };
        let chunk = audio.decode().unwrap();
        assert_eq!(chunk.format, AudioFormat::new(16_000, 1));
        assert_eq!(chunk.data, vec![1, 0, 2, 0]);
    }

    #[test]
    fn realtime_audio_from_pcm_encodes_format() {
        let chunk = PcmChunk::from_samples(&[1, 2, 3, 4], AudioFormat::new(48_000, 2));
        let audio = RealtimeAudio::from_pcm(&chunk);
        assert_eq!(audio.mime_type, "audio/pcm;rate=48000;channels=2");
        assert_eq!(audio.decode().unwrap(), chunk);
    }

    #[test]
    fn realtime_audio_rejects_bad_base64() {
        let audio = RealtimeAudio {
            mime_type: "audio/pcm;rate=16000".into(),
            data: "not base64!".into(),
        };
        assert!(matches!(audio.decode(), Err(VoicecastError::InvalidInput(_))));
    }

    #[test]
    fn opus_packet_and_error_shapes() {
        let json = serde_json::to_value(WorkerMessage::AssistantOpusPacket {
            packet: vec![0xf8, 0xff, 0xfe],
        })
        .unwrap();
        assert_eq!(json["type"], "assistantOpusPacket");
        assert_eq!(json["packet"], serde_json::json!([248, 255, 254]));

        let json = serde_json::to_value(WorkerMessage::error("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "error", "error": "boom"}));
    }

    #[test]
    fn tool_call_completed_omits_absent_fields() {
        let msg = WorkerMessage::ToolCallCompleted(ToolCallResult {
            session_id: "s".into(),
            message_id: "m".into(),
            data: Some(serde_json::json!({"ok": true})),
            error: None,
            markdown: Some("**done**".into()),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "toolCallCompleted");
        assert_eq!(json["sessionId"], "s");
        assert_eq!(json["messageId"], "m");
        assert_eq!(json["data"]["ok"], true);
        assert!(json.get("error").is_none());

        let round_trip: WorkerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(round_trip, msg);
    }

    #[test]
    fn lifecycle_happy_path() {
        let audio = HostMessage::SendTextInput { text: "hi".into() };
        let state = SessionLifecycle::Uninitialized.on_message(&init()).unwrap();
        assert_eq!(state, SessionLifecycle::Ready);
        let state = state.on_message(&HostMessage::Interrupt).unwrap();
        assert_eq!(state, SessionLifecycle::Ready);
        let state = state.on_message(&audio).unwrap();
        assert_eq!(state, SessionLifecycle::Active);
        let state = state.on_message(&HostMessage::Interrupt).unwrap();
        assert_eq!(state, SessionLifecycle::Active);
        let state = state.on_message(&HostMessage::Stop).unwrap();
        assert_eq!(state, SessionLifecycle::Stopping);
        assert!(state.is_terminal());
    }

    #[test]
    fn lifecycle_rejects_out_of_order_messages() {
        assert!(matches!(
            SessionLifecycle::Uninitialized.on_message(&HostMessage::Interrupt),
            Err(VoicecastError::NotInitialized)
        ));
        assert!(SessionLifecycle::Ready.on_message(&init()).is_err());
        for state in [SessionLifecycle::Stopping, SessionLifecycle::Stopped] {
            for msg in [init(), HostMessage::Interrupt, HostMessage::Stop] {
                assert!(matches!(
                    state.on_message(&msg),
                    Err(VoicecastError::Protocol(_))
                ));
            }
        }
    }

    #[test]
    fn lifecycle_serializes_lowercase() {
        let event = SessionStatusEvent {
            lifecycle: SessionLifecycle::Stopping,
            detail: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["lifecycle"], "stopping");
    }
}
