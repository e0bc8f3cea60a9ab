//! AI voice session abstraction and the isolation boundary around it.
//!
//! The `VoiceSession` trait decouples the worker from any specific AI
//! backend (echo stub, realtime model client, scripted test fake). A backend
//! reports what it produces through `SessionEvent`s on the channel handed to
//! `VoiceSessionFactory::connect`.
//!
//! ```text
//!  host thread                     worker thread
//!  ───────────                     ─────────────
//!  IsolatedSession ──HostMessage──► worker loop ──► VoiceSession
//!        ▲                              │  ▲              │
//!        │                              │  └─SessionEvent─┘
//!        └────────WorkerMessage─────────┤
//!                                       └─► StreamController ─► pacer
//! ```

pub mod echo;
pub mod host;
mod worker;

pub use echo::{EchoSession, EchoSessionFactory};
pub use host::{HostDispatcher, IsolatedSession, SessionObserver, ShutdownOutcome};

use std::time::Duration;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::audio::PcmChunk;
use crate::engine::{duration_ms, PipelineConfig};
use crate::error::Result;
use crate::ipc::{SessionInit, ToolCallResult};

/// Events an AI session produces.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Assistant audio, at the pipeline's input format.
    Audio(PcmChunk),
    StartSpeaking,
    StopSpeaking,
    /// The AI detected the user talking over it.
    InterruptSpeaking,
    ToolCallCompleted(ToolCallResult),
    Error(String),
}

/// Contract for AI voice session backends.
///
/// Calls come from the worker thread only, so `&mut self` is enough.
/// Implementations must not call back into the worker; everything they
/// produce goes through the event channel.
pub trait VoiceSession: Send + 'static {
    /// Forward one chunk of user audio.
    fn send_audio(&mut self, chunk: PcmChunk) -> Result<()>;

    /// Forward a text turn.
    fn send_text(&mut self, text: &str) -> Result<()>;

    /// Close the session. No events may follow a successful return.
    fn close(&mut self) -> Result<()>;
}

/// Opens `VoiceSession`s on behalf of the worker.
pub trait VoiceSessionFactory: Send + Sync + 'static {
    /// # Errors
    /// `Session` if the backend cannot be reached or rejects `init`.
    fn connect(
        &self,
        init: &SessionInit,
        events: Sender<SessionEvent>,
    ) -> Result<Box<dyn VoiceSession>>;
}

/// Configuration for one isolated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SessionConfig {
    pub pipeline: PipelineConfig,
    /// Longest `IsolatedSession::shutdown` waits before force-terminating.
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Worker thread name; the pacer thread is `<name>-pacer`.
    pub worker_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            shutdown_timeout: Duration::from_secs(3),
            worker_name: "voicecast-session".into(),
        }
    }
}
