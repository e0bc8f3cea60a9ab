//! `EchoSession`: deterministic AI session without a model behind it.
//!
//! Every audio input is replayed as assistant audio, bracketed by
//! start/stop speaking events. Every text input is answered with a
//! tool-call completion carrying the text. Lets the whole worker and host
//! path run end-to-end with no network access.

use crossbeam_channel::Sender;
use tracing::debug;

use crate::audio::PcmChunk;
use crate::error::{Result, VoicecastError};
use crate::ipc::{SessionInit, ToolCallResult};
use crate::session::{SessionEvent, VoiceSession, VoiceSessionFactory};

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoSessionFactory;

impl EchoSessionFactory {
    pub fn new() -> Self {
        Self
    }
}

impl VoiceSessionFactory for EchoSessionFactory {
    fn connect(
        &self,
        init: &SessionInit,
        events: Sender<SessionEvent>,
    ) -> Result<Box<dyn VoiceSession>> {
        debug!(
            directory = %init.directory.display(),
            has_system_message = init.system_message.is_some(),
            "echo session connected"
        );
        Ok(Box::new(EchoSession::new(
            format!("echo-{}-{}", init.guild_id, init.channel_id),
            events,
        )))
    }
}

pub struct EchoSession {
    session_id: String,
    events: Sender<SessionEvent>,
    turns: u32,
    closed: bool,
}

impl EchoSession {
    pub fn new(session_id: String, events: Sender<SessionEvent>) -> Self {
        Self {
            session_id,
            events,
            turns: 0,
            closed: false,
        }
    }

    fn emit(&self, event: SessionEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| VoicecastError::Session("event channel closed".into()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(VoicecastError::Session("echo session is closed".into()));
        }
        Ok(())
    }
}

impl VoiceSession for EchoSession {
    fn send_audio(&mut self, chunk: PcmChunk) -> Result<()> {
        self.ensure_open()?;
        if chunk.is_empty() {
            return Ok(());
        }
        self.emit(SessionEvent::StartSpeaking)?;
        self.emit(SessionEvent::Audio(chunk))?;
        self.emit(SessionEvent::StopSpeaking)
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        self.ensure_open()?;
        self.turns += 1;
        self.emit(SessionEvent::ToolCallCompleted(ToolCallResult {
            session_id: self.session_id.clone(),
            message_id: format!("msg-{}", self.turns),
            data: Some(serde_json::json!({ "text": text })),
            error: None,
            markdown: Some(format!("echo: {text}")),
        }))
    }

    fn close(&mut self) -> Result<()> {
        debug!(session = %self.session_id, turns = self.turns, "echo session closed");
        self.closed = true;
        Ok(())
    }
}
