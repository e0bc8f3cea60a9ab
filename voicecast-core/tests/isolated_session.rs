use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use voicecast_core::audio::AudioFormat;
use voicecast_core::ipc::ToolCallResult;
use voicecast_core::{
    EchoSessionFactory, EncoderKind, IsolatedSession, ManualClock, PacingClock, PcmChunk,
    PipelineConfig, SessionConfig, SessionEvent, SessionInit, SessionLifecycle, ShutdownOutcome,
    VoiceSession, VoiceSessionFactory, VoicecastError, WorkerMessage,
};

const STEREO_48K: AudioFormat = AudioFormat::new(48_000, 2);

/// Text inputs are commands: `panic`, `interrupt`, `fail`; anything else is
/// acknowledged with a tool call. `close` blocks until `release` fires when
/// `block_close` is set.
struct ScriptedSession {
    events: Sender<SessionEvent>,
    release: Receiver<()>,
    block_close: bool,
}

impl VoiceSession for ScriptedSession {
    fn send_audio(&mut self, chunk: PcmChunk) -> voicecast_core::Result<()> {
        let _ = self.events.send(SessionEvent::Audio(chunk));
        Ok(())
    }

    fn send_text(&mut self, text: &str) -> voicecast_core::Result<()> {
        match text {
            "panic" => panic!("scripted panic"),
            "interrupt" => {
                let _ = self.events.send(SessionEvent::InterruptSpeaking);
            }
            "fail" => {
                let _ = self.events.send(SessionEvent::Error("scripted failure".into()));
            }
            other => {
                let _ = self.events.send(SessionEvent::ToolCallCompleted(ToolCallResult {
                    session_id: "scripted".into(),
                    message_id: other.into(),
                    data: None,
                    error: None,
                    markdown: None,
                }));
            }
        }
        Ok(())
    }

    fn close(&mut self) -> voicecast_core::Result<()> {
        if self.block_close {
            let _ = self.release.recv();
        }
        Ok(())
    }
}

struct ScriptedFactory {
    release: Receiver<()>,
    block_close: bool,
    refuse: bool,
}

impl VoiceSessionFactory for ScriptedFactory {
    fn connect(
        &self,
        _init: &SessionInit,
        events: Sender<SessionEvent>,
    ) -> voicecast_core::Result<Box<dyn VoiceSession>> {
        if self.refuse {
            return Err(VoicecastError::Session("backend refused connection".into()));
        }
        Ok(Box::new(ScriptedSession {
            events,
            release: self.release.clone(),
            block_close: self.block_close,
        }))
    }
}

fn scripted(block_close: bool, refuse: bool) -> (Arc<dyn VoiceSessionFactory>, Sender<()>) {
    let (release_tx, release_rx) = crossbeam_channel::bounded(1);
    let factory = ScriptedFactory {
        release: release_rx,
        block_close,
        refuse,
    };
    (Arc::new(factory), release_tx)
}

fn config() -> SessionConfig {
    SessionConfig {
        pipeline: PipelineConfig {
            input: STEREO_48K,
            encoder: EncoderKind::Passthrough,
            drain_timeout: Duration::from_millis(200),
            ..PipelineConfig::default()
        },
        shutdown_timeout: Duration::from_secs(2),
        worker_name: "test-session".into(),
    }
}

fn init_msg() -> SessionInit {
    SessionInit {
        directory: PathBuf::from("/tmp"),
        system_message: Some("test".into()),
        guild_id: "guild".into(),
        channel_id: "channel".into(),
    }
}

fn spawn(factory: Arc<dyn VoiceSessionFactory>) -> (IsolatedSession, ManualClock) {
    let (clock, source) = PacingClock::manual();
    let session = IsolatedSession::spawn_with_clock(config(), factory, source).expect("spawn");
    (session, clock)
}

fn next(session: &IsolatedSession) -> WorkerMessage {
    session
        .recv_timeout(Duration::from_secs(2))
        .expect("worker alive")
        .expect("timed out waiting for worker message")
}

fn stereo_frames(n: usize) -> PcmChunk {
    PcmChunk::from_samples(&vec![250; 1920 * n], STEREO_48K)
}

fn is_packet(msg: &WorkerMessage) -> bool {
    matches!(msg, WorkerMessage::AssistantOpusPacket { .. })
}

#[test]
fn interrupt_before_first_tick_emits_no_packets() {
    let (mut session, clock) = spawn(Arc::new(EchoSessionFactory::new()));
    session.init(init_msg()).unwrap();
    assert_eq!(next(&session), WorkerMessage::Ready);
    assert_eq!(session.lifecycle(), SessionLifecycle::Ready);

    session.send_audio(&stereo_frames(5)).unwrap();
    assert_eq!(session.lifecycle(), SessionLifecycle::Active);
    session.interrupt().unwrap();
    assert_eq!(next(&session), WorkerMessage::AssistantInterruptSpeaking);
    assert_eq!(session.lifecycle(), SessionLifecycle::Active);

    clock.advance(10);
    let mut drained = Vec::new();
    let outcome = session.shutdown(Duration::from_secs(2), |msg| drained.push(msg));
    assert_eq!(outcome, ShutdownOutcome::Graceful);
    assert!(!drained.iter().any(is_packet), "{drained:?}");
    assert_eq!(session.lifecycle(), SessionLifecycle::Stopped);
}

#[test]
fn audio_is_paced_and_stopped_comes_last() {
    let (mut session, clock) = spawn(Arc::new(EchoSessionFactory::new()));
    let mut status = session.subscribe_status();

    session.init(init_msg()).unwrap();
    assert_eq!(next(&session), WorkerMessage::Ready);
    session.send_audio(&stereo_frames(3)).unwrap();

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while seen.iter().filter(|m| is_packet(m)).count() < 3 {
        assert!(Instant::now() < deadline, "packets never arrived: {seen:?}");
        clock.tick();
        if let Some(msg) = session.recv_timeout(Duration::from_millis(10)).unwrap() {
            seen.push(msg);
        }
    }
    let first_packet = seen.iter().position(is_packet).unwrap();
    assert!(seen[..first_packet].contains(&WorkerMessage::AssistantStartSpeaking));
    assert_eq!(
        seen.iter().find(|m| is_packet(m)),
        Some(&WorkerMessage::AssistantOpusPacket {
            packet: stereo_frames(1).data
        })
    );

    let mut drained = Vec::new();
    let outcome = session.shutdown(Duration::from_secs(2), |msg| drained.push(msg));
    assert_eq!(outcome, ShutdownOutcome::Graceful);
    assert!(!drained.iter().any(is_packet));
    assert!(session.try_next().is_none());

    let lifecycles: Vec<SessionLifecycle> = std::iter::from_fn(|| status.try_recv().ok())
        .map(|event| event.lifecycle)
        .collect();
    assert_eq!(
        lifecycles,
        vec![
            SessionLifecycle::Ready,
            SessionLifecycle::Active,
            SessionLifecycle::Stopping,
            SessionLifecycle::Stopped,
        ]
    );
}

#[test]
fn messages_after_stop_are_rejected() {
    let (mut session, _clock) = spawn(Arc::new(EchoSessionFactory::new()));
    session.init(init_msg()).unwrap();
    assert_eq!(next(&session), WorkerMessage::Ready);

    session.stop().unwrap();
    assert_eq!(session.lifecycle(), SessionLifecycle::Stopping);
    assert!(matches!(
        session.send_text("too late"),
        Err(VoicecastError::Protocol(_))
    ));
    assert!(matches!(session.stop(), Err(VoicecastError::Protocol(_))));

    assert_eq!(next(&session), WorkerMessage::Stopped);
    assert_eq!(session.lifecycle(), SessionLifecycle::Stopped);
    assert!(matches!(
        session.interrupt(),
        Err(VoicecastError::Protocol(_))
    ));
    assert_eq!(
        session.shutdown(Duration::from_secs(1), |_| {}),
        ShutdownOutcome::Graceful
    );
}

#[test]
fn input_sent_before_ready_is_read_leaves_session_active() {
    let (mut session, _clock) = spawn(Arc::new(EchoSessionFactory::new()));
    let mut status = session.subscribe_status();
    session.init(init_msg()).unwrap();
    session.send_audio(&stereo_frames(1)).unwrap();
    assert_eq!(session.lifecycle(), SessionLifecycle::Uninitialized);

    assert_eq!(next(&session), WorkerMessage::Ready);
    assert_eq!(session.lifecycle(), SessionLifecycle::Active);

    let lifecycles: Vec<SessionLifecycle> = std::iter::from_fn(|| status.try_recv().ok())
        .map(|event| event.lifecycle)
        .collect();
    assert_eq!(
        lifecycles,
        vec![SessionLifecycle::Ready, SessionLifecycle::Active]
    );
    session.shutdown(Duration::from_secs(1), |_| {});
}

#[test]
fn input_before_init_is_answered_with_error() {
    let (mut session, _clock) = spawn(Arc::new(EchoSessionFactory::new()));
    session.send_text("hello?").unwrap();
    match next(&session) {
        WorkerMessage::Error { error } => assert!(error.contains("not initialised"), "{error}"),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(session.lifecycle(), SessionLifecycle::Uninitialized);
    assert_eq!(
        session.shutdown(Duration::from_secs(1), |_| {}),
        ShutdownOutcome::Graceful
    );
}

#[test]
fn text_input_completes_tool_call() {
    let (mut session, _clock) = spawn(Arc::new(EchoSessionFactory::new()));
    session.init(init_msg()).unwrap();
    assert_eq!(next(&session), WorkerMessage::Ready);
    session.send_text("list files").unwrap();

    match next(&session) {
        WorkerMessage::ToolCallCompleted(result) => {
            assert_eq!(result.session_id, "echo-guild-channel");
            assert_eq!(result.markdown.as_deref(), Some("echo: list files"));
        }
        other => panic!("expected tool call, got {other:?}"),
    }
    session.shutdown(Duration::from_secs(1), |_| {});
}

#[test]
fn session_interrupt_and_errors_are_forwarded() {
    let (factory, _release) = scripted(false, false);
    let (mut session, _clock) = spawn(factory);
    session.init(init_msg()).unwrap();
    assert_eq!(next(&session), WorkerMessage::Ready);

    session.send_text("interrupt").unwrap();
    assert_eq!(next(&session), WorkerMessage::AssistantInterruptSpeaking);
    session.send_text("fail").unwrap();
    assert_eq!(next(&session), WorkerMessage::error("scripted failure"));
    assert_eq!(
        session.shutdown(Duration::from_secs(1), |_| {}),
        ShutdownOutcome::Graceful
    );
}

#[test]
fn failed_connect_leaves_session_uninitialised() {
    let (factory, _release) = scripted(false, true);
    let (mut session, _clock) = spawn(factory);
    session.init(init_msg()).unwrap();
    match next(&session) {
        WorkerMessage::Error { error } => assert!(error.contains("refused"), "{error}"),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(session.lifecycle(), SessionLifecycle::Uninitialized);
    session.shutdown(Duration::from_secs(1), |_| {});
}

#[test]
fn stuck_close_is_force_terminated_within_timeout() {
    let (factory, release) = scripted(true, false);
    let (mut session, clock) = spawn(factory);
    let mut status = session.subscribe_status();
    session.init(init_msg()).unwrap();
    assert_eq!(next(&session), WorkerMessage::Ready);
    // Queued but never ticked out before the shutdown.
    session.send_audio(&stereo_frames(5)).unwrap();

    let start = Instant::now();
    let outcome = session.shutdown(Duration::from_millis(100), |_| {});
    assert_eq!(outcome, ShutdownOutcome::ForceTerminated);
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(session.lifecycle(), SessionLifecycle::Stopped);
    assert!(matches!(
        session.send_text("anyone?"),
        Err(VoicecastError::Protocol(_))
    ));

    let last = std::iter::from_fn(|| status.try_recv().ok()).last().unwrap();
    assert_eq!(last.lifecycle, SessionLifecycle::Stopped);
    assert_eq!(last.detail.as_deref(), Some("force-terminated"));

    // The abandoned pacer keeps ticking; none of it reaches the host.
    clock.advance(5);
    std::thread::sleep(Duration::from_millis(50));
    assert!(session.try_next().is_none());
    assert!(matches!(
        session.recv_timeout(Duration::from_millis(50)),
        Err(VoicecastError::WorkerDisconnected)
    ));
    assert!(matches!(
        session.recv(),
        Err(VoicecastError::WorkerDisconnected)
    ));

    // Let the abandoned worker finish.
    let _ = release.send(());
}

#[test]
fn worker_panic_is_reported_then_disconnects() {
    let (factory, _release) = scripted(false, false);
    let (mut session, _clock) = spawn(factory);
    session.init(init_msg()).unwrap();
    assert_eq!(next(&session), WorkerMessage::Ready);

    session.send_text("panic").unwrap();
    match next(&session) {
        WorkerMessage::Error { error } => assert!(error.contains("scripted panic"), "{error}"),
        other => panic!("expected panic report, got {other:?}"),
    }
    assert!(matches!(
        session.recv_timeout(Duration::from_secs(2)),
        Err(VoicecastError::WorkerDisconnected)
    ));
    assert_eq!(
        session.shutdown(Duration::from_secs(1), |_| {}),
        ShutdownOutcome::WorkerExited
    );
}
