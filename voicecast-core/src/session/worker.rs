//! Worker side of the isolation boundary.
//!
//! One OS thread owns the AI session and the `StreamController`. It reacts
//! to exactly two inputs, host messages and AI session events, and talks
//! back only through the outbound channel. Nothing else is shared with the
//! host.
//!
//! ## Stop sequence
//!
//! ```text
//! stop ─► close AI session ─► StreamController::stop (drain, bounded)
//!      ─► reject leftover inbound messages ─► `stopped` ─► thread exits
//! ```
//!
//! The pacer thread is joined inside `StreamController::stop`, so no
//! `assistantOpusPacket` can follow `stopped`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, field, info, info_span, warn, Span};

use crate::buffering::frame::EncodedPacket;
use crate::engine::StreamController;
use crate::error::{Result, VoicecastError};
use crate::ipc::{HostMessage, SessionInit, SessionLifecycle, WorkerMessage};
use crate::pacer::{PacingClock, PacketSink};
use crate::session::{SessionConfig, SessionEvent, VoiceSession, VoiceSessionFactory};

/// Channel ends the host keeps.
pub(crate) struct WorkerLink {
    pub inbound: Sender<HostMessage>,
    pub outbound: Receiver<WorkerMessage>,
    pub thread: JoinHandle<()>,
}

/// Start a worker thread.
pub(crate) fn spawn(
    config: SessionConfig,
    factory: Arc<dyn VoiceSessionFactory>,
    clock: PacingClock,
) -> Result<WorkerLink> {
    let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
    let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
    let name = config.worker_name.clone();

    let thread = std::thread::Builder::new()
        .name(name)
        .spawn(move || run(config, factory, clock, inbound_rx, outbound_tx))
        .map_err(|e| VoicecastError::WorkerSpawn(format!("session worker: {e}")))?;

    Ok(WorkerLink {
        inbound: inbound_tx,
        outbound: outbound_rx,
        thread,
    })
}

fn run(
    config: SessionConfig,
    factory: Arc<dyn VoiceSessionFactory>,
    clock: PacingClock,
    inbound: Receiver<HostMessage>,
    outbound: Sender<WorkerMessage>,
) {
    let span = info_span!(
        "voice_session",
        worker = %config.worker_name,
        guild = field::Empty,
        channel = field::Empty
    );
    let _entered = span.enter();

    let panic_tx = outbound.clone();
    let result = panic::catch_unwind(AssertUnwindSafe(move || {
        Worker::new(config, factory, clock, inbound, outbound).run();
    }));

    if let Err(payload) = result {
        let message = panic_message(payload.as_ref());
        error!("session worker panicked: {message}");
        let _ = panic_tx.send(WorkerMessage::error(format!(
            "session worker panicked: {message}"
        )));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Worker {
    config: SessionConfig,
    factory: Arc<dyn VoiceSessionFactory>,
    clock: Option<PacingClock>,
    inbound: Receiver<HostMessage>,
    outbound: Sender<WorkerMessage>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    lifecycle: SessionLifecycle,
    session: Option<Box<dyn VoiceSession>>,
    controller: Option<StreamController>,
    backpressured: bool,
}

impl Worker {
    fn new(
        config: SessionConfig,
        factory: Arc<dyn VoiceSessionFactory>,
        clock: PacingClock,
        inbound: Receiver<HostMessage>,
        outbound: Sender<WorkerMessage>,
    ) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            factory,
            clock: Some(clock),
            inbound,
            outbound,
            events_tx,
            events_rx,
            lifecycle: SessionLifecycle::Uninitialized,
            session: None,
            controller: None,
            backpressured: false,
        }
    }

    fn run(mut self) {
        info!("session worker started");
        let inbound = self.inbound.clone();
        let events = self.events_rx.clone();

        loop {
            // Events a backend emitted synchronously from the previous
            // message are handled before the next message.
            self.drain_session_events();

            crossbeam_channel::select! {
                recv(inbound) -> msg => match msg {
                    Ok(msg) => {
                        if self.handle_message(msg) == Flow::Stop {
                            break;
                        }
                    }
                    Err(_) => {
                        warn!("host disconnected, tearing down session");
                        self.teardown();
                        return;
                    }
                },
                recv(events) -> event => {
                    if let Ok(event) = event {
                        self.handle_event(event);
                    }
                }
            }
        }

        self.shutdown();
    }

    fn handle_message(&mut self, msg: HostMessage) -> Flow {
        let next = match self.lifecycle.on_message(&msg) {
            Ok(next) => next,
            Err(e) => {
                warn!(
                    message = msg.kind(),
                    lifecycle = self.lifecycle.as_str(),
                    "message rejected: {e}"
                );
                self.emit(WorkerMessage::error(e.to_string()));
                return Flow::Continue;
            }
        };

        match msg {
            HostMessage::Init(init) => match self.initialise(&init) {
                Ok(()) => {
                    self.set_lifecycle(next);
                    self.emit(WorkerMessage::Ready);
                }
                Err(e) => {
                    error!("session init failed: {e}");
                    self.emit(WorkerMessage::error(e.to_string()));
                }
            },
            HostMessage::SendRealtimeInput { audio } => {
                self.set_lifecycle(next);
                let result = audio
                    .decode()
                    .and_then(|chunk| self.session_mut()?.send_audio(chunk));
                self.report(result);
            }
            HostMessage::SendTextInput { text } => {
                self.set_lifecycle(next);
                let result = self.session_mut().and_then(|s| s.send_text(&text));
                self.report(result);
            }
            HostMessage::Interrupt => self.interrupt_playback("host"),
            HostMessage::Stop => {
                self.set_lifecycle(next);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Audio(chunk) => {
                let Some(controller) = &self.controller else {
                    debug!("assistant audio without a pipeline dropped");
                    return;
                };
                let result = controller.write(chunk);
                let backpressured = controller.is_backpressured();
                if backpressured && !self.backpressured {
                    info!(
                        buffered_ms = controller.buffered_audio().as_millis() as u64,
                        queued = controller.queued_packets(),
                        "playback queue above backpressure threshold"
                    );
                }
                self.backpressured = backpressured;
                self.report(result);
            }
            SessionEvent::StartSpeaking => debug!("AI session started speaking"),
            SessionEvent::StopSpeaking => debug!("AI session stopped speaking"),
            SessionEvent::InterruptSpeaking => self.interrupt_playback("session"),
            SessionEvent::ToolCallCompleted(result) => {
                debug!(message_id = %result.message_id, "tool call completed");
                self.emit(WorkerMessage::ToolCallCompleted(result));
            }
            SessionEvent::Error(message) => {
                warn!("AI session error: {message}");
                self.emit(WorkerMessage::error(message));
            }
        }
    }

    fn initialise(&mut self, init: &SessionInit) -> Result<()> {
        let span = Span::current();
        span.record("guild", init.guild_id.as_str());
        span.record("channel", init.channel_id.as_str());

        let mut session = self.factory.connect(init, self.events_tx.clone())?;
        let clock = self
            .clock
            .take()
            .unwrap_or_else(|| PacingClock::realtime(self.config.pipeline.frame_duration()));
        let sink = Arc::new(OutboundSink::new(self.outbound.clone()));

        match StreamController::new(self.config.pipeline.clone(), sink, clock) {
            Ok(controller) => {
                self.session = Some(session);
                self.controller = Some(controller);
                info!(directory = %init.directory.display(), "voice session initialised");
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = session.close() {
                    warn!("closing AI session after failed init: {close_err}");
                }
                Err(e)
            }
        }
    }

    fn interrupt_playback(&mut self, source: &'static str) {
        if let Some(controller) = &self.controller {
            let discarded = controller.interrupt();
            debug!(source, discarded, "playback interrupted");
        }
        self.backpressured = false;
        self.emit(WorkerMessage::AssistantInterruptSpeaking);
    }

    fn shutdown(mut self) {
        info!("stopping voice session");
        self.close_session();

        let late = self.events_rx.try_iter().count();
        if late > 0 {
            debug!(late, "discarded AI session events received after stop");
        }

        if let Some(controller) = self.controller.take() {
            let result = controller.stop();
            self.report(result);
        }

        // Anything the host sent after `stop` gets an answer, never silence.
        for msg in self.inbound.try_iter() {
            if let Err(e) = self.lifecycle.on_message(&msg) {
                self.emit(WorkerMessage::error(e.to_string()));
            }
        }

        self.set_lifecycle(SessionLifecycle::Stopped);
        self.emit(WorkerMessage::Stopped);
        info!("voice session stopped");
    }

    /// Host vanished: release everything, nobody is listening.
    fn teardown(&mut self) {
        self.close_session();
        if let Some(controller) = self.controller.take() {
            if let Err(e) = controller.stop() {
                debug!("flush during teardown failed: {e}");
            }
        }
        self.set_lifecycle(SessionLifecycle::Stopped);
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close() {
                warn!("closing AI session failed: {e}");
            }
        }
    }

    fn session_mut(&mut self) -> Result<&mut Box<dyn VoiceSession>> {
        self.session.as_mut().ok_or(VoicecastError::NotInitialized)
    }

    fn set_lifecycle(&mut self, next: SessionLifecycle) {
        if next != self.lifecycle {
            debug!(from = self.lifecycle.as_str(), to = next.as_str(), "lifecycle");
            self.lifecycle = next;
        }
    }

    fn report(&self, result: Result<()>) {
        if let Err(e) = result {
            error!("pipeline error: {e}");
            self.emit(WorkerMessage::error(e.to_string()));
        }
    }

    fn emit(&self, msg: WorkerMessage) {
        if self.outbound.send(msg).is_err() {
            debug!("host receiver gone, outbound message dropped");
        }
    }

    fn drain_session_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
    }
}

/// `PacketSink` that forwards to the host as outbound messages.
///
/// Ready while the host still listens.
struct OutboundSink {
    tx: Sender<WorkerMessage>,
    connected: AtomicBool,
}

impl OutboundSink {
    fn new(tx: Sender<WorkerMessage>) -> Self {
        Self {
            tx,
            connected: AtomicBool::new(true),
        }
    }

    fn forward(&self, msg: WorkerMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| {
            self.connected.store(false, Ordering::Relaxed);
            VoicecastError::WorkerDisconnected
        })
    }
}

impl PacketSink for OutboundSink {
    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn send_packet(&self, packet: EncodedPacket) -> Result<()> {
        self.forward(WorkerMessage::AssistantOpusPacket {
            packet: packet.data,
        })
    }

    fn set_speaking(&self, speaking: bool) {
        let msg = if speaking {
            WorkerMessage::AssistantStartSpeaking
        } else {
            WorkerMessage::AssistantStopSpeaking
        };
        let _ = self.forward(msg);
    }
}
