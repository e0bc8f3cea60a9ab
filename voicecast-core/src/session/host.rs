//! Host side of the isolation boundary.
//!
//! `IsolatedSession` owns the channel ends of one worker thread. It
//! mirrors the worker's lifecycle, rejects anything sent after `stop`, and
//! bounds shutdown: if the worker has not said `stopped` within the timeout
//! the thread is detached and its channels dropped.
//!
//! `HostDispatcher` turns the worker's outbound messages into calls on the
//! real transport and on a `SessionObserver`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::audio::PcmChunk;
use crate::buffering::frame::EncodedPacket;
use crate::error::{Result, VoicecastError};
use crate::ipc::{
    HostMessage, RealtimeAudio, SessionInit, SessionLifecycle, SessionStatusEvent,
    ToolCallResult, WorkerMessage,
};
use crate::pacer::{PacingClock, PacketSink};
use crate::session::{worker, SessionConfig, VoiceSessionFactory};

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// How `IsolatedSession::shutdown` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ShutdownOutcome {
    /// The worker drained and sent `stopped`.
    Graceful,
    /// The timeout elapsed; the worker was abandoned.
    ForceTerminated,
    /// The worker exited without `stopped` (crash or earlier shutdown).
    WorkerExited,
}

/// Handle to one voice session running on its own worker thread.
pub struct IsolatedSession {
    inbound: Option<Sender<HostMessage>>,
    outbound: Option<Receiver<WorkerMessage>>,
    thread: Option<JoinHandle<()>>,
    lifecycle: Mutex<SessionLifecycle>,
    /// `init` sent but `ready` not yet read.
    init_pending: AtomicBool,
    /// Input sent while `init_pending`; the worker is already active.
    input_before_ready: AtomicBool,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    shutdown_timeout: Duration,
}

impl IsolatedSession {
    /// Spawn a worker paced by the wall clock.
    pub fn spawn(config: SessionConfig, factory: Arc<dyn VoiceSessionFactory>) -> Result<Self> {
        let clock = PacingClock::realtime(config.pipeline.frame_duration());
        Self::spawn_with_clock(config, factory, clock)
    }

    /// Spawn a worker paced by `clock`.
    pub fn spawn_with_clock(
        config: SessionConfig,
        factory: Arc<dyn VoiceSessionFactory>,
        clock: PacingClock,
    ) -> Result<Self> {
        config.pipeline.validate()?;
        let shutdown_timeout = config.shutdown_timeout;
        let worker_name = config.worker_name.clone();
        let link = worker::spawn(config, factory, clock)?;
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        info!(worker = %worker_name, "isolated session spawned");
        Ok(Self {
            inbound: Some(link.inbound),
            outbound: Some(link.outbound),
            thread: Some(link.thread),
            lifecycle: Mutex::new(SessionLifecycle::Uninitialized),
            init_pending: AtomicBool::new(false),
            input_before_ready: AtomicBool::new(false),
            status_tx,
            shutdown_timeout,
        })
    }

    /// Send one control message.
    ///
    /// # Errors
    /// - `Protocol` once `stop` has been sent or the session is stopped.
    /// - `WorkerDisconnected` if the worker thread is gone.
    ///
    /// Other ordering violations (e.g. input before `init`) are answered by
    /// the worker with an `error` message.
    pub fn send(&self, msg: HostMessage) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_terminal() {
            return Err(VoicecastError::Protocol(format!(
                "`{}` rejected: session is {}",
                msg.kind(),
                lifecycle.as_str()
            )));
        }
        let Some(inbound) = &self.inbound else {
            return Err(VoicecastError::WorkerDisconnected);
        };

        let is_input = matches!(
            msg,
            HostMessage::SendRealtimeInput { .. } | HostMessage::SendTextInput { .. }
        );
        let next = match (&msg, *lifecycle) {
            (HostMessage::Stop, _) => Some(SessionLifecycle::Stopping),
            (_, SessionLifecycle::Ready) if is_input => Some(SessionLifecycle::Active),
            _ => None,
        };
        let init_uninitialized = matches!(
            (&msg, *lifecycle),
            (HostMessage::Init(_), SessionLifecycle::Uninitialized)
        );

        inbound
            .send(msg)
            .map_err(|_| VoicecastError::WorkerDisconnected)?;
        if init_uninitialized {
            self.init_pending.store(true, Ordering::SeqCst);
            self.input_before_ready.store(false, Ordering::SeqCst);
        } else if is_input && self.init_pending.load(Ordering::SeqCst) {
            self.input_before_ready.store(true, Ordering::SeqCst);
        }
        if let Some(next) = next {
            self.transition(&mut lifecycle, next, None);
        }
        Ok(())
    }

    pub fn init(&self, init: SessionInit) -> Result<()> {
        self.send(HostMessage::Init(init))
    }

    pub fn send_audio(&self, chunk: &PcmChunk) -> Result<()> {
        self.send(HostMessage::SendRealtimeInput {
            audio: RealtimeAudio::from_pcm(chunk),
        })
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(HostMessage::SendTextInput { text: text.into() })
    }

    pub fn interrupt(&self) -> Result<()> {
        self.send(HostMessage::Interrupt)
    }

    /// Send `stop` without waiting. See `shutdown` for the bounded wait.
    pub fn stop(&self) -> Result<()> {
        self.send(HostMessage::Stop)
    }

    /// Block until the next worker message.
    ///
    /// # Errors
    /// `WorkerDisconnected` once the worker has exited and every message
    /// has been read, or once the worker was force-terminated.
    pub fn recv(&self) -> Result<WorkerMessage> {
        let msg = self
            .outbound()?
            .recv()
            .map_err(|_| VoicecastError::WorkerDisconnected)?;
        self.observe(&msg);
        Ok(msg)
    }

    /// Like `recv`, giving up after `timeout` with `Ok(None)`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<WorkerMessage>> {
        match self.outbound()?.recv_timeout(timeout) {
            Ok(msg) => {
                self.observe(&msg);
                Ok(Some(msg))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(VoicecastError::WorkerDisconnected),
        }
    }

    /// Next message if one is waiting.
    pub fn try_next(&self) -> Option<WorkerMessage> {
        let msg = self.outbound.as_ref()?.try_recv().ok()?;
        self.observe(&msg);
        Some(msg)
    }

    fn outbound(&self) -> Result<&Receiver<WorkerMessage>> {
        self.outbound
            .as_ref()
            .ok_or(VoicecastError::WorkerDisconnected)
    }

    /// Subscribe to lifecycle changes.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn lifecycle(&self) -> SessionLifecycle {
        *self.lifecycle.lock()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Stop the session and wait at most `timeout` for `stopped`.
    ///
    /// Messages the worker emits while draining are passed to `on_message`
    /// in order; `stopped` itself is not. If `stopped` was already read
    /// through `recv`, the worker is joined and the outcome is `Graceful`.
    /// On timeout the worker thread is detached and its channels dropped, so
    /// it can never reach the host again.
    pub fn shutdown(
        &mut self,
        timeout: Duration,
        mut on_message: impl FnMut(WorkerMessage),
    ) -> ShutdownOutcome {
        if self.thread.is_none() {
            return ShutdownOutcome::WorkerExited;
        }
        if self.lifecycle() == SessionLifecycle::Stopped {
            self.join_worker();
            return ShutdownOutcome::Graceful;
        }
        if !self.lifecycle().is_terminal() {
            if let Err(e) = self.stop() {
                debug!("stop not delivered: {e}");
            }
        }

        let Some(outbound) = self.outbound.clone() else {
            return ShutdownOutcome::WorkerExited;
        };
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            match outbound.recv_deadline(deadline) {
                Ok(WorkerMessage::Stopped) => {
                    self.observe(&WorkerMessage::Stopped);
                    self.join_worker();
                    info!(elapsed_ms = started.elapsed().as_millis() as u64, "session shut down");
                    return ShutdownOutcome::Graceful;
                }
                Ok(msg) => {
                    self.observe(&msg);
                    on_message(msg);
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.force_terminate(timeout);
                    return ShutdownOutcome::ForceTerminated;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.join_worker();
                    let mut lifecycle = self.lifecycle.lock();
                    self.transition(
                        &mut lifecycle,
                        SessionLifecycle::Stopped,
                        Some("worker exited".into()),
                    );
                    warn!("worker exited without a stopped notification");
                    return ShutdownOutcome::WorkerExited;
                }
            }
        }
    }

    fn force_terminate(&mut self, timeout: Duration) {
        self.inbound = None;
        self.outbound = None;
        // Dropping the JoinHandle detaches the thread.
        self.thread = None;
        let mut lifecycle = self.lifecycle.lock();
        self.transition(
            &mut lifecycle,
            SessionLifecycle::Stopped,
            Some("force-terminated".into()),
        );
        warn!(
            timeout_ms = timeout.as_millis() as u64,
            "graceful shutdown timed out, worker force-terminated"
        );
    }

    fn join_worker(&mut self) {
        self.inbound = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("session worker thread panicked");
            }
        }
    }

    /// Update the mirrored lifecycle from what the worker reports.
    fn observe(&self, msg: &WorkerMessage) {
        let mut lifecycle = self.lifecycle.lock();
        match msg {
            WorkerMessage::Ready if *lifecycle == SessionLifecycle::Uninitialized => {
                self.init_pending.store(false, Ordering::SeqCst);
                self.transition(&mut lifecycle, SessionLifecycle::Ready, None);
                // The worker handled that input right after `init`.
                if self.input_before_ready.swap(false, Ordering::SeqCst) {
                    self.transition(&mut lifecycle, SessionLifecycle::Active, None);
                }
            }
            WorkerMessage::Stopped => {
                self.transition(&mut lifecycle, SessionLifecycle::Stopped, None);
            }
            WorkerMessage::Error { error } => {
                let _ = self.status_tx.send(SessionStatusEvent {
                    lifecycle: *lifecycle,
                    detail: Some(error.clone()),
                });
            }
            _ => {}
        }
    }

    fn transition(
        &self,
        lifecycle: &mut SessionLifecycle,
        next: SessionLifecycle,
        detail: Option<String>,
    ) {
        if *lifecycle == next {
            return;
        }
        debug!(from = lifecycle.as_str(), to = next.as_str(), "session lifecycle");
        *lifecycle = next;
        // No subscribers is fine.
        let _ = self.status_tx.send(SessionStatusEvent {
            lifecycle: next,
            detail,
        });
    }
}

impl Drop for IsolatedSession {
    fn drop(&mut self) {
        if self.thread.is_some() {
            // Disconnecting the inbound channel makes the worker tear down
            // on its own; the host never blocks here.
            debug!("isolated session dropped without shutdown, detaching worker");
            self.inbound = None;
            self.outbound = None;
            self.thread = None;
        }
    }
}

/// Receives the non-audio worker events. Every method defaults to a no-op.
pub trait SessionObserver: Send {
    fn on_ready(&mut self) {}
    fn on_interrupt(&mut self) {}
    fn on_tool_call(&mut self, _result: ToolCallResult) {}
    fn on_error(&mut self, _message: String) {}
    fn on_stopped(&mut self) {}
}

impl SessionObserver for () {}

/// Packet counts seen by a `HostDispatcher`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub packets_forwarded: u64,
    pub packets_dropped: u64,
    pub errors: u64,
}

/// Routes worker messages to the transport and an observer.
pub struct HostDispatcher {
    transport: Arc<dyn PacketSink>,
    observer: Box<dyn SessionObserver>,
    next_seq: u64,
    stats: DispatchStats,
}

impl HostDispatcher {
    pub fn new(transport: Arc<dyn PacketSink>, observer: Box<dyn SessionObserver>) -> Self {
        Self {
            transport,
            observer,
            next_seq: 0,
            stats: DispatchStats::default(),
        }
    }

    pub fn dispatch(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Ready => self.observer.on_ready(),
            WorkerMessage::AssistantOpusPacket { packet } => self.forward_packet(packet),
            WorkerMessage::AssistantStartSpeaking => self.transport.set_speaking(true),
            WorkerMessage::AssistantStopSpeaking => self.transport.set_speaking(false),
            WorkerMessage::AssistantInterruptSpeaking => {
                self.transport.set_speaking(false);
                self.observer.on_interrupt();
            }
            WorkerMessage::ToolCallCompleted(result) => self.observer.on_tool_call(result),
            WorkerMessage::Error { error } => {
                self.stats.errors += 1;
                self.observer.on_error(error);
            }
            WorkerMessage::Stopped => {
                self.transport.set_speaking(false);
                self.observer.on_stopped();
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    fn forward_packet(&mut self, data: Vec<u8>) {
        let seq = self.next_seq;
        self.next_seq += 1;

        if !self.transport.is_ready() {
            self.stats.packets_dropped += 1;
            warn!(seq, "voice connection not ready, dropping packet");
            return;
        }
        match self.transport.send_packet(EncodedPacket::new(seq, data)) {
            Ok(()) => self.stats.packets_forwarded += 1,
            Err(e) => {
                self.stats.packets_dropped += 1;
                error!(seq, "voice connection rejected packet: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Transport {
        ready: AtomicBool,
        packets: Mutex<Vec<(u64, Vec<u8>)>>,
        speaking: Mutex<Vec<bool>>,
    }

    impl PacketSink for Transport {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn send_packet(&self, packet: EncodedPacket) -> Result<()> {
            self.packets.lock().push((packet.seq, packet.data));
            Ok(())
        }

        fn set_speaking(&self, speaking: bool) {
            self.speaking.lock().push(speaking);
        }
    }

    #[derive(Default, Clone)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl SessionObserver for Log {
        fn on_ready(&mut self) {
            self.0.lock().push("ready".into());
        }
        fn on_interrupt(&mut self) {
            self.0.lock().push("interrupt".into());
        }
        fn on_tool_call(&mut self, result: ToolCallResult) {
            self.0.lock().push(format!("tool:{}", result.message_id));
        }
        fn on_error(&mut self, message: String) {
            self.0.lock().push(format!("error:{message}"));
        }
        fn on_stopped(&mut self) {
            self.0.lock().push("stopped".into());
        }
    }

    fn dispatcher() -> (HostDispatcher, Arc<Transport>, Log) {
        let transport = Arc::new(Transport::default());
        transport.ready.store(true, Ordering::SeqCst);
        let log = Log::default();
        let dispatcher = HostDispatcher::new(
            Arc::clone(&transport) as Arc<dyn PacketSink>,
            Box::new(log.clone()),
        );
        (dispatcher, transport, log)
    }

    #[test]
    fn packets_and_speaking_reach_transport() {
        let (mut d, transport, _) = dispatcher();
        d.dispatch(WorkerMessage::AssistantStartSpeaking);
        d.dispatch(WorkerMessage::AssistantOpusPacket { packet: vec![1] });
        d.dispatch(WorkerMessage::AssistantOpusPacket { packet: vec![2] });
        d.dispatch(WorkerMessage::AssistantStopSpeaking);

        assert_eq!(
            *transport.packets.lock(),
            vec![(0, vec![1]), (1, vec![2])]
        );
        assert_eq!(*transport.speaking.lock(), vec![true, false]);
        assert_eq!(d.stats().packets_forwarded, 2);
    }

    #[test]
    fn unready_transport_drops_packets() {
        let (mut d, transport, _) = dispatcher();
        transport.ready.store(false, Ordering::SeqCst);
        d.dispatch(WorkerMessage::AssistantOpusPacket { packet: vec![1] });
        transport.ready.store(true, Ordering::SeqCst);
        d.dispatch(WorkerMessage::AssistantOpusPacket { packet: vec![2] });

        assert_eq!(*transport.packets.lock(), vec![(1, vec![2])]);
        assert_eq!(
            d.stats(),
            DispatchStats {
                packets_forwarded: 1,
                packets_dropped: 1,
                errors: 0,
            }
        );
    }

    #[test]
    fn control_messages_reach_observer() {
        let (mut d, transport, log) = dispatcher();
        d.dispatch(WorkerMessage::Ready);
        d.dispatch(WorkerMessage::AssistantInterruptSpeaking);
        d.dispatch(WorkerMessage::ToolCallCompleted(ToolCallResult {
            session_id: "s".into(),
            message_id: "m1".into(),
            data: None,
            error: None,
            markdown: None,
        }));
        d.dispatch(WorkerMessage::error("bad"));
        d.dispatch(WorkerMessage::Stopped);

        assert_eq!(
            *log.0.lock(),
            vec!["ready", "interrupt", "tool:m1", "error:bad", "stopped"]
        );
        assert_eq!(*transport.speaking.lock(), vec![false, false]);
        assert_eq!(d.stats().errors, 1);
    }

    #[test]
    fn shutdown_outcome_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&ShutdownOutcome::ForceTerminated).unwrap(),
            r#""forceTerminated""#
        );
    }
}
