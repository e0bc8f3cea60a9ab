//! # voicecast-core
//!
//! Real-time voice output pipeline for AI voice sessions.
//!
//! ## Architecture
//!
//! ```text
//! AI session PCM → StreamResampler → FrameAccumulator → FrameEncoder
//!                                                            │
//!                                                   PacketPacer queue
//!                                                            │ one packet / 20 ms
//!                                                       PacketSink
//! ```
//!
//! `StreamController` owns one such pipeline. `IsolatedSession` runs the AI
//! session and its controller on a worker thread and exchanges typed
//! `HostMessage` / `WorkerMessage` values with the host.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod codec;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod pacer;
pub mod session;

// Convenience re-exports for downstream crates
pub use audio::{AudioFormat, PcmChunk};
pub use buffering::frame::{EncodedPacket, Frame};
pub use codec::{create_encoder, EncoderKind, FrameEncoder};
pub use engine::{pipeline::DiagnosticsSnapshot, PipelineConfig, StreamController};
pub use error::{Result, VoicecastError};
pub use ipc::{HostMessage, SessionInit, SessionLifecycle, SessionStatusEvent, WorkerMessage};
pub use pacer::{ManualClock, PacingClock, PacketSink};
pub use session::{
    EchoSessionFactory, HostDispatcher, IsolatedSession, SessionConfig, SessionEvent,
    SessionObserver, ShutdownOutcome, VoiceSession, VoiceSessionFactory,
};
