//! Typed messages crossing the isolation boundary.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize`; the JSON shape
//! is the wire contract for hosts living in another process.

pub mod messages;

pub use messages::{
    HostMessage, RealtimeAudio, SessionInit, SessionLifecycle, SessionStatusEvent, ToolCallResult,
    WorkerMessage,
};
