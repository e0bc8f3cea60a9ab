use thiserror::Error;

/// All errors produced by voicecast-core.
#[derive(Debug, Error)]
pub enum VoicecastError {
    #[error("resampler error: {0}")]
    Resample(String),

    #[error("encoder initialisation failed: {0}")]
    EncoderInit(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("encoder `{0}` unavailable: crate built without the matching feature")]
    EncoderUnavailable(&'static str),

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("chunk format {got} does not match pipeline input {expected}")]
    FormatMismatch { expected: String, got: String },

    #[error("stream controller is stopped, write rejected")]
    Stopped,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("voice session is not initialised")]
    NotInitialized,

    #[error("voice session error: {0}")]
    Session(String),

    #[error("invalid realtime input: {0}")]
    InvalidInput(String),

    #[error("worker failed to start: {0}")]
    WorkerSpawn(String),

    #[error("worker disconnected")]
    WorkerDisconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoicecastError>;
