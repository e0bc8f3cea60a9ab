//! `voicecast` streams a WAV file through an isolated voice session.
//!
//! The WAV plays the part of the user's microphone: it is sent to the
//! session as `sendRealtimeInput` chunks at wall-clock speed. The stub AI
//! session echoes it back, the worker encodes and paces the reply, and the
//! packets land in a length-prefixed packet file.

mod settings;
mod transport;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use voicecast_core::audio::AudioFormat;
use voicecast_core::ipc::ToolCallResult;
use voicecast_core::session::host::DispatchStats;
use voicecast_core::{
    EchoSessionFactory, HostDispatcher, IsolatedSession, PacketSink, PcmChunk, SessionInit,
    SessionObserver, ShutdownOutcome, WorkerMessage,
};

use settings::{default_settings_path, load_settings, HostSettings};
use transport::PacketFileSink;

/// How long `init` may take before the run is abandoned.
const READY_TIMEOUT: Duration = Duration::from_secs(5);
/// Playback is considered finished after this long without a packet.
const QUIET_PERIOD: Duration = Duration::from_millis(250);
const POLL: Duration = Duration::from_millis(10);

struct Args {
    input: PathBuf,
    output: Option<PathBuf>,
    settings: Option<PathBuf>,
    chunk_ms: Option<u32>,
}

fn parse_args() -> Result<Args, String> {
    let mut input: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut settings: Option<PathBuf> = None;
    let mut chunk_ms: Option<u32> = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--input" | "-i" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --input".into());
                };
                input = Some(PathBuf::from(v));
            }
            "--output" | "-o" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --output".into());
                };
                output = Some(PathBuf::from(v));
            }
            "--settings" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --settings".into());
                };
                settings = Some(PathBuf::from(v));
            }
            "--chunk-ms" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --chunk-ms".into());
                };
                chunk_ms = Some(
                    v.parse::<u32>()
                        .map_err(|_| "invalid value for --chunk-ms".to_string())?,
                );
            }
            "--help" | "-h" => {
                println!(
                    "Usage: voicecast --input <file.wav> [--output <packets.bin>] \\
  [--settings <settings.json>] [--chunk-ms <n>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    let input = input.ok_or_else(|| "--input <file.wav> is required".to_string())?;
    Ok(Args {
        input,
        output,
        settings,
        chunk_ms,
    })
}

/// Counts what the session reported besides audio.
#[derive(Default)]
struct RunLog {
    tool_calls: Vec<ToolCallResult>,
    errors: Vec<String>,
    interrupts: usize,
}

#[derive(Clone, Default)]
struct LogObserver(Arc<Mutex<RunLog>>);

impl SessionObserver for LogObserver {
    fn on_ready(&mut self) {
        info!("voice session ready");
    }

    fn on_interrupt(&mut self) {
        self.0.lock().interrupts += 1;
    }

    fn on_tool_call(&mut self, result: ToolCallResult) {
        info!(message_id = %result.message_id, "tool call completed");
        self.0.lock().tool_calls.push(result);
    }

    fn on_error(&mut self, message: String) {
        warn!("session error: {message}");
        self.0.lock().errors.push(message);
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunSummary {
    input: String,
    input_format: AudioFormat,
    output: Option<String>,
    encoder: String,
    chunks_sent: usize,
    audio_ms: u64,
    packets_written: u64,
    bytes_written: u64,
    dispatch: DispatchStats,
    tool_calls: usize,
    interrupts: usize,
    errors: Vec<String>,
    cancelled: bool,
    shutdown: ShutdownOutcome,
    elapsed_ms: u64,
}

/// Routes worker messages and remembers when the last packet arrived.
struct Pump {
    dispatcher: HostDispatcher,
    ready: bool,
    last_packet: Instant,
}

impl Pump {
    fn handle(&mut self, msg: WorkerMessage) {
        match &msg {
            WorkerMessage::Ready => self.ready = true,
            WorkerMessage::AssistantOpusPacket { .. } => self.last_packet = Instant::now(),
            _ => {}
        }
        self.dispatcher.dispatch(msg);
    }

    /// Dispatch everything that arrives before `deadline`.
    fn until(
        &mut self,
        session: &IsolatedSession,
        deadline: Instant,
        cancel: &AtomicBool,
    ) -> anyhow::Result<()> {
        loop {
            let now = Instant::now();
            if now >= deadline || cancel.load(Ordering::Relaxed) {
                return Ok(());
            }
            if let Some(msg) = session.recv_timeout((deadline - now).min(POLL))? {
                self.handle(msg);
            }
        }
    }
}

fn read_wav(path: &Path) -> anyhow::Result<(AudioFormat, Vec<i16>)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        bail!(
            "{} must be 16-bit integer PCM (got {} bit {:?})",
            path.display(),
            spec.bits_per_sample,
            spec.sample_format
        );
    }
    let format = AudioFormat::new(spec.sample_rate, spec.channels);
    format.validate()?;
    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading samples from {}", path.display()))?;
    Ok((format, samples))
}

/// Blocking session driver; runs on a tokio blocking thread.
fn drive(
    args: Args,
    settings: HostSettings,
    (format, samples): (AudioFormat, Vec<i16>),
    mut session: IsolatedSession,
    cancel: Arc<AtomicBool>,
) -> anyhow::Result<RunSummary> {
    let started = Instant::now();
    let config = settings.session_config(format);

    let writer: Box<dyn Write + Send> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(io::sink()),
    };
    let transport = Arc::new(PacketFileSink::new(writer));
    let log = LogObserver::default();
    let mut pump = Pump {
        dispatcher: HostDispatcher::new(
            Arc::clone(&transport) as Arc<dyn PacketSink>,
            Box::new(log.clone()),
        ),
        ready: false,
        last_packet: Instant::now(),
    };

    session.init(SessionInit {
        directory: settings
            .working_directory
            .clone()
            .map_or_else(std::env::current_dir, Ok)?,
        system_message: settings.system_message.clone(),
        guild_id: settings.guild_id.clone(),
        channel_id: settings.channel_id.clone(),
    })?;

    let ready_deadline = Instant::now() + READY_TIMEOUT;
    while !pump.ready {
        if Instant::now() >= ready_deadline || cancel.load(Ordering::Relaxed) {
            let last_error = log.0.lock().errors.last().cloned();
            session.shutdown(Duration::ZERO, |_| {});
            return Err(anyhow!(
                "voice session never became ready{}",
                last_error.map(|e| format!(": {e}")).unwrap_or_default()
            ));
        }
        pump.until(&session, Instant::now() + POLL, &cancel)?;
    }

    // Feed the file at wall-clock speed, like a live microphone.
    let chunk_ms = args.chunk_ms.unwrap_or(settings.chunk_ms).clamp(10, 1_000);
    let samples_per_chunk = format.frames_for_ms(chunk_ms) * format.channels as usize;
    let chunk_period = Duration::from_millis(chunk_ms as u64);
    let mut chunks_sent = 0;
    let mut next_send = Instant::now();
    for chunk in samples.chunks(samples_per_chunk) {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        pump.until(&session, next_send, &cancel)?;
        session.send_audio(&PcmChunk::from_samples(chunk, format))?;
        chunks_sent += 1;
        next_send += chunk_period;
    }

    // Let the paced reply play out.
    pump.last_packet = pump.last_packet.max(Instant::now());
    while !cancel.load(Ordering::Relaxed) && pump.last_packet.elapsed() < QUIET_PERIOD {
        pump.until(&session, Instant::now() + POLL, &cancel)?;
    }

    let shutdown = session.shutdown(config.shutdown_timeout, |msg| pump.handle(msg));
    transport.flush().context("flushing packet file")?;

    let log = log.0.lock();
    let total_frames = samples.len() / format.channels as usize;
    Ok(RunSummary {
        input: args.input.display().to_string(),
        input_format: format,
        output: args.output.as_ref().map(|p| p.display().to_string()),
        encoder: config.pipeline.encoder.as_str().to_string(),
        chunks_sent,
        audio_ms: format.duration_of(total_frames).as_millis() as u64,
        packets_written: transport.packets_written(),
        bytes_written: transport.bytes_written(),
        dispatch: pump.dispatcher.stats(),
        tool_calls: log.tool_calls.len(),
        interrupts: log.interrupts,
        errors: log.errors.clone(),
        cancelled: cancel.load(Ordering::Relaxed),
        shutdown,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

async fn run() -> anyhow::Result<RunSummary> {
    let args = parse_args().map_err(|e| anyhow!(e))?;

    let settings_path = args.settings.clone().unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    settings.apply_env_overrides();
    info!(
        settings_path = ?settings_path,
        encoder = %settings.encoder,
        output_rate = settings.output_sample_rate,
        shutdown_timeout_ms = settings.shutdown_timeout_ms,
        "host settings loaded"
    );

    // The session's input format is the WAV's.
    let (format, samples) = read_wav(&args.input)?;
    let session = IsolatedSession::spawn(
        settings.session_config(format),
        Arc::new(EchoSessionFactory::new()),
    )
    .context("spawning voice session")?;

    let mut status = session.subscribe_status();
    let status_task = tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(event) => info!(
                    lifecycle = event.lifecycle.as_str(),
                    detail = event.detail.as_deref().unwrap_or(""),
                    "session status"
                ),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let cancel = Arc::new(AtomicBool::new(false));
    let signal_task = {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, shutting down session");
                cancel.store(true, Ordering::Relaxed);
            }
        })
    };

    let summary = tokio::task::spawn_blocking(move || {
        drive(args, settings, (format, samples), session, cancel)
    })
    .await
    .context("session driver panicked")??;

    signal_task.abort();
    let _ = status_task.await;
    Ok(summary)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voicecast=info")),
        )
        .with_writer(io::stderr)
        .init();

    match run().await {
        Ok(summary) => match serde_json::to_string_pretty(&summary) {
            Ok(json) => {
                println!("{json}");
                if summary.shutdown == ShutdownOutcome::ForceTerminated {
                    warn!("session had to be force-terminated");
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("failed to render summary: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            error!("{e:#}");
            eprintln!("voicecast: {e:#}");
            ExitCode::FAILURE
        }
    }
}
