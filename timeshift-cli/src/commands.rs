//! CLI command implementations

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use timeshift_core::timeshift::{
    RecordingInfo, StreamContext, StreamKind, TimeshiftBuffer, create_timeshift_buffer,
};
use timeshift_core::{SimulatedDvr, StreamingMethod, TimeshiftConfig};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{info, warn};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Play a channel or recording from the configured backend
    Play {
        /// Stream URL as known to the backend
        url: String,
        /// Streaming method override
        #[arg(short, long)]
        method: Option<StreamingMethod>,
        /// Stop after this many seconds
        #[arg(short, long, default_value = "30")]
        seconds: u64,
        /// Write received bytes to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Play as radio, bypassing any buffering strategy
        #[arg(long, conflicts_with = "recording_start")]
        radio: bool,
        /// Play a recording that started at this RFC 3339 time
        #[arg(long)]
        recording_start: Option<DateTime<Utc>>,
        /// Scheduled recording length in minutes
        #[arg(long, default_value = "60", requires = "recording_start")]
        recording_minutes: u64,
    },
    /// Run a strategy against the simulated DVR and verify every byte
    Simulate {
        /// Streaming method to exercise
        #[arg(short, long, default_value = "timeshift")]
        method: StreamingMethod,
        /// Seconds of playback
        #[arg(short, long, default_value = "10")]
        seconds: u64,
        /// Live stream growth in bytes per second
        #[arg(long, default_value = "2000000")]
        bitrate: u64,
        /// Seed for the simulated short reads
        #[arg(long)]
        seed: Option<u64>,
        /// Seek back this many bytes halfway through
        #[arg(long)]
        rewind: Option<u64>,
    },
    /// Print the effective configuration as JSON
    Config,
}

/// Loads `path` when given, otherwise defaults with environment overrides.
///
/// # Errors
/// - Configuration file missing, unparsable or invalid
pub fn load_config(path: Option<&Path>) -> anyhow::Result<TimeshiftConfig> {
    match path {
        Some(path) => TimeshiftConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(TimeshiftConfig::from_env()),
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands, config: TimeshiftConfig) -> anyhow::Result<()> {
    match command {
        Commands::Play {
            url,
            method,
            seconds,
            output,
            radio,
            recording_start,
            recording_minutes,
        } => {
            let mut config = config;
            if let Some(method) = method {
                config.streaming.method = method;
            }
            let kind = match recording_start {
                Some(start) => StreamKind::Recording(RecordingInfo::new(
                    start,
                    Duration::from_secs(recording_minutes * 60),
                )),
                None if radio => StreamKind::Radio,
                None => StreamKind::LiveTv,
            };
            play(config, &url, &kind, Duration::from_secs(seconds), output).await
        }
        Commands::Simulate {
            method,
            seconds,
            bitrate,
            seed,
            rewind,
        } => {
            let mut config = config;
            config.streaming.method = method;
            let run = SimulationRun {
                duration: Duration::from_secs(seconds),
                bitrate,
                seed,
                rewind,
            };
            simulate(config, run).await
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Totals for one playback run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackReport {
    pub bytes: u64,
    pub reads: u64,
    pub empty_reads: u64,
}

impl PlaybackReport {
    fn print(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        println!("Received {:.2} MB in {:.1}s", self.bytes as f64 / 1_048_576.0, secs);
        println!("  Throughput: {:.2} MB/s", self.bytes as f64 / 1_048_576.0 / secs);
        println!("  Reads: {} ({} empty)", self.reads, self.empty_reads);
    }
}

/// Play `url` from the configured backend as `kind`
///
/// # Errors
/// - Backend connection could not be set up
/// - The stream failed to open
/// - Output file could not be written
pub async fn play(
    config: TimeshiftConfig,
    url: &str,
    kind: &StreamKind,
    duration: Duration,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let method = config.streaming.method;
    let context = StreamContext::production(config).context("setting up backend connection")?;
    let buffer = create_timeshift_buffer(kind, &context);

    println!("Opening {url} with {} ({method})", buffer.name());
    buffer
        .open(url)
        .await
        .map_err(timeshift_core::Error::from)
        .map_err(|e| anyhow::anyhow!("{}", e.user_message()))?;

    let mut file = match &output {
        Some(path) => Some(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => None,
    };

    let started = Instant::now();
    let mut report = PlaybackReport::default();
    let mut chunk = vec![0u8; buffer.read_chunk_size()];
    while started.elapsed() < duration {
        let count = buffer.read(&mut chunk).await;
        report.reads += 1;
        if count == 0 {
            report.empty_reads += 1;
            if buffer.is_complete() {
                info!("Stream {} finished", url);
                break;
            }
            continue;
        }
        report.bytes += count as u64;
        if let Some(file) = file.as_mut() {
            file.write_all(&chunk[..count]).await?;
        }
    }
    if let Some(mut file) = file {
        file.flush().await?;
    }

    if let Some(times) = buffer.stream_times() {
        println!(
            "Window: start {} begin {}us end {}us",
            times.start_time, times.pts_begin, times.pts_end
        );
    }
    buffer.close().await;
    report.print(started.elapsed());
    Ok(())
}

/// Parameters of a simulated run.
#[derive(Debug, Clone, Copy)]
pub struct SimulationRun {
    pub duration: Duration,
    pub bitrate: u64,
    pub seed: Option<u64>,
    pub rewind: Option<u64>,
}

/// Initial stream length, enough to satisfy every strategy's prebuffer.
const SIMULATED_HEAD_START: u64 = 4 << 20;

/// Run the configured strategy against the simulated DVR
///
/// # Errors
/// - The stream failed to open
/// - A byte arrived out of order or with the wrong content
pub async fn simulate(config: TimeshiftConfig, run: SimulationRun) -> anyhow::Result<()> {
    let dvr = match run.seed {
        Some(seed) => SimulatedDvr::with_seed(seed),
        None => SimulatedDvr::new(),
    };
    dvr.set_live(SIMULATED_HEAD_START, run.bitrate);
    if config.streaming.method == StreamingMethod::Transcoded {
        dvr.script_transcode(1, false);
    }

    let context = dvr.context(config);
    let buffer = create_timeshift_buffer(&StreamKind::LiveTv, &context);
    println!("Simulating {} against sim://live/1", buffer.name());
    buffer.open("sim://live/1").await?;

    let report = drive_verified(buffer.as_ref(), run).await;
    buffer.close().await;

    let stats = dvr.stats();
    println!(
        "  Backend: {} starts, {} stops, {} leases, {} block connections",
        stats.stream_starts,
        stats.stream_stops,
        stats.stream_leases + stats.transcode_leases,
        stats.block_connections
    );
    let report = report?;
    println!("All {} bytes matched the stream pattern", report.bytes);
    Ok(())
}

/// Reads for `run.duration`, checking every byte against the stream pattern.
async fn drive_verified(
    buffer: &dyn TimeshiftBuffer,
    run: SimulationRun,
) -> anyhow::Result<PlaybackReport> {
    let started = Instant::now();
    let mut report = PlaybackReport::default();
    let mut rewound = run.rewind.is_none();
    let mut chunk = vec![0u8; buffer.read_chunk_size()];

    while started.elapsed() < run.duration {
        if !rewound && started.elapsed() >= run.duration / 2 {
            rewound = true;
            let back = run.rewind.unwrap_or(0).min(i64::MAX as u64) as i64;
            match buffer.seek(SeekFrom::Current(-back)).await {
                Some(position) => println!("  Rewound to {position}"),
                None => warn!("Rewind by {} bytes refused", back),
            }
        }

        let offset = buffer.position();
        let count = buffer.read(&mut chunk).await;
        report.reads += 1;
        if count == 0 {
            report.empty_reads += 1;
            if buffer.is_complete() {
                break;
            }
            continue;
        }
        if !SimulatedDvr::verify_pattern(offset, &chunk[..count]) {
            bail!("{count} bytes at offset {offset} do not match the stream");
        }
        report.bytes += count as u64;
    }

    report.print(started.elapsed());
    Ok(report)
}
