use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use crate::bench::stats::Baseline;
use crate::bench::{ClientConfig, DeliveryMode, ServerConfig};
use crate::net::mux::MuxConfig;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum EnumerableLevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<EnumerableLevelFilter> for LevelFilter {
    fn from(value: EnumerableLevelFilter) -> Self {
        match value {
            EnumerableLevelFilter::Off => LevelFilter::Off,
            EnumerableLevelFilter::Error => LevelFilter::Error,
            EnumerableLevelFilter::Warn => LevelFilter::Warn,
            EnumerableLevelFilter::Info => LevelFilter::Info,
            EnumerableLevelFilter::Debug => LevelFilter::Debug,
            EnumerableLevelFilter::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum EnumerableDeliveryMode {
    /// One data channel per frame.
    PerFrame,
    /// All frames back-to-back on the control channel.
    Shared,
}

impl From<EnumerableDeliveryMode> for DeliveryMode {
    fn from(value: EnumerableDeliveryMode) -> Self {
        match value {
            EnumerableDeliveryMode::PerFrame => DeliveryMode::PerFrameChannel,
            EnumerableDeliveryMode::Shared => DeliveryMode::SharedChannel,
        }
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
/// rtcbench: measure frame-paced media delivery over a multiplexed transport.
pub struct CliArgs {
    /// Filter log messages more verbose than the given level.
    #[arg(
        short,
        long,
        global = true,
        value_name = "LEVEL",
        default_value = "info"
    )]
    pub log_level: EnumerableLevelFilter,
    /// Override log filters using RUST_LOG directives supported by the env_logger crate.
    #[arg(short = 'f', long, global = true, value_name = "FILTERS")]
    pub log_filter: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
/// Holds the supported subcommands and their args.
pub enum Command {
    /// Serve frames to connecting clients.
    Server(ServerArgs),
    /// Request frames from a server and report the goodput.
    Client(ClientArgs),
}

/// Options shared by both roles.
#[derive(Args)]
pub struct SessionArgs {
    /// How frames travel: one channel each, or all on the control channel.
    #[arg(short, long, value_enum, default_value = "per-frame")]
    pub mode: EnumerableDeliveryMode,
    /// Seconds between interval throughput reports.
    #[arg(long, value_name = "SECS", default_value_t = 1.0)]
    pub report_interval_secs: f64,
    /// Tear a session down after this many seconds without inbound traffic.
    #[arg(long, value_name = "SECS", default_value_t = 30.0)]
    pub idle_timeout_secs: f64,
    /// Give up on a single frame after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub frame_timeout_secs: Option<f64>,
}

#[derive(Args)]
pub struct ServerArgs {
    /// Address to listen on.
    #[arg(short = 'p', long, default_value = "127.0.0.1:8080")]
    pub addr: SocketAddr,
    /// Payload size of every frame in bytes.
    #[arg(short = 's', long, default_value_t = 5000)]
    pub frame_size: usize,
    /// Milliseconds between frame slots.
    #[arg(short = 'i', long, value_name = "MILLIS", default_value_t = 33)]
    pub frame_interval_ms: u64,
    /// Stop accepting after this many sessions (serves forever if unset).
    #[arg(long, value_name = "N")]
    pub max_sessions: Option<u64>,
    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args)]
pub struct ClientArgs {
    /// Server address to connect to.
    #[arg(short = 'p', long, default_value = "127.0.0.1:8080")]
    pub addr: SocketAddr,
    /// Number of frames to request.
    #[arg(short = 'n', long, default_value_t = 300)]
    pub frames: u64,
    /// Expected payload size of every frame in bytes.
    #[arg(short = 's', long, default_value_t = 5000)]
    pub frame_size: usize,
    /// Start time of the test in unix seconds, the origin of `fin time`
    /// offsets (0 means now).
    #[arg(short = 't', long, value_name = "UNIX_SECS", default_value_t = 0.0)]
    pub start_time: f64,
    #[command(flatten)]
    pub session: SessionArgs,
}

fn secs(value: f64, what: &str) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| anyhow::anyhow!("invalid {what} of {value} seconds: {e}"))
}

impl SessionArgs {
    pub fn mux_config(&self) -> anyhow::Result<MuxConfig> {
        let idle = secs(self.idle_timeout_secs, "idle timeout")?;
        Ok(MuxConfig {
            idle_timeout: (!idle.is_zero()).then_some(idle),
            ..MuxConfig::default()
        })
    }

    fn frame_timeout(&self) -> anyhow::Result<Option<Duration>> {
        self.frame_timeout_secs
            .map(|value| secs(value, "frame timeout"))
            .transpose()
    }

    fn report_interval(&self) -> anyhow::Result<Duration> {
        secs(self.report_interval_secs, "report interval")
    }
}

impl ServerArgs {
    pub fn bench_config(&self) -> anyhow::Result<ServerConfig> {
        Ok(ServerConfig {
            frame_size: self.frame_size,
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            mode: self.session.mode.into(),
            report_interval: self.session.report_interval()?,
            frame_timeout: self.session.frame_timeout()?,
        })
    }
}

impl ClientArgs {
    pub fn bench_config(&self) -> anyhow::Result<ClientConfig> {
        Ok(ClientConfig {
            frame_count: self.frames,
            frame_size: self.frame_size,
            mode: self.session.mode.into(),
            report_interval: self.session.report_interval()?,
            frame_timeout: self.session.frame_timeout()?,
            baseline: Some(Baseline::from_unix_secs(self.start_time)),
        })
    }
}

pub fn parse_cli_args() -> CliArgs {
    CliArgs::parse()
}
