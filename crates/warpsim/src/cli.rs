use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::script::{parse_script, Script};

#[derive(Parser, Debug)]
#[command(
    name = "warpsim",
    author,
    version,
    about = "Time-warp pipeline simulator",
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the pipeline against a simulated display, GPU and producer.
    Run(RunArgs),
    /// Inspect or install the default configuration.
    Defaults(DefaultsCommand),
    /// Validate a configuration file (and its distortion table) then exit.
    Check {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Pipeline configuration; falls back to the user config, then built-in defaults.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Wall-clock time source (`system`) or instant virtual time (`simulated`, synchronous only).
    #[arg(long, value_enum, default_value_t = ClockKind::System)]
    pub clock: ClockKind,

    /// How long the producer keeps submitting.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "3s")]
    pub duration: Duration,

    /// Mean time the producer spends rendering each frame.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "8ms")]
    pub render_cost: Duration,

    /// Uniform spread applied to the render cost, as a fraction of it (0.0-1.0).
    #[arg(long, value_name = "FRACTION", default_value_t = 0.0, value_parser = parse_fraction)]
    pub render_variance: f64,

    /// Time from frame submission to its fence signalling.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "4ms")]
    pub gpu_latency: Duration,

    /// Producer stall start, measured from the first submission.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, requires = "stall_for")]
    pub stall_at: Option<Duration>,

    /// Length of the producer stall.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, requires = "stall_at")]
    pub stall_for: Option<Duration>,

    /// Maximum noise added to each display callback timestamp.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "0ms")]
    pub pulse_jitter: Duration,

    /// Head yaw rate in radians per second.
    #[arg(long, value_name = "RAD/S", default_value_t = 1.0)]
    pub head_rate: f32,

    /// Power and headset events, e.g. `2s=powersave,4s=unmount,4500ms=mount,5s=normal`.
    #[arg(long, value_name = "SCRIPT", value_parser = parse_script)]
    pub script: Option<Script>,

    /// Seed for render-cost and pulse noise.
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Write the JSON report (totals, eye log, throttle notices) to this path.
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClockKind {
    System,
    Simulated,
}

#[derive(Parser, Debug)]
pub struct DefaultsCommand {
    #[command(subcommand)]
    pub action: DefaultsAction,
}

#[derive(Subcommand, Debug)]
pub enum DefaultsAction {
    /// Print resolved directories for configuration and reports.
    Where,
    /// Print the built-in configuration as TOML.
    Show,
    /// Install the built-in configuration as the user config.
    Write {
        /// Replace an existing user config.
        #[arg(long)]
        force: bool,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}

/// Human-readable durations (`8ms`, `1.5s`) or bare seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("duration must not be empty".to_string());
    }
    if let Ok(seconds) = trimmed.parse::<f64>() {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(format!("duration must be non-negative, got {trimmed}"));
        }
        return Ok(Duration::from_secs_f64(seconds));
    }
    humantime::parse_duration(trimmed).map_err(|err| format!("invalid duration '{trimmed}': {err}"))
}

fn parse_fraction(value: &str) -> Result<f64, String> {
    let fraction: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid fraction '{value}'"))?;
    if !(0.0..=1.0).contains(&fraction) {
        return Err(format!("fraction must be within 0.0-1.0, got {fraction}"));
    }
    Ok(fraction)
}
