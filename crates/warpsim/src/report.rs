use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use timewarp::{ThrottleNotice, ThrottleState, WarpReport};

use crate::sim::SimOutcome;

#[derive(Debug, Serialize)]
pub struct BlockedSummary {
    pub mean_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct SimReport<'a> {
    pub topology: String,
    pub config: Option<&'a Path>,
    pub duration_seconds: f64,
    pub submissions: u64,
    pub ignored: u64,
    pub blocked: BlockedSummary,
    pub streamed_samples: u64,
    pub throttle: ThrottleState,
    pub notices: &'a [ThrottleNotice],
    pub fault: Option<&'a str>,
    pub warp: Option<&'a WarpReport>,
}

impl<'a> SimReport<'a> {
    pub fn new(outcome: &'a SimOutcome, config: Option<&'a PathBuf>) -> Self {
        Self {
            topology: outcome.topology.to_string(),
            config: config.map(PathBuf::as_path),
            duration_seconds: outcome.elapsed.as_secs_f64(),
            submissions: outcome.submissions,
            ignored: outcome.ignored,
            blocked: BlockedSummary {
                mean_ms: outcome.blocked.mean().as_secs_f64() * 1e3,
                max_ms: outcome.blocked.max.as_secs_f64() * 1e3,
            },
            streamed_samples: outcome.streamed_samples,
            throttle: outcome.throttle,
            notices: &outcome.notices,
            fault: outcome.fault.as_deref(),
            warp: outcome.warp.as_ref(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| {
                format!("failed to prepare report directory at {}", dir.display())
            })?;
        }
        let serialized =
            serde_json::to_string_pretty(self).context("failed to serialize report to JSON")?;
        fs::write(path, serialized)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        Ok(())
    }

    pub fn print_summary(&self) {
        println!("Topology:        {}", self.topology);
        if let Some(config) = self.config {
            println!("Config:          {}", config.display());
        }
        println!("Duration:        {:.3}s", self.duration_seconds);
        println!("Submissions:     {}", self.submissions);
        println!(
            "Producer blocked: mean {:.2}ms, max {:.2}ms",
            self.blocked.mean_ms, self.blocked.max_ms
        );
        if let Some(warp) = self.warp {
            let totals = warp.totals;
            println!(
                "Warp frames:     {} (held {}, blank {}, late eyes {}, dropped submissions {})",
                totals.frames,
                totals.held_frames,
                totals.blank_frames,
                totals.late_eyes,
                totals.dropped_submissions
            );
            println!("Last vsync:      {}", warp.last_vsync);
        }
        if self.throttle.throttled || self.throttle.cannot_continue {
            println!(
                "Throttle:        throttled={} cannot_continue={}",
                self.throttle.throttled, self.throttle.cannot_continue
            );
        }
        for notice in self.notices {
            println!("  notice {notice:?}");
        }
        if let Some(fault) = self.fault {
            println!("Fault:           {fault}");
        }
    }
}
