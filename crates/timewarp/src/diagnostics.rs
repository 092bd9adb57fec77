use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::ser::Serializer;
use serde::Serialize;

use crate::source::Eye;

/// Entries kept in the rolling eye log.
pub const EYE_LOG_COUNT: usize = 512;

/// An eye that took longer than this from wake to finish is counted late.
pub const LATE_EYE_SECONDS: f32 = 0.008;

/// Timing of one eye warp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EyeSample {
    pub vsync: i64,
    pub eye: Eye,
    /// Submission drawn, zero when nothing was.
    pub buffer_num: u64,
    /// Nothing new was drawn: a held source or no source at all.
    pub skipped: bool,
    /// Seconds from the wake point to issuing the finish.
    pub issue_finish: f32,
    /// Seconds from the wake point to the finish completing.
    pub complete_finish: f32,
    /// How far ahead of sampling the pose was predicted.
    pub pose_latency_seconds: f32,
}

/// Ring of the most recent [`EYE_LOG_COUNT`] samples.
#[derive(Debug, Clone)]
pub struct EyeLog {
    entries: Vec<EyeSample>,
    logged: u64,
}

impl EyeLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(EYE_LOG_COUNT),
            logged: 0,
        }
    }

    pub fn push(&mut self, sample: EyeSample) {
        let index = (self.logged as usize) & (EYE_LOG_COUNT - 1);
        if self.entries.len() < EYE_LOG_COUNT {
            self.entries.push(sample);
        } else {
            self.entries[index] = sample;
        }
        self.logged += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Samples ever pushed, including those already overwritten.
    pub fn total_logged(&self) -> u64 {
        self.logged
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &EyeSample> {
        let split = if self.entries.len() < EYE_LOG_COUNT {
            0
        } else {
            (self.logged as usize) & (EYE_LOG_COUNT - 1)
        };
        self.entries[split..].iter().chain(self.entries[..split].iter())
    }

    pub fn latest(&self) -> Option<&EyeSample> {
        self.iter().last()
    }

    pub fn snapshot(&self) -> Vec<EyeSample> {
        self.iter().copied().collect()
    }
}

impl Default for EyeLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize for EyeLog {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(self.iter())
    }
}

pub(crate) fn sample_channel() -> (SampleSink, DiagnosticsTap) {
    let (tx, rx) = bounded(EYE_LOG_COUNT);
    (
        SampleSink { tx },
        DiagnosticsTap {
            samples: rx,
            log: EyeLog::new(),
        },
    )
}

/// Warp-thread end of the sample stream. Never blocks.
#[derive(Debug, Clone)]
pub(crate) struct SampleSink {
    tx: Sender<EyeSample>,
}

impl SampleSink {
    pub fn offer(&self, sample: EyeSample) {
        match self.tx.try_send(sample) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!(vsync = sample.vsync, "diagnostics tap is full; dropping sample");
            }
        }
    }
}

/// Observer end of the eye log, for external tooling.
#[derive(Debug)]
pub struct DiagnosticsTap {
    samples: Receiver<EyeSample>,
    log: EyeLog,
}

impl DiagnosticsTap {
    /// Folds pending samples into the local log; returns how many arrived.
    pub fn drain(&mut self) -> usize {
        let mut received = 0;
        for sample in self.samples.try_iter() {
            self.log.push(sample);
            received += 1;
        }
        received
    }

    pub fn log(&self) -> &EyeLog {
        &self.log
    }
}

/// Lifetime counters of a warp loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WarpTotals {
    pub frames: u64,
    /// Frames that did not show a new source.
    pub held_frames: u64,
    pub blank_frames: u64,
    pub late_eyes: u64,
    /// Submissions superseded before they were ever shown.
    pub dropped_submissions: u64,
}

/// Counters logged once per second from the warp thread.
#[derive(Debug, Default)]
pub(crate) struct WarpStats {
    window_start: Option<f64>,
    window: WarpTotals,
    totals: WarpTotals,
}

impl WarpStats {
    pub fn record_frame(&mut self, held: bool, blank: bool) {
        for counters in [&mut self.window, &mut self.totals] {
            counters.frames += 1;
            if held || blank {
                counters.held_frames += 1;
            }
            if blank {
                counters.blank_frames += 1;
            }
        }
    }

    pub fn record_eye(&mut self, sample: &EyeSample) {
        if sample.complete_finish > LATE_EYE_SECONDS {
            self.window.late_eyes += 1;
            self.totals.late_eyes += 1;
        }
    }

    pub fn record_dropped(&mut self, count: u64) {
        self.window.dropped_submissions += count;
        self.totals.dropped_submissions += count;
    }

    pub fn totals(&self) -> WarpTotals {
        self.totals
    }

    pub fn maybe_log(&mut self, now_seconds: f64) {
        let start = *self.window_start.get_or_insert(now_seconds);
        if now_seconds - start < 1.0 {
            return;
        }
        tracing::debug!(
            frames = self.window.frames,
            held = self.window.held_frames,
            blank = self.window.blank_frames,
            late_eyes = self.window.late_eyes,
            dropped = self.window.dropped_submissions,
            "warp statistics"
        );
        self.window = WarpTotals::default();
        self.window_start = Some(now_seconds);
    }
}
