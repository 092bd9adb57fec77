//! The warp loop: one iteration per display refresh.
//!
//! ```text
//!   WaitForVsync ──▶ SelectSource ──▶ Warp ──▶ Present ──┐
//!        ▲            (first eye)    (per eye or slice)   │
//!        └──────────────── next base vsync ◀──────────────┘
//! ```
//!
//! The same loop runs on the background warp thread or, for synchronous
//! topologies, inline inside `submit_frame`. The source is chosen once per
//! base vsync, so both eyes of a refresh always come from one submission.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use glam::{Mat4, Quat};
use serde::Serialize;

use crate::diagnostics::{EyeLog, EyeSample, SampleSink, WarpStats, WarpTotals, LATE_EYE_SECONDS};
use crate::distortion::{EyeMesh, WarpMesh};
use crate::error::WarpError;
use crate::fence::{FenceStatus, GpuSync};
use crate::lockless::{Publisher, Reader};
use crate::pose::{time_warp_matrix, PosePredictor};
use crate::source::{Eye, Selection, SourceView, WarpSource};
use crate::surface::{PresentationSurface, Region, SurfaceInfo, WarpDraw};
use crate::swap_program::SwapProgram;
use crate::uniforms::WarpUniforms;
use crate::vsync::VsyncTimeline;

/// Lead time of a sliced warp when the submission does not set one.
pub const DEFAULT_PRE_SCHEDULE_SECONDS: f64 = 0.014;

const SLICES_PER_EYE: u32 = 4;

/// Held refreshes in a row before the stall is reported.
const HELD_WARNING_FRAMES: u32 = 60;

/// What the warp thread last put on screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwapState {
    pub vsync_count: i64,
    pub eye_buffer_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WarpPhase {
    /// No refresh has been warped yet.
    Idle,
    WaitForVsync,
    SelectSource,
    Warp,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub base: i64,
    /// Submission on screen, `None` for a blank frame.
    pub submission: Option<u64>,
    /// The submission was new at this refresh.
    pub fresh: bool,
}

/// Returned when the loop stops.
#[derive(Debug, Clone, Serialize)]
pub struct WarpReport {
    pub totals: WarpTotals,
    pub eye_log: EyeLog,
    pub last_vsync: i64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct WarpSettings {
    pub sliced: bool,
    pub fence_timeout: Duration,
    pub prediction_bias_seconds: f64,
}

pub(crate) struct WarpLoopParts {
    pub timeline: VsyncTimeline,
    pub gpu: Arc<dyn GpuSync>,
    pub pose: Arc<dyn PosePredictor>,
    pub mesh: Arc<WarpMesh>,
    pub surface: Box<dyn PresentationSurface>,
    pub surface_info: SurfaceInfo,
    pub sources: SourceView,
    pub program: Reader<SwapProgram>,
    pub swap: Publisher<SwapState>,
    pub latched: Option<Sender<()>>,
    pub samples: Option<SampleSink>,
    pub settings: WarpSettings,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    eye: Eye,
    wake: f64,
    /// Wall-clock nanoseconds the region is scanned out between.
    scan: [f64; 2],
    region: Region,
    first_of_eye: bool,
    last_of_eye: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct EyeTiming {
    wake: f64,
    issued: f64,
    completed: f64,
    sampled_at: f64,
    scan: [f64; 2],
    skipped: bool,
}

pub(crate) struct WarpLoop {
    timeline: VsyncTimeline,
    gpu: Arc<dyn GpuSync>,
    pose: Arc<dyn PosePredictor>,
    mesh: Arc<WarpMesh>,
    surface: Box<dyn PresentationSurface>,
    surface_info: SurfaceInfo,
    sources: SourceView,
    program: Reader<SwapProgram>,
    swap: Publisher<SwapState>,
    latched: Option<Sender<()>>,
    samples: Option<SampleSink>,
    settings: WarpSettings,
    /// Private copy of the source on screen; only this copy's
    /// `first_displayed_vsync` is ever written.
    current: Option<WarpSource>,
    /// Newest submission whose fence has not signalled, and since when.
    pending: Option<(u64, f64)>,
    last_base: Option<i64>,
    held_streak: u32,
    phase: WarpPhase,
    stats: WarpStats,
    eye_log: EyeLog,
}

impl WarpLoop {
    pub fn new(parts: WarpLoopParts) -> Self {
        Self {
            timeline: parts.timeline,
            gpu: parts.gpu,
            pose: parts.pose,
            mesh: parts.mesh,
            surface: parts.surface,
            surface_info: parts.surface_info,
            sources: parts.sources,
            program: parts.program,
            swap: parts.swap,
            latched: parts.latched,
            samples: parts.samples,
            settings: parts.settings,
            current: None,
            pending: None,
            last_base: None,
            held_streak: 0,
            phase: WarpPhase::Idle,
            stats: WarpStats::default(),
            eye_log: EyeLog::new(),
        }
    }

    pub fn phase(&self) -> WarpPhase {
        self.phase
    }

    #[cfg(test)]
    pub fn eye_log(&self) -> &EyeLog {
        &self.eye_log
    }

    pub fn timeline(&self) -> &VsyncTimeline {
        &self.timeline
    }

    /// Base vsync of the next refresh to warp.
    ///
    /// Advances one refresh per iteration so a late wake does not skip a
    /// refresh; once the loop is more than a refresh behind it jumps to the
    /// first refresh whose first eye can still be made.
    pub fn next_base(&self) -> i64 {
        let fractional = self.timeline.fractional_vsync();
        let lead = self.program.read().delta_vsync[0];
        let candidate = match self.last_base {
            Some(previous) => previous + 1,
            None => fractional.floor() as i64 + 1,
        };
        if (candidate as f64 + lead) < fractional - 1.0 {
            let resumed = (fractional - lead).ceil() as i64;
            tracing::debug!(skipped = resumed - candidate, vsync = resumed, "warp loop fell behind");
            return resumed;
        }
        candidate
    }

    /// One loop iteration: warps and presents the next refresh.
    pub fn step(&mut self) -> Result<FrameReport, WarpError> {
        let base = self.next_base();
        self.warp_frame(base)
    }

    pub fn warp_frame(&mut self, base: i64) -> Result<FrameReport, WarpError> {
        let program = self.program.read();
        let latest = self.sources.get(self.sources.latest());
        let pre_schedule = latest.map_or(DEFAULT_PRE_SCHEDULE_SECONDS, |s| s.pre_schedule_seconds);
        let sliced = self.surface_info.front_buffer
            && latest.and_then(|s| s.sliced).unwrap_or(self.settings.sliced);
        let segments = self.segments(&program, base, sliced, pre_schedule);
        let clock = Arc::clone(self.timeline.clock());

        let mut fresh = false;
        let mut fence_checked = false;
        let mut carried = None;
        let mut eyes = [EyeTiming::default(); 2];
        for (index, segment) in segments.iter().enumerate() {
            self.phase = WarpPhase::WaitForVsync;
            clock.sleep_until(segment.wake);

            if index == 0 {
                self.phase = WarpPhase::SelectSource;
                fresh = self.select_source(base)?;
                self.track_held(base, fresh);
            }

            self.phase = WarpPhase::Warp;
            let (sampled_at, skipped) = self.draw_segment(base, segment, &mut carried);
            let timing = &mut eyes[segment.eye.index()];
            if segment.first_of_eye {
                timing.sampled_at = sampled_at;
                timing.skipped = skipped;
                timing.scan[0] = segment.scan[0];
            }
            timing.scan[1] = segment.scan[1];
            if !segment.last_of_eye {
                continue;
            }

            self.phase = WarpPhase::Present;
            if fresh && !fence_checked {
                if let Some(source) = self.current {
                    self.await_fence(&source)?;
                }
                fence_checked = true;
            }
            let timing = &mut eyes[segment.eye.index()];
            timing.wake = segment.wake;
            timing.issued = clock.now_nanos();
            if self.surface_info.front_buffer {
                self.surface.finish();
                timing.completed = clock.now_nanos();
                if segment.eye == Eye::Left {
                    self.publish_swap(base);
                }
            }
        }
        if !self.surface_info.front_buffer {
            self.surface.present()?;
            let completed = clock.now_nanos();
            for timing in &mut eyes {
                timing.completed = completed;
            }
            self.publish_swap(base);
        }

        let submission = self.current.map(|s| s.submission);
        for eye in Eye::BOTH {
            let timing = eyes[eye.index()];
            let mid_scan = 0.5 * (timing.scan[0] + timing.scan[1]);
            let sample = EyeSample {
                vsync: base,
                eye,
                buffer_num: submission.unwrap_or(0),
                skipped: timing.skipped,
                issue_finish: ((timing.issued - timing.wake) * 1e-9) as f32,
                complete_finish: ((timing.completed - timing.wake) * 1e-9) as f32,
                pose_latency_seconds: ((mid_scan - timing.sampled_at) * 1e-9) as f32,
            };
            tracing::trace!(
                vsync = base,
                ?eye,
                submission = sample.buffer_num,
                skipped = sample.skipped,
                complete = sample.complete_finish,
                "eye warped"
            );
            if sample.complete_finish > LATE_EYE_SECONDS {
                tracing::warn!(
                    vsync = base,
                    ?eye,
                    seconds = sample.complete_finish,
                    "eye finished late"
                );
            }
            self.stats.record_eye(&sample);
            self.eye_log.push(sample);
            if let Some(sink) = &self.samples {
                sink.offer(sample);
            }
        }
        self.stats
            .record_frame(!fresh && self.current.is_some(), self.current.is_none());
        self.stats.maybe_log(clock.now_seconds());
        self.last_base = Some(base);

        Ok(FrameReport {
            base,
            submission,
            fresh,
        })
    }

    /// Draws black into both eyes and presents, so no stale or torn image is
    /// left on screen.
    pub fn present_blank(&mut self) -> Result<(), WarpError> {
        self.current = None;
        let vsync = self.last_base.unwrap_or(0);
        for eye in Eye::BOTH {
            self.surface.begin_region(eye_region(&self.surface_info, eye));
            self.surface
                .draw(&blank_draw(vsync, eye, self.mesh.eye(eye)));
            self.surface.end_region();
            if self.surface_info.front_buffer {
                self.surface.finish();
            }
        }
        self.surface.present()
    }

    pub fn into_report(self) -> WarpReport {
        WarpReport {
            totals: self.stats.totals(),
            eye_log: self.eye_log,
            last_vsync: self.last_base.unwrap_or(0),
        }
    }

    fn segments(&self, program: &SwapProgram, base: i64, sliced: bool, pre_schedule: f64) -> Vec<Segment> {
        let timeline = &self.timeline;
        if !sliced {
            return Eye::BOTH
                .iter()
                .map(|&eye| {
                    let [start, stop] = program.prediction_window(eye, base);
                    Segment {
                        eye,
                        wake: timeline.vsync_to_time(program.wake_point(eye, base)),
                        scan: [timeline.vsync_to_time(start), timeline.vsync_to_time(stop)],
                        region: eye_region(&self.surface_info, eye),
                        first_of_eye: true,
                        last_of_eye: true,
                    }
                })
                .collect();
        }

        // Slices of the refresh that follows the base vsync, left to right.
        let slices = SLICES_PER_EYE * 2;
        let displayed = (base + 1) as f64;
        let slice_width = self.surface_info.width / slices;
        (0..slices)
            .map(|slice| {
                let start = timeline.scanout_to_time(displayed, slice as f64 / slices as f64);
                let stop = timeline.scanout_to_time(displayed, (slice + 1) as f64 / slices as f64);
                Segment {
                    eye: if slice < SLICES_PER_EYE {
                        Eye::Left
                    } else {
                        Eye::Right
                    },
                    wake: start - pre_schedule * 1e9,
                    scan: [start, stop],
                    region: Region {
                        x: slice * slice_width,
                        y: 0,
                        width: slice_width,
                        height: self.surface_info.height,
                    },
                    first_of_eye: slice % SLICES_PER_EYE == 0,
                    last_of_eye: slice % SLICES_PER_EYE == SLICES_PER_EYE - 1,
                }
            })
            .collect()
    }

    /// Returns whether a new submission went on screen.
    fn select_source(&mut self, base: i64) -> Result<bool, WarpError> {
        let now = self.timeline.clock().now_nanos();
        let latest = self.sources.latest();
        let timeout_nanos = self.settings.fence_timeout.as_nanos() as f64;
        let shown = self.current.map(|s| s.submission);
        let gpu = &self.gpu;
        let pending = &mut self.pending;

        let selection = self.sources.select(base, shown, |candidate| {
            match gpu.wait_fence(candidate.completion_fence, Duration::ZERO) {
                FenceStatus::Signaled => {
                    if matches!(*pending, Some((n, _)) if n == candidate.submission) {
                        *pending = None;
                    }
                    Ok(true)
                }
                FenceStatus::Failed => Err(WarpError::FenceFailed {
                    submission: candidate.submission,
                }),
                FenceStatus::TimedOut => {
                    if candidate.submission != latest {
                        return Ok(false);
                    }
                    let since = match *pending {
                        Some((n, since)) if n == latest => since,
                        _ => {
                            *pending = Some((latest, now));
                            now
                        }
                    };
                    let waited = now - since;
                    if waited > timeout_nanos {
                        return Err(WarpError::FenceTimeout {
                            submission: latest,
                            waited: Duration::from_nanos(waited as u64),
                        });
                    }
                    Ok(false)
                }
            }
        })?;

        Ok(match selection {
            Selection::Fresh(source) => {
                let skipped = source.submission - shown.unwrap_or(0) - 1;
                if skipped > 0 {
                    tracing::debug!(
                        vsync = base,
                        submission = source.submission,
                        skipped,
                        "submissions replaced before they were shown"
                    );
                    self.stats.record_dropped(skipped);
                }
                self.current = Some(source);
                true
            }
            Selection::Held => false,
            Selection::Empty => {
                self.current = None;
                false
            }
        })
    }

    fn await_fence(&self, source: &WarpSource) -> Result<(), WarpError> {
        let timeout = self.settings.fence_timeout;
        match self.gpu.wait_fence(source.completion_fence, timeout) {
            FenceStatus::Signaled => Ok(()),
            FenceStatus::TimedOut => Err(WarpError::FenceTimeout {
                submission: source.submission,
                waited: timeout,
            }),
            FenceStatus::Failed => Err(WarpError::FenceFailed {
                submission: source.submission,
            }),
        }
    }

    fn track_held(&mut self, base: i64, fresh: bool) {
        if fresh {
            if self.held_streak >= HELD_WARNING_FRAMES {
                tracing::info!(vsync = base, held = self.held_streak, "new frames resumed");
            }
            self.held_streak = 0;
            return;
        }
        self.held_streak += 1;
        if self.held_streak == HELD_WARNING_FRAMES {
            tracing::warn!(
                vsync = base,
                submission = ?self.current.map(|s| s.submission),
                "no new frame for {HELD_WARNING_FRAMES} refreshes; holding the last image"
            );
        }
    }

    /// Issues one region. Returns when the pose was sampled and whether the
    /// eye showed nothing new.
    fn draw_segment(&mut self, base: i64, segment: &Segment, carried: &mut Option<Quat>) -> (f64, bool) {
        let bias = self.settings.prediction_bias_seconds;
        let sampled_at = self.timeline.clock().now_nanos();
        let mesh = self.mesh.eye(segment.eye);
        let eye = segment.eye;

        self.surface.begin_region(segment.region);
        let (draw, skipped) = match self.current.as_mut() {
            Some(source) => {
                let layer = source.payload.layer(eye);
                let start = match carried.take() {
                    Some(pose) if !segment.first_of_eye => pose,
                    _ => self.pose.predict_pose(segment.scan[0] * 1e-9 + bias),
                };
                let end = self.pose.predict_pose(segment.scan[1] * 1e-9 + bias);
                *carried = Some(end);

                let steps = source.external_velocity_steps(base);
                let velocity = (0..steps).fold(Quat::IDENTITY, |acc, _| acc * source.external_velocity);
                let velocity = Mat4::from_quat(velocity.normalize());
                let warp = |predicted: Quat| {
                    layer.tex_coords_from_tan_angles * velocity * time_warp_matrix(layer.pose, predicted)
                };

                let first = &mut source.first_displayed_vsync[eye.index()];
                let held = *first != 0 && *first < base;
                if *first == 0 {
                    *first = base;
                }
                let draw = WarpDraw {
                    vsync: base,
                    eye,
                    texture: layer.texture,
                    submission: Some(source.submission),
                    minimum_vsync: Some(source.minimum_vsync),
                    held,
                    uniforms: WarpUniforms::new(
                        eye,
                        warp(start),
                        warp(end),
                        !source.disable_chromatic_correction,
                    ),
                    mesh,
                };
                (draw, held)
            }
            None => (blank_draw(base, eye, mesh), true),
        };
        self.surface.draw(&draw);
        self.surface.end_region();
        (sampled_at, skipped)
    }

    fn publish_swap(&mut self, base: i64) {
        self.swap.publish(SwapState {
            vsync_count: base,
            eye_buffer_count: self.current.map_or(0, |s| s.submission),
        });
        if let Some(latched) = &self.latched {
            // A full channel already holds a wake-up.
            let _ = latched.try_send(());
        }
    }
}

fn eye_region(info: &SurfaceInfo, eye: Eye) -> Region {
    let half = info.width / 2;
    Region {
        x: eye.index() as u32 * half,
        y: 0,
        width: half,
        height: info.height,
    }
}

fn blank_draw(vsync: i64, eye: Eye, mesh: &EyeMesh) -> WarpDraw<'_> {
    WarpDraw {
        vsync,
        eye,
        texture: None,
        submission: None,
        minimum_vsync: None,
        held: false,
        uniforms: WarpUniforms::new(eye, Mat4::IDENTITY, Mat4::IDENTITY, false),
        mesh,
    }
}
