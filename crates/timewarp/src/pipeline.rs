use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use glam::Quat;
use warpconfig::PipelineConfig;

use crate::diagnostics::{sample_channel, DiagnosticsTap};
use crate::distortion::{Distortion, WarpMesh};
use crate::error::WarpError;
use crate::fence::{FenceHandle, FenceStatus, GpuSync};
use crate::lockless::{slot_exchange, Publisher, Reader};
use crate::pose::PosePredictor;
use crate::priority::{PriorityControl, PriorityLevel, ProducerWatchdog, ThreadRole};
use crate::runtime::WarpThread;
use crate::source::{source_ring, EyeImageSet, SourceRing, WarpSource};
use crate::surface::PresentationSurface;
use crate::swap_program::Topology;
use crate::throttle::{HeadsetWatch, PowerMonitor, ThrottleController, ThrottleNotice, ThrottleState};
use crate::vsync::VsyncTimeline;
use crate::warp::{
    SwapState, WarpLoop, WarpLoopParts, WarpReport, WarpSettings, DEFAULT_PRE_SCHEDULE_SECONDS,
};

/// Submissions issued by a flush.
const FLUSH_SUBMISSIONS: usize = 3;

/// Host services the pipeline runs against.
pub struct Collaborators {
    pub timeline: VsyncTimeline,
    pub gpu: Arc<dyn GpuSync>,
    pub pose: Arc<dyn PosePredictor>,
    pub surface: Box<dyn PresentationSurface>,
    pub distortion: Arc<dyn Distortion>,
    pub power: Box<dyn PowerMonitor>,
    pub priority: Arc<dyn PriorityControl>,
    pub headset: HeadsetWatch,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubmitOptions {
    /// Submit three times so the images are pushed through before a long
    /// stall such as a level load.
    pub flush: bool,
    /// Show the built-in black image for eyes without a texture.
    pub default_images: bool,
    /// Overrides `pipeline.sliced` for this frame.
    pub sliced: Option<bool>,
    /// Refreshes this frame must occupy at least.
    pub minimum_vsyncs: Option<u32>,
    pub pre_schedule_seconds: f64,
    /// Per-refresh rotation applied while the frame is held.
    pub external_velocity: Quat,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            flush: false,
            default_images: false,
            sliced: None,
            minimum_vsyncs: None,
            pre_schedule_seconds: DEFAULT_PRE_SCHEDULE_SECONDS,
            external_velocity: Quat::IDENTITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted {
        submission: u64,
        /// The frame is shown at a later vsync than this.
        minimum_vsync: i64,
        /// Time spent in fence waits and rate limiting.
        blocked: Duration,
    },
    /// No warp thread is running.
    Ignored,
}

enum Consumer {
    Threaded {
        thread: WarpThread,
        latched: Receiver<()>,
    },
    Inline(Box<WarpLoop>),
    Exited(Option<Result<WarpReport, WarpError>>),
}

enum Released {
    At(i64),
    ThreadExited,
    Failed(WarpError),
}

/// One time-warp session: the source ring, warp consumer and throttle state.
///
/// Constructed on the producer thread; every submission must come from it.
pub struct WarpPipeline {
    topology: Topology,
    timeline: VsyncTimeline,
    gpu: Arc<dyn GpuSync>,
    priority: Arc<dyn PriorityControl>,
    ring: SourceRing,
    consumer: Consumer,
    swap: Reader<SwapState>,
    throttle: ThrottleController,
    throttle_state: Reader<ThrottleState>,
    power: Box<dyn PowerMonitor>,
    headset: HeadsetWatch,
    last_submit: Publisher<f64>,
    diagnostics: Option<DiagnosticsTap>,
    notices: Vec<ThrottleNotice>,
    fault: Option<WarpError>,
    producer: ThreadId,
    realtime_producer: bool,
    last_fence: FenceHandle,
    last_swap_vsync: Option<i64>,
    fence_timeout: Duration,
}

impl WarpPipeline {
    /// Acquires the surface, builds the distortion mesh and, for asynchronous
    /// topologies, starts the warp thread.
    pub fn start(config: &PipelineConfig, collaborators: Collaborators) -> Result<Self, WarpError> {
        config.validate()?;
        let Collaborators {
            timeline,
            gpu,
            pose,
            mut surface,
            distortion,
            power,
            priority,
            headset,
        } = collaborators;
        let settings = &config.pipeline;

        let requested = Topology::new(settings.asynchronous, settings.front_buffer);
        let surface_info = surface.acquire(requested.is_front_buffer())?;
        let topology = if requested.is_front_buffer() && !surface_info.front_buffer {
            tracing::info!(%requested, "surface refused front-buffer rendering; using swapped buffers");
            Topology::new(requested.is_asynchronous(), false)
        } else {
            requested
        };
        let sliced = settings.sliced && topology.is_front_buffer();
        if settings.sliced && !sliced {
            tracing::info!("sliced warp needs front-buffer rendering; disabled");
        }

        let base_program = topology.program().with_minimum_vsyncs(settings.minimum_vsyncs);
        let table = config.distortion_table()?;
        let mesh = Arc::new(WarpMesh::build(distortion.as_ref(), table.tessellation));
        tracing::info!(
            %topology,
            minimum_vsyncs = base_program.minimum_vsyncs,
            sliced,
            width = surface_info.width,
            height = surface_info.height,
            "starting time-warp pipeline"
        );

        let (ring, sources) = source_ring();
        let (throttle, throttle_state, program) = ThrottleController::new(
            settings.allow_power_save,
            config.throttle.poll_interval,
            config.throttle.remount_grace,
            base_program,
        );
        let (swap_publisher, swap) = slot_exchange(SwapState::default());
        let (last_submit, last_submit_reader) = slot_exchange(0.0f64);
        let (samples, diagnostics) = if config.diagnostics.eye_log {
            let (sink, tap) = sample_channel();
            (Some(sink), Some(tap))
        } else {
            (None, None)
        };
        let (latched_tx, latched_rx) = bounded(1);

        let warp = WarpLoop::new(WarpLoopParts {
            timeline: timeline.clone(),
            gpu: Arc::clone(&gpu),
            pose,
            mesh,
            surface,
            surface_info,
            sources,
            program,
            swap: swap_publisher,
            latched: topology.is_asynchronous().then_some(latched_tx),
            samples,
            settings: WarpSettings {
                sliced,
                fence_timeout: settings.fence_timeout,
                prediction_bias_seconds: settings.prediction_bias.as_secs_f64(),
            },
        });

        if settings.realtime_producer {
            priority.set_priority(ThreadRole::Producer, PriorityLevel::RealTime);
        }
        let consumer = if topology.is_asynchronous() {
            let watchdog = settings
                .realtime_producer
                .then(|| ProducerWatchdog::new(last_submit_reader, Arc::clone(&priority)));
            Consumer::Threaded {
                thread: WarpThread::spawn(warp, watchdog, Arc::clone(&priority))?,
                latched: latched_rx,
            }
        } else {
            Consumer::Inline(Box::new(warp))
        };

        Ok(Self {
            topology,
            timeline,
            gpu,
            priority,
            ring,
            consumer,
            swap,
            throttle,
            throttle_state,
            power,
            headset,
            last_submit,
            diagnostics,
            notices: Vec::new(),
            fault: None,
            producer: thread::current().id(),
            realtime_producer: settings.realtime_producer,
            last_fence: FenceHandle::NONE,
            last_swap_vsync: None,
            fence_timeout: settings.fence_timeout,
        })
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn timeline(&self) -> &VsyncTimeline {
        &self.timeline
    }

    pub fn submission_count(&self) -> u64 {
        self.ring.submission_count()
    }

    /// What the warp consumer last put on screen.
    pub fn swap_state(&self) -> SwapState {
        self.swap.read()
    }

    pub fn throttle_state(&self) -> ThrottleState {
        self.throttle.state()
    }

    /// Reader of the throttle flags for other threads.
    pub fn throttle_watch(&self) -> Reader<ThrottleState> {
        self.throttle_state.clone()
    }

    /// Notices raised since the last call, oldest first.
    pub fn take_notices(&mut self) -> Vec<ThrottleNotice> {
        std::mem::take(&mut self.notices)
    }

    /// `None` when `diagnostics.eye_log` is off.
    pub fn diagnostics(&mut self) -> Option<&mut DiagnosticsTap> {
        self.diagnostics.as_mut()
    }

    /// Seconds on the pipeline clock at which a frame started now, with
    /// `pipeline_depth` frames queued ahead of it, is expected mid-scanout.
    pub fn predicted_display_time(&self, pipeline_depth: u32) -> f64 {
        let vsync = self.timeline.fractional_vsync().floor();
        let minimum_vsyncs = self.throttle.program().minimum_vsyncs as f64;
        self.timeline
            .vsync_to_time(vsync + minimum_vsyncs * (pipeline_depth as f64 + 0.5))
            * 1e-9
    }

    /// Publishes `images` behind a fence inserted now.
    pub fn submit_frame(
        &mut self,
        images: EyeImageSet,
        options: &SubmitOptions,
    ) -> Result<SubmitOutcome, WarpError> {
        self.submit(images, None, options)
    }

    /// Publishes `images` behind a fence the host already inserted.
    pub fn submit_frame_with_fence(
        &mut self,
        images: EyeImageSet,
        fence: FenceHandle,
        options: &SubmitOptions,
    ) -> Result<SubmitOutcome, WarpError> {
        self.submit(images, Some(fence), options)
    }

    /// Stops the warp consumer after its current frame and blanks the screen.
    pub fn shutdown(self) -> Result<WarpReport, WarpError> {
        if self.realtime_producer {
            self.priority
                .set_priority(ThreadRole::Producer, PriorityLevel::Normal);
        }
        match self.consumer {
            Consumer::Threaded { thread, .. } => thread.shutdown(),
            Consumer::Inline(mut warp) => {
                warp.present_blank()?;
                Ok(warp.into_report())
            }
            Consumer::Exited(result) => result.unwrap_or(Err(WarpError::WarpThreadExited)),
        }
    }

    fn submit(
        &mut self,
        images: EyeImageSet,
        fence: Option<FenceHandle>,
        options: &SubmitOptions,
    ) -> Result<SubmitOutcome, WarpError> {
        let current = thread::current().id();
        assert!(
            current == self.producer,
            "submit_frame called from thread {current:?}; the pipeline was started on {:?}",
            self.producer
        );

        let images = if options.default_images {
            images.with_default_images()
        } else {
            images
        };
        let repeats = if options.flush { FLUSH_SUBMISSIONS } else { 1 };
        let mut outcome = SubmitOutcome::Ignored;
        for repeat in 0..repeats {
            let fence = if repeat == 0 { fence } else { None };
            outcome = self.submit_once(images, fence, options)?;
            if outcome == SubmitOutcome::Ignored {
                break;
            }
        }
        Ok(outcome)
    }

    fn submit_once(
        &mut self,
        images: EyeImageSet,
        fence: Option<FenceHandle>,
        options: &SubmitOptions,
    ) -> Result<SubmitOutcome, WarpError> {
        if let Some(fault) = self.fault.as_ref().and_then(WarpError::replay_gpu_fault) {
            return Err(fault);
        }
        if !self.consumer_running()? {
            tracing::warn!("warp thread is not running; submission ignored");
            return Ok(SubmitOutcome::Ignored);
        }

        let clock = Arc::clone(self.timeline.clock());
        let started = clock.now_nanos();

        // At most one frame of GPU work in flight.
        if self.last_fence != FenceHandle::NONE {
            let submission = self.ring.submission_count();
            match self.gpu.wait_fence(self.last_fence, self.fence_timeout) {
                FenceStatus::Signaled => {}
                FenceStatus::TimedOut => {
                    return Err(self.fatal(WarpError::FenceTimeout {
                        submission,
                        waited: self.fence_timeout,
                    }))
                }
                FenceStatus::Failed => return Err(self.fatal(WarpError::FenceFailed { submission })),
            }
        }

        self.throttle.update(
            clock.now_seconds(),
            self.power.as_mut(),
            &mut self.headset,
            &mut self.notices,
        );

        let program = self.throttle.program();
        let minimum_vsyncs = program
            .minimum_vsyncs
            .max(options.minimum_vsyncs.unwrap_or(1))
            .max(1);
        let base_vsync = self
            .last_swap_vsync
            .unwrap_or_else(|| self.timeline.fractional_vsync().floor() as i64);
        let minimum_vsync = base_vsync + minimum_vsyncs as i64 - 1;

        let completion_fence = fence.unwrap_or_else(|| self.gpu.insert_fence());
        let (submission, evicted) = self.ring.publish(WarpSource {
            submission: 0,
            minimum_vsync,
            first_displayed_vsync: [0, 0],
            completion_fence,
            disable_chromatic_correction: self.throttle.state().throttled,
            external_velocity: options.external_velocity,
            pre_schedule_seconds: options.pre_schedule_seconds,
            sliced: options.sliced,
            payload: images,
        });
        if let Some(evicted) = evicted {
            if evicted.completion_fence != FenceHandle::NONE {
                self.gpu.release_fence(evicted.completion_fence);
            }
        }
        self.last_fence = completion_fence;
        self.last_submit.publish(clock.now_seconds());

        let target = base_vsync + minimum_vsyncs as i64;
        match self.wait_for_release(target, submission - 1) {
            Released::At(vsync) => self.last_swap_vsync = Some(vsync),
            Released::ThreadExited => {
                self.on_thread_exit()?;
                return Ok(SubmitOutcome::Ignored);
            }
            Released::Failed(err) => return Err(self.fatal(err)),
        }

        let blocked = Duration::from_nanos((clock.now_nanos() - started).max(0.0) as u64);
        tracing::trace!(submission, minimum_vsync, ?blocked, "frame submitted");
        Ok(SubmitOutcome::Submitted {
            submission,
            minimum_vsync,
            blocked,
        })
    }

    /// Blocks until the consumer has shown vsync `target` with submission
    /// `previous` or a newer one on screen.
    fn wait_for_release(&mut self, target: i64, previous: u64) -> Released {
        let released = |state: SwapState| state.vsync_count >= target && state.eye_buffer_count >= previous;
        match &mut self.consumer {
            Consumer::Threaded { latched, .. } => {
                let period = Duration::from_nanos(self.timeline.period_nanos().max(1.0) as u64);
                loop {
                    let state = self.swap.read();
                    if released(state) {
                        return Released::At(state.vsync_count);
                    }
                    match latched.recv_timeout(period) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => return Released::ThreadExited,
                    }
                }
            }
            Consumer::Inline(warp) => loop {
                match warp.step() {
                    Ok(report) => {
                        tracing::trace!(
                            vsync = report.base,
                            submission = ?report.submission,
                            fresh = report.fresh,
                            "inline warp"
                        );
                        let state = self.swap.read();
                        if released(state) {
                            return Released::At(state.vsync_count);
                        }
                    }
                    Err(err) => return Released::Failed(err),
                }
            },
            Consumer::Exited(_) => Released::ThreadExited,
        }
    }

    fn consumer_running(&mut self) -> Result<bool, WarpError> {
        let finished = matches!(
            &self.consumer,
            Consumer::Threaded { thread, .. } if thread.is_finished()
        );
        if finished {
            return self.on_thread_exit();
        }
        Ok(!matches!(self.consumer, Consumer::Exited(_)))
    }

    /// Joins a warp thread that stopped by itself. A GPU fault it stopped on
    /// becomes the pipeline's fault.
    fn on_thread_exit(&mut self) -> Result<bool, WarpError> {
        let consumer = std::mem::replace(&mut self.consumer, Consumer::Exited(None));
        let result = match consumer {
            Consumer::Threaded { thread, .. } => thread.shutdown(),
            other => {
                self.consumer = other;
                return Ok(false);
            }
        };
        if let Err(err) = &result {
            self.fault = err.replay_gpu_fault();
        }
        self.consumer = Consumer::Exited(Some(result));
        match self.fault.as_ref().and_then(WarpError::replay_gpu_fault) {
            Some(fault) => Err(fault),
            None => Ok(false),
        }
    }

    fn fatal(&mut self, err: WarpError) -> WarpError {
        tracing::error!(%err, "GPU fault; the pipeline cannot continue");
        if let Some(fault) = err.replay_gpu_fault() {
            self.fault = Some(fault);
        }
        err
    }
}
