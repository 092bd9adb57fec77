use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use glam::Quat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use timewarp::{
    headset_events, vsync_estimator, Clock, Collaborators, ConstantRotation, EyeImage, EyeImageSet,
    NoPriorityControl, PipelineConfig, PolynomialDistortion, PosePredictor, RecordingSurface,
    SimulatedClock, SimulatedGpu, SubmitOptions, SubmitOutcome, SystemClock, TextureId,
    ThrottleNotice, ThrottleState, Topology, VsyncEstimator, WarpPipeline, WarpReport,
};
use tracing::{debug, info, warn};

use crate::cli::{ClockKind, RunArgs};
use crate::script::Script;

#[derive(Debug, Clone)]
pub struct SimOptions {
    pub clock: ClockKind,
    pub duration: Duration,
    pub render_cost: Duration,
    pub render_variance: f64,
    pub gpu_latency: Duration,
    pub stall: Option<(Duration, Duration)>,
    pub pulse_jitter: Duration,
    pub head_rate: f32,
    pub script: Script,
    pub seed: u64,
}

impl From<&RunArgs> for SimOptions {
    fn from(args: &RunArgs) -> Self {
        Self {
            clock: args.clock,
            duration: args.duration,
            render_cost: args.render_cost,
            render_variance: args.render_variance,
            gpu_latency: args.gpu_latency,
            stall: args.stall_at.zip(args.stall_for),
            pulse_jitter: args.pulse_jitter,
            head_rate: args.head_rate,
            script: args.script.clone().unwrap_or_default(),
            seed: args.seed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlockedStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl BlockedStats {
    fn record(&mut self, blocked: Duration) {
        self.count += 1;
        self.total += blocked;
        self.max = self.max.max(blocked);
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total / self.count as u32
    }
}

#[derive(Debug)]
pub struct SimOutcome {
    pub topology: Topology,
    pub elapsed: Duration,
    pub submissions: u64,
    pub ignored: u64,
    pub blocked: BlockedStats,
    /// Eye samples the host-side diagnostics tap received.
    pub streamed_samples: u64,
    pub throttle: ThrottleState,
    pub notices: Vec<ThrottleNotice>,
    pub warp: Option<WarpReport>,
    pub fault: Option<String>,
}

/// Time source of a run. Render cost and stalls either sleep or advance
/// virtual time.
enum SimTime {
    System(Arc<SystemClock>),
    Simulated(Arc<SimulatedClock>),
}

impl SimTime {
    fn clock(&self) -> Arc<dyn Clock> {
        match self {
            SimTime::System(clock) => clock.clone(),
            SimTime::Simulated(clock) => clock.clone(),
        }
    }

    fn spend(&self, duration: Duration) {
        match self {
            SimTime::System(_) => thread::sleep(duration),
            SimTime::Simulated(clock) => clock.advance(duration),
        }
    }
}

/// Display callback model: a pulse at every nominal refresh boundary,
/// stamped up to `jitter` late.
struct Display {
    estimator: VsyncEstimator,
    origin: f64,
    period: f64,
    jitter: f64,
    next: u64,
    rng: StdRng,
}

impl Display {
    fn new(estimator: VsyncEstimator, origin: f64, period: f64, jitter: Duration, seed: u64) -> Self {
        Self {
            estimator,
            origin,
            period,
            jitter: jitter.as_nanos() as f64,
            next: 0,
            rng: StdRng::seed_from_u64(seed.rotate_left(17)),
        }
    }

    fn next_boundary(&self) -> f64 {
        self.origin + self.next as f64 * self.period
    }

    /// Delivers every pulse due by `now`.
    fn catch_up(&mut self, now: f64) {
        while self.next_boundary() <= now {
            let noise = if self.jitter > 0.0 {
                self.rng.gen_range(0.0..=self.jitter)
            } else {
                0.0
            };
            self.estimator
                .on_vsync_pulse((self.next_boundary() + noise).min(now));
            self.next += 1;
        }
    }
}

/// Background display thread for wall-clock runs.
struct DisplayThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DisplayThread {
    fn spawn(mut display: Display, clock: Arc<dyn Clock>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("vsync".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    clock.sleep_until(display.next_boundary());
                    display.catch_up(clock.now_nanos());
                }
            })
            .context("failed to spawn display thread")?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for DisplayThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn stereo_frame(frame: u64, pose: Quat) -> EyeImageSet {
    // Two textures per frame, recycled over a three-frame swap chain.
    let base = (frame % 3) as u32 * 2 + 1;
    EyeImageSet::Stereo {
        left: EyeImage::new(TextureId(base), pose),
        right: EyeImage::new(TextureId(base + 1), pose),
    }
}

pub fn simulate(mut config: PipelineConfig, options: &SimOptions) -> Result<SimOutcome> {
    let time = match options.clock {
        ClockKind::System => SimTime::System(Arc::new(SystemClock::new(config.pipeline.sleep))),
        ClockKind::Simulated => {
            if config.pipeline.asynchronous {
                info!("simulated clock selected; warping on the producer thread");
                config.pipeline.asynchronous = false;
            }
            SimTime::Simulated(Arc::new(SimulatedClock::new()))
        }
    };
    let clock = time.clock();
    let period = config.vsync_period_nanos();

    let (mut estimator, timeline) = vsync_estimator(
        period,
        config.display.active_scanout_fraction,
        clock.clone(),
    );
    let origin = clock.now_nanos();
    estimator.on_vsync_pulse(origin);
    let mut display = Display::new(estimator, origin, period, options.pulse_jitter, options.seed);
    display.next = 1;

    let predictor = ConstantRotation::yaw(options.head_rate);
    let (surface, _surface_log) =
        RecordingSurface::new(config.display.width, config.display.height, true);
    let (mut headset, headset_watch) = headset_events();
    let table = config
        .distortion_table()
        .context("failed to resolve distortion table")?;
    let power_clock = clock.clone();
    let power_script = options.script.clone();
    let start_seconds = clock.now_seconds();

    let mut pipeline = WarpPipeline::start(
        &config,
        Collaborators {
            timeline,
            gpu: Arc::new(SimulatedGpu::new(clock.clone(), options.gpu_latency)),
            pose: Arc::new(predictor),
            surface: Box::new(surface),
            distortion: Arc::new(PolynomialDistortion::from_table(&table)),
            power: Box::new(move || {
                let elapsed = (power_clock.now_seconds() - start_seconds).max(0.0);
                power_script.power_at(Duration::from_secs_f64(elapsed))
            }),
            priority: Arc::new(NoPriorityControl),
            headset: headset_watch,
        },
    )
    .context("failed to start the warp pipeline")?;
    let topology = pipeline.topology();
    info!(%topology, refresh_hz = config.display.refresh_hz, "simulation started");

    let (mut display, _display_thread) = match &time {
        SimTime::System(_) => (None, Some(DisplayThread::spawn(display, clock.clone())?)),
        SimTime::Simulated(_) => (Some(display), None),
    };

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut cursor = options.script.headset_cursor();
    let mut stall = options.stall;
    let mut blocked = BlockedStats::default();
    let mut ignored = 0;
    let mut fault = None;
    let elapsed = |clock: &Arc<dyn Clock>| {
        Duration::from_secs_f64((clock.now_seconds() - start_seconds).max(0.0))
    };

    let submit_options = SubmitOptions::default();
    let mut frame = 0u64;
    while elapsed(&clock) < options.duration {
        cursor.deliver(elapsed(&clock), &mut headset);
        if let Some((at, length)) = stall {
            if elapsed(&clock) >= at {
                info!(?length, "producer stalling");
                time.spend(length);
                stall = None;
            }
        }

        let pose = predictor.predict_pose(pipeline.predicted_display_time(1));
        let spread = if options.render_variance > 0.0 {
            rng.gen_range(-options.render_variance..=options.render_variance)
        } else {
            0.0
        };
        time.spend(options.render_cost.mul_f64((1.0 + spread).max(0.0)));
        if let Some(display) = display.as_mut() {
            display.catch_up(clock.now_nanos());
        }

        match pipeline.submit_frame(stereo_frame(frame, pose), &submit_options) {
            Ok(SubmitOutcome::Submitted {
                submission,
                blocked: waited,
                ..
            }) => {
                blocked.record(waited);
                debug!(submission, blocked = ?waited, "frame released");
            }
            Ok(SubmitOutcome::Ignored) => {
                ignored += 1;
                warn!("warp consumer is gone; ending the run");
                break;
            }
            Err(err) => {
                warn!(%err, "submission failed; ending the run");
                fault = Some(err.to_string());
                break;
            }
        }
        if let Some(tap) = pipeline.diagnostics() {
            tap.drain();
        }
        frame += 1;
    }

    let run_time = elapsed(&clock);
    let submissions = pipeline.submission_count();
    let streamed_samples = pipeline
        .diagnostics()
        .map(|tap| {
            tap.drain();
            tap.log().total_logged()
        })
        .unwrap_or(0);
    let throttle = pipeline.throttle_state();
    let notices = pipeline.take_notices();
    let warp = match pipeline.shutdown() {
        Ok(report) => Some(report),
        Err(err) => {
            if fault.is_none() {
                fault = Some(err.to_string());
            }
            None
        }
    };

    Ok(SimOutcome {
        topology,
        elapsed: run_time,
        submissions,
        ignored,
        blocked,
        streamed_samples,
        throttle,
        notices,
        warp,
        fault,
    })
}
