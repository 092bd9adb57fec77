use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use glam::Quat;
use timewarp::surface::PresentedEye;
use timewarp::{
    headset_events, vsync_estimator, Clock, Collaborators, ConstantRotation, Eye, EyeImage,
    EyeImageSet, NoPriorityControl, PipelineConfig, PolynomialDistortion, PowerLevel,
    RecordingSurface, SimulatedClock, SimulatedGpu, SubmitOptions, SubmitOutcome, SurfaceLog,
    SystemClock, TextureId, Topology, VsyncEstimator, WarpError, WarpPipeline,
};

const PERIOD_NANOS: f64 = 1e9 / 60.0;

struct Fixture {
    pipeline: WarpPipeline,
    clock: Arc<SimulatedClock>,
    gpu: Arc<SimulatedGpu>,
    log: SurfaceLog,
    estimator: VsyncEstimator,
}

fn stereo() -> EyeImageSet {
    EyeImageSet::Stereo {
        left: EyeImage::new(TextureId(1), Quat::IDENTITY),
        right: EyeImage::new(TextureId(2), Quat::IDENTITY),
    }
}

fn start(config: &PipelineConfig, clock: Arc<dyn Clock>, gpu: Arc<SimulatedGpu>, front_buffer: bool) -> (WarpPipeline, SurfaceLog, VsyncEstimator) {
    let (pipeline, log, mut estimator) = start_without_pulse(config, clock.clone(), gpu, front_buffer);
    estimator.on_vsync_pulse(clock.now_nanos());
    (pipeline, log, estimator)
}

/// The display callback has not fired yet when the pipeline starts.
fn start_without_pulse(
    config: &PipelineConfig,
    clock: Arc<dyn Clock>,
    gpu: Arc<SimulatedGpu>,
    front_buffer: bool,
) -> (WarpPipeline, SurfaceLog, VsyncEstimator) {
    let (estimator, timeline) = vsync_estimator(
        config.vsync_period_nanos(),
        config.display.active_scanout_fraction,
        clock.clone(),
    );
    let (surface, log) = RecordingSurface::new(config.display.width, config.display.height, front_buffer);
    let (_events, headset) = headset_events();
    let table = config.distortion_table().expect("distortion table");
    let pipeline = WarpPipeline::start(
        config,
        Collaborators {
            timeline,
            gpu,
            pose: Arc::new(ConstantRotation::yaw(1.0)),
            surface: Box::new(surface),
            distortion: Arc::new(PolynomialDistortion::from_table(&table)),
            power: Box::new(|| PowerLevel::Normal),
            priority: Arc::new(NoPriorityControl),
            headset,
        },
    )
    .expect("start pipeline");
    (pipeline, log, estimator)
}

fn sync_fixture(front_buffer: bool, tweak: impl FnOnce(&mut PipelineConfig)) -> Fixture {
    let mut config = PipelineConfig::default();
    config.pipeline.asynchronous = false;
    config.pipeline.front_buffer = front_buffer;
    tweak(&mut config);
    let clock = Arc::new(SimulatedClock::new());
    let gpu = Arc::new(SimulatedGpu::new(clock.clone(), Duration::from_millis(4)));
    let (pipeline, log, estimator) = start(&config, clock.clone(), gpu.clone(), true);
    Fixture {
        pipeline,
        clock,
        gpu,
        log,
        estimator,
    }
}

impl Fixture {
    /// Display callback: stamps the most recent refresh boundary.
    fn pulse(&mut self) {
        let timeline = self.pipeline.timeline();
        let vsync = timeline.fractional_vsync().floor();
        let stamp = timeline.vsync_to_time(vsync);
        self.estimator.on_vsync_pulse(stamp);
    }

    fn submit(&mut self) -> (u64, i64, Duration) {
        match self
            .pipeline
            .submit_frame(stereo(), &SubmitOptions::default())
            .expect("submit")
        {
            SubmitOutcome::Submitted {
                submission,
                minimum_vsync,
                blocked,
            } => (submission, minimum_vsync, blocked),
            SubmitOutcome::Ignored => panic!("submission ignored"),
        }
    }
}

fn frames(draws: &[PresentedEye]) -> BTreeMap<i64, Vec<&PresentedEye>> {
    let mut frames: BTreeMap<i64, Vec<&PresentedEye>> = BTreeMap::new();
    for draw in draws {
        frames.entry(draw.vsync).or_default().push(draw);
    }
    frames
}

#[test]
fn fast_producer_is_held_to_the_refresh_rate() {
    let mut fixture = sync_fixture(false, |_| {});
    assert_eq!(fixture.pipeline.topology(), Topology::SyncSwappedBuffer);

    let start = fixture.clock.now_nanos();
    let mut blocked = Duration::ZERO;
    let mut submissions = 0;
    while fixture.clock.now_nanos() - start < 1e9 {
        fixture.clock.advance(Duration::from_millis(8));
        fixture.pulse();
        let (_, _, waited) = fixture.submit();
        blocked += waited;
        submissions += 1;
    }

    assert!((59..=61).contains(&submissions), "{submissions} submissions");
    let blocked = blocked.as_secs_f64();
    assert!((0.45..=0.6).contains(&blocked), "blocked {blocked}s");

    let draws = fixture.log.draws();
    let frames = frames(&draws);
    assert!((59..=61).contains(&frames.len()), "{} frames", frames.len());
    let mut previous = 0;
    for (vsync, eyes) in &frames {
        assert_eq!(eyes.len(), 2);
        assert_eq!(eyes[0].submission, eyes[1].submission);
        let submission = eyes[0].submission.expect("frame has a source");
        assert!(submission > previous, "submission {submission} repeated at {vsync}");
        previous = submission;
        assert!(eyes.iter().all(|eye| eye.minimum_vsync.is_some_and(|m| m < *vsync)));
    }
    assert!(fixture.gpu.max_outstanding() <= 1);
}

#[test]
fn each_submission_costs_one_refresh_even_when_free() {
    let mut fixture = sync_fixture(false, |_| {});
    let mut minimums = Vec::new();
    let mut swaps = Vec::new();
    for _ in 0..10 {
        let (_, minimum_vsync, _) = fixture.submit();
        minimums.push(minimum_vsync);
        swaps.push(fixture.pipeline.swap_state().vsync_count);
    }
    assert!(minimums.windows(2).all(|pair| pair[1] == pair[0] + 1), "{minimums:?}");
    assert!(swaps.windows(2).all(|pair| pair[1] == pair[0] + 1), "{swaps:?}");
    let elapsed_vsyncs = fixture.pipeline.timeline().fractional_vsync();
    assert!(elapsed_vsyncs >= 9.99 && elapsed_vsyncs <= 10.01, "{elapsed_vsyncs}");
}

#[test]
fn requested_minimum_vsyncs_halve_the_rate() {
    let mut fixture = sync_fixture(true, |config| config.pipeline.minimum_vsyncs = 2);
    assert_eq!(fixture.pipeline.topology(), Topology::SyncFrontBuffer);
    let swaps: Vec<i64> = (0..6)
        .map(|_| {
            fixture.submit();
            fixture.pipeline.swap_state().vsync_count
        })
        .collect();
    assert!(swaps.windows(2).all(|pair| pair[1] - pair[0] == 2), "{swaps:?}");
}

#[test]
fn flush_submits_three_times() {
    let mut fixture = sync_fixture(false, |_| {});
    let options = SubmitOptions {
        flush: true,
        ..SubmitOptions::default()
    };
    let outcome = fixture.pipeline.submit_frame(stereo(), &options).unwrap();
    assert!(matches!(outcome, SubmitOutcome::Submitted { submission: 3, .. }));
    assert_eq!(fixture.pipeline.submission_count(), 3);
}

#[test]
fn default_images_replace_missing_eyes() {
    let mut fixture = sync_fixture(false, |_| {});
    let images = EyeImageSet::Mono(EyeImage {
        texture: None,
        ..EyeImage::new(TextureId(5), Quat::IDENTITY)
    });
    let options = SubmitOptions {
        default_images: true,
        ..SubmitOptions::default()
    };
    fixture.pipeline.submit_frame(images, &options).unwrap();
    let draws = fixture.log.draws();
    assert_eq!(draws.len(), 2);
    assert!(draws.iter().all(|draw| draw.submission == Some(1)));
}

#[test]
fn hung_gpu_is_fatal_and_stays_fatal() {
    let mut fixture = sync_fixture(false, |config| {
        config.pipeline.fence_timeout = Duration::from_millis(100);
    });
    fixture.submit();
    fixture.gpu.hang();
    fixture.submit();

    let err = fixture
        .pipeline
        .submit_frame(stereo(), &SubmitOptions::default())
        .unwrap_err();
    assert!(matches!(err, WarpError::FenceTimeout { submission: 2, .. }), "{err}");
    let again = fixture
        .pipeline
        .submit_frame(stereo(), &SubmitOptions::default())
        .unwrap_err();
    assert!(again.is_gpu_fault());
}

#[test]
fn submitting_from_another_thread_panics() {
    let fixture = sync_fixture(false, |_| {});
    let mut pipeline = fixture.pipeline;
    let result = thread::spawn(move || {
        let _ = pipeline.submit_frame(stereo(), &SubmitOptions::default());
    })
    .join();
    assert!(result.is_err());
}

#[test]
fn shutdown_blanks_both_eyes() {
    let mut fixture = sync_fixture(false, |_| {});
    fixture.submit();
    fixture.submit();
    let log = fixture.log.clone();
    let report = fixture.pipeline.shutdown().unwrap();
    let draws = log.draws();
    let tail = &draws[draws.len() - 2..];
    assert!(tail.iter().all(|draw| draw.submission.is_none()));
    assert_eq!(report.totals.frames, 2);
    assert_eq!(report.eye_log.len(), 4);
}

#[test]
fn front_buffer_request_degrades_without_support() {
    let mut config = PipelineConfig::default();
    config.pipeline.asynchronous = false;
    let clock = Arc::new(SimulatedClock::new());
    let gpu = Arc::new(SimulatedGpu::new(clock.clone(), Duration::from_millis(1)));
    let (pipeline, _log, _estimator) = start(&config, clock, gpu, false);
    assert_eq!(pipeline.topology(), Topology::SyncSwappedBuffer);
}

#[test]
fn predicted_display_time_lands_mid_frame() {
    let fixture = sync_fixture(false, |_| {});
    let now = fixture.clock.now_seconds();
    let predicted = fixture.pipeline.predicted_display_time(1);
    let expected = now + 1.5 * PERIOD_NANOS * 1e-9;
    assert!((predicted - expected).abs() < 1e-6, "{predicted} vs {expected}");
}

#[test]
fn asynchronous_stall_holds_the_last_frame_every_refresh() {
    let config = PipelineConfig::default();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
    let gpu = Arc::new(SimulatedGpu::new(clock.clone(), Duration::from_millis(1)));
    let (mut pipeline, log, _estimator) = start(&config, clock, gpu, true);
    assert_eq!(pipeline.topology(), Topology::AsyncFrontBuffer);

    let options = SubmitOptions::default();
    for _ in 0..12 {
        thread::sleep(Duration::from_millis(8));
        pipeline.submit_frame(stereo(), &options).unwrap();
    }
    let stalled = pipeline.submission_count();
    thread::sleep(Duration::from_millis(500));
    for _ in 0..6 {
        thread::sleep(Duration::from_millis(8));
        pipeline.submit_frame(stereo(), &options).unwrap();
    }

    let tap = pipeline.diagnostics().expect("eye log enabled");
    tap.drain();
    assert!(!tap.log().is_empty());

    let report = pipeline.shutdown().unwrap();
    let samples = report.eye_log.snapshot();
    for pair in samples.chunks(2) {
        assert_eq!(pair[0].eye, Eye::Left);
        assert_eq!(pair[1].vsync, pair[0].vsync);
        assert_eq!(pair[1].buffer_num, pair[0].buffer_num);
    }
    let held = samples
        .iter()
        .filter(|s| s.eye == Eye::Left && s.skipped && s.buffer_num == stalled)
        .count();
    assert!((24..=40).contains(&held), "{held} held refreshes");

    let draws = log.draws();
    assert!(draws[draws.len() - 2..].iter().all(|d| d.submission.is_none()));
    assert_eq!(log.presents(), 1);
}

#[test]
fn asynchronous_fence_timeout_is_reported_to_the_producer() {
    let mut config = PipelineConfig::default();
    config.pipeline.fence_timeout = Duration::from_millis(50);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
    let gpu = Arc::new(SimulatedGpu::new(clock.clone(), Duration::from_millis(1)));
    gpu.hang();
    let (mut pipeline, _log, _estimator) = start(&config, clock, gpu, true);

    let options = SubmitOptions::default();
    let mut fault = None;
    for _ in 0..10 {
        if let Err(err) = pipeline.submit_frame(stereo(), &options) {
            fault = Some(err);
            break;
        }
    }
    let fault = fault.expect("hung fence surfaced");
    assert!(fault.is_gpu_fault(), "{fault}");
    let again = pipeline.submit_frame(stereo(), &options).unwrap_err();
    assert!(again.is_gpu_fault());
}

#[test]
fn submissions_before_the_first_vsync_pulse_still_return() {
    let (done_tx, done_rx) = bounded(1);
    // The pipeline must live on its producer thread, so the whole session
    // runs on a helper that reports back.
    thread::spawn(move || {
        let mut config = PipelineConfig::default();
        config.pipeline.asynchronous = false;
        let clock = Arc::new(SimulatedClock::new());
        let gpu = Arc::new(SimulatedGpu::new(clock.clone(), Duration::from_millis(4)));
        let (mut pipeline, log, estimator) = start_without_pulse(&config, clock, gpu, false);
        let outcomes: Vec<SubmitOutcome> = (0..3)
            .map(|_| pipeline.submit_frame(stereo(), &SubmitOptions::default()).unwrap())
            .collect();
        let free_running = estimator.is_free_running();
        let swap = pipeline.swap_state();
        let _ = done_tx.send((outcomes, free_running, swap, log.draws()));
    });

    let (outcomes, free_running, swap, draws) = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("submit_frame returned while no vsync pulse has arrived");
    assert!(free_running);
    assert!(outcomes
        .iter()
        .all(|outcome| matches!(outcome, SubmitOutcome::Submitted { .. })));
    assert_eq!(swap.eye_buffer_count, 3);
    assert_eq!(swap.vsync_count, 3);
    assert!(draws.iter().any(|draw| draw.submission == Some(1)));
}

#[test]
fn producer_waits_for_its_previous_frame_to_reach_the_screen() {
    let config = PipelineConfig::default();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
    // Each frame's GPU work outlasts a refresh.
    let gpu = Arc::new(SimulatedGpu::new(clock.clone(), Duration::from_millis(25)));
    let (mut pipeline, _log, _estimator) = start(&config, clock, gpu, false);
    assert_eq!(pipeline.topology(), Topology::AsyncSwappedBuffer);

    let options = SubmitOptions::default();
    let mut displayed = Vec::new();
    for _ in 0..20 {
        let SubmitOutcome::Submitted { submission, .. } =
            pipeline.submit_frame(stereo(), &options).unwrap()
        else {
            panic!("submission ignored");
        };
        let swap = pipeline.swap_state();
        assert!(
            swap.eye_buffer_count + 1 >= submission,
            "released for submission {submission} with {} on screen",
            swap.eye_buffer_count
        );
        displayed.push(swap.eye_buffer_count);
    }
    assert!(displayed.windows(2).all(|pair| pair[1] >= pair[0]), "{displayed:?}");

    let report = pipeline.shutdown().unwrap();
    assert!(report.totals.frames > 20);
    assert_eq!(report.totals.dropped_submissions, 0);
}
