use std::sync::Arc;
use std::time::Duration;

use glam::Quat;
use parking_lot::Mutex;
use timewarp::{
    headset_events, vsync_estimator, Clock, Collaborators, ConstantRotation, EyeImage, EyeImageSet,
    HeadsetEvents, NoPriorityControl, PipelineConfig, PolynomialDistortion, PowerLevel,
    RecordingSurface, SimulatedClock, SimulatedGpu, SubmitOptions, SurfaceLog, TextureId,
    ThrottleNotice, ThrottleState, WarpPipeline,
};

struct Rig {
    pipeline: WarpPipeline,
    events: HeadsetEvents,
    power: Arc<Mutex<PowerLevel>>,
    clock: Arc<SimulatedClock>,
    log: SurfaceLog,
}

fn rig(allow_power_save: bool) -> Rig {
    let mut config = PipelineConfig::default();
    config.pipeline.asynchronous = false;
    config.pipeline.front_buffer = false;
    config.pipeline.allow_power_save = allow_power_save;
    config.throttle.poll_interval = Duration::from_millis(10);
    config.throttle.remount_grace = Duration::ZERO;

    let clock = Arc::new(SimulatedClock::new());
    let (mut estimator, timeline) = vsync_estimator(
        config.vsync_period_nanos(),
        config.display.active_scanout_fraction,
        clock.clone(),
    );
    estimator.on_vsync_pulse(clock.now_nanos());
    let (surface, log) = RecordingSurface::new(config.display.width, config.display.height, false);
    let (events, headset) = headset_events();
    let power = Arc::new(Mutex::new(PowerLevel::Normal));
    let monitor = Arc::clone(&power);
    let table = config.distortion_table().unwrap();
    let pipeline = WarpPipeline::start(
        &config,
        Collaborators {
            timeline,
            gpu: Arc::new(SimulatedGpu::new(clock.clone(), Duration::from_millis(2))),
            pose: Arc::new(ConstantRotation::yaw(0.5)),
            surface: Box::new(surface),
            distortion: Arc::new(PolynomialDistortion::from_table(&table)),
            power: Box::new(move || *monitor.lock()),
            priority: Arc::new(NoPriorityControl),
            headset,
        },
    )
    .unwrap();
    Rig {
        pipeline,
        events,
        power,
        clock,
        log,
    }
}

impl Rig {
    /// Submits one frame after `render_ms` of rendering; returns the
    /// refreshes it occupied.
    fn frame(&mut self, render_ms: u64) -> i64 {
        let before = self.pipeline.swap_state().vsync_count;
        self.clock.advance(Duration::from_millis(render_ms));
        let images = EyeImageSet::Mono(EyeImage::new(TextureId(7), Quat::IDENTITY));
        self.pipeline
            .submit_frame(images, &SubmitOptions::default())
            .unwrap();
        self.pipeline.swap_state().vsync_count - before
    }

    fn set_power(&self, level: PowerLevel) {
        *self.power.lock() = level;
    }
}

#[test]
fn power_save_halves_the_rate_until_the_headset_comes_off() {
    let mut rig = rig(true);
    rig.frame(0);
    assert_eq!(rig.frame(4), 1);

    rig.set_power(PowerLevel::PowerSave);
    rig.frame(4);
    assert_eq!(
        rig.pipeline.throttle_state(),
        ThrottleState {
            throttled: true,
            cannot_continue: false
        }
    );
    assert_eq!(rig.frame(4), 2);
    assert!(rig.log.draws().last().is_some_and(|draw| !draw.chromatic));

    // Latched: normal readings alone do not restore the rate.
    rig.set_power(PowerLevel::Normal);
    for _ in 0..3 {
        assert_eq!(rig.frame(4), 2);
    }
    assert!(rig.pipeline.throttle_watch().read().throttled);

    rig.events.set_mounted(false);
    rig.frame(4);
    assert!(rig.pipeline.throttle_state().throttled);
    rig.events.set_mounted(true);
    rig.frame(4);
    assert_eq!(rig.pipeline.throttle_state(), ThrottleState::default());
    assert_eq!(rig.frame(4), 1);
    assert!(rig.log.draws().last().is_some_and(|draw| draw.chromatic));

    assert_eq!(
        rig.pipeline.take_notices(),
        vec![ThrottleNotice::PowerSaveEngaged, ThrottleNotice::Restored]
    );
    assert!(rig.pipeline.take_notices().is_empty());
}

#[test]
fn refused_power_save_latches_cannot_continue_until_undocked() {
    let mut rig = rig(false);
    rig.frame(0);

    rig.set_power(PowerLevel::PowerSave);
    rig.frame(4);
    let state = rig.pipeline.throttle_state();
    assert!(state.throttled && state.cannot_continue);

    rig.set_power(PowerLevel::Normal);
    rig.events.set_mounted(false);
    rig.frame(4);
    rig.events.set_mounted(true);
    for _ in 0..3 {
        rig.frame(4);
    }
    assert!(rig.pipeline.throttle_state().cannot_continue);

    rig.events.set_docked(false);
    rig.frame(4);
    assert_eq!(rig.pipeline.throttle_state(), ThrottleState::default());
    assert_eq!(
        rig.pipeline.take_notices(),
        vec![ThrottleNotice::CannotContinue, ThrottleNotice::Restored]
    );
}

#[test]
fn minimum_power_is_fatal_to_the_session_even_when_power_save_is_allowed() {
    let mut rig = rig(true);
    rig.frame(0);
    rig.set_power(PowerLevel::Minimum);
    rig.frame(4);
    assert!(rig.pipeline.throttle_state().cannot_continue);
    assert_eq!(rig.pipeline.take_notices(), vec![ThrottleNotice::CannotContinue]);
}
