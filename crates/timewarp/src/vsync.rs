use std::sync::Arc;

use crate::clock::Clock;
use crate::lockless::{slot_exchange, Publisher, Reader};

/// Last observed refresh, as published by the display callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VsyncState {
    pub vsync_count: i64,
    pub vsync_period_nanos: f64,
    pub vsync_base_nanos: f64,
}

/// Builds the writer half (owned by the display callback) and the shared
/// read-only timeline.
///
/// Until the first pulse the timeline free-runs on the nominal period from
/// vsync 0 at the time of this call, so consumers never wait on a display
/// that has not reported yet.
pub fn vsync_estimator(
    nominal_period_nanos: f64,
    active_scanout_fraction: f64,
    clock: Arc<dyn Clock>,
) -> (VsyncEstimator, VsyncTimeline) {
    let (publisher, reader) = slot_exchange(VsyncState {
        vsync_count: 0,
        vsync_period_nanos: nominal_period_nanos,
        vsync_base_nanos: clock.now_nanos(),
    });
    (
        VsyncEstimator {
            publisher,
            nominal_period_nanos,
            pulses: 0,
        },
        VsyncTimeline {
            state: reader,
            clock,
            active_scanout_fraction,
        },
    )
}

/// Turns refresh callbacks into published [`VsyncState`] snapshots.
pub struct VsyncEstimator {
    publisher: Publisher<VsyncState>,
    nominal_period_nanos: f64,
    pulses: u64,
}

impl VsyncEstimator {
    /// Records a refresh that started at `timestamp_nanos`.
    ///
    /// Missed callbacks are absorbed by rounding the elapsed time to whole
    /// periods. The period itself is reset to the nominal refresh because
    /// panels differ slightly and the callback jitter dwarfs the difference.
    /// The first pulse continues the free-running count; it may predate the
    /// estimator.
    pub fn on_vsync_pulse(&mut self, timestamp_nanos: f64) {
        let mut state = self.publisher.current();
        let elapsed = timestamp_nanos - state.vsync_base_nanos;
        if elapsed < 0.0 && !self.is_free_running() {
            tracing::debug!(
                timestamp = timestamp_nanos,
                base = state.vsync_base_nanos,
                "ignoring vsync pulse older than the current base"
            );
            return;
        }
        if self.is_free_running() {
            tracing::debug!(timestamp = timestamp_nanos, "first vsync pulse");
        }
        let delta = (elapsed.max(0.0) / state.vsync_period_nanos).round() as i64;
        state.vsync_count += delta;
        state.vsync_period_nanos = self.nominal_period_nanos;
        state.vsync_base_nanos = timestamp_nanos;
        self.pulses += 1;
        self.publisher.publish(state);
    }

    /// No pulse has arrived yet.
    pub fn is_free_running(&self) -> bool {
        self.pulses == 0
    }

    pub fn state(&self) -> VsyncState {
        self.publisher.current()
    }
}

/// Read side of the estimator; cheap to clone into every thread.
#[derive(Clone)]
pub struct VsyncTimeline {
    state: Reader<VsyncState>,
    clock: Arc<dyn Clock>,
    active_scanout_fraction: f64,
}

impl VsyncTimeline {
    pub fn state(&self) -> VsyncState {
        self.state.read()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn period_nanos(&self) -> f64 {
        self.state().vsync_period_nanos
    }

    /// Vsync count plus progress through the current interval.
    pub fn fractional_vsync(&self) -> f64 {
        let state = self.state();
        let elapsed = self.clock.now_nanos() - state.vsync_base_nanos;
        state.vsync_count as f64 + elapsed / state.vsync_period_nanos
    }

    /// Wall-clock nanoseconds at which `frame_point` begins.
    pub fn vsync_to_time(&self, frame_point: f64) -> f64 {
        let state = self.state();
        state.vsync_base_nanos + (frame_point - state.vsync_count as f64) * state.vsync_period_nanos
    }

    /// Time at which the raster reaches `fraction` of the visible rows of the
    /// refresh starting at `base`. Blanking rows at the end of the interval
    /// carry no pixels, so the fraction is compressed into the active part.
    pub fn scanout_to_time(&self, base: f64, fraction: f64) -> f64 {
        self.vsync_to_time(base + fraction * self.active_scanout_fraction)
    }
}
