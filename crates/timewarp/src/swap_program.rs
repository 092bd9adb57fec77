use std::fmt;

use crate::source::Eye;

/// When each eye is warped relative to a base vsync.
///
/// `delta_vsync[eye]` is the fraction of a refresh after the base vsync
/// before that eye may start warping. `prediction_points[eye]` is the
/// fractional-vsync window `[start, stop]` over which that eye is scanned
/// out; its ends timestamp the two pose samples of a rolling warp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapProgram {
    /// Warps run on the producer thread inside `submit_frame`.
    pub single_threaded: bool,
    /// Both eyes are scanned out together and share one schedule.
    pub dual_mono_display: bool,
    pub delta_vsync: [f64; 2],
    pub prediction_points: [[f64; 2]; 2],
    /// Refreshes each submitted frame must occupy at least.
    pub minimum_vsyncs: u32,
}

impl SwapProgram {
    /// Each eye is drawn into the front buffer half a refresh ahead of the
    /// raster reaching it.
    pub const ASYNC_FRONT_BUFFER: Self = Self {
        single_threaded: false,
        dual_mono_display: false,
        delta_vsync: [0.5, 1.0],
        prediction_points: [[1.0, 1.5], [1.5, 2.0]],
        minimum_vsyncs: 1,
    };

    pub const ASYNC_SWAPPED_BUFFER: Self = Self {
        single_threaded: false,
        dual_mono_display: false,
        delta_vsync: [0.0, 0.5],
        prediction_points: [[1.0, 1.5], [1.5, 2.0]],
        minimum_vsyncs: 1,
    };

    pub const SYNC_FRONT_BUFFER: Self = Self {
        single_threaded: true,
        dual_mono_display: false,
        delta_vsync: [0.5, 1.0],
        prediction_points: [[1.0, 1.5], [1.5, 2.0]],
        minimum_vsyncs: 1,
    };

    /// Both eyes right at the frame boundary so the swap is never missed;
    /// the image appears one refresh later.
    pub const SYNC_SWAPPED_BUFFER: Self = Self {
        single_threaded: true,
        dual_mono_display: false,
        delta_vsync: [0.0, 0.0],
        prediction_points: [[2.0, 2.5], [2.5, 3.0]],
        minimum_vsyncs: 1,
    };

    pub fn with_minimum_vsyncs(mut self, minimum_vsyncs: u32) -> Self {
        self.minimum_vsyncs = minimum_vsyncs.max(1);
        self
    }

    /// Program used while thermally throttled: twice the refreshes per frame.
    pub fn throttled(self) -> Self {
        let doubled = self.minimum_vsyncs.saturating_mul(2).max(2);
        self.with_minimum_vsyncs(doubled)
    }

    fn slot(&self, eye: Eye) -> usize {
        if self.dual_mono_display {
            0
        } else {
            eye.index()
        }
    }

    /// Fractional vsync at which `eye` may begin warping.
    pub fn wake_point(&self, eye: Eye, base: i64) -> f64 {
        base as f64 + self.delta_vsync[self.slot(eye)]
    }

    /// Scanout window of `eye` in fractional vsyncs.
    pub fn prediction_window(&self, eye: Eye, base: i64) -> [f64; 2] {
        let [start, stop] = self.prediction_points[self.slot(eye)];
        [base as f64 + start, base as f64 + stop]
    }

    /// Nominal pose time for `eye`, the middle of its scanout window.
    pub fn prediction_point(&self, eye: Eye, base: i64) -> f64 {
        let [start, stop] = self.prediction_window(eye, base);
        0.5 * (start + stop)
    }
}

/// Presentation topology, fixed when the pipeline starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    AsyncFrontBuffer,
    AsyncSwappedBuffer,
    SyncFrontBuffer,
    SyncSwappedBuffer,
}

impl Topology {
    pub fn new(asynchronous: bool, front_buffer: bool) -> Self {
        match (asynchronous, front_buffer) {
            (true, true) => Topology::AsyncFrontBuffer,
            (true, false) => Topology::AsyncSwappedBuffer,
            (false, true) => Topology::SyncFrontBuffer,
            (false, false) => Topology::SyncSwappedBuffer,
        }
    }

    pub fn is_asynchronous(self) -> bool {
        matches!(
            self,
            Topology::AsyncFrontBuffer | Topology::AsyncSwappedBuffer
        )
    }

    pub fn is_front_buffer(self) -> bool {
        matches!(self, Topology::AsyncFrontBuffer | Topology::SyncFrontBuffer)
    }

    pub fn program(self) -> SwapProgram {
        match self {
            Topology::AsyncFrontBuffer => SwapProgram::ASYNC_FRONT_BUFFER,
            Topology::AsyncSwappedBuffer => SwapProgram::ASYNC_SWAPPED_BUFFER,
            Topology::SyncFrontBuffer => SwapProgram::SYNC_FRONT_BUFFER,
            Topology::SyncSwappedBuffer => SwapProgram::SYNC_SWAPPED_BUFFER,
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Topology::AsyncFrontBuffer => "async-front-buffer",
            Topology::AsyncSwappedBuffer => "async-swapped-buffer",
            Topology::SyncFrontBuffer => "sync-front-buffer",
            Topology::SyncSwappedBuffer => "sync-swapped-buffer",
        };
        f.write_str(label)
    }
}
