use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::distortion::EyeMesh;
use crate::error::WarpError;
use crate::source::{Eye, EyeTexture};
use crate::uniforms::WarpUniforms;

/// What the surface granted on acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceInfo {
    pub width: u32,
    pub height: u32,
    /// Writes go straight to the buffer being scanned out.
    pub front_buffer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One distortion-corrected draw into the current region.
#[derive(Debug, Clone)]
pub struct WarpDraw<'a> {
    pub vsync: i64,
    pub eye: Eye,
    /// `None` draws black.
    pub texture: Option<EyeTexture>,
    pub submission: Option<u64>,
    pub minimum_vsync: Option<i64>,
    /// The source was already shown on this eye at an earlier vsync.
    pub held: bool,
    pub uniforms: WarpUniforms,
    pub mesh: &'a EyeMesh,
}

/// Window or display the warp renders into.
pub trait PresentationSurface: Send {
    /// Binds the surface to the calling thread. `front_buffer` is a request;
    /// the returned info says whether it was honoured.
    fn acquire(&mut self, front_buffer: bool) -> Result<SurfaceInfo, WarpError>;

    fn begin_region(&mut self, region: Region);

    fn draw(&mut self, draw: &WarpDraw<'_>);

    fn end_region(&mut self);

    /// Waits for issued draws to reach the display. Used between front-buffer
    /// eyes.
    fn finish(&mut self) {}

    /// Swaps buffers. Front-buffer surfaces may treat this as a flush.
    fn present(&mut self) -> Result<(), WarpError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresentedEye {
    pub vsync: i64,
    pub eye: Eye,
    pub submission: Option<u64>,
    pub minimum_vsync: Option<i64>,
    pub held: bool,
    pub chromatic: bool,
    pub region: Option<Region>,
}

#[derive(Debug, Default)]
struct Record {
    draws: Vec<PresentedEye>,
    presents: u64,
    finishes: u64,
}

/// Shared view of what a [`RecordingSurface`] was asked to show.
#[derive(Debug, Clone, Default)]
pub struct SurfaceLog {
    record: Arc<Mutex<Record>>,
}

impl SurfaceLog {
    pub fn draws(&self) -> Vec<PresentedEye> {
        self.record.lock().draws.clone()
    }

    pub fn presents(&self) -> u64 {
        self.record.lock().presents
    }

    pub fn finishes(&self) -> u64 {
        self.record.lock().finishes
    }
}

/// Headless surface that records every draw; used by the simulator and tests.
#[derive(Debug)]
pub struct RecordingSurface {
    width: u32,
    height: u32,
    supports_front_buffer: bool,
    region: Option<Region>,
    log: SurfaceLog,
}

impl RecordingSurface {
    pub fn new(width: u32, height: u32, supports_front_buffer: bool) -> (Self, SurfaceLog) {
        let log = SurfaceLog::default();
        (
            Self {
                width,
                height,
                supports_front_buffer,
                region: None,
                log: log.clone(),
            },
            log,
        )
    }
}

impl PresentationSurface for RecordingSurface {
    fn acquire(&mut self, front_buffer: bool) -> Result<SurfaceInfo, WarpError> {
        Ok(SurfaceInfo {
            width: self.width,
            height: self.height,
            front_buffer: front_buffer && self.supports_front_buffer,
        })
    }

    fn begin_region(&mut self, region: Region) {
        self.region = Some(region);
    }

    fn draw(&mut self, draw: &WarpDraw<'_>) {
        self.log.record.lock().draws.push(PresentedEye {
            vsync: draw.vsync,
            eye: draw.eye,
            submission: draw.submission,
            minimum_vsync: draw.minimum_vsync,
            held: draw.held,
            chromatic: draw.uniforms.chromatic(),
            region: self.region,
        });
    }

    fn end_region(&mut self) {
        self.region = None;
    }

    fn finish(&mut self) {
        self.log.record.lock().finishes += 1;
    }

    fn present(&mut self) -> Result<(), WarpError> {
        self.log.record.lock().presents += 1;
        Ok(())
    }
}
