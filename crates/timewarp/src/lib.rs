//! Asynchronous time-warp pipeline.
//!
//! Decouples an application's eye-image rendering rate from the display's
//! fixed refresh. The producer submits stereo images behind a GPU fence; the
//! warp consumer re-projects the newest completed submission with a freshly
//! predicted head pose just before each eye is scanned out. The overall flow
//! is:
//!
//! ```text
//!   display callback ──▶ VsyncEstimator ──▶ VsyncTimeline ◀──────────────┐
//!                                              │                         │
//!   producer ── submit_frame() ──▶ SourceRing ─┼─▶ WarpLoop ──▶ surface  │
//!      ▲            │                          │   (warp thread or       │
//!      │            └─▶ ThrottleController ────┘    inline when sync)    │
//!      └──────────────── SwapState ◀───────────────────┘ ────────────────┘
//! ```
//!
//! Every piece of cross-thread state travels through the wait-free
//! [`lockless`] exchange; the hot path takes no locks. Presentation, GPU
//! fences, pose prediction, lens distortion, power levels and thread
//! priority are collaborator traits so the core runs headless against the
//! simulated implementations shipped here.

pub mod clock;
pub mod diagnostics;
pub mod distortion;
pub mod error;
pub mod fence;
pub mod lockless;
pub mod pipeline;
pub mod pose;
pub mod priority;
mod runtime;
pub mod source;
pub mod surface;
pub mod swap_program;
pub mod throttle;
pub mod uniforms;
pub mod vsync;
mod warp;

pub use clock::{Clock, SimulatedClock, SystemClock};
pub use diagnostics::{DiagnosticsTap, EyeLog, EyeSample, WarpTotals, EYE_LOG_COUNT};
pub use distortion::{Distortion, PolynomialDistortion, WarpMesh};
pub use error::WarpError;
pub use fence::{FenceHandle, FenceStatus, GpuSync, SimulatedGpu};
pub use pipeline::{Collaborators, SubmitOptions, SubmitOutcome, WarpPipeline};
pub use pose::{ConstantRotation, PosePredictor};
pub use priority::{NoPriorityControl, PriorityControl, PriorityLevel, ThreadRole};
pub use source::{Eye, EyeImage, EyeImageSet, ExternalHandle, TextureId};
pub use surface::{PresentationSurface, RecordingSurface, SurfaceLog};
pub use swap_program::{SwapProgram, Topology};
pub use throttle::{headset_events, HeadsetEvents, PowerLevel, PowerMonitor, ThrottleNotice, ThrottleState};
pub use vsync::{vsync_estimator, VsyncEstimator, VsyncTimeline};
pub use warp::{SwapState, WarpReport, DEFAULT_PRE_SCHEDULE_SECONDS};
pub use warpconfig::PipelineConfig;
