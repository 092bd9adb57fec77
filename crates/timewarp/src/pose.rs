use glam::{Mat4, Quat, Vec3};

/// Quaternions shorter than this are treated as uninitialised.
const MIN_VALID_LENGTH_SQUARED: f32 = 0.95;

/// Head orientation prediction supplied by the tracking stack.
pub trait PosePredictor: Send + Sync {
    /// Orientation expected at `time_seconds` on the pipeline clock.
    fn predict_pose(&self, time_seconds: f64) -> Quat;
}

impl<F> PosePredictor for F
where
    F: Fn(f64) -> Quat + Send + Sync,
{
    fn predict_pose(&self, time_seconds: f64) -> Quat {
        self(time_seconds)
    }
}

/// Head turning at a constant rate about a fixed axis.
#[derive(Debug, Clone, Copy)]
pub struct ConstantRotation {
    axis: Vec3,
    radians_per_second: f32,
}

impl ConstantRotation {
    pub fn new(axis: Vec3, radians_per_second: f32) -> Self {
        Self {
            axis: axis.normalize_or_zero(),
            radians_per_second,
        }
    }

    pub fn yaw(radians_per_second: f32) -> Self {
        Self::new(Vec3::Y, radians_per_second)
    }
}

impl PosePredictor for ConstantRotation {
    fn predict_pose(&self, time_seconds: f64) -> Quat {
        if self.axis == Vec3::ZERO {
            return Quat::IDENTITY;
        }
        let angle = (time_seconds * self.radians_per_second as f64) % std::f64::consts::TAU;
        Quat::from_axis_angle(self.axis, angle as f32)
    }
}

fn is_valid(orientation: Quat) -> bool {
    orientation.length_squared() > MIN_VALID_LENGTH_SQUARED
}

/// Replaces uninitialised orientations so the warp degrades to identity.
pub fn sanitize(rendered: Quat, predicted: Quat) -> (Quat, Quat) {
    match (is_valid(rendered), is_valid(predicted)) {
        (true, true) => (rendered, predicted),
        (false, true) => (predicted, predicted),
        (true, false) => (rendered, rendered),
        (false, false) => (Quat::IDENTITY, Quat::IDENTITY),
    }
}

/// Rotation taking the view an image was rendered from to the predicted view.
pub fn time_warp_delta(rendered: Quat, predicted: Quat) -> Quat {
    let (from, to) = sanitize(rendered, predicted);
    (from.normalize() * to.normalize().conjugate()).normalize()
}

pub fn time_warp_matrix(rendered: Quat, predicted: Quat) -> Mat4 {
    Mat4::from_quat(time_warp_delta(rendered, predicted))
}
