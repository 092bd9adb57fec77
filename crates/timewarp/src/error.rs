use std::time::Duration;

use warpconfig::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum WarpError {
    #[error("fence of submission {submission} did not signal within {waited:?}")]
    FenceTimeout { submission: u64, waited: Duration },
    #[error("driver reported a failed fence for submission {submission}")]
    FenceFailed { submission: u64 },
    #[error("warp thread has exited")]
    WarpThreadExited,
    #[error("warp thread panicked: {0}")]
    WarpThreadPanicked(String),
    #[error("presentation surface error: {0}")]
    Surface(String),
    #[error("failed to spawn warp thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WarpError {
    /// Driver faults after which the pipeline cannot guess display content.
    pub fn is_gpu_fault(&self) -> bool {
        matches!(
            self,
            WarpError::FenceTimeout { .. } | WarpError::FenceFailed { .. }
        )
    }

    /// A copy of a GPU fault, so it can be reported on every later call.
    pub(crate) fn replay_gpu_fault(&self) -> Option<WarpError> {
        match *self {
            WarpError::FenceTimeout { submission, waited } => {
                Some(WarpError::FenceTimeout { submission, waited })
            }
            WarpError::FenceFailed { submission } => Some(WarpError::FenceFailed { submission }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_gpu_faults_replay() {
        let timeout = WarpError::FenceTimeout {
            submission: 4,
            waited: Duration::from_secs(2),
        };
        assert!(matches!(
            timeout.replay_gpu_fault(),
            Some(WarpError::FenceTimeout { submission: 4, .. })
        ));
        assert!(WarpError::WarpThreadExited.replay_gpu_fault().is_none());
        assert_eq!(
            timeout.to_string(),
            "fence of submission 4 did not signal within 2s"
        );
    }
}
