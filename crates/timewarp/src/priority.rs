use std::sync::Arc;

use crate::lockless::Reader;

/// Producer idle time after which its real-time hint is dropped.
const PRODUCER_IDLE_SECONDS: f64 = 1.0;

/// Submissions this recent count as the producer having resumed.
const PRODUCER_RESUMED_SECONDS: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    Warp,
    Producer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityLevel {
    Normal,
    RealTime,
}

/// Platform scheduling hints. Implementations record the producer thread
/// when the pipeline starts so the warp thread can adjust it later.
pub trait PriorityControl: Send + Sync {
    fn set_priority(&self, role: ThreadRole, level: PriorityLevel);
}

/// Leaves scheduling alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPriorityControl;

impl PriorityControl for NoPriorityControl {
    fn set_priority(&self, role: ThreadRole, level: PriorityLevel) {
        tracing::debug!(?role, ?level, "thread priority request ignored");
    }
}

/// Drops the producer's real-time hint while it is not submitting, so a
/// paused application does not hold a real-time core for nothing.
pub(crate) struct ProducerWatchdog {
    last_submit: Reader<f64>,
    priority: Arc<dyn PriorityControl>,
    demoted: bool,
}

impl ProducerWatchdog {
    pub fn new(last_submit: Reader<f64>, priority: Arc<dyn PriorityControl>) -> Self {
        Self {
            last_submit,
            priority,
            demoted: false,
        }
    }

    pub fn check(&mut self, now_seconds: f64) {
        let last = self.last_submit.read();
        if last <= 0.0 {
            return;
        }
        let idle = now_seconds - last;
        if !self.demoted && idle > PRODUCER_IDLE_SECONDS {
            tracing::warn!(idle_seconds = idle, "producer stopped submitting; dropping its priority");
            self.priority
                .set_priority(ThreadRole::Producer, PriorityLevel::Normal);
            self.demoted = true;
        } else if self.demoted && idle < PRODUCER_RESUMED_SECONDS {
            tracing::info!("producer resumed; restoring its priority");
            self.priority
                .set_priority(ThreadRole::Producer, PriorityLevel::RealTime);
            self.demoted = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockless::slot_exchange;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(ThreadRole, PriorityLevel)>>,
    }

    impl PriorityControl for Recorder {
        fn set_priority(&self, role: ThreadRole, level: PriorityLevel) {
            self.calls.lock().push((role, level));
        }
    }

    #[test]
    fn idle_producer_is_demoted_then_restored() {
        let recorder = Arc::new(Recorder::default());
        let (mut last_submit, reader) = slot_exchange(0.0f64);
        let mut watchdog = ProducerWatchdog::new(reader, recorder.clone());

        watchdog.check(5.0);
        assert!(recorder.calls.lock().is_empty());

        last_submit.publish(5.0);
        watchdog.check(5.5);
        watchdog.check(6.2);
        watchdog.check(7.0);
        last_submit.publish(7.0);
        watchdog.check(7.05);

        assert_eq!(
            *recorder.calls.lock(),
            vec![
                (ThreadRole::Producer, PriorityLevel::Normal),
                (ThreadRole::Producer, PriorityLevel::RealTime),
            ]
        );
    }
}
