use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;

/// Opaque GPU completion fence. The zero handle stands for "no fence" and is
/// always signalled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub u64);

impl FenceHandle {
    pub const NONE: Self = Self(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    /// Still pending when the timeout elapsed.
    TimedOut,
    /// The driver reported an error for this fence.
    Failed,
}

/// Fence operations of the rendering context.
pub trait GpuSync: Send + Sync {
    /// Inserts a fence after all work issued so far.
    fn insert_fence(&self) -> FenceHandle;

    /// Waits up to `timeout` for the fence. A zero timeout polls.
    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> FenceStatus;

    fn release_fence(&self, fence: FenceHandle);
}

#[derive(Debug, Clone, Copy)]
struct SimulatedFence {
    ready_at: f64,
}

/// GPU stand-in whose fences signal a fixed latency after insertion.
pub struct SimulatedGpu {
    clock: Arc<dyn Clock>,
    latency_nanos: AtomicU64,
    next_id: AtomicU64,
    fences: Mutex<HashMap<u64, SimulatedFence>>,
    hung: AtomicBool,
    max_outstanding: AtomicU64,
}

impl SimulatedGpu {
    pub fn new(clock: Arc<dyn Clock>, latency: Duration) -> Self {
        Self {
            clock,
            latency_nanos: AtomicU64::new(latency.as_nanos() as u64),
            next_id: AtomicU64::new(1),
            fences: Mutex::new(HashMap::new()),
            hung: AtomicBool::new(false),
            max_outstanding: AtomicU64::new(0),
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_nanos
            .store(latency.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Fences inserted from now on never signal.
    pub fn hang(&self) {
        self.hung.store(true, Ordering::SeqCst);
    }

    /// Highest number of unsignalled fences seen when a new one was inserted.
    pub fn max_outstanding(&self) -> u64 {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    fn status(&self, fence: FenceHandle) -> Option<f64> {
        self.fences.lock().get(&fence.0).map(|f| f.ready_at)
    }
}

impl GpuSync for SimulatedGpu {
    fn insert_fence(&self) -> FenceHandle {
        let now = self.clock.now_nanos();
        let ready_at = if self.hung.load(Ordering::SeqCst) {
            f64::INFINITY
        } else {
            now + self.latency_nanos.load(Ordering::SeqCst) as f64
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut fences = self.fences.lock();
        let outstanding = fences.values().filter(|f| f.ready_at > now).count() as u64;
        self.max_outstanding.fetch_max(outstanding, Ordering::SeqCst);
        fences.insert(id, SimulatedFence { ready_at });
        FenceHandle(id)
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> FenceStatus {
        if fence == FenceHandle::NONE {
            return FenceStatus::Signaled;
        }
        // Released fences have already retired.
        let Some(ready_at) = self.status(fence) else {
            return FenceStatus::Signaled;
        };
        let now = self.clock.now_nanos();
        if ready_at <= now {
            return FenceStatus::Signaled;
        }
        if timeout.is_zero() {
            return FenceStatus::TimedOut;
        }
        let deadline = now + timeout.as_nanos() as f64;
        self.clock.sleep_until(ready_at.min(deadline));
        if ready_at <= self.clock.now_nanos() {
            FenceStatus::Signaled
        } else {
            FenceStatus::TimedOut
        }
    }

    fn release_fence(&self, fence: FenceHandle) {
        self.fences.lock().remove(&fence.0);
    }
}
