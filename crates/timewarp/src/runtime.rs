use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};

use crate::error::WarpError;
use crate::lockless::{slot_exchange, Publisher, Reader};
use crate::priority::{PriorityControl, PriorityLevel, ProducerWatchdog, ThreadRole};
use crate::warp::{WarpLoop, WarpReport};

/// Owns the background warp thread. Dropping it stops the thread.
pub(crate) struct WarpThread {
    shutdown: Publisher<bool>,
    join_handle: Option<JoinHandle<Result<WarpReport, WarpError>>>,
}

impl WarpThread {
    pub fn spawn(
        warp: WarpLoop,
        watchdog: Option<ProducerWatchdog>,
        priority: Arc<dyn PriorityControl>,
    ) -> Result<Self, WarpError> {
        let (shutdown, shutdown_reader) = slot_exchange(false);
        let (ready_tx, ready_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("timewarp".into())
            .spawn(move || run_warp_thread(warp, shutdown_reader, watchdog, priority, ready_tx))
            .map_err(WarpError::Spawn)?;

        ready_rx.recv().map_err(|_| WarpError::WarpThreadExited)?;

        Ok(Self {
            shutdown,
            join_handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Lets the in-flight frame complete, then joins the thread.
    pub fn shutdown(mut self) -> Result<WarpReport, WarpError> {
        let Some(handle) = self.join_handle.take() else {
            return Err(WarpError::WarpThreadExited);
        };
        self.shutdown.publish(true);
        handle
            .join()
            .map_err(|payload| WarpError::WarpThreadPanicked(panic_message(payload.as_ref())))?
    }
}

impl Drop for WarpThread {
    fn drop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            self.shutdown.publish(true);
            let _ = handle.join();
        }
    }
}

fn run_warp_thread(
    mut warp: WarpLoop,
    shutdown: Reader<bool>,
    mut watchdog: Option<ProducerWatchdog>,
    priority: Arc<dyn PriorityControl>,
    ready_tx: Sender<()>,
) -> Result<WarpReport, WarpError> {
    priority.set_priority(ThreadRole::Warp, PriorityLevel::RealTime);
    tracing::info!("warp thread started");
    let _ = ready_tx.send(());

    let outcome = loop {
        if shutdown.read() {
            break Ok(());
        }
        if let Err(err) = warp.step() {
            break Err(err);
        }
        if let Some(watchdog) = watchdog.as_mut() {
            watchdog.check(warp.timeline().clock().now_seconds());
        }
    };

    let phase = warp.phase();
    let blanked = warp.present_blank();
    priority.set_priority(ThreadRole::Warp, PriorityLevel::Normal);
    match outcome {
        Ok(()) => {
            blanked?;
            let report = warp.into_report();
            tracing::info!(
                frames = report.totals.frames,
                held = report.totals.held_frames,
                vsync = report.last_vsync,
                "warp thread stopped"
            );
            Ok(report)
        }
        Err(err) => {
            tracing::error!(%err, ?phase, "warp thread stopped on a fatal error");
            Err(err)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
