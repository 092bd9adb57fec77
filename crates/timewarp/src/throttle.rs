//! Thermal and power throttling policy.
//!
//! The platform reports a power level; the controller answers by doubling the
//! refreshes each frame occupies or by declaring that the session cannot
//! continue. Both states latch: going back to
//! [`PowerLevel::Normal`] does not undo them until the user takes the headset
//! off (power save) or removes the phone from it (cannot continue).

use std::time::Duration;

use serde::Serialize;

use crate::lockless::{slot_exchange, Publisher, Reader};
use crate::swap_program::SwapProgram;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerLevel {
    Normal,
    PowerSave,
    Minimum,
}

/// Platform source of the current power level.
pub trait PowerMonitor: Send {
    fn power_level(&mut self) -> PowerLevel;
}

impl<F> PowerMonitor for F
where
    F: FnMut() -> PowerLevel + Send,
{
    fn power_level(&mut self) -> PowerLevel {
        self()
    }
}

/// What the controller is waiting for before it changes state again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThrottleAction {
    None,
    WaitingForUnmount,
    WaitingForUndock,
    WaitingForReset,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThrottleState {
    /// Frames occupy twice the refreshes; chromatic correction is off.
    pub throttled: bool,
    pub cannot_continue: bool,
}

/// User-facing notices the host is expected to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThrottleNotice {
    PowerSaveEngaged,
    CannotContinue,
    Restored,
}

#[derive(Debug, Clone, Copy, Default)]
struct EdgeState {
    sequence: u64,
    active: bool,
}

/// Creates the callback half and the polling half of the headset state.
pub fn headset_events() -> (HeadsetEvents, HeadsetWatch) {
    let (mount, mount_reader) = slot_exchange(EdgeState {
        sequence: 0,
        active: true,
    });
    let (dock, dock_reader) = slot_exchange(EdgeState {
        sequence: 0,
        active: true,
    });
    (
        HeadsetEvents { mount, dock },
        HeadsetWatch {
            mount: mount_reader,
            dock: dock_reader,
            seen_mount: 0,
            seen_dock: 0,
        },
    )
}

/// Fed by the platform's mount and dock notifications.
pub struct HeadsetEvents {
    mount: Publisher<EdgeState>,
    dock: Publisher<EdgeState>,
}

impl HeadsetEvents {
    pub fn set_mounted(&mut self, mounted: bool) {
        let previous = self.mount.current();
        self.mount.publish(EdgeState {
            sequence: previous.sequence + 1,
            active: mounted,
        });
    }

    pub fn set_docked(&mut self, docked: bool) {
        let previous = self.dock.current();
        self.dock.publish(EdgeState {
            sequence: previous.sequence + 1,
            active: docked,
        });
    }
}

/// Edges observed since the previous poll, with the state they ended in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadsetEdges {
    pub mounted: Option<bool>,
    pub docked: Option<bool>,
}

pub struct HeadsetWatch {
    mount: Reader<EdgeState>,
    dock: Reader<EdgeState>,
    seen_mount: u64,
    seen_dock: u64,
}

impl HeadsetWatch {
    pub fn poll(&mut self) -> HeadsetEdges {
        let mount = self.mount.read();
        let dock = self.dock.read();
        let mut edges = HeadsetEdges::default();
        if mount.sequence != self.seen_mount {
            self.seen_mount = mount.sequence;
            edges.mounted = Some(mount.active);
        }
        if dock.sequence != self.seen_dock {
            self.seen_dock = dock.sequence;
            edges.docked = Some(dock.active);
        }
        edges
    }
}

pub struct ThrottleController {
    allow_power_save: bool,
    poll_interval: f64,
    remount_grace: f64,
    next_check: f64,
    mounted: bool,
    action: ThrottleAction,
    base_program: SwapProgram,
    state: Publisher<ThrottleState>,
    program: Publisher<SwapProgram>,
}

impl ThrottleController {
    /// Returns the controller with readers for its flags and the active
    /// swap program.
    pub fn new(
        allow_power_save: bool,
        poll_interval: Duration,
        remount_grace: Duration,
        base_program: SwapProgram,
    ) -> (Self, Reader<ThrottleState>, Reader<SwapProgram>) {
        let (state, state_reader) = slot_exchange(ThrottleState::default());
        let (program, program_reader) = slot_exchange(base_program);
        (
            Self {
                allow_power_save,
                poll_interval: poll_interval.as_secs_f64(),
                remount_grace: remount_grace.as_secs_f64(),
                next_check: 0.0,
                mounted: true,
                action: ThrottleAction::None,
                base_program,
                state,
                program,
            },
            state_reader,
            program_reader,
        )
    }

    pub fn action(&self) -> ThrottleAction {
        self.action
    }

    pub fn state(&self) -> ThrottleState {
        self.state.current()
    }

    pub fn program(&self) -> SwapProgram {
        self.program.current()
    }

    /// Applies headset edges, then polls the monitor if a check is due.
    /// Raised notices are appended to `notices` in that order.
    pub fn update(
        &mut self,
        now_seconds: f64,
        monitor: &mut dyn PowerMonitor,
        headset: &mut HeadsetWatch,
        notices: &mut Vec<ThrottleNotice>,
    ) {
        notices.extend(self.on_headset_edges(now_seconds, headset.poll()));
        if !self.mounted || now_seconds < self.next_check {
            return;
        }
        let level = monitor.power_level();
        notices.extend(self.observe(now_seconds, level));
    }

    pub fn on_headset_edges(&mut self, now_seconds: f64, edges: HeadsetEdges) -> Option<ThrottleNotice> {
        let mut notice = None;
        match edges.mounted {
            Some(false) => {
                self.mounted = false;
                if self.action == ThrottleAction::WaitingForUnmount {
                    tracing::info!("headset removed; throttle will reset on the next normal reading");
                    self.action = ThrottleAction::WaitingForReset;
                }
            }
            Some(true) => {
                self.mounted = true;
                self.next_check = now_seconds + self.remount_grace;
            }
            None => {}
        }
        if edges.docked == Some(false) && self.action == ThrottleAction::WaitingForUndock {
            tracing::info!("device undocked; clearing cannot-continue latch");
            self.action = ThrottleAction::None;
            notice = self.restore();
        }
        notice
    }

    /// Applies one power-level reading, at most once per poll interval.
    pub fn observe(&mut self, now_seconds: f64, level: PowerLevel) -> Option<ThrottleNotice> {
        if now_seconds < self.next_check {
            return None;
        }
        self.next_check = now_seconds + self.poll_interval;

        let state = self.state.current();
        match level {
            PowerLevel::Normal => {
                if self.action == ThrottleAction::WaitingForReset {
                    self.action = ThrottleAction::None;
                    return self.restore();
                }
                None
            }
            PowerLevel::PowerSave if self.allow_power_save => {
                if state.throttled {
                    return None;
                }
                tracing::warn!("power save engaged; reducing to half refresh rate");
                self.action = ThrottleAction::WaitingForUnmount;
                self.state.publish(ThrottleState {
                    throttled: true,
                    ..state
                });
                self.program.publish(self.base_program.throttled());
                Some(ThrottleNotice::PowerSaveEngaged)
            }
            PowerLevel::PowerSave | PowerLevel::Minimum => {
                if self.action == ThrottleAction::WaitingForUndock {
                    return None;
                }
                tracing::warn!(?level, "power level too low; application cannot continue");
                self.action = ThrottleAction::WaitingForUndock;
                self.state.publish(ThrottleState {
                    throttled: true,
                    cannot_continue: true,
                });
                self.program.publish(self.base_program.throttled());
                Some(ThrottleNotice::CannotContinue)
            }
        }
    }

    fn restore(&mut self) -> Option<ThrottleNotice> {
        if self.state.current() == ThrottleState::default() {
            return None;
        }
        tracing::info!("throttle cleared; restoring full refresh rate");
        self.state.publish(ThrottleState::default());
        self.program.publish(self.base_program);
        Some(ThrottleNotice::Restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(allow_power_save: bool) -> (ThrottleController, Reader<ThrottleState>, Reader<SwapProgram>) {
        ThrottleController::new(
            allow_power_save,
            Duration::from_secs(1),
            Duration::from_secs(5),
            SwapProgram::ASYNC_FRONT_BUFFER,
        )
    }

    #[test]
    fn readings_are_rate_limited() {
        let (mut throttle, state, _) = controller(true);
        assert_eq!(throttle.observe(10.0, PowerLevel::Normal), None);
        assert_eq!(throttle.observe(10.5, PowerLevel::PowerSave), None);
        assert!(!state.read().throttled);
        assert_eq!(
            throttle.observe(11.0, PowerLevel::PowerSave),
            Some(ThrottleNotice::PowerSaveEngaged)
        );
        assert!(state.read().throttled);
    }

    #[test]
    fn power_save_halves_rate_and_waits_for_unmount() {
        let (mut throttle, state, program) = controller(true);
        throttle.observe(1.0, PowerLevel::PowerSave);
        assert_eq!(throttle.action(), ThrottleAction::WaitingForUnmount);
        assert_eq!(program.read().minimum_vsyncs, 2);
        assert!(!state.read().cannot_continue);

        // Back to normal does nothing until the headset comes off.
        assert_eq!(throttle.observe(2.0, PowerLevel::Normal), None);
        assert!(state.read().throttled);
    }

    #[test]
    fn forbidden_power_save_cannot_continue() {
        let (mut throttle, state, _) = controller(false);
        assert_eq!(
            throttle.observe(1.0, PowerLevel::PowerSave),
            Some(ThrottleNotice::CannotContinue)
        );
        assert_eq!(throttle.action(), ThrottleAction::WaitingForUndock);
        assert!(state.read().cannot_continue);
        assert_eq!(throttle.observe(2.0, PowerLevel::PowerSave), None);
    }

    #[test]
    fn minimum_level_cannot_continue_regardless_of_policy() {
        let (mut throttle, state, _) = controller(true);
        assert_eq!(
            throttle.observe(1.0, PowerLevel::Minimum),
            Some(ThrottleNotice::CannotContinue)
        );
        assert!(state.read().cannot_continue);
    }

    #[test]
    fn unmount_then_normal_restores() {
        let (mut throttle, state, program) = controller(true);
        throttle.observe(1.0, PowerLevel::PowerSave);
        throttle.on_headset_edges(
            1.5,
            HeadsetEdges {
                mounted: Some(false),
                docked: None,
            },
        );
        assert_eq!(throttle.action(), ThrottleAction::WaitingForReset);
        assert_eq!(
            throttle.observe(2.0, PowerLevel::Normal),
            Some(ThrottleNotice::Restored)
        );
        assert_eq!(state.read(), ThrottleState::default());
        assert_eq!(program.read(), SwapProgram::ASYNC_FRONT_BUFFER);
    }

    #[test]
    fn undock_and_reading_in_one_poll_raise_both_notices() {
        let (mut throttle, state, _) = controller(true);
        let (mut events, mut watch) = headset_events();
        let mut notices = Vec::new();
        let mut minimum = || PowerLevel::Minimum;
        throttle.update(1.0, &mut minimum, &mut watch, &mut notices);
        assert_eq!(notices, [ThrottleNotice::CannotContinue]);

        notices.clear();
        events.set_docked(false);
        let mut power_save = || PowerLevel::PowerSave;
        throttle.update(2.0, &mut power_save, &mut watch, &mut notices);
        assert_eq!(
            notices,
            [ThrottleNotice::Restored, ThrottleNotice::PowerSaveEngaged]
        );
        assert_eq!(throttle.action(), ThrottleAction::WaitingForUnmount);
        assert!(state.read().throttled && !state.read().cannot_continue);
    }

    #[test]
    fn headset_watch_reports_each_edge_once() {
        let (mut events, mut watch) = headset_events();
        assert_eq!(watch.poll(), HeadsetEdges::default());
        events.set_mounted(false);
        events.set_docked(false);
        assert_eq!(
            watch.poll(),
            HeadsetEdges {
                mounted: Some(false),
                docked: Some(false),
            }
        );
        assert_eq!(watch.poll(), HeadsetEdges::default());
        events.set_mounted(true);
        assert_eq!(watch.poll().mounted, Some(true));
    }

    #[test]
    fn closures_are_power_monitors() {
        let mut readings = vec![PowerLevel::PowerSave, PowerLevel::Normal].into_iter();
        let mut monitor = move || readings.next().unwrap_or(PowerLevel::Normal);
        assert_eq!(monitor.power_level(), PowerLevel::PowerSave);
        assert_eq!(monitor.power_level(), PowerLevel::Normal);
        assert_eq!(monitor.power_level(), PowerLevel::Normal);
    }
}
