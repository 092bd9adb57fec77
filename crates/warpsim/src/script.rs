use std::time::Duration;

use timewarp::{HeadsetEvents, PowerLevel};

use crate::cli::parse_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptAction {
    Power(PowerLevel),
    Mounted(bool),
    Docked(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptEvent {
    /// Offset from the start of the run.
    pub at: Duration,
    pub action: ScriptAction,
}

/// Timed power-level and headset changes, ordered by time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    events: Vec<ScriptEvent>,
}

impl Script {
    pub fn new(mut events: Vec<ScriptEvent>) -> Self {
        events.sort_by_key(|event| event.at);
        Self { events }
    }

    pub fn events(&self) -> &[ScriptEvent] {
        &self.events
    }

    /// The power level the platform reports `elapsed` into the run.
    pub fn power_at(&self, elapsed: Duration) -> PowerLevel {
        self.events
            .iter()
            .take_while(|event| event.at <= elapsed)
            .filter_map(|event| match event.action {
                ScriptAction::Power(level) => Some(level),
                _ => None,
            })
            .last()
            .unwrap_or(PowerLevel::Normal)
    }

    pub fn headset_cursor(&self) -> HeadsetCursor {
        HeadsetCursor {
            events: self
                .events
                .iter()
                .filter(|event| !matches!(event.action, ScriptAction::Power(_)))
                .copied()
                .collect(),
            next: 0,
        }
    }
}

/// Replays the mount and dock entries of a [`Script`] once each.
#[derive(Debug, Clone)]
pub struct HeadsetCursor {
    events: Vec<ScriptEvent>,
    next: usize,
}

impl HeadsetCursor {
    /// Delivers every headset event due by `elapsed`; returns how many fired.
    pub fn deliver(&mut self, elapsed: Duration, headset: &mut HeadsetEvents) -> usize {
        let mut fired = 0;
        while let Some(event) = self.events.get(self.next) {
            if event.at > elapsed {
                break;
            }
            match event.action {
                ScriptAction::Mounted(mounted) => headset.set_mounted(mounted),
                ScriptAction::Docked(docked) => headset.set_docked(docked),
                ScriptAction::Power(_) => {}
            }
            tracing::info!(at = ?event.at, action = ?event.action, "script event");
            self.next += 1;
            fired += 1;
        }
        fired
    }
}

/// Parses `TIME=EVENT[,TIME=EVENT...]`.
pub fn parse_script(value: &str) -> Result<Script, String> {
    let mut events = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (at, action) = entry
            .split_once('=')
            .ok_or_else(|| format!("script entry '{entry}' is not TIME=EVENT"))?;
        let at = parse_duration(at)?;
        let action = match action.trim().to_ascii_lowercase().as_str() {
            "normal" => ScriptAction::Power(PowerLevel::Normal),
            "powersave" | "power-save" => ScriptAction::Power(PowerLevel::PowerSave),
            "minimum" => ScriptAction::Power(PowerLevel::Minimum),
            "mount" => ScriptAction::Mounted(true),
            "unmount" => ScriptAction::Mounted(false),
            "dock" => ScriptAction::Docked(true),
            "undock" => ScriptAction::Docked(false),
            other => {
                return Err(format!(
                    "unknown script event '{other}'; expected normal, powersave, minimum, mount, unmount, dock or undock"
                ))
            }
        };
        events.push(ScriptEvent { at, action });
    }
    if events.is_empty() {
        return Err("script must contain at least one TIME=EVENT entry".into());
    }
    Ok(Script::new(events))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_orders_entries() {
        let script = parse_script("5s=normal, 2s=powersave,4s=unmount").unwrap();
        let times: Vec<_> = script.events().iter().map(|e| e.at.as_secs()).collect();
        assert_eq!(times, vec![2, 4, 5]);
        assert_eq!(script.events()[1].action, ScriptAction::Mounted(false));
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_script("").is_err());
        assert!(parse_script("2s").is_err());
        assert!(parse_script("2s=overclock").is_err());
        assert!(parse_script("later=normal").is_err());
    }

    #[test]
    fn power_level_follows_the_latest_due_entry() {
        let script = parse_script("1s=powersave,2s=mount,3s=normal").unwrap();
        assert_eq!(script.power_at(Duration::from_millis(500)), PowerLevel::Normal);
        assert_eq!(script.power_at(Duration::from_millis(2500)), PowerLevel::PowerSave);
        assert_eq!(script.power_at(Duration::from_secs(3)), PowerLevel::Normal);
    }

    #[test]
    fn headset_events_fire_once() {
        let script = parse_script("1s=unmount,2s=mount,3s=minimum").unwrap();
        let (mut events, _watch) = timewarp::headset_events();
        let mut cursor = script.headset_cursor();
        assert_eq!(cursor.deliver(Duration::ZERO, &mut events), 0);
        assert_eq!(cursor.deliver(Duration::from_secs(5), &mut events), 2);
        assert_eq!(cursor.deliver(Duration::from_secs(6), &mut events), 0);
    }
}
