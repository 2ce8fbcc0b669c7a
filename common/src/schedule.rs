use chrono::{DateTime, FixedOffset, NaiveTime, Timelike};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::paths::TIMER_KEY_PREFIX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerAction {
    TurnOn,
    TurnOff,
}

impl TimerAction {
    pub fn desired_state(self) -> bool {
        matches!(self, Self::TurnOn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerTime {
    pub hour: u8,
    pub minute: u8,
}

impl TriggerTime {
    /// Parses the `HH:MM` form stored by the app.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let padded = raw.len() == 5
            && raw
                .bytes()
                .enumerate()
                .all(|(i, byte)| if i == 2 { byte == b':' } else { byte.is_ascii_digit() });
        if !padded {
            return None;
        }
        let time = NaiveTime::parse_from_str(raw, "%H:%M").ok()?;
        Some(Self {
            hour: time.hour() as u8,
            minute: time.minute() as u8,
        })
    }

    pub fn matches(self, local: &DateTime<FixedOffset>) -> bool {
        u32::from(self.hour) == local.hour() && u32::from(self.minute) == local.minute()
    }
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    time: String,
    action: TimerAction,
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub trigger_time: TriggerTime,
    pub action: TimerAction,
    pub enabled: bool,
}

impl ScheduleEntry {
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let raw = RawEntry::deserialize(value).map_err(|err| err.to_string())?;
        let trigger_time =
            TriggerTime::parse(&raw.time).ok_or_else(|| format!("invalid time `{}`", raw.time))?;

        Ok(Self {
            trigger_time,
            action: raw.action,
            enabled: raw.enabled,
        })
    }
}

/// Timer entries keyed by their backend key, in the order the backend returned them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleMap {
    entries: Vec<(String, ScheduleEntry)>,
}

impl ScheduleMap {
    pub fn from_value(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::default();
        };

        let mut entries = Vec::with_capacity(object.len());
        for (key, raw) in object {
            if !key.starts_with(TIMER_KEY_PREFIX) {
                debug!("ignoring non-timer key `{key}`");
                continue;
            }
            match ScheduleEntry::from_value(raw) {
                Ok(entry) => entries.push((key.clone(), entry)),
                Err(reason) => warn!("skipping timer `{key}`: {reason}"),
            }
        }

        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScheduleEntry)> {
        self.entries.iter().map(|(key, entry)| (key.as_str(), entry))
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleEvaluator {
    interval_ms: u64,
    last_check_ms: Option<u64>,
    last_fired_minute: Option<i64>,
}

impl ScheduleEvaluator {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_check_ms: None,
            last_fired_minute: None,
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.last_check_ms
            .map(|last| now_ms.saturating_sub(last) >= self.interval_ms)
            .unwrap_or(true)
    }

    pub fn mark_checked(&mut self, now_ms: u64) {
        self.last_check_ms = Some(now_ms);
    }

    /// Desired state to write for the current minute, if any entry fires and
    /// would change `observed`. When conflicting entries fire together the
    /// last one in backend order wins.
    pub fn evaluate(
        &self,
        schedule: &ScheduleMap,
        local: &DateTime<FixedOffset>,
        observed: bool,
    ) -> Option<bool> {
        if self.last_fired_minute == Some(minute_index(local)) {
            debug!("schedule already fired this minute");
            return None;
        }

        let mut desired = None;
        for (key, entry) in schedule.iter() {
            if !entry.enabled || !entry.trigger_time.matches(local) {
                continue;
            }
            let target = entry.action.desired_state();
            if target == observed {
                debug!("timer `{key}` already satisfied");
                continue;
            }
            info!("timer `{key}` fired: {:?}", entry.action);
            desired = Some(target);
        }
        desired
    }

    /// Records that a write was issued for the minute containing `local`.
    pub fn mark_fired(&mut self, local: &DateTime<FixedOffset>) {
        self.last_fired_minute = Some(minute_index(local));
    }
}

fn minute_index(local: &DateTime<FixedOffset>) -> i64 {
    local.timestamp().div_euclid(60)
}
