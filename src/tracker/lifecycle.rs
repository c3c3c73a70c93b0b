//! Activity status transitions and time arithmetic.
//!
//! ```text
//!            start              pause
//!   next ───────────> in_progress ─────> paused
//!    │                 │  ^                 │
//!    │                 │  └──── start ──────┤
//!    │          complete/cancel      complete/cancel
//!    │                 v                    v
//!    └── cancel ──> completed | cancelled ──┘
//!                        │
//!                     reopen ──> paused
//! ```

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{ActivityStatus, LogAction};
use crate::errors::TrackerError;

/// A user-triggered timer mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimerAction {
    Start,
    Pause,
    Complete,
    Cancel,
    Reopen,
}

impl TimerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Complete => "complete",
            Self::Cancel => "cancel",
            Self::Reopen => "reopen",
        }
    }
}

impl std::fmt::Display for TimerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "pause" => Ok(Self::Pause),
            "complete" => Ok(Self::Complete),
            "cancel" => Ok(Self::Cancel),
            "reopen" => Ok(Self::Reopen),
            _ => Err(format!("Invalid timer action: {}", s)),
        }
    }
}

/// Status an activity moves to when `action` is applied in state `from`.
pub fn next_status(from: ActivityStatus, action: TimerAction) -> Result<ActivityStatus, TrackerError> {
    use ActivityStatus::*;

    let to = match (action, from) {
        (TimerAction::Start, Next | Paused) => InProgress,
        (TimerAction::Pause, InProgress) => Paused,
        (TimerAction::Complete, InProgress | Paused) => Completed,
        (TimerAction::Cancel, Next | InProgress | Paused) => Cancelled,
        (TimerAction::Reopen, Completed | Cancelled) => Paused,
        _ => return Err(TrackerError::InvalidTransition { from, action }),
    };
    Ok(to)
}

/// Audit-log entry recorded for a transition.
pub fn log_action(from: ActivityStatus, action: TimerAction) -> LogAction {
    match action {
        TimerAction::Start if from == ActivityStatus::Paused => LogAction::Resumed,
        TimerAction::Start => LogAction::Started,
        TimerAction::Pause => LogAction::Paused,
        TimerAction::Complete => LogAction::Completed,
        TimerAction::Cancel => LogAction::Cancelled,
        TimerAction::Reopen => LogAction::Reopened,
    }
}

/// Whether applying `action` stops the activity's open session.
pub fn closes_session(action: TimerAction) -> bool {
    matches!(
        action,
        TimerAction::Pause | TimerAction::Complete | TimerAction::Cancel
    )
}

/// Whole seconds between two instants, never negative.
pub fn elapsed_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_seconds().max(0)
}

/// Accumulated time plus the running session, if any.
pub fn live_tracked_seconds(
    total_seconds: i64,
    running_since: Option<&str>,
    now: DateTime<Utc>,
) -> i64 {
    let running = running_since
        .and_then(|s| parse_timestamp(s).ok())
        .map(|start| elapsed_seconds(start, now))
        .unwrap_or(0);
    total_seconds + running
}

/// Canonical storage format for timestamps (`YYYY-MM-DDTHH:MM:SSZ`).
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp: {}", s))
}
