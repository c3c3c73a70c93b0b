use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Member => "member",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "manager" => Ok(Self::Manager),
            "member" => Ok(Self::Member),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Next,
    InProgress,
    Paused,
    Completed,
    Cancelled,
}

impl ActivityStatus {
    pub const ALL: [ActivityStatus; 5] = [
        Self::Next,
        Self::InProgress,
        Self::Paused,
        Self::Completed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Next => "next",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed and cancelled activities accept no timer actions except reopen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "next" => Ok(Self::Next),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid activity status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Kind of entry written to the activity audit log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Created,
    Updated,
    Started,
    Resumed,
    Paused,
    AutoPaused,
    Completed,
    Cancelled,
    Reopened,
    TimeAdjusted,
    SubtaskAdded,
    SubtaskCompleted,
    SubtaskReopened,
    SubtaskDeleted,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Started => "started",
            Self::Resumed => "resumed",
            Self::Paused => "paused",
            Self::AutoPaused => "auto_paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Reopened => "reopened",
            Self::TimeAdjusted => "time_adjusted",
            Self::SubtaskAdded => "subtask_added",
            Self::SubtaskCompleted => "subtask_completed",
            Self::SubtaskReopened => "subtask_reopened",
            Self::SubtaskDeleted => "subtask_deleted",
        }
    }
}

impl std::fmt::Display for LogAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "started" => Ok(Self::Started),
            "resumed" => Ok(Self::Resumed),
            "paused" => Ok(Self::Paused),
            "auto_paused" => Ok(Self::AutoPaused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "reopened" => Ok(Self::Reopened),
            "time_adjusted" => Ok(Self::TimeAdjusted),
            "subtask_added" => Ok(Self::SubtaskAdded),
            "subtask_completed" => Ok(Self::SubtaskCompleted),
            "subtask_reopened" => Ok(Self::SubtaskReopened),
            "subtask_deleted" => Ok(Self::SubtaskDeleted),
            _ => Err(format!("Invalid log action: {}", s)),
        }
    }
}

// ── Organization ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sector {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plant {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub location: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub sector_id: Option<i64>,
    pub active: bool,
    #[serde(skip)]
    pub password_hash: String,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub sector_id: Option<i64>,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

// ── Activities ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub status: ActivityStatus,
    pub priority: Priority,
    pub sector_id: Option<i64>,
    pub plant_id: Option<i64>,
    pub project_id: Option<i64>,
    pub assignee_id: Option<i64>,
    pub created_by: i64,
    /// Seconds from closed sessions plus manual adjustments.
    pub total_seconds: i64,
    /// Start of the open session while `status == InProgress`.
    pub running_since: Option<String>,
    pub due_date: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: i64,
    pub activity_id: i64,
    pub title: String,
    pub done: bool,
    pub position: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySession {
    pub id: i64,
    pub activity_id: i64,
    pub user_id: i64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLog {
    pub id: i64,
    pub activity_id: i64,
    pub user_id: i64,
    pub action: LogAction,
    pub message: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeAdjustment {
    pub id: i64,
    pub activity_id: i64,
    pub user_id: i64,
    pub previous_seconds: i64,
    pub new_seconds: i64,
    pub delta_seconds: i64,
    pub reason: String,
    pub created_at: String,
}

// API view types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityView {
    #[serde(flatten)]
    pub activity: Activity,
    /// `total_seconds` plus the running session, as of the read.
    pub tracked_seconds: i64,
    pub subtasks_total: i64,
    pub subtasks_done: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityDetail {
    pub activity: ActivityView,
    pub subtasks: Vec<Subtask>,
    pub sessions: Vec<ActivitySession>,
    pub logs: Vec<ActivityLog>,
    pub adjustments: Vec<TimeAdjustment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTimer {
    pub activity: ActivityView,
    pub session: ActivitySession,
}

/// Result of a timer mutation. `auto_paused` is the activity whose timer was
/// stopped to keep a single running timer per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerOutcome {
    pub activity: Activity,
    pub auto_paused: Option<Activity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEntry {
    pub id: i64,
    pub activity_id: i64,
    pub activity_title: String,
    pub sector_id: Option<i64>,
    pub user_id: i64,
    pub user_name: String,
    pub action: LogAction,
    pub message: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceEntry {
    pub user_id: i64,
    pub name: String,
    pub sector_id: Option<i64>,
    pub connections: usize,
    pub since: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusCounts {
    pub next: i64,
    pub in_progress: i64,
    pub paused: i64,
    pub completed: i64,
    pub cancelled: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: ActivityStatus, n: i64) {
        match status {
            ActivityStatus::Next => self.next += n,
            ActivityStatus::InProgress => self.in_progress += n,
            ActivityStatus::Paused => self.paused += n,
            ActivityStatus::Completed => self.completed += n,
            ActivityStatus::Cancelled => self.cancelled += n,
        }
    }

    pub fn total(&self) -> i64 {
        self.next + self.in_progress + self.paused + self.completed + self.cancelled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProductivity {
    pub user_id: i64,
    pub name: String,
    pub tracked_seconds: i64,
    pub sessions: i64,
    pub completed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectorProductivity {
    pub sector_id: Option<i64>,
    pub name: String,
    pub tracked_seconds: i64,
    pub activities: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardStats {
    pub from: Option<String>,
    pub to: Option<String>,
    pub status_counts: StatusCounts,
    pub tracked_seconds: i64,
    pub completed_in_range: i64,
    pub by_user: Vec<UserProductivity>,
    pub by_sector: Vec<SectorProductivity>,
    pub by_priority: BTreeMap<String, i64>,
}

// ── Mutation payloads ────────────────────────────────────────────────

/// Deserialize a present field (including `null`) as `Some(..)` so patches
/// can tell "clear this" apart from "leave unchanged".
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Insert payload for `users`; the password is already hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub role: Role,
    pub sector_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPatch {
    pub name: Option<String>,
    pub role: Option<Role>,
    #[serde(default, deserialize_with = "double_option")]
    pub sector_id: Option<Option<i64>>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SectorPatch {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlantPatch {
    pub name: Option<String>,
    pub code: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub sector_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub sector_id: Option<Option<i64>>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewActivity {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    pub sector_id: Option<i64>,
    pub plant_id: Option<i64>,
    pub project_id: Option<i64>,
    pub assignee_id: Option<i64>,
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    #[serde(default, deserialize_with = "double_option")]
    pub sector_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub plant_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub project_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub assignee_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub due_date: Option<Option<String>>,
}

impl ActivityPatch {
    /// Names of the fields present in the patch, for the audit message.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.title.is_some() {
            fields.push("title");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if self.priority.is_some() {
            fields.push("priority");
        }
        if self.sector_id.is_some() {
            fields.push("sector");
        }
        if self.plant_id.is_some() {
            fields.push("plant");
        }
        if self.project_id.is_some() {
            fields.push("project");
        }
        if self.assignee_id.is_some() {
            fields.push("assignee");
        }
        if self.due_date.is_some() {
            fields.push("due_date");
        }
        fields
    }
}
