use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, named_params, params};

use super::{TrackerDb, apply_patch, enum_col, opt_int, opt_text, required_text};
use crate::errors::TrackerError;
use crate::tracker::auth::{Visibility, can_delete_activity, can_modify_activity};
use crate::tracker::lifecycle::{
    TimerAction, closes_session, elapsed_seconds, live_tracked_seconds, log_action, next_status,
    parse_timestamp, timestamp,
};
use crate::tracker::models::*;

pub(super) const ACTIVITY_COLUMNS: &str = "a.id, a.title, a.description, a.status, a.priority, \
     a.sector_id, a.plant_id, a.project_id, a.assignee_id, a.created_by, a.total_seconds, \
     a.running_since, a.due_date, a.completed_at, a.created_at, a.updated_at";

/// Subtask counters appended after [`ACTIVITY_COLUMNS`] (indexes 16 and 17).
const SUBTASK_COUNTS: &str = "(SELECT COUNT(*) FROM subtasks s WHERE s.activity_id = a.id), \
     (SELECT COUNT(*) FROM subtasks s WHERE s.activity_id = a.id AND s.done = 1)";

pub(super) fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<Activity> {
    Ok(Activity {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: enum_col(row, 3)?,
        priority: enum_col(row, 4)?,
        sector_id: row.get(5)?,
        plant_id: row.get(6)?,
        project_id: row.get(7)?,
        assignee_id: row.get(8)?,
        created_by: row.get(9)?,
        total_seconds: row.get(10)?,
        running_since: row.get(11)?,
        due_date: row.get(12)?,
        completed_at: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

/// Row with [`ACTIVITY_COLUMNS`] followed by [`SUBTASK_COUNTS`].
struct ActivityViewRow {
    activity: Activity,
    subtasks_total: i64,
    subtasks_done: i64,
}

impl ActivityViewRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            activity: activity_from_row(row)?,
            subtasks_total: row.get(16)?,
            subtasks_done: row.get(17)?,
        })
    }

    fn into_view(self, now: DateTime<Utc>) -> ActivityView {
        let tracked_seconds = live_tracked_seconds(
            self.activity.total_seconds,
            self.activity.running_since.as_deref(),
            now,
        );
        ActivityView {
            activity: self.activity,
            tracked_seconds,
            subtasks_total: self.subtasks_total,
            subtasks_done: self.subtasks_done,
        }
    }
}

pub(super) fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ActivitySession> {
    Ok(ActivitySession {
        id: row.get(0)?,
        activity_id: row.get(1)?,
        user_id: row.get(2)?,
        started_at: row.get(3)?,
        ended_at: row.get(4)?,
        duration_seconds: row.get(5)?,
    })
}

fn subtask_from_row(row: &Row<'_>) -> rusqlite::Result<Subtask> {
    Ok(Subtask {
        id: row.get(0)?,
        activity_id: row.get(1)?,
        title: row.get(2)?,
        done: row.get(3)?,
        position: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Filters for `GET /api/activities`. Every field narrows the result.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ActivityFilter {
    pub status: Option<ActivityStatus>,
    pub sector_id: Option<i64>,
    pub assignee_id: Option<i64>,
    pub project_id: Option<i64>,
    pub plant_id: Option<i64>,
    /// Case-insensitive substring of the title.
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub const DEFAULT_PAGE_SIZE: i64 = 200;
pub const MAX_PAGE_SIZE: i64 = 1000;

impl TrackerDb {
    // ── Activity CRUD ─────────────────────────────────────────────────

    pub fn create_activity(&self, actor: &User, new: &NewActivity) -> Result<Activity> {
        let title = required_text(&new.title, "Title")?;
        let sector_id = new.sector_id.or(actor.sector_id);
        if !actor.is_admin() && sector_id != actor.sector_id {
            return Err(TrackerError::Forbidden(
                "Activities can only be created in your own sector".into(),
            )
            .into());
        }
        let assignee_id = match (new.assignee_id, actor.role) {
            (Some(id), _) => Some(id),
            (None, Role::Member) => Some(actor.id),
            (None, _) => None,
        };
        if actor.role == Role::Member && assignee_id != Some(actor.id) {
            return Err(TrackerError::Forbidden(
                "Members can only create activities assigned to themselves".into(),
            )
            .into());
        }
        self.check_references(sector_id, new.plant_id, new.project_id, assignee_id)?;
        let due_date = new.due_date.as_deref().map(normalize_due_date).transpose()?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO activities
                 (title, description, priority, sector_id, plant_id, project_id,
                  assignee_id, created_by, due_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                title,
                new.description.trim(),
                new.priority.as_str(),
                sector_id,
                new.plant_id,
                new.project_id,
                assignee_id,
                actor.id,
                due_date,
            ],
        )
        .context("Failed to insert activity")?;
        let id = tx.last_insert_rowid();
        insert_log(&tx, id, actor.id, LogAction::Created, &title)?;
        tx.commit().context("Failed to commit activity")?;

        self.get_activity(id)?.context("Activity not found after insert")
    }

    pub fn get_activity(&self, id: i64) -> Result<Option<Activity>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM activities a WHERE a.id = ?1", ACTIVITY_COLUMNS),
                params![id],
                activity_from_row,
            )
            .optional()
            .context("Failed to query activity")
    }

    pub fn get_activity_view(&self, id: i64, now: DateTime<Utc>) -> Result<Option<ActivityView>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {}, {} FROM activities a WHERE a.id = ?1",
                    ACTIVITY_COLUMNS, SUBTASK_COUNTS
                ),
                params![id],
                ActivityViewRow::from_row,
            )
            .optional()
            .context("Failed to query activity view")?;
        Ok(row.map(|r| r.into_view(now)))
    }

    pub fn list_activities(
        &self,
        viewer: &User,
        filter: &ActivityFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActivityView>> {
        let (see_all, vis_sector, vis_user) = Visibility::for_user(viewer).sql_params();
        let search = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s.to_lowercase()));
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = filter.offset.unwrap_or(0).max(0);

        let sql = format!(
            "SELECT {cols}, {counts} FROM activities a
             WHERE {vis}
               AND (:status IS NULL OR a.status = :status)
               AND (:sector IS NULL OR a.sector_id = :sector)
               AND (:assignee IS NULL OR a.assignee_id = :assignee)
               AND (:project IS NULL OR a.project_id = :project)
               AND (:plant IS NULL OR a.plant_id = :plant)
               AND (:search IS NULL OR lower(a.title) LIKE :search)
             ORDER BY
               CASE a.status
                 WHEN 'in_progress' THEN 0 WHEN 'paused' THEN 1 WHEN 'next' THEN 2
                 WHEN 'completed' THEN 3 ELSE 4 END,
               CASE a.priority
                 WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 WHEN 'medium' THEN 2 ELSE 3 END,
               a.updated_at DESC, a.id DESC
             LIMIT :limit OFFSET :offset",
            cols = ACTIVITY_COLUMNS,
            counts = SUBTASK_COUNTS,
            vis = Visibility::SQL,
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_activities")?;
        let rows = stmt
            .query_map(
                named_params! {
                    ":see_all": see_all,
                    ":vis_sector": vis_sector,
                    ":vis_user": vis_user,
                    ":status": filter.status.map(|s| s.as_str()),
                    ":sector": filter.sector_id,
                    ":assignee": filter.assignee_id,
                    ":project": filter.project_id,
                    ":plant": filter.plant_id,
                    ":search": search,
                    ":limit": limit,
                    ":offset": offset,
                },
                ActivityViewRow::from_row,
            )
            .context("Failed to query activities")?;
        let mut views = Vec::new();
        for row in rows {
            views.push(row.context("Failed to read activity row")?.into_view(now));
        }
        Ok(views)
    }

    /// Full activity record with subtasks, sessions and audit trails.
    pub fn get_activity_detail(
        &self,
        viewer: &User,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<ActivityDetail> {
        let view = self
            .get_activity_view(id, now)?
            .ok_or(TrackerError::not_found("Activity", id))?;
        if !Visibility::for_user(viewer).can_see(&view.activity) {
            return Err(TrackerError::Forbidden(format!("Activity {} is not visible to you", id)).into());
        }
        Ok(ActivityDetail {
            subtasks: self.list_subtasks(id)?,
            sessions: self.list_sessions(id)?,
            logs: self.list_logs(id)?,
            adjustments: self.list_adjustments(id)?,
            activity: view,
        })
    }

    pub fn update_activity(&self, actor: &User, id: i64, patch: &ActivityPatch) -> Result<Activity> {
        let current = self.activity_for_update(actor, id)?;

        let mut sets = Vec::new();
        if let Some(title) = &patch.title {
            sets.push(("title", Value::Text(required_text(title, "Title")?)));
        }
        if let Some(description) = &patch.description {
            sets.push(("description", Value::Text(description.trim().to_string())));
        }
        if let Some(priority) = patch.priority {
            sets.push(("priority", Value::Text(priority.as_str().to_string())));
        }
        if let Some(sector_id) = patch.sector_id {
            if !actor.is_admin() && sector_id != actor.sector_id {
                return Err(TrackerError::Forbidden(
                    "Only administrators can move activities across sectors".into(),
                )
                .into());
            }
            sets.push(("sector_id", opt_int(sector_id)));
        }
        if let Some(plant_id) = patch.plant_id {
            sets.push(("plant_id", opt_int(plant_id)));
        }
        if let Some(project_id) = patch.project_id {
            sets.push(("project_id", opt_int(project_id)));
        }
        if let Some(assignee_id) = patch.assignee_id {
            if actor.role == Role::Member && assignee_id != current.assignee_id {
                return Err(TrackerError::Forbidden(
                    "Members cannot reassign activities".into(),
                )
                .into());
            }
            sets.push(("assignee_id", opt_int(assignee_id)));
        }
        if let Some(due_date) = &patch.due_date {
            let normalized = due_date.as_deref().map(normalize_due_date).transpose()?;
            sets.push(("due_date", opt_text(normalized)));
        }
        self.check_references(
            patch.sector_id.flatten(),
            patch.plant_id.flatten(),
            patch.project_id.flatten(),
            patch.assignee_id.flatten(),
        )?;

        if sets.is_empty() {
            return Ok(current);
        }
        let fields = patch.changed_fields().join(", ");

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        apply_patch(&tx, "activities", id, sets).context("Failed to update activity")?;
        insert_log(&tx, id, actor.id, LogAction::Updated, &format!("Changed {}", fields))?;
        tx.commit().context("Failed to commit activity update")?;

        self.get_activity(id)?
            .ok_or_else(|| TrackerError::not_found("Activity", id).into())
    }

    /// Delete an activity and (by cascade) its sessions, logs and subtasks.
    pub fn delete_activity(&self, actor: &User, id: i64) -> Result<Activity> {
        let activity = self
            .get_activity(id)?
            .ok_or(TrackerError::not_found("Activity", id))?;
        if !can_delete_activity(actor, &activity) {
            return Err(TrackerError::Forbidden(format!(
                "You may not delete activity {}",
                id
            ))
            .into());
        }
        self.conn
            .execute("DELETE FROM activities WHERE id = ?1", params![id])
            .context("Failed to delete activity")?;
        Ok(activity)
    }

    // ── Timer ─────────────────────────────────────────────────────────

    /// Apply a start/pause/complete/cancel/reopen in one transaction.
    ///
    /// Starting while the actor already runs a timer elsewhere either pauses
    /// that activity first (`auto_pause`) or fails with `TimerConflict`.
    pub fn apply_timer_action(
        &self,
        actor: &User,
        id: i64,
        action: TimerAction,
        note: Option<&str>,
        now: DateTime<Utc>,
        auto_pause: bool,
    ) -> Result<TimerOutcome> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let activity = self.activity_for_update(actor, id)?;
        let from = activity.status;
        let to = next_status(from, action)?;
        let now_ts = timestamp(now);
        let note = note.map(str::trim).filter(|n| !n.is_empty());

        let mut auto_paused_id = None;
        if action == TimerAction::Start {
            if let Some(other) = self.open_session_activity(actor.id)? {
                if other != id {
                    if !auto_pause {
                        return Err(TrackerError::TimerConflict { activity_id: other }.into());
                    }
                    let seconds = self.close_open_session(other, now)?;
                    tx.execute(
                        "UPDATE activities
                         SET status = 'paused', running_since = NULL,
                             total_seconds = total_seconds + ?1
                         WHERE id = ?2",
                        params![seconds, other],
                    )
                    .context("Failed to auto-pause activity")?;
                    insert_log(
                        &tx,
                        other,
                        actor.id,
                        LogAction::AutoPaused,
                        &format!("Paused after {} because activity {} was started", fmt_duration(seconds), id),
                    )?;
                    auto_paused_id = Some(other);
                }
            }
            tx.execute(
                "INSERT INTO activity_sessions (activity_id, user_id, started_at) VALUES (?1, ?2, ?3)",
                params![id, actor.id, now_ts],
            )
            .context("Failed to open session")?;
            tx.execute(
                "UPDATE activities SET status = ?1, running_since = ?2, completed_at = NULL
                 WHERE id = ?3",
                params![to.as_str(), now_ts, id],
            )
            .context("Failed to start activity")?;
        } else {
            let seconds = if closes_session(action) {
                self.close_open_session(id, now)?
            } else {
                0
            };
            let completed_at = (to == ActivityStatus::Completed).then(|| now_ts.clone());
            tx.execute(
                "UPDATE activities
                 SET status = ?1, running_since = NULL, completed_at = ?2,
                     total_seconds = total_seconds + ?3
                 WHERE id = ?4",
                params![to.as_str(), completed_at, seconds, id],
            )
            .context("Failed to update activity status")?;
        }

        let message = match note {
            Some(note) => format!("{} → {}: {}", from, to, note),
            None => format!("{} → {}", from, to),
        };
        insert_log(&tx, id, actor.id, log_action(from, action), &message)?;
        tx.commit().context("Failed to commit timer action")?;

        let activity = self
            .get_activity(id)?
            .context("Activity not found after timer action")?;
        let auto_paused = match auto_paused_id {
            Some(other) => self.get_activity(other)?,
            None => None,
        };
        Ok(TimerOutcome {
            activity,
            auto_paused,
        })
    }

    /// Activity the user currently has an open session on.
    fn open_session_activity(&self, user_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT activity_id FROM activity_sessions WHERE user_id = ?1 AND ended_at IS NULL",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query open session")
    }

    /// Close the activity's open session (if any); returns its length in seconds.
    fn close_open_session(&self, activity_id: i64, now: DateTime<Utc>) -> Result<i64> {
        let open: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, started_at FROM activity_sessions
                 WHERE activity_id = ?1 AND ended_at IS NULL",
                params![activity_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query open session")?;
        let Some((session_id, started_at)) = open else {
            return Ok(0);
        };
        let seconds = elapsed_seconds(parse_timestamp(&started_at)?, now);
        self.conn
            .execute(
                "UPDATE activity_sessions SET ended_at = ?1, duration_seconds = ?2 WHERE id = ?3",
                params![timestamp(now), seconds, session_id],
            )
            .context("Failed to close session")?;
        Ok(seconds)
    }

    /// Overwrite accumulated time, recording who, why and by how much.
    pub fn adjust_time(
        &self,
        actor: &User,
        id: i64,
        new_total_seconds: i64,
        reason: &str,
    ) -> Result<(Activity, TimeAdjustment)> {
        let reason = required_text(reason, "Reason")?;
        if new_total_seconds < 0 {
            return Err(TrackerError::Validation("Total time cannot be negative".into()).into());
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let activity = self.activity_for_update(actor, id)?;
        if activity.status == ActivityStatus::InProgress {
            return Err(TrackerError::InvalidState(
                "Pause the timer before adjusting its time".into(),
            )
            .into());
        }
        let previous = activity.total_seconds;
        let delta = new_total_seconds - previous;

        tx.execute(
            "UPDATE activities SET total_seconds = ?1 WHERE id = ?2",
            params![new_total_seconds, id],
        )
        .context("Failed to update total time")?;
        tx.execute(
            "INSERT INTO time_adjustments
                 (activity_id, user_id, previous_seconds, new_seconds, delta_seconds, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, actor.id, previous, new_total_seconds, delta, reason],
        )
        .context("Failed to insert time adjustment")?;
        let adjustment_id = tx.last_insert_rowid();
        insert_log(
            &tx,
            id,
            actor.id,
            LogAction::TimeAdjusted,
            &format!(
                "{} → {} ({}{}): {}",
                fmt_duration(previous),
                fmt_duration(new_total_seconds),
                if delta < 0 { "-" } else { "+" },
                fmt_duration(delta.abs()),
                reason
            ),
        )?;
        tx.commit().context("Failed to commit time adjustment")?;

        let activity = self
            .get_activity(id)?
            .context("Activity not found after adjustment")?;
        let adjustment = self
            .list_adjustments(id)?
            .into_iter()
            .find(|a| a.id == adjustment_id)
            .context("Adjustment not found after insert")?;
        Ok((activity, adjustment))
    }

    // ── Audit trails ──────────────────────────────────────────────────

    pub fn list_logs(&self, activity_id: i64) -> Result<Vec<ActivityLog>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, activity_id, user_id, action, message, created_at
                 FROM activity_logs WHERE activity_id = ?1 ORDER BY id DESC",
            )
            .context("Failed to prepare list_logs")?;
        let rows = stmt
            .query_map(params![activity_id], |row| {
                Ok(ActivityLog {
                    id: row.get(0)?,
                    activity_id: row.get(1)?,
                    user_id: row.get(2)?,
                    action: enum_col(row, 3)?,
                    message: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .context("Failed to query logs")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read log row")
    }

    pub fn list_sessions(&self, activity_id: i64) -> Result<Vec<ActivitySession>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, activity_id, user_id, started_at, ended_at, duration_seconds
                 FROM activity_sessions WHERE activity_id = ?1 ORDER BY started_at DESC, id DESC",
            )
            .context("Failed to prepare list_sessions")?;
        let rows = stmt
            .query_map(params![activity_id], session_from_row)
            .context("Failed to query sessions")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read session row")
    }

    pub fn list_adjustments(&self, activity_id: i64) -> Result<Vec<TimeAdjustment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, activity_id, user_id, previous_seconds, new_seconds, delta_seconds,
                        reason, created_at
                 FROM time_adjustments WHERE activity_id = ?1 ORDER BY id DESC",
            )
            .context("Failed to prepare list_adjustments")?;
        let rows = stmt
            .query_map(params![activity_id], |row| {
                Ok(TimeAdjustment {
                    id: row.get(0)?,
                    activity_id: row.get(1)?,
                    user_id: row.get(2)?,
                    previous_seconds: row.get(3)?,
                    new_seconds: row.get(4)?,
                    delta_seconds: row.get(5)?,
                    reason: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .context("Failed to query adjustments")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read adjustment row")
    }

    // ── Subtasks ──────────────────────────────────────────────────────

    pub fn list_subtasks(&self, activity_id: i64) -> Result<Vec<Subtask>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, activity_id, title, done, position, created_at, updated_at
                 FROM subtasks WHERE activity_id = ?1 ORDER BY position, id",
            )
            .context("Failed to prepare list_subtasks")?;
        let rows = stmt
            .query_map(params![activity_id], subtask_from_row)
            .context("Failed to query subtasks")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read subtask row")
    }

    pub fn get_subtask(&self, id: i64) -> Result<Option<Subtask>> {
        self.conn
            .query_row(
                "SELECT id, activity_id, title, done, position, created_at, updated_at
                 FROM subtasks WHERE id = ?1",
                params![id],
                subtask_from_row,
            )
            .optional()
            .context("Failed to query subtask")
    }

    pub fn add_subtask(&self, actor: &User, activity_id: i64, title: &str) -> Result<Subtask> {
        let title = required_text(title, "Subtask title")?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.activity_for_update(actor, activity_id)?;
        let position: i32 = tx
            .query_row(
                "SELECT COALESCE(MAX(position), -1) + 1 FROM subtasks WHERE activity_id = ?1",
                params![activity_id],
                |row| row.get(0),
            )
            .context("Failed to get next subtask position")?;
        tx.execute(
            "INSERT INTO subtasks (activity_id, title, position) VALUES (?1, ?2, ?3)",
            params![activity_id, title, position],
        )
        .context("Failed to insert subtask")?;
        let id = tx.last_insert_rowid();
        insert_log(&tx, activity_id, actor.id, LogAction::SubtaskAdded, &title)?;
        tx.commit().context("Failed to commit subtask")?;
        self.get_subtask(id)?.context("Subtask not found after insert")
    }

    pub fn update_subtask(
        &self,
        actor: &User,
        id: i64,
        title: Option<&str>,
        done: Option<bool>,
    ) -> Result<Subtask> {
        let current = self
            .get_subtask(id)?
            .ok_or(TrackerError::not_found("Subtask", id))?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.activity_for_update(actor, current.activity_id)?;

        let mut sets = Vec::new();
        if let Some(title) = title {
            sets.push(("title", Value::Text(required_text(title, "Subtask title")?)));
        }
        if let Some(done) = done {
            sets.push(("done", Value::Integer(done as i64)));
        }
        apply_patch(&tx, "subtasks", id, sets).context("Failed to update subtask")?;
        match done {
            Some(true) if !current.done => insert_log(
                &tx,
                current.activity_id,
                actor.id,
                LogAction::SubtaskCompleted,
                &current.title,
            )?,
            Some(false) if current.done => insert_log(
                &tx,
                current.activity_id,
                actor.id,
                LogAction::SubtaskReopened,
                &current.title,
            )?,
            _ => {}
        }
        tx.commit().context("Failed to commit subtask update")?;
        self.get_subtask(id)?
            .ok_or_else(|| TrackerError::not_found("Subtask", id).into())
    }

    pub fn delete_subtask(&self, actor: &User, id: i64) -> Result<Subtask> {
        let current = self
            .get_subtask(id)?
            .ok_or(TrackerError::not_found("Subtask", id))?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.activity_for_update(actor, current.activity_id)?;
        tx.execute("DELETE FROM subtasks WHERE id = ?1", params![id])
            .context("Failed to delete subtask")?;
        insert_log(
            &tx,
            current.activity_id,
            actor.id,
            LogAction::SubtaskDeleted,
            &current.title,
        )?;
        tx.commit().context("Failed to commit subtask delete")?;
        Ok(current)
    }

    // ── Helpers ───────────────────────────────────────────────────────

    /// Load an activity the actor is allowed to modify.
    fn activity_for_update(&self, actor: &User, id: i64) -> Result<Activity> {
        let activity = self
            .get_activity(id)?
            .ok_or(TrackerError::not_found("Activity", id))?;
        if !can_modify_activity(actor, &activity) {
            return Err(TrackerError::Forbidden(format!(
                "You may not modify activity {}",
                id
            ))
            .into());
        }
        Ok(activity)
    }

    fn check_references(
        &self,
        sector_id: Option<i64>,
        plant_id: Option<i64>,
        project_id: Option<i64>,
        assignee_id: Option<i64>,
    ) -> Result<()> {
        if let Some(id) = sector_id {
            self.ensure_sector(id)?;
        }
        if let Some(id) = plant_id {
            if self.get_plant(id)?.is_none() {
                return Err(TrackerError::Validation(format!("Unknown plant {}", id)).into());
            }
        }
        if let Some(id) = project_id {
            match self.get_project(id)? {
                Some(p) if p.active => {}
                Some(_) => {
                    return Err(TrackerError::Validation(format!("Project {} is inactive", id)).into());
                }
                None => {
                    return Err(TrackerError::Validation(format!("Unknown project {}", id)).into());
                }
            }
        }
        if let Some(id) = assignee_id {
            match self.get_user(id)? {
                Some(u) if u.active => {}
                _ => {
                    return Err(
                        TrackerError::Validation(format!("Unknown or inactive user {}", id)).into(),
                    );
                }
            }
        }
        Ok(())
    }
}

pub(super) fn insert_log(
    conn: &rusqlite::Connection,
    activity_id: i64,
    user_id: i64,
    action: LogAction,
    message: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO activity_logs (activity_id, user_id, action, message) VALUES (?1, ?2, ?3, ?4)",
        params![activity_id, user_id, action.as_str(), message],
    )
    .context("Failed to insert activity log")?;
    Ok(())
}

/// Accept `YYYY-MM-DD` or an RFC 3339 timestamp; store the calendar date.
fn normalize_due_date(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.format("%Y-%m-%d").to_string());
    }
    match parse_timestamp(raw) {
        Ok(at) => Ok(at.date_naive().format("%Y-%m-%d").to_string()),
        Err(_) => Err(TrackerError::Validation(format!("Invalid due date: {}", raw)).into()),
    }
}

/// `1h 05m`, `12m 30s`, `45s`.
pub fn fmt_duration(seconds: i64) -> String {
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    if h > 0 {
        format!("{}h {:02}m", h, m)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}
