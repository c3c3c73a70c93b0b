use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, named_params, params};

use super::activities::session_from_row;
use super::{TrackerDb, enum_col};
use crate::tracker::auth::Visibility;
use crate::tracker::lifecycle::{elapsed_seconds, parse_timestamp, timestamp};
use crate::tracker::models::*;

pub const DEFAULT_FEED_LIMIT: i64 = 50;
pub const MAX_FEED_LIMIT: i64 = 500;

const FEED_SELECT: &str = "SELECT l.id, l.activity_id, a.title, a.sector_id, l.user_id, u.name,
            l.action, l.message, l.created_at
     FROM activity_logs l
     JOIN activities a ON a.id = l.activity_id
     JOIN users u ON u.id = l.user_id";

fn feed_from_row(row: &Row<'_>) -> rusqlite::Result<FeedEntry> {
    Ok(FeedEntry {
        id: row.get(0)?,
        activity_id: row.get(1)?,
        activity_title: row.get(2)?,
        sector_id: row.get(3)?,
        user_id: row.get(4)?,
        user_name: row.get(5)?,
        action: enum_col(row, 6)?,
        message: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// One session row as seen by the dashboard aggregation.
struct SessionSample {
    activity_id: i64,
    user_id: i64,
    user_name: String,
    sector_id: Option<i64>,
    sector_name: Option<String>,
    seconds: i64,
}

impl TrackerDb {
    /// The user's running activity and its open session, if any.
    pub fn active_timer(&self, user_id: i64, now: DateTime<Utc>) -> Result<Option<ActiveTimer>> {
        let session = self
            .conn
            .query_row(
                "SELECT id, activity_id, user_id, started_at, ended_at, duration_seconds
                 FROM activity_sessions WHERE user_id = ?1 AND ended_at IS NULL",
                params![user_id],
                session_from_row,
            )
            .optional()
            .context("Failed to query active timer")?;
        let Some(session) = session else {
            return Ok(None);
        };
        let activity = self
            .get_activity_view(session.activity_id, now)?
            .context("Running session points at a missing activity")?;
        Ok(Some(ActiveTimer { activity, session }))
    }

    /// Most recent audit rows across every activity the viewer can see.
    pub fn feed(&self, viewer: &User, limit: i64) -> Result<Vec<FeedEntry>> {
        let (see_all, vis_sector, vis_user) = Visibility::for_user(viewer).sql_params();
        let sql = format!(
            "{} WHERE {} ORDER BY l.id DESC LIMIT :limit",
            FEED_SELECT,
            Visibility::SQL
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare feed")?;
        let rows = stmt
            .query_map(
                named_params! {
                    ":see_all": see_all,
                    ":vis_sector": vis_sector,
                    ":vis_user": vis_user,
                    ":limit": limit.clamp(1, MAX_FEED_LIMIT),
                },
                feed_from_row,
            )
            .context("Failed to query feed")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read feed row")
    }

    /// Newest audit row of one activity, for pushing to live clients.
    pub fn last_feed_entry(&self, activity_id: i64) -> Result<Option<FeedEntry>> {
        self.conn
            .query_row(
                &format!("{} WHERE l.activity_id = ?1 ORDER BY l.id DESC LIMIT 1", FEED_SELECT),
                params![activity_id],
                feed_from_row,
            )
            .optional()
            .context("Failed to query latest feed entry")
    }

    /// Productivity figures over the viewer's visible activities.
    ///
    /// Tracked time comes from sessions started inside `[from, to)`; an open
    /// session counts up to `now`. Manual adjustments are not included.
    pub fn dashboard(
        &self,
        viewer: &User,
        sector_id: Option<i64>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<DashboardStats> {
        let (see_all, vis_sector, vis_user) = Visibility::for_user(viewer).sql_params();
        let from_ts = from.map(timestamp);
        let to_ts = to.map(timestamp);

        let mut stats = DashboardStats {
            from: from_ts.clone(),
            to: to_ts.clone(),
            status_counts: StatusCounts::default(),
            tracked_seconds: 0,
            completed_in_range: 0,
            by_user: Vec::new(),
            by_sector: Vec::new(),
            by_priority: BTreeMap::new(),
        };

        // Status and priority counts.
        let sql = format!(
            "SELECT a.status, a.priority, COUNT(*) FROM activities a
             WHERE {} AND (:sector IS NULL OR a.sector_id = :sector)
             GROUP BY a.status, a.priority",
            Visibility::SQL
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare status counts")?;
        let rows = stmt
            .query_map(
                named_params! {
                    ":see_all": see_all,
                    ":vis_sector": vis_sector,
                    ":vis_user": vis_user,
                    ":sector": sector_id,
                },
                |row| {
                    Ok((
                        enum_col::<ActivityStatus>(row, 0)?,
                        enum_col::<Priority>(row, 1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .context("Failed to query status counts")?;
        for row in rows {
            let (status, priority, n) = row.context("Failed to read status count")?;
            stats.status_counts.add(status, n);
            if !status.is_terminal() {
                *stats
                    .by_priority
                    .entry(priority.as_str().to_string())
                    .or_insert(0) += n;
            }
        }

        // Completions per assignee inside the range.
        let sql = format!(
            "SELECT a.assignee_id, COUNT(*) FROM activities a
             WHERE {} AND (:sector IS NULL OR a.sector_id = :sector)
               AND a.status = 'completed'
               AND (:from IS NULL OR a.completed_at >= :from)
               AND (:to IS NULL OR a.completed_at < :to)
             GROUP BY a.assignee_id",
            Visibility::SQL
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare completion counts")?;
        let rows = stmt
            .query_map(
                named_params! {
                    ":see_all": see_all,
                    ":vis_sector": vis_sector,
                    ":vis_user": vis_user,
                    ":sector": sector_id,
                    ":from": from_ts,
                    ":to": to_ts,
                },
                |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, i64>(1)?)),
            )
            .context("Failed to query completion counts")?;
        let mut completed_by: BTreeMap<i64, i64> = BTreeMap::new();
        for row in rows {
            let (assignee, n) = row.context("Failed to read completion count")?;
            stats.completed_in_range += n;
            if let Some(user_id) = assignee {
                completed_by.insert(user_id, n);
            }
        }

        // Sessions inside the range.
        let sql = format!(
            "SELECT s.activity_id, s.user_id, u.name, a.sector_id, sec.name,
                    s.started_at, s.duration_seconds
             FROM activity_sessions s
             JOIN activities a ON a.id = s.activity_id
             JOIN users u ON u.id = s.user_id
             LEFT JOIN sectors sec ON sec.id = a.sector_id
             WHERE {} AND (:sector IS NULL OR a.sector_id = :sector)
               AND (:from IS NULL OR s.started_at >= :from)
               AND (:to IS NULL OR s.started_at < :to)",
            Visibility::SQL
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare session aggregation")?;
        let rows = stmt
            .query_map(
                named_params! {
                    ":see_all": see_all,
                    ":vis_sector": vis_sector,
                    ":vis_user": vis_user,
                    ":sector": sector_id,
                    ":from": from_ts,
                    ":to": to_ts,
                },
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                    ))
                },
            )
            .context("Failed to query sessions")?;
        let mut samples = Vec::new();
        for row in rows {
            let (activity_id, user_id, user_name, sector_id, sector_name, started_at, duration) =
                row.context("Failed to read session row")?;
            let seconds = match duration {
                Some(d) => d,
                None => elapsed_seconds(parse_timestamp(&started_at)?, now),
            };
            samples.push(SessionSample {
                activity_id,
                user_id,
                user_name,
                sector_id,
                sector_name,
                seconds,
            });
        }

        stats.tracked_seconds = samples.iter().map(|s| s.seconds).sum();
        stats.by_user = aggregate_by_user(&samples, &completed_by, |id| {
            self.get_user(id).map(|u| u.map(|u| u.name))
        })?;
        stats.by_sector = aggregate_by_sector(&samples);
        Ok(stats)
    }
}

fn aggregate_by_user(
    samples: &[SessionSample],
    completed_by: &BTreeMap<i64, i64>,
    lookup_name: impl Fn(i64) -> Result<Option<String>>,
) -> Result<Vec<UserProductivity>> {
    let mut by_user: BTreeMap<i64, UserProductivity> = BTreeMap::new();
    for s in samples {
        let entry = by_user.entry(s.user_id).or_insert_with(|| UserProductivity {
            user_id: s.user_id,
            name: s.user_name.clone(),
            tracked_seconds: 0,
            sessions: 0,
            completed: 0,
        });
        entry.tracked_seconds += s.seconds;
        entry.sessions += 1;
    }
    for (&user_id, &n) in completed_by {
        match by_user.get_mut(&user_id) {
            Some(entry) => entry.completed = n,
            None => {
                let name = lookup_name(user_id)?.unwrap_or_default();
                by_user.insert(
                    user_id,
                    UserProductivity {
                        user_id,
                        name,
                        tracked_seconds: 0,
                        sessions: 0,
                        completed: n,
                    },
                );
            }
        }
    }
    let mut rows: Vec<UserProductivity> = by_user.into_values().collect();
    rows.sort_by(|a, b| {
        b.tracked_seconds
            .cmp(&a.tracked_seconds)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(rows)
}

fn aggregate_by_sector(samples: &[SessionSample]) -> Vec<SectorProductivity> {
    let mut by_sector: BTreeMap<Option<i64>, (SectorProductivity, HashSet<i64>)> = BTreeMap::new();
    for s in samples {
        let (entry, activities) = by_sector.entry(s.sector_id).or_insert_with(|| {
            (
                SectorProductivity {
                    sector_id: s.sector_id,
                    name: s
                        .sector_name
                        .clone()
                        .unwrap_or_else(|| "Unassigned".to_string()),
                    tracked_seconds: 0,
                    activities: 0,
                },
                HashSet::new(),
            )
        });
        entry.tracked_seconds += s.seconds;
        activities.insert(s.activity_id);
    }
    let mut rows: Vec<SectorProductivity> = by_sector
        .into_values()
        .map(|(mut entry, activities)| {
            entry.activities = activities.len() as i64;
            entry
        })
        .collect();
    rows.sort_by(|a, b| b.tracked_seconds.cmp(&a.tracked_seconds));
    rows
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{at, sector, user};
    use super::*;
    use crate::tracker::lifecycle::TimerAction;

    fn activity(db: &TrackerDb, actor: &User, title: &str) -> Activity {
        db.create_activity(
            actor,
            &NewActivity {
                title: title.to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_active_timer_follows_start_and_pause() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let s = sector(&db, "Maintenance");
        let tech = user(&db, "tech@example.com", Role::Member, Some(s.id));
        let a = activity(&db, &tech, "Lubricate conveyor");

        assert!(db.active_timer(tech.id, at(8, 0))?.is_none());
        db.apply_timer_action(&tech, a.id, TimerAction::Start, None, at(8, 0), true)?;

        let timer = db.active_timer(tech.id, at(8, 10))?.expect("timer should be running");
        assert_eq!(timer.activity.activity.id, a.id);
        assert_eq!(timer.activity.tracked_seconds, 600);
        assert!(timer.session.ended_at.is_none());

        db.apply_timer_action(&tech, a.id, TimerAction::Pause, None, at(8, 20), true)?;
        assert!(db.active_timer(tech.id, at(8, 30))?.is_none());
        Ok(())
    }

    #[test]
    fn test_feed_is_scoped_and_newest_first() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let north = sector(&db, "North");
        let south = sector(&db, "South");
        let ana = user(&db, "ana@example.com", Role::Member, Some(north.id));
        let bo = user(&db, "bo@example.com", Role::Member, Some(south.id));
        let admin = user(&db, "root@example.com", Role::Admin, None);

        let a = activity(&db, &ana, "North job");
        activity(&db, &bo, "South job");
        db.apply_timer_action(&ana, a.id, TimerAction::Start, None, at(9, 0), true)?;

        let feed = db.feed(&ana, DEFAULT_FEED_LIMIT)?;
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0].action, LogAction::Started);
        assert_eq!(feed[0].user_name, "ana");
        assert_eq!(feed[0].activity_title, "North job");
        assert!(feed.iter().all(|e| e.sector_id == Some(north.id)));

        assert_eq!(db.feed(&admin, DEFAULT_FEED_LIMIT)?.len(), 3);
        assert_eq!(db.feed(&admin, 1)?.len(), 1);

        let last = db.last_feed_entry(a.id)?.unwrap();
        assert_eq!(last.action, LogAction::Started);
        Ok(())
    }

    #[test]
    fn test_dashboard_aggregates_sessions_and_completions() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let s = sector(&db, "Maintenance");
        let ana = user(&db, "ana@example.com", Role::Member, Some(s.id));
        let bo = user(&db, "bo@example.com", Role::Member, Some(s.id));
        let boss = user(&db, "boss@example.com", Role::Manager, Some(s.id));

        let a = activity(&db, &ana, "Pump");
        let b = activity(&db, &bo, "Valve");
        activity(&db, &bo, "Backlog");

        db.apply_timer_action(&ana, a.id, TimerAction::Start, None, at(8, 0), true)?;
        db.apply_timer_action(&ana, a.id, TimerAction::Complete, None, at(9, 0), true)?;
        db.apply_timer_action(&bo, b.id, TimerAction::Start, None, at(10, 0), true)?;

        // Bo's session is still open and counts up to `now`.
        let stats = db.dashboard(&boss, None, Some(at(0, 0)), Some(at(23, 0)), at(10, 30))?;
        assert_eq!(stats.tracked_seconds, 3600 + 1800);
        assert_eq!(stats.completed_in_range, 1);
        assert_eq!(stats.status_counts.completed, 1);
        assert_eq!(stats.status_counts.in_progress, 1);
        assert_eq!(stats.status_counts.next, 1);
        assert_eq!(stats.status_counts.total(), 3);
        assert_eq!(stats.by_priority.get("medium"), Some(&2));

        assert_eq!(stats.by_user.len(), 2);
        assert_eq!(stats.by_user[0].name, "ana");
        assert_eq!(stats.by_user[0].tracked_seconds, 3600);
        assert_eq!(stats.by_user[0].completed, 1);
        assert_eq!(stats.by_user[1].sessions, 1);

        assert_eq!(stats.by_sector.len(), 1);
        assert_eq!(stats.by_sector[0].name, "Maintenance");
        assert_eq!(stats.by_sector[0].activities, 2);
        Ok(())
    }

    #[test]
    fn test_dashboard_range_excludes_outside_sessions_and_adjustments() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let s = sector(&db, "Maintenance");
        let ana = user(&db, "ana@example.com", Role::Member, Some(s.id));
        let a = activity(&db, &ana, "Pump");

        db.apply_timer_action(&ana, a.id, TimerAction::Start, None, at(6, 0), true)?;
        db.apply_timer_action(&ana, a.id, TimerAction::Pause, None, at(7, 0), true)?;
        db.adjust_time(&ana, a.id, 99_999, "Imported from paper sheet")?;

        let stats = db.dashboard(&ana, None, Some(at(8, 0)), None, at(12, 0))?;
        assert_eq!(stats.tracked_seconds, 0);
        assert!(stats.by_user.is_empty());

        let stats = db.dashboard(&ana, None, None, None, at(12, 0))?;
        assert_eq!(stats.tracked_seconds, 3600);
        Ok(())
    }

    #[test]
    fn test_dashboard_sector_filter_respects_visibility() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let north = sector(&db, "North");
        let south = sector(&db, "South");
        let ana = user(&db, "ana@example.com", Role::Member, Some(north.id));
        let bo = user(&db, "bo@example.com", Role::Member, Some(south.id));
        activity(&db, &ana, "North job");
        activity(&db, &bo, "South job");

        let stats = db.dashboard(&ana, Some(south.id), None, None, at(12, 0))?;
        assert_eq!(stats.status_counts.total(), 0);

        let admin = user(&db, "root@example.com", Role::Admin, None);
        let stats = db.dashboard(&admin, Some(south.id), None, None, at(12, 0))?;
        assert_eq!(stats.status_counts.total(), 1);
        Ok(())
    }
}
