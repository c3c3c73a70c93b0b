use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{ApiError, SharedState};
use crate::tracker::auth::{AuthUser, Visibility};
use crate::tracker::db::ActivityFilter;
use crate::tracker::lifecycle::TimerAction;
use crate::tracker::models::*;
use crate::tracker::ws::{WsMessage, broadcast_activity};

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct TimerRequest {
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct AdjustTimeRequest {
    pub total_seconds: i64,
    pub reason: String,
}

#[derive(Serialize)]
pub struct AdjustTimeResponse {
    pub activity: Activity,
    pub adjustment: TimeAdjustment,
}

#[derive(Deserialize)]
pub struct CreateSubtaskRequest {
    pub title: String,
}

#[derive(Deserialize)]
pub struct UpdateSubtaskRequest {
    pub title: Option<String>,
    pub done: Option<bool>,
}

// ── Activities ────────────────────────────────────────────────────────

pub async fn list_activities(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Query(filter): Query<ActivityFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let activities = state
        .db
        .call(move |db| db.list_activities(&user, &filter, Utc::now()))
        .await?;
    Ok(Json(activities))
}

pub async fn create_activity(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(new): Json<NewActivity>,
) -> Result<impl IntoResponse, ApiError> {
    let (activity, entry) = state
        .db
        .call(move |db| {
            let activity = db.create_activity(&user, &new)?;
            let entry = db.last_feed_entry(activity.id)?;
            Ok((activity, entry))
        })
        .await?;
    tracing::info!(activity_id = activity.id, "Activity created");
    broadcast_activity(
        &state.ws_tx,
        &activity,
        &WsMessage::ActivityCreated {
            activity: activity.clone(),
        },
    );
    publish_feed(&state, &activity, entry);
    Ok((StatusCode::CREATED, Json(activity)))
}

pub async fn get_activity(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| db.get_activity_detail(&user, id, Utc::now()))
        .await?;
    Ok(Json(detail))
}

pub async fn update_activity(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
    Json(patch): Json<ActivityPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let (before, activity, entry) = state
        .db
        .call(move |db| {
            let before = db.get_activity(id)?;
            let activity = db.update_activity(&user, id, &patch)?;
            let entry = db.last_feed_entry(id)?;
            Ok((before, activity, entry))
        })
        .await?;
    let msg = WsMessage::ActivityUpdated {
        activity: activity.clone(),
    };
    // A reassigned or moved activity must also reach its former audience.
    if let Some(before) = &before {
        if before.sector_id != activity.sector_id || before.assignee_id != activity.assignee_id {
            broadcast_activity(&state.ws_tx, before, &msg);
        }
    }
    broadcast_activity(&state.ws_tx, &activity, &msg);
    publish_feed(&state, &activity, entry);
    Ok(Json(activity))
}

pub async fn delete_activity(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.id;
    let deleted = state
        .db
        .call(move |db| db.delete_activity(&user, id))
        .await?;
    tracing::info!(activity_id = id, user_id, "Activity deleted");
    broadcast_activity(
        &state.ws_tx,
        &deleted,
        &WsMessage::ActivityDeleted { activity_id: id },
    );
    Ok(StatusCode::NO_CONTENT)
}

// ── Timer ─────────────────────────────────────────────────────────────

pub async fn start_activity(
    state: State<SharedState>,
    user: AuthUser,
    id: Path<i64>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    run_timer_action(state, user, id, body, TimerAction::Start).await
}

pub async fn pause_activity(
    state: State<SharedState>,
    user: AuthUser,
    id: Path<i64>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    run_timer_action(state, user, id, body, TimerAction::Pause).await
}

pub async fn complete_activity(
    state: State<SharedState>,
    user: AuthUser,
    id: Path<i64>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    run_timer_action(state, user, id, body, TimerAction::Complete).await
}

pub async fn cancel_activity(
    state: State<SharedState>,
    user: AuthUser,
    id: Path<i64>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    run_timer_action(state, user, id, body, TimerAction::Cancel).await
}

pub async fn reopen_activity(
    state: State<SharedState>,
    user: AuthUser,
    id: Path<i64>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    run_timer_action(state, user, id, body, TimerAction::Reopen).await
}

async fn run_timer_action(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
    body: Bytes,
    action: TimerAction,
) -> Result<Json<TimerOutcome>, ApiError> {
    let note = parse_timer_request(&body)?.note;
    let auto_pause = state.settings.auto_pause_on_start;
    let user_id = user.id;

    let (from, outcome, entries) = state
        .db
        .call(move |db| {
            let from = db
                .get_activity(id)?
                .map(|a| a.status)
                .ok_or(crate::errors::TrackerError::not_found("Activity", id))?;
            let outcome =
                db.apply_timer_action(&user, id, action, note.as_deref(), Utc::now(), auto_pause)?;
            let mut entries = Vec::new();
            if let Some(paused) = &outcome.auto_paused {
                entries.extend(db.last_feed_entry(paused.id)?);
            }
            entries.extend(db.last_feed_entry(id)?);
            Ok((from, outcome, entries))
        })
        .await?;

    tracing::info!(
        activity_id = id,
        user_id,
        action = %action,
        from = %from,
        to = %outcome.activity.status,
        "Timer action applied"
    );

    if let Some(paused) = &outcome.auto_paused {
        tracing::info!(activity_id = paused.id, user_id, "Running activity auto-paused");
        broadcast_activity(
            &state.ws_tx,
            paused,
            &WsMessage::ActivityStatusChanged {
                activity: paused.clone(),
                from: ActivityStatus::InProgress,
                action: TimerAction::Pause,
                user_id,
            },
        );
    }
    broadcast_activity(
        &state.ws_tx,
        &outcome.activity,
        &WsMessage::ActivityStatusChanged {
            activity: outcome.activity.clone(),
            from,
            action,
            user_id,
        },
    );
    for entry in entries {
        let activity = match &outcome.auto_paused {
            Some(paused) if paused.id == entry.activity_id => paused,
            _ => &outcome.activity,
        };
        publish_feed(&state, activity, Some(entry));
    }
    Ok(Json(outcome))
}

pub async fn adjust_time(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<AdjustTimeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.id;
    let (activity, adjustment, entry) = state
        .db
        .call(move |db| {
            let (activity, adjustment) =
                db.adjust_time(&user, id, req.total_seconds, &req.reason)?;
            let entry = db.last_feed_entry(id)?;
            Ok((activity, adjustment, entry))
        })
        .await?;
    tracing::info!(
        activity_id = id,
        user_id,
        delta_seconds = adjustment.delta_seconds,
        "Time adjusted"
    );
    broadcast_activity(
        &state.ws_tx,
        &activity,
        &WsMessage::TimeAdjusted {
            activity: activity.clone(),
            adjustment: adjustment.clone(),
        },
    );
    publish_feed(&state, &activity, entry);
    Ok(Json(AdjustTimeResponse {
        activity,
        adjustment,
    }))
}

// ── Audit trails ──────────────────────────────────────────────────────

pub async fn list_logs(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let logs = state
        .db
        .call(move |db| {
            ensure_visible(db, &user, id)?;
            db.list_logs(id)
        })
        .await?;
    Ok(Json(logs))
}

pub async fn list_sessions(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state
        .db
        .call(move |db| {
            ensure_visible(db, &user, id)?;
            db.list_sessions(id)
        })
        .await?;
    Ok(Json(sessions))
}

pub async fn list_adjustments(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let adjustments = state
        .db
        .call(move |db| {
            ensure_visible(db, &user, id)?;
            db.list_adjustments(id)
        })
        .await?;
    Ok(Json(adjustments))
}

// ── Subtasks ──────────────────────────────────────────────────────────

pub async fn add_subtask(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(activity_id): Path<i64>,
    Json(req): Json<CreateSubtaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (subtask, activity, entry) = state
        .db
        .call(move |db| {
            let subtask = db.add_subtask(&user, activity_id, &req.title)?;
            let activity = db.get_activity(activity_id)?;
            let entry = db.last_feed_entry(activity_id)?;
            Ok((subtask, activity, entry))
        })
        .await?;
    if let Some(activity) = &activity {
        publish_subtask(&state, activity, subtask.id, Some(subtask.clone()), entry);
    }
    Ok((StatusCode::CREATED, Json(subtask)))
}

pub async fn update_subtask(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateSubtaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (subtask, activity, entry) = state
        .db
        .call(move |db| {
            let subtask = db.update_subtask(&user, id, req.title.as_deref(), req.done)?;
            let activity = db.get_activity(subtask.activity_id)?;
            let entry = db.last_feed_entry(subtask.activity_id)?;
            Ok((subtask, activity, entry))
        })
        .await?;
    if let Some(activity) = &activity {
        publish_subtask(&state, activity, id, Some(subtask.clone()), entry);
    }
    Ok(Json(subtask))
}

pub async fn delete_subtask(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let (activity, entry) = state
        .db
        .call(move |db| {
            let subtask = db.delete_subtask(&user, id)?;
            let activity = db.get_activity(subtask.activity_id)?;
            let entry = db.last_feed_entry(subtask.activity_id)?;
            Ok((activity, entry))
        })
        .await?;
    if let Some(activity) = &activity {
        publish_subtask(&state, activity, id, None, entry);
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Timer endpoints accept an empty body or `{"note": "..."}`.
fn parse_timer_request(body: &[u8]) -> Result<TimerRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(TimerRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

fn ensure_visible(
    db: &crate::tracker::db::TrackerDb,
    user: &User,
    id: i64,
) -> anyhow::Result<()> {
    use crate::errors::TrackerError;

    let activity = db
        .get_activity(id)?
        .ok_or(TrackerError::not_found("Activity", id))?;
    if !Visibility::for_user(user).can_see(&activity) {
        return Err(TrackerError::Forbidden(format!("Activity {} is not visible to you", id)).into());
    }
    Ok(())
}

fn publish_feed(state: &SharedState, activity: &Activity, entry: Option<FeedEntry>) {
    if let Some(entry) = entry {
        broadcast_activity(&state.ws_tx, activity, &WsMessage::FeedEvent { entry });
    }
}

fn publish_subtask(
    state: &SharedState,
    activity: &Activity,
    subtask_id: i64,
    subtask: Option<Subtask>,
    entry: Option<FeedEntry>,
) {
    broadcast_activity(
        &state.ws_tx,
        activity,
        &WsMessage::SubtaskChanged {
            activity_id: activity.id,
            subtask_id,
            subtask,
        },
    );
    publish_feed(state, activity, entry);
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{TestApp, test_app};
    use axum::http::StatusCode;
    use serde_json::{Value, json};

    use crate::tracker::auth::Visibility;
    use crate::tracker::models::Role;

    struct Crew {
        app: TestApp,
        sector: i64,
        admin: String,
        manager: String,
        tech: String,
        tech_id: i64,
    }

    async fn crew() -> Crew {
        let app = test_app();
        let sector = app.sector("Maintenance").await;
        let (_, admin) = app.login_as("root@example.com", Role::Admin, None).await;
        let (_, manager) = app
            .login_as("boss@example.com", Role::Manager, Some(sector))
            .await;
        let (tech_id, tech) = app
            .login_as("tech@example.com", Role::Member, Some(sector))
            .await;
        Crew {
            app,
            sector,
            admin,
            manager,
            tech,
            tech_id,
        }
    }

    async fn create(c: &Crew, token: &str, title: &str) -> i64 {
        let (status, body) = c
            .app
            .request("POST", "/api/activities", Some(token), Some(json!({"title": title})))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_i64().unwrap()
    }

    async fn act(c: &Crew, token: &str, id: i64, action: &str) -> (StatusCode, Value) {
        c.app
            .request(
                "POST",
                &format!("/api/activities/{}/{}", id, action),
                Some(token),
                None,
            )
            .await
    }

    #[tokio::test]
    async fn test_create_and_list_activity() {
        let c = crew().await;
        let id = create(&c, &c.tech, "Replace conveyor belt").await;

        let (status, list) = c.app.request("GET", "/api/activities", Some(&c.tech), None).await;
        assert_eq!(status, StatusCode::OK);
        let list = list.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["id"], id);
        assert_eq!(list[0]["status"], "next");
        assert_eq!(list[0]["assignee_id"], c.tech_id);
        assert_eq!(list[0]["sector_id"], c.sector);
    }

    #[tokio::test]
    async fn test_create_rejects_blank_title() {
        let c = crew().await;
        let (status, body) = c
            .app
            .request("POST", "/api/activities", Some(&c.tech), Some(json!({"title": "  "})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Title"));
    }

    #[tokio::test]
    async fn test_list_filters_by_status_and_search() {
        let c = crew().await;
        let pump = create(&c, &c.tech, "Pump overhaul").await;
        create(&c, &c.tech, "Valve check").await;
        act(&c, &c.tech, pump, "start").await;

        let (_, running) = c
            .app
            .request("GET", "/api/activities?status=in_progress", Some(&c.tech), None)
            .await;
        assert_eq!(running.as_array().unwrap().len(), 1);
        assert_eq!(running[0]["id"], pump);

        let (_, found) = c
            .app
            .request("GET", "/api/activities?search=valve", Some(&c.tech), None)
            .await;
        assert_eq!(found.as_array().unwrap().len(), 1);
        assert_eq!(found[0]["title"], "Valve check");
    }

    #[tokio::test]
    async fn test_timer_lifecycle_over_http() {
        let c = crew().await;
        let id = create(&c, &c.tech, "Overhaul pump").await;

        let (status, body) = act(&c, &c.tech, id, "start").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activity"]["status"], "in_progress");
        assert!(body["auto_paused"].is_null());

        let (status, body) = act(&c, &c.tech, id, "pause").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activity"]["status"], "paused");

        let (status, body) = c
            .app
            .request(
                "POST",
                &format!("/api/activities/{}/complete", id),
                Some(&c.tech),
                Some(json!({"note": "replaced seals"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activity"]["status"], "completed");

        let (status, body) = act(&c, &c.tech, id, "pause").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Cannot pause an activity that is completed");

        let (status, body) = act(&c, &c.tech, id, "reopen").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activity"]["status"], "paused");

        let (status, logs) = c
            .app
            .request("GET", &format!("/api/activities/{}/logs", id), Some(&c.tech), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let actions: Vec<&str> = logs
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["action"].as_str().unwrap())
            .collect();
        assert_eq!(actions, vec!["reopened", "completed", "paused", "started", "created"]);
        assert!(logs[1]["message"].as_str().unwrap().contains("replaced seals"));

        let (_, sessions) = c
            .app
            .request("GET", &format!("/api/activities/{}/sessions", id), Some(&c.tech), None)
            .await;
        assert_eq!(sessions.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_starting_second_activity_auto_pauses_first() {
        let c = crew().await;
        let first = create(&c, &c.tech, "First").await;
        let second = create(&c, &c.tech, "Second").await;

        act(&c, &c.tech, first, "start").await;
        let (status, body) = act(&c, &c.tech, second, "start").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activity"]["id"], second);
        assert_eq!(body["auto_paused"]["id"], first);
        assert_eq!(body["auto_paused"]["status"], "paused");

        let (_, timer) = c.app.request("GET", "/api/timer", Some(&c.tech), None).await;
        assert_eq!(timer["activity"]["id"], second);
    }

    #[tokio::test]
    async fn test_timer_action_broadcasts_status_change() {
        let c = crew().await;
        let id = create(&c, &c.tech, "Broadcasted").await;
        let mut rx = c.app.state.ws_tx.subscribe();

        act(&c, &c.tech, id, "start").await;

        let envelope = rx.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(envelope.text().unwrap()).unwrap();
        assert_eq!(parsed["type"], "ActivityStatusChanged");
        assert_eq!(parsed["data"]["from"], "next");
        assert_eq!(parsed["data"]["action"], "start");
        assert_eq!(parsed["data"]["activity"]["status"], "in_progress");

        let envelope = rx.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(envelope.text().unwrap()).unwrap();
        assert_eq!(parsed["type"], "FeedEvent");
        assert_eq!(parsed["data"]["entry"]["action"], "started");
    }

    #[tokio::test]
    async fn test_moved_activity_reaches_former_sector() {
        let c = crew().await;
        let assembly = c.app.sector("Assembly").await;
        let id = create(&c, &c.tech, "Relocated press").await;
        let mut rx = c.app.state.ws_tx.subscribe();

        let (status, body) = c
            .app
            .request(
                "PATCH",
                &format!("/api/activities/{}", id),
                Some(&c.admin),
                Some(json!({"sector_id": assembly})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let mut audiences = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            let parsed: Value = serde_json::from_str(envelope.text().unwrap()).unwrap();
            if parsed["type"] == "ActivityUpdated" {
                assert_eq!(parsed["data"]["activity"]["sector_id"], assembly);
                audiences.push(envelope.audience);
            }
        }
        assert_eq!(audiences.len(), 2);

        let old_sector_peer = Visibility::Scoped {
            sector_id: Some(c.sector),
            user_id: 900,
        };
        let new_sector_peer = Visibility::Scoped {
            sector_id: Some(assembly),
            user_id: 901,
        };
        assert!(audiences[0].includes(&old_sector_peer));
        assert!(!audiences[0].includes(&new_sector_peer));
        assert!(audiences[1].includes(&new_sector_peer));
        assert!(!audiences[1].includes(&old_sector_peer));
    }

    #[tokio::test]
    async fn test_adjust_time_and_trail() {
        let c = crew().await;
        let id = create(&c, &c.tech, "Paper timesheet").await;

        let (status, body) = c
            .app
            .request(
                "POST",
                &format!("/api/activities/{}/adjust-time", id),
                Some(&c.manager),
                Some(json!({"total_seconds": 5400, "reason": "Worked offline"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activity"]["total_seconds"], 5400);
        assert_eq!(body["adjustment"]["delta_seconds"], 5400);

        let (status, _) = c
            .app
            .request(
                "POST",
                &format!("/api/activities/{}/adjust-time", id),
                Some(&c.tech),
                Some(json!({"total_seconds": -1, "reason": "oops"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        act(&c, &c.tech, id, "start").await;
        let (status, _) = c
            .app
            .request(
                "POST",
                &format!("/api/activities/{}/adjust-time", id),
                Some(&c.tech),
                Some(json!({"total_seconds": 60, "reason": "running"})),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, trail) = c
            .app
            .request("GET", &format!("/api/activities/{}/adjustments", id), Some(&c.tech), None)
            .await;
        assert_eq!(trail.as_array().unwrap().len(), 1);
        assert_eq!(trail[0]["reason"], "Worked offline");
    }

    #[tokio::test]
    async fn test_other_sector_cannot_read_or_modify() {
        let c = crew().await;
        let other = c.app.sector("Assembly").await;
        let (_, outsider) = c
            .app
            .login_as("far@example.com", Role::Member, Some(other))
            .await;
        let id = create(&c, &c.tech, "Private").await;

        let (status, _) = c
            .app
            .request("GET", &format!("/api/activities/{}", id), Some(&outsider), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = act(&c, &outsider, id, "start").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = c
            .app
            .request("GET", &format!("/api/activities/{}/logs", id), Some(&outsider), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = c
            .app
            .request("GET", &format!("/api/activities/{}", id), Some(&c.admin), None)
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_get_missing_activity_is_404() {
        let c = crew().await;
        let (status, _) = c.app.request("GET", "/api/activities/999", Some(&c.tech), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = act(&c, &c.tech, 999, "start").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_and_delete_activity() {
        let c = crew().await;
        let id = create(&c, &c.tech, "Draft").await;

        let (status, body) = c
            .app
            .request(
                "PATCH",
                &format!("/api/activities/{}", id),
                Some(&c.tech),
                Some(json!({"title": "Final", "priority": "high", "due_date": "2024-07-01"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Final");
        assert_eq!(body["priority"], "high");
        assert_eq!(body["due_date"], "2024-07-01");

        let (status, _) = c
            .app
            .request("DELETE", &format!("/api/activities/{}", id), Some(&c.tech), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = c
            .app
            .request("DELETE", &format!("/api/activities/{}", id), Some(&c.manager), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = c
            .app
            .request("GET", &format!("/api/activities/{}", id), Some(&c.manager), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_subtask_endpoints() {
        let c = crew().await;
        let id = create(&c, &c.tech, "Checklist").await;

        let (status, subtask) = c
            .app
            .request(
                "POST",
                &format!("/api/activities/{}/subtasks", id),
                Some(&c.tech),
                Some(json!({"title": "Isolate power"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let subtask_id = subtask["id"].as_i64().unwrap();
        assert_eq!(subtask["done"], false);

        let (status, subtask) = c
            .app
            .request(
                "PATCH",
                &format!("/api/subtasks/{}", subtask_id),
                Some(&c.tech),
                Some(json!({"done": true})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(subtask["done"], true);

        let (_, detail) = c
            .app
            .request("GET", &format!("/api/activities/{}", id), Some(&c.tech), None)
            .await;
        assert_eq!(detail["activity"]["subtasks_total"], 1);
        assert_eq!(detail["activity"]["subtasks_done"], 1);
        assert_eq!(detail["subtasks"][0]["title"], "Isolate power");

        let (status, _) = c
            .app
            .request("DELETE", &format!("/api/subtasks/{}", subtask_id), Some(&c.tech), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = c
            .app
            .request("DELETE", &format!("/api/subtasks/{}", subtask_id), Some(&c.tech), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
