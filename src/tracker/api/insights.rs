use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use super::{ApiError, SharedState};
use crate::tracker::auth::{AuthUser, Visibility};
use crate::tracker::models::PresenceEntry;

#[derive(Deserialize, Default)]
pub struct FeedQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct DashboardQuery {
    pub sector_id: Option<i64>,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// The caller's running activity, or `null`.
pub async fn active_timer(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let timer = state
        .db
        .call(move |db| db.active_timer(user.id, Utc::now()))
        .await?;
    Ok(Json(timer))
}

pub async fn feed(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Query(query): Query<FeedQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(state.settings.feed_limit);
    let entries = state.db.call(move |db| db.feed(&user, limit)).await?;
    Ok(Json(entries))
}

pub async fn presence(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> Json<Vec<PresenceEntry>> {
    Json(state.presence.visible_to(&Visibility::for_user(&user)))
}

pub async fn dashboard(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Query(query): Query<DashboardQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let from = query.from.as_deref().map(|s| parse_bound(s, false)).transpose()?;
    let to = query.to.as_deref().map(|s| parse_bound(s, true)).transpose()?;
    if let (Some(from), Some(to)) = (from, to) {
        if from >= to {
            return Err(ApiError::BadRequest("`from` must be before `to`".into()));
        }
    }
    let sector_id = query.sector_id;
    let stats = state
        .db
        .call(move |db| db.dashboard(&user, sector_id, from, to, Utc::now()))
        .await?;
    Ok(Json(stats))
}

/// Accept RFC 3339 or a bare `YYYY-MM-DD`. A bare date used as the upper
/// bound means the end of that day.
fn parse_bound(raw: &str, upper: bool) -> Result<DateTime<Utc>, ApiError> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("Invalid date: {}", raw)))?;
    let date = if upper { date.succ_opt().unwrap_or(date) } else { date };
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid date: {}", raw)))
}
