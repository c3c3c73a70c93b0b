//! REST surface of the tracker.
//!
//! Handlers are split by area: `account` (login, users, sectors, plants,
//! projects), `activities` (CRUD, timer, subtasks) and `insights` (timer,
//! feed, presence, dashboard). All of them share [`AppState`] and answer
//! errors as `{"error": "..."}`.

mod account;
mod activities;
mod insights;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use chrono::Duration;
use tokio::sync::broadcast;

use super::db::DbHandle;
use super::presence::PresenceRegistry;
use super::ws::WsEnvelope;
use crate::errors::TrackerError;

// ── Shared application state ──────────────────────────────────────────

/// Runtime knobs the handlers need from the loaded configuration.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// Pause the user's running activity when they start another one.
    pub auto_pause_on_start: bool,
    pub session_ttl: Duration,
    pub feed_limit: i64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            auto_pause_on_start: true,
            session_ttl: Duration::hours(12),
            feed_limit: 50,
        }
    }
}

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<WsEnvelope>,
    pub presence: PresenceRegistry,
    pub settings: ApiSettings,
}

impl AppState {
    pub fn new(db: DbHandle, settings: ApiSettings) -> Self {
        let (ws_tx, _rx) = broadcast::channel::<WsEnvelope>(256);
        Self {
            db,
            ws_tx,
            presence: PresenceRegistry::new(),
            settings,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<&TrackerError> for ApiError {
    fn from(err: &TrackerError) -> Self {
        let msg = err.to_string();
        match err {
            TrackerError::NotFound { .. } => ApiError::NotFound(msg),
            TrackerError::Validation(_) => ApiError::BadRequest(msg),
            TrackerError::Unauthorized(_) => ApiError::Unauthorized(msg),
            TrackerError::Forbidden(_) => ApiError::Forbidden(msg),
            TrackerError::InvalidTransition { .. }
            | TrackerError::InvalidState(_)
            | TrackerError::TimerConflict { .. }
            | TrackerError::Conflict(_) => ApiError::Conflict(msg),
        }
    }
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        ApiError::from(&err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match TrackerError::find(&err) {
            Some(domain) => ApiError::from(domain),
            None => {
                tracing::error!(error = %format!("{:#}", err), "Request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/auth/login", post(account::login))
        .route("/api/auth/logout", post(account::logout))
        .route("/api/auth/me", get(account::me))
        .route("/api/auth/password", post(account::change_password))
        .route("/api/users", get(account::list_users).post(account::create_user))
        .route(
            "/api/users/{id}",
            get(account::get_user).patch(account::update_user),
        )
        .route(
            "/api/sectors",
            get(account::list_sectors).post(account::create_sector),
        )
        .route(
            "/api/sectors/{id}",
            patch(account::update_sector).delete(account::delete_sector),
        )
        .route(
            "/api/plants",
            get(account::list_plants).post(account::create_plant),
        )
        .route(
            "/api/plants/{id}",
            patch(account::update_plant).delete(account::delete_plant),
        )
        .route(
            "/api/projects",
            get(account::list_projects).post(account::create_project),
        )
        .route(
            "/api/projects/{id}",
            get(account::get_project)
                .patch(account::update_project)
                .delete(account::delete_project),
        )
        .route(
            "/api/activities",
            get(activities::list_activities).post(activities::create_activity),
        )
        .route(
            "/api/activities/{id}",
            get(activities::get_activity)
                .patch(activities::update_activity)
                .delete(activities::delete_activity),
        )
        .route("/api/activities/{id}/start", post(activities::start_activity))
        .route("/api/activities/{id}/pause", post(activities::pause_activity))
        .route(
            "/api/activities/{id}/complete",
            post(activities::complete_activity),
        )
        .route("/api/activities/{id}/cancel", post(activities::cancel_activity))
        .route("/api/activities/{id}/reopen", post(activities::reopen_activity))
        .route("/api/activities/{id}/adjust-time", post(activities::adjust_time))
        .route("/api/activities/{id}/logs", get(activities::list_logs))
        .route("/api/activities/{id}/sessions", get(activities::list_sessions))
        .route(
            "/api/activities/{id}/adjustments",
            get(activities::list_adjustments),
        )
        .route("/api/activities/{id}/subtasks", post(activities::add_subtask))
        .route(
            "/api/subtasks/{id}",
            patch(activities::update_subtask).delete(activities::delete_subtask),
        )
        .route("/api/timer", get(insights::active_timer))
        .route("/api/feed", get(insights::feed))
        .route("/api/presence", get(insights::presence))
        .route("/api/dashboard", get(insights::dashboard))
        .route("/health", get(health_check))
}

async fn health_check() -> &'static str {
    "ok"
}

// ── Test helpers ──────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::tracker::auth::{generate_token, hash_password, hash_token};
    use crate::tracker::db::TrackerDb;
    use crate::tracker::models::{NewUser, Role};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    pub struct TestApp {
        pub state: SharedState,
        pub router: Router,
    }

    pub fn test_app() -> TestApp {
        let db = TrackerDb::new_in_memory().unwrap();
        let state = Arc::new(AppState::new(DbHandle::new(db), ApiSettings::default()));
        let router = api_router().with_state(state.clone());
        TestApp { state, router }
    }

    impl TestApp {
        /// Create a sector directly in the store.
        pub async fn sector(&self, name: &str) -> i64 {
            let name = name.to_string();
            self.state
                .db
                .call(move |db| db.create_sector(&name, ""))
                .await
                .unwrap()
                .id
        }

        /// Create a user and a live session; returns `(user_id, token)`.
        pub async fn login_as(&self, email: &str, role: Role, sector_id: Option<i64>) -> (i64, String) {
            let email = email.to_string();
            let token = generate_token();
            let token_hash = hash_token(&token);
            let id = self
                .state
                .db
                .call(move |db| {
                    let user = db.create_user(&NewUser {
                        name: email.split('@').next().unwrap_or("user").to_string(),
                        email,
                        password_hash: hash_password("password123")?,
                        role,
                        sector_id,
                    })?;
                    db.create_auth_session(
                        user.id,
                        &token_hash,
                        chrono::Utc::now() + Duration::hours(1),
                    )?;
                    Ok(user.id)
                })
                .await
                .unwrap();
            (id, token)
        }

        pub async fn request(
            &self,
            method: &str,
            uri: &str,
            token: Option<&str>,
            body: Option<serde_json::Value>,
        ) -> (StatusCode, serde_json::Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header("authorization", format!("Bearer {}", token));
            }
            let request = match body {
                Some(json) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(json.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let json = if bytes.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
            };
            (status, json)
        }
    }
}
