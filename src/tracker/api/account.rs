use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ApiError, SharedState};
use crate::errors::TrackerError;
use crate::tracker::auth::{
    AuthUser, bearer_token, can_manage_project, generate_token, hash_password, hash_token,
    require_admin, verify_password,
};
use crate::tracker::models::*;
use crate::tracker::ws::{Audience, WsMessage, broadcast_message};

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub name: String,
    pub password: String,
    #[serde(default = "default_role")]
    pub role: Role,
    pub sector_id: Option<i64>,
}

fn default_role() -> Role {
    Role::Member
}

#[derive(Deserialize)]
pub struct CreateSectorRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize)]
pub struct CreatePlantRequest {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub location: String,
}

#[derive(Deserialize, Default)]
pub struct SectorQuery {
    pub sector_id: Option<i64>,
}

// ── Auth ──────────────────────────────────────────────────────────────

pub async fn login(
    State(state): State<SharedState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ttl = state.settings.session_ttl;
    let (token, user, expires_at) = state
        .db
        .call(move |db| {
            let user = match db.get_user_by_email(&req.email)? {
                Some(user) if user.active && verify_password(&req.password, &user.password_hash) => {
                    user
                }
                _ => {
                    return Err(
                        TrackerError::Unauthorized("Invalid email or password".into()).into(),
                    );
                }
            };
            let token = generate_token();
            let expires_at = Utc::now() + ttl;
            db.create_auth_session(user.id, &hash_token(&token), expires_at)?;
            Ok((token, user, expires_at))
        })
        .await?;
    tracing::info!(user_id = user.id, "User logged in");
    Ok(Json(LoginResponse {
        token,
        user,
        expires_at,
    }))
}

pub async fn logout(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let token_hash = bearer_token(&headers)
        .map(hash_token)
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
    state
        .db
        .call(move |db| db.delete_auth_session(&token_hash))
        .await?;
    tracing::info!(user_id = user.id, "User logged out");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(AuthUser(user): AuthUser) -> Json<User> {
    Json(user)
}

/// Change the caller's password. Every session is revoked, including the
/// one used for this request.
pub async fn change_password(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(move |db| {
            if !verify_password(&req.current_password, &user.password_hash) {
                return Err(
                    TrackerError::Unauthorized("Current password is incorrect".into()).into(),
                );
            }
            let hash = hash_password(&req.new_password)?;
            db.set_password_hash(user.id, &hash)
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Users ─────────────────────────────────────────────────────────────

/// Admins list everyone (optionally by sector); others see their sector.
pub async fn list_users(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Query(query): Query<SectorQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let users = state
        .db
        .call(move |db| {
            if user.is_admin() {
                return db.list_users(query.sector_id);
            }
            match user.sector_id {
                Some(sector_id) => db.list_users(Some(sector_id)),
                None => Ok(vec![user]),
            }
        })
        .await?;
    Ok(Json(users))
}

pub async fn create_user(
    State(state): State<SharedState>,
    AuthUser(admin): AuthUser,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&admin)?;
    let user = state
        .db
        .call(move |db| {
            if let Some(sector_id) = req.sector_id {
                if db.get_sector(sector_id)?.is_none() {
                    return Err(
                        TrackerError::Validation(format!("Unknown sector {}", sector_id)).into(),
                    );
                }
            }
            db.create_user(&NewUser {
                email: req.email,
                name: req.name,
                password_hash: hash_password(&req.password)?,
                role: req.role,
                sector_id: req.sector_id,
            })
        })
        .await?;
    tracing::info!(user_id = user.id, role = %user.role, "User created");
    broadcast_user(&state, &user);
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn get_user(
    State(state): State<SharedState>,
    AuthUser(viewer): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .db
        .call(move |db| db.get_user(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("User {} not found", id)))?;
    let same_sector = viewer.sector_id.is_some() && viewer.sector_id == user.sector_id;
    if !(viewer.is_admin() || viewer.id == id || same_sector) {
        return Err(ApiError::Forbidden(format!("User {} is not visible to you", id)));
    }
    Ok(Json(user))
}

pub async fn update_user(
    State(state): State<SharedState>,
    AuthUser(admin): AuthUser,
    Path(id): Path<i64>,
    Json(patch): Json<UserPatch>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&admin)?;
    if admin.id == id && (patch.active == Some(false) || patch.role.is_some_and(|r| r != Role::Admin)) {
        return Err(ApiError::BadRequest(
            "You cannot deactivate or demote yourself".into(),
        ));
    }
    let (before, user) = state
        .db
        .call(move |db| {
            let before = db.get_user(id)?;
            let user = db.update_user(id, &patch)?;
            Ok((before, user))
        })
        .await?;
    tracing::info!(user_id = user.id, active = user.active, "User updated");
    // A user moved out of a sector disappears from its roster too.
    if let Some(before) = before.filter(|b| b.sector_id != user.sector_id) {
        broadcast_message(
            &state.ws_tx,
            Audience::for_user(&before),
            &WsMessage::UserChanged { user: user.clone() },
        );
    }
    broadcast_user(&state, &user);
    Ok(Json(user))
}

// ── Sectors ───────────────────────────────────────────────────────────

pub async fn list_sectors(
    State(state): State<SharedState>,
    AuthUser(_user): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let sectors = state.db.call(|db| db.list_sectors()).await?;
    Ok(Json(sectors))
}

pub async fn create_sector(
    State(state): State<SharedState>,
    AuthUser(admin): AuthUser,
    Json(req): Json<CreateSectorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&admin)?;
    let sector = state
        .db
        .call(move |db| db.create_sector(&req.name, &req.description))
        .await?;
    broadcast_sector(&state, sector.id, Some(sector.clone()));
    Ok((StatusCode::CREATED, Json(sector)))
}

pub async fn update_sector(
    State(state): State<SharedState>,
    AuthUser(admin): AuthUser,
    Path(id): Path<i64>,
    Json(patch): Json<SectorPatch>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&admin)?;
    let sector = state.db.call(move |db| db.update_sector(id, &patch)).await?;
    broadcast_sector(&state, id, Some(sector.clone()));
    Ok(Json(sector))
}

pub async fn delete_sector(
    State(state): State<SharedState>,
    AuthUser(admin): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&admin)?;
    match state.db.call(move |db| db.delete_sector(id)).await? {
        true => {
            broadcast_sector(&state, id, None);
            Ok(StatusCode::NO_CONTENT)
        }
        false => Err(ApiError::NotFound(format!("Sector {} not found", id))),
    }
}

// ── Plants ────────────────────────────────────────────────────────────

pub async fn list_plants(
    State(state): State<SharedState>,
    AuthUser(_user): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let plants = state.db.call(|db| db.list_plants()).await?;
    Ok(Json(plants))
}

pub async fn create_plant(
    State(state): State<SharedState>,
    AuthUser(admin): AuthUser,
    Json(req): Json<CreatePlantRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&admin)?;
    let plant = state
        .db
        .call(move |db| db.create_plant(&req.name, &req.code, &req.location))
        .await?;
    broadcast_plant(&state, plant.id, Some(plant.clone()));
    Ok((StatusCode::CREATED, Json(plant)))
}

pub async fn update_plant(
    State(state): State<SharedState>,
    AuthUser(admin): AuthUser,
    Path(id): Path<i64>,
    Json(patch): Json<PlantPatch>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&admin)?;
    let plant = state.db.call(move |db| db.update_plant(id, &patch)).await?;
    broadcast_plant(&state, id, Some(plant.clone()));
    Ok(Json(plant))
}

pub async fn delete_plant(
    State(state): State<SharedState>,
    AuthUser(admin): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&admin)?;
    match state.db.call(move |db| db.delete_plant(id)).await? {
        true => {
            broadcast_plant(&state, id, None);
            Ok(StatusCode::NO_CONTENT)
        }
        false => Err(ApiError::NotFound(format!("Plant {} not found", id))),
    }
}

// ── Projects ──────────────────────────────────────────────────────────

pub async fn list_projects(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Query(query): Query<SectorQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let projects = state
        .db
        .call(move |db| {
            let projects = if user.is_admin() {
                db.list_projects(query.sector_id)?
            } else {
                db.list_projects(user.sector_id)?
                    .into_iter()
                    .filter(|p| p.sector_id.is_none() || p.sector_id == user.sector_id)
                    .collect()
            };
            Ok(projects)
        })
        .await?;
    Ok(Json(projects))
}

pub async fn create_project(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(mut new): Json<NewProject>,
) -> Result<impl IntoResponse, ApiError> {
    if !user.is_admin() && new.sector_id.is_none() {
        new.sector_id = user.sector_id;
    }
    if !can_manage_project(&user, new.sector_id) {
        return Err(ApiError::Forbidden(
            "Only administrators and the sector's managers can create projects".into(),
        ));
    }
    let project = state.db.call(move |db| db.create_project(&new)).await?;
    broadcast_project(&state, project.id, project.sector_id, Some(project.clone()));
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn get_project(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, id).await?;
    let visible = user.is_admin()
        || project.sector_id.is_none()
        || (user.sector_id.is_some() && project.sector_id == user.sector_id);
    if !visible {
        return Err(ApiError::Forbidden(format!("Project {} is not visible to you", id)));
    }
    Ok(Json(project))
}

pub async fn update_project(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
    Json(patch): Json<ProjectPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let current = load_project(&state, id).await?;
    let target_ok = patch
        .sector_id
        .map_or(true, |target| can_manage_project(&user, target));
    if !can_manage_project(&user, current.sector_id) || !target_ok {
        return Err(ApiError::Forbidden(format!("You may not modify project {}", id)));
    }
    let project = state.db.call(move |db| db.update_project(id, &patch)).await?;
    broadcast_project(&state, id, current.sector_id, Some(project.clone()));
    if project.sector_id != current.sector_id {
        broadcast_project(&state, id, project.sector_id, Some(project.clone()));
    }
    Ok(Json(project))
}

pub async fn delete_project(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let current = load_project(&state, id).await?;
    if !can_manage_project(&user, current.sector_id) {
        return Err(ApiError::Forbidden(format!("You may not delete project {}", id)));
    }
    match state.db.call(move |db| db.delete_project(id)).await? {
        true => {
            broadcast_project(&state, id, current.sector_id, None);
            Ok(StatusCode::NO_CONTENT)
        }
        false => Err(ApiError::NotFound(format!("Project {} not found", id))),
    }
}

async fn load_project(state: &SharedState, id: i64) -> Result<Project, ApiError> {
    state
        .db
        .call(move |db| db.get_project(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Project {} not found", id)))
}

fn broadcast_project(
    state: &SharedState,
    project_id: i64,
    sector_id: Option<i64>,
    project: Option<Project>,
) {
    broadcast_message(
        &state.ws_tx,
        Audience::for_sector(sector_id),
        &WsMessage::ProjectChanged {
            project_id,
            project,
        },
    );
}

fn broadcast_user(state: &SharedState, user: &User) {
    broadcast_message(
        &state.ws_tx,
        Audience::for_user(user),
        &WsMessage::UserChanged { user: user.clone() },
    );
}

// Sectors and plants are reference data every user can list.
fn broadcast_sector(state: &SharedState, sector_id: i64, sector: Option<Sector>) {
    broadcast_message(
        &state.ws_tx,
        Audience::Everyone,
        &WsMessage::SectorChanged { sector_id, sector },
    );
}

fn broadcast_plant(state: &SharedState, plant_id: i64, plant: Option<Plant>) {
    broadcast_message(
        &state.ws_tx,
        Audience::Everyone,
        &WsMessage::PlantChanged { plant_id, plant },
    );
}
