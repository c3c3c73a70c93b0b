//! Authentication and sector-scoped authorization.
//!
//! Login issues an opaque bearer token; only its SHA-256 is stored in
//! `auth_sessions`. Every authenticated handler takes an [`AuthUser`], which
//! resolves the token on the blocking DB pool.
//!
//! Visibility rules:
//! - admins see every activity
//! - managers and members see their sector's activities plus anything
//!   assigned to or created by them
//!
//! Modification rules:
//! - admins may modify anything
//! - managers may modify activities in their sector
//! - members may modify activities assigned to or created by them

use anyhow::{Result, anyhow};
use argon2::Argon2;
use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng,
};
use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, header, request::Parts};
use chrono::Utc;
use sha2::{Digest, Sha256};

use super::api::{ApiError, SharedState};
use super::models::{Activity, Role, User};
use crate::errors::TrackerError;

pub fn hash_password(password: &str) -> Result<String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(TrackerError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ))
        .into());
    }
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("Failed to hash password: {}", e))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

pub const MIN_PASSWORD_LEN: usize = 8;

/// Fresh opaque bearer token (returned to the client exactly once).
pub fn generate_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

// ── Visibility ────────────────────────────────────────────────────────

/// Which activities a user may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    All,
    Scoped {
        sector_id: Option<i64>,
        user_id: i64,
    },
}

impl Visibility {
    pub fn for_user(user: &User) -> Self {
        if user.is_admin() {
            Self::All
        } else {
            Self::Scoped {
                sector_id: user.sector_id,
                user_id: user.id,
            }
        }
    }

    pub fn can_see(&self, activity: &Activity) -> bool {
        match *self {
            Self::All => true,
            Self::Scoped { sector_id, user_id } => {
                (sector_id.is_some() && activity.sector_id == sector_id)
                    || activity.assignee_id == Some(user_id)
                    || activity.created_by == user_id
            }
        }
    }

    /// Whether envelopes scoped to `sector_id` reach this viewer.
    pub fn sees_sector(&self, sector_id: Option<i64>) -> bool {
        match *self {
            Self::All => true,
            Self::Scoped { sector_id: own, .. } => sector_id.is_none() || sector_id == own,
        }
    }

    /// Bind values for [`Visibility::SQL`]: `(see_all, sector_id, user_id)`.
    pub fn sql_params(&self) -> (bool, Option<i64>, i64) {
        match *self {
            Self::All => (true, None, 0),
            Self::Scoped { sector_id, user_id } => (false, sector_id, user_id),
        }
    }

    /// Predicate over the `a` alias of `activities`, bound to `:see_all`,
    /// `:vis_sector` and `:vis_user`.
    pub const SQL: &'static str = "(:see_all = 1 OR a.sector_id = :vis_sector \
         OR a.assignee_id = :vis_user OR a.created_by = :vis_user)";
}

pub fn can_modify_activity(user: &User, activity: &Activity) -> bool {
    match user.role {
        Role::Admin => true,
        Role::Manager => {
            (user.sector_id.is_some() && activity.sector_id == user.sector_id)
                || activity.assignee_id == Some(user.id)
                || activity.created_by == user.id
        }
        Role::Member => activity.assignee_id == Some(user.id) || activity.created_by == user.id,
    }
}

pub fn can_delete_activity(user: &User, activity: &Activity) -> bool {
    match user.role {
        Role::Admin => true,
        Role::Manager => user.sector_id.is_some() && activity.sector_id == user.sector_id,
        Role::Member => false,
    }
}

/// Managers own projects in their sector; admins own all of them.
pub fn can_manage_project(user: &User, project_sector: Option<i64>) -> bool {
    match user.role {
        Role::Admin => true,
        Role::Manager => user.sector_id.is_some() && project_sector == user.sector_id,
        Role::Member => false,
    }
}

pub fn require_admin(user: &User) -> Result<(), TrackerError> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(TrackerError::Forbidden("administrator role required".into()))
    }
}

// ── Extractor ─────────────────────────────────────────────────────────

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
        let user = resolve_token(state, token).await?;
        Ok(AuthUser(user))
    }
}

/// Look up the user behind a raw token (header or `?token=` query).
pub async fn resolve_token(state: &SharedState, token: &str) -> Result<User, ApiError> {
    let token_hash = hash_token(token);
    let user = state
        .db
        .call(move |db| db.resolve_auth_session(&token_hash, Utc::now()))
        .await?;
    Ok(user)
}
