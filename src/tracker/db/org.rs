use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, params};

use super::{TrackerDb, apply_patch, enum_col, opt_int, required_text, unique_violation};
use crate::errors::TrackerError;
use crate::tracker::lifecycle::timestamp;
use crate::tracker::models::*;

const USER_COLUMNS: &str =
    "id, email, name, role, sector_id, active, password_hash, created_at, updated_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        role: enum_col(row, 3)?,
        sector_id: row.get(4)?,
        active: row.get(5)?,
        password_hash: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn sector_from_row(row: &Row<'_>) -> rusqlite::Result<Sector> {
    Ok(Sector {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn plant_from_row(row: &Row<'_>) -> rusqlite::Result<Plant> {
    Ok(Plant {
        id: row.get(0)?,
        name: row.get(1)?,
        code: row.get(2)?,
        location: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        sector_id: row.get(3)?,
        active: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

impl TrackerDb {
    fn count_where(&self, sql: &str, id: i64) -> Result<i64> {
        self.conn
            .query_row(sql, params![id], |row| row.get(0))
            .context("Failed to count references")
    }

    // ── Sectors ───────────────────────────────────────────────────────

    pub fn create_sector(&self, name: &str, description: &str) -> Result<Sector> {
        let name = required_text(name, "Sector name")?;
        self.conn
            .execute(
                "INSERT INTO sectors (name, description) VALUES (?1, ?2)",
                params![name, description.trim()],
            )
            .map_err(|e| unique_violation(e, "Sector"))?;
        let id = self.conn.last_insert_rowid();
        self.get_sector(id)?.context("Sector not found after insert")
    }

    pub fn list_sectors(&self) -> Result<Vec<Sector>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, description, created_at, updated_at FROM sectors ORDER BY name")
            .context("Failed to prepare list_sectors")?;
        let rows = stmt
            .query_map([], sector_from_row)
            .context("Failed to query sectors")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read sector row")
    }

    pub fn get_sector(&self, id: i64) -> Result<Option<Sector>> {
        self.conn
            .query_row(
                "SELECT id, name, description, created_at, updated_at FROM sectors WHERE id = ?1",
                params![id],
                sector_from_row,
            )
            .optional()
            .context("Failed to query sector")
    }

    pub fn update_sector(&self, id: i64, patch: &SectorPatch) -> Result<Sector> {
        let mut sets = Vec::new();
        if let Some(name) = &patch.name {
            sets.push(("name", Value::Text(required_text(name, "Sector name")?)));
        }
        if let Some(description) = &patch.description {
            sets.push(("description", Value::Text(description.trim().to_string())));
        }
        apply_patch(&self.conn, "sectors", id, sets).map_err(|e| unique_violation(e, "Sector"))?;
        self.get_sector(id)?
            .ok_or_else(|| TrackerError::not_found("Sector", id).into())
    }

    /// Delete a sector nobody references. Returns `false` if it did not exist.
    pub fn delete_sector(&self, id: i64) -> Result<bool> {
        let refs = self.count_where("SELECT COUNT(*) FROM users WHERE sector_id = ?1", id)?
            + self.count_where("SELECT COUNT(*) FROM projects WHERE sector_id = ?1", id)?
            + self.count_where("SELECT COUNT(*) FROM activities WHERE sector_id = ?1", id)?;
        if refs > 0 {
            return Err(TrackerError::Conflict(format!(
                "Sector {} is still referenced by {} users, projects or activities",
                id, refs
            ))
            .into());
        }
        let n = self
            .conn
            .execute("DELETE FROM sectors WHERE id = ?1", params![id])
            .context("Failed to delete sector")?;
        Ok(n > 0)
    }

    // ── Plants ────────────────────────────────────────────────────────

    pub fn create_plant(&self, name: &str, code: &str, location: &str) -> Result<Plant> {
        let name = required_text(name, "Plant name")?;
        let code = required_text(code, "Plant code")?.to_uppercase();
        self.conn
            .execute(
                "INSERT INTO plants (name, code, location) VALUES (?1, ?2, ?3)",
                params![name, code, location.trim()],
            )
            .map_err(|e| unique_violation(e, "Plant code"))?;
        let id = self.conn.last_insert_rowid();
        self.get_plant(id)?.context("Plant not found after insert")
    }

    pub fn list_plants(&self) -> Result<Vec<Plant>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, code, location, created_at, updated_at FROM plants ORDER BY name",
            )
            .context("Failed to prepare list_plants")?;
        let rows = stmt
            .query_map([], plant_from_row)
            .context("Failed to query plants")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read plant row")
    }

    pub fn get_plant(&self, id: i64) -> Result<Option<Plant>> {
        self.conn
            .query_row(
                "SELECT id, name, code, location, created_at, updated_at FROM plants WHERE id = ?1",
                params![id],
                plant_from_row,
            )
            .optional()
            .context("Failed to query plant")
    }

    pub fn update_plant(&self, id: i64, patch: &PlantPatch) -> Result<Plant> {
        let mut sets = Vec::new();
        if let Some(name) = &patch.name {
            sets.push(("name", Value::Text(required_text(name, "Plant name")?)));
        }
        if let Some(code) = &patch.code {
            sets.push((
                "code",
                Value::Text(required_text(code, "Plant code")?.to_uppercase()),
            ));
        }
        if let Some(location) = &patch.location {
            sets.push(("location", Value::Text(location.trim().to_string())));
        }
        apply_patch(&self.conn, "plants", id, sets).map_err(|e| unique_violation(e, "Plant code"))?;
        self.get_plant(id)?
            .ok_or_else(|| TrackerError::not_found("Plant", id).into())
    }

    pub fn delete_plant(&self, id: i64) -> Result<bool> {
        let refs = self.count_where("SELECT COUNT(*) FROM activities WHERE plant_id = ?1", id)?;
        if refs > 0 {
            return Err(TrackerError::Conflict(format!(
                "Plant {} is still referenced by {} activities",
                id, refs
            ))
            .into());
        }
        let n = self
            .conn
            .execute("DELETE FROM plants WHERE id = ?1", params![id])
            .context("Failed to delete plant")?;
        Ok(n > 0)
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, new: &NewProject) -> Result<Project> {
        let name = required_text(&new.name, "Project name")?;
        if let Some(sector_id) = new.sector_id {
            self.ensure_sector(sector_id)?;
        }
        self.conn
            .execute(
                "INSERT INTO projects (name, description, sector_id) VALUES (?1, ?2, ?3)",
                params![name, new.description.trim(), new.sector_id],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?.context("Project not found after insert")
    }

    /// Projects visible to a sector: its own plus organization-wide ones.
    /// `None` lists everything.
    pub fn list_projects(&self, sector_id: Option<i64>) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, description, sector_id, active, created_at, updated_at
                 FROM projects
                 WHERE ?1 IS NULL OR sector_id = ?1 OR sector_id IS NULL
                 ORDER BY active DESC, name",
            )
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map(params![sector_id], project_from_row)
            .context("Failed to query projects")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read project row")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, description, sector_id, active, created_at, updated_at
                 FROM projects WHERE id = ?1",
                params![id],
                project_from_row,
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn update_project(&self, id: i64, patch: &ProjectPatch) -> Result<Project> {
        let mut sets = Vec::new();
        if let Some(name) = &patch.name {
            sets.push(("name", Value::Text(required_text(name, "Project name")?)));
        }
        if let Some(description) = &patch.description {
            sets.push(("description", Value::Text(description.trim().to_string())));
        }
        if let Some(sector_id) = patch.sector_id {
            if let Some(sid) = sector_id {
                self.ensure_sector(sid)?;
            }
            sets.push(("sector_id", opt_int(sector_id)));
        }
        if let Some(active) = patch.active {
            sets.push(("active", Value::Integer(active as i64)));
        }
        apply_patch(&self.conn, "projects", id, sets).context("Failed to update project")?;
        self.get_project(id)?
            .ok_or_else(|| TrackerError::not_found("Project", id).into())
    }

    pub fn delete_project(&self, id: i64) -> Result<bool> {
        let refs = self.count_where("SELECT COUNT(*) FROM activities WHERE project_id = ?1", id)?;
        if refs > 0 {
            return Err(TrackerError::Conflict(format!(
                "Project {} still has {} activities; deactivate it instead",
                id, refs
            ))
            .into());
        }
        let n = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        Ok(n > 0)
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(&self, new: &NewUser) -> Result<User> {
        let email = required_text(&new.email, "Email")?.to_lowercase();
        if !email.contains('@') {
            return Err(TrackerError::Validation(format!("Invalid email: {}", email)).into());
        }
        let name = required_text(&new.name, "Name")?;
        if let Some(sector_id) = new.sector_id {
            self.ensure_sector(sector_id)?;
        }
        self.conn
            .execute(
                "INSERT INTO users (email, name, password_hash, role, sector_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![email, name, new.password_hash, new.role.as_str(), new.sector_id],
            )
            .map_err(|e| unique_violation(e, "User email"))?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    /// Users in a sector (`None` lists everyone).
    pub fn list_users(&self, sector_id: Option<i64>) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM users WHERE ?1 IS NULL OR sector_id = ?1 ORDER BY name",
                USER_COLUMNS
            ))
            .context("Failed to prepare list_users")?;
        let rows = stmt
            .query_map(params![sector_id], user_from_row)
            .context("Failed to query users")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read user row")
    }

    pub fn count_users(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .context("Failed to count users")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                params![id],
                user_from_row,
            )
            .optional()
            .context("Failed to query user")
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS),
                params![email.trim()],
                user_from_row,
            )
            .optional()
            .context("Failed to query user by email")
    }

    pub fn update_user(&self, id: i64, patch: &UserPatch) -> Result<User> {
        let mut sets = Vec::new();
        if let Some(name) = &patch.name {
            sets.push(("name", Value::Text(required_text(name, "Name")?)));
        }
        if let Some(role) = patch.role {
            sets.push(("role", Value::Text(role.as_str().to_string())));
        }
        if let Some(sector_id) = patch.sector_id {
            if let Some(sid) = sector_id {
                self.ensure_sector(sid)?;
            }
            sets.push(("sector_id", opt_int(sector_id)));
        }
        if let Some(active) = patch.active {
            sets.push(("active", Value::Integer(active as i64)));
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        apply_patch(&tx, "users", id, sets).context("Failed to update user")?;
        if patch.active == Some(false) {
            tx.execute("DELETE FROM auth_sessions WHERE user_id = ?1", params![id])
                .context("Failed to revoke sessions of deactivated user")?;
        }
        tx.commit().context("Failed to commit user update")?;

        self.get_user(id)?
            .ok_or_else(|| TrackerError::not_found("User", id).into())
    }

    /// Replace a password hash and revoke every session of the user.
    pub fn set_password_hash(&self, id: i64, password_hash: &str) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let n = tx
            .execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                params![password_hash, id],
            )
            .context("Failed to update password")?;
        if n == 0 {
            return Err(TrackerError::not_found("User", id).into());
        }
        tx.execute("DELETE FROM auth_sessions WHERE user_id = ?1", params![id])
            .context("Failed to revoke sessions")?;
        tx.commit().context("Failed to commit password change")?;
        Ok(())
    }

    pub(super) fn ensure_sector(&self, id: i64) -> Result<()> {
        match self.get_sector(id)? {
            Some(_) => Ok(()),
            None => Err(TrackerError::Validation(format!("Unknown sector {}", id)).into()),
        }
    }

    // ── Auth sessions ─────────────────────────────────────────────────

    pub fn create_auth_session(
        &self,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO auth_sessions (user_id, token_hash, expires_at) VALUES (?1, ?2, ?3)",
                params![user_id, token_hash, timestamp(expires_at)],
            )
            .context("Failed to insert auth session")?;
        Ok(())
    }

    /// Resolve a token hash to its active user, bumping `last_seen_at`.
    pub fn resolve_auth_session(&self, token_hash: &str, now: DateTime<Utc>) -> Result<User> {
        let now_ts = timestamp(now);
        let user_id: Option<i64> = self
            .conn
            .query_row(
                "SELECT user_id FROM auth_sessions WHERE token_hash = ?1 AND expires_at > ?2",
                params![token_hash, now_ts],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query auth session")?;
        let Some(user_id) = user_id else {
            return Err(TrackerError::Unauthorized("Invalid or expired session".into()).into());
        };
        let user = match self.get_user(user_id)? {
            Some(user) if user.active => user,
            _ => return Err(TrackerError::Unauthorized("Account is disabled".into()).into()),
        };
        self.conn
            .execute(
                "UPDATE auth_sessions SET last_seen_at = ?1 WHERE token_hash = ?2",
                params![now_ts, token_hash],
            )
            .context("Failed to touch auth session")?;
        Ok(user)
    }

    pub fn delete_auth_session(&self, token_hash: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "DELETE FROM auth_sessions WHERE token_hash = ?1",
                params![token_hash],
            )
            .context("Failed to delete auth session")?;
        Ok(n > 0)
    }

    pub fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM auth_sessions WHERE expires_at <= ?1",
                params![timestamp(now)],
            )
            .context("Failed to purge expired sessions")
    }
}
