//! Database bootstrap commands: `activitypro init-db` and `create-user`.

use anyhow::{Context, Result, anyhow};
use std::path::Path;

use activitypro::tracker::auth::hash_password;
use activitypro::tracker::db::TrackerDb;
use activitypro::tracker::models::{NewUser, Role};

pub struct NewAccount<'a> {
    pub email: &'a str,
    pub name: &'a str,
    pub password: &'a str,
    pub role: &'a str,
    pub sector: Option<&'a str>,
}

fn open_db(db_path: &Path) -> Result<TrackerDb> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    TrackerDb::new(db_path)
}

pub fn cmd_init_db(db_path: &Path) -> Result<()> {
    let db = open_db(db_path)?;
    println!("Database initialized at {}", db_path.display());
    if db.count_users()? == 0 {
        println!();
        println!("No users yet. Create the first administrator with:");
        println!("  activitypro create-user --role admin --email <email> --name <name>");
    }
    Ok(())
}

pub fn cmd_create_user(db_path: &Path, account: NewAccount<'_>) -> Result<()> {
    let role: Role = account.role.parse().map_err(|e: String| anyhow!(e))?;
    let db = open_db(db_path)?;

    let sector_id = match account.sector {
        Some(name) => {
            let existing = db
                .list_sectors()?
                .into_iter()
                .find(|s| s.name.eq_ignore_ascii_case(name.trim()));
            let sector = match existing {
                Some(sector) => sector,
                None => {
                    let sector = db.create_sector(name, "")?;
                    println!("Created sector '{}' (id {})", sector.name, sector.id);
                    sector
                }
            };
            Some(sector.id)
        }
        None => None,
    };

    let user = db.create_user(&NewUser {
        email: account.email.to_string(),
        name: account.name.to_string(),
        password_hash: hash_password(account.password)?,
        role,
        sector_id,
    })?;

    println!(
        "Created {} {} <{}> (id {})",
        user.role.as_str(),
        user.name,
        user.email,
        user.id
    );
    Ok(())
}
