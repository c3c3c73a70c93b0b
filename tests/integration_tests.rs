//! Integration tests for the activitypro CLI
//!
//! These drive the real binary against a throwaway directory.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create an activitypro Command rooted in `dir`
fn activitypro(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("activitypro");
    cmd.current_dir(dir.path())
        .env_remove("RUST_LOG")
        .env_remove("ACTIVITYPRO_CONFIG")
        .env_remove("ACTIVITYPRO_PORT")
        .env_remove("ACTIVITYPRO_DB_PATH")
        .env_remove("ACTIVITYPRO_PASSWORD");
    cmd
}

fn create_temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = create_temp_dir();
        activitypro(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("create-user"));
    }

    #[test]
    fn test_version() {
        let dir = create_temp_dir();
        activitypro(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = create_temp_dir();
        activitypro(&dir).arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Database Bootstrap Tests
// =============================================================================

mod database {
    use super::*;

    #[test]
    fn test_init_db_creates_file_and_parent_dirs() {
        let dir = create_temp_dir();
        let db_path = dir.path().join("nested/data/tracker.db");

        activitypro(&dir)
            .args(["init-db", "--db-path"])
            .arg(&db_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("Database initialized"))
            .stdout(predicate::str::contains("create-user --role admin"));

        assert!(db_path.exists());
    }

    #[test]
    fn test_init_db_uses_configured_path() {
        let dir = create_temp_dir();
        fs::write(
            dir.path().join("activitypro.toml"),
            "[database]\npath = \"store/from-config.db\"\n",
        )
        .unwrap();

        activitypro(&dir).arg("init-db").assert().success();

        assert!(dir.path().join("store/from-config.db").exists());
    }

    #[test]
    fn test_create_user_with_new_sector() {
        let dir = create_temp_dir();

        activitypro(&dir)
            .args([
                "create-user",
                "--email",
                "Admin@Example.com",
                "--name",
                "Site Admin",
                "--password",
                "correct-horse",
                "--role",
                "admin",
                "--sector",
                "Maintenance",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created sector 'Maintenance'"))
            .stdout(predicate::str::contains("admin Site Admin <admin@example.com>"));

        assert!(dir.path().join("data/activitypro.db").exists());
    }

    #[test]
    fn test_create_user_reuses_existing_sector() {
        let dir = create_temp_dir();
        let create = |email: &str| {
            let mut cmd = activitypro(&dir);
            cmd.args([
                "create-user",
                "--email",
                email,
                "--name",
                "Tech",
                "--sector",
                "maintenance",
            ])
            .env("ACTIVITYPRO_PASSWORD", "password123");
            cmd
        };

        create("one@example.com")
            .assert()
            .success()
            .stdout(predicate::str::contains("Created sector"));
        create("two@example.com")
            .assert()
            .success()
            .stdout(predicate::str::contains("Created sector").not())
            .stdout(predicate::str::contains("member Tech <two@example.com>"));
    }

    #[test]
    fn test_create_user_duplicate_email_fails() {
        let dir = create_temp_dir();
        let args = [
            "create-user",
            "--email",
            "tech@example.com",
            "--name",
            "Tech",
            "--password",
            "password123",
        ];

        activitypro(&dir).args(args).assert().success();
        activitypro(&dir)
            .args(args)
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_create_user_rejects_short_password() {
        let dir = create_temp_dir();
        activitypro(&dir)
            .args([
                "create-user",
                "--email",
                "tech@example.com",
                "--name",
                "Tech",
                "--password",
                "short",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("at least 8"));
    }

    #[test]
    fn test_create_user_rejects_unknown_role() {
        let dir = create_temp_dir();
        activitypro(&dir)
            .args([
                "create-user",
                "--email",
                "tech@example.com",
                "--name",
                "Tech",
                "--password",
                "password123",
                "--role",
                "overlord",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid role"));
    }
}

// =============================================================================
// Config Command Tests
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let dir = create_temp_dir();

        activitypro(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created activitypro.toml"));

        let content = fs::read_to_string(dir.path().join("activitypro.toml")).unwrap();
        assert!(content.contains("[server]"));
        assert!(content.contains("port = 8080"));

        activitypro(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_show_applies_env_overrides() {
        let dir = create_temp_dir();
        fs::write(dir.path().join("activitypro.toml"), "[server]\nport = 9000\n").unwrap();

        activitypro(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9000"));

        activitypro(&dir)
            .args(["config", "show"])
            .env("ACTIVITYPRO_PORT", "9100")
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9100"));
    }

    #[test]
    fn test_config_flag_points_elsewhere() {
        let dir = create_temp_dir();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(
            dir.path().join("etc/custom.toml"),
            "[tracker]\nfeed_limit = 25\n",
        )
        .unwrap();

        activitypro(&dir)
            .args(["--config", "etc/custom.toml", "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("feed_limit = 25"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_dir();

        activitypro(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults"));

        fs::write(
            dir.path().join("activitypro.toml"),
            "[auth]\nsession_ttl_hours = 0\n",
        )
        .unwrap();

        activitypro(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("session_ttl_hours"));
    }

    #[test]
    fn test_invalid_config_file_fails() {
        let dir = create_temp_dir();
        fs::write(dir.path().join("activitypro.toml"), "[server\nport = ").unwrap();

        activitypro(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse activitypro.toml"));
    }
}
