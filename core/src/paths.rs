//! Per-project state directory layout.
//!
//! Everything durable lives under `<project>/.slb/`:
//!
//! ```text
//! .slb/
//!   slb.db          relational store (+ WAL sidecars)
//!   config.toml     recognized-key configuration
//!   logs/           one file per execution, timestamped
//!   pending/        one JSON snapshot per pending request
//!   processed/      snapshots of requests that reached a terminal state
//!   sessions/       session records for audit
//!   rollback/       rollback capture pointers
//! ```

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use uuid::Uuid;

use crate::error::Result;

pub const STATE_DIR_NAME: &str = ".slb";
const DB_FILE: &str = "slb.db";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    project: PathBuf,
    state: PathBuf,
}

impl ProjectPaths {
    pub fn new(project: impl Into<PathBuf>) -> Self {
        let project = project.into();
        let state = project.join(STATE_DIR_NAME);
        Self { project, state }
    }

    pub fn project(&self) -> &Path {
        &self.project
    }

    pub fn state_dir(&self) -> &Path {
        &self.state
    }

    pub fn db_path(&self) -> PathBuf {
        self.state.join(DB_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.state.join(CONFIG_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state.join("logs")
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.state.join("pending")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.state.join("processed")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state.join("sessions")
    }

    pub fn rollback_dir(&self) -> PathBuf {
        self.state.join("rollback")
    }

    /// Create the directory tree and add the state directory to the
    /// project's ignore list. Idempotent.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.state_dir().to_path_buf(),
            self.logs_dir(),
            self.pending_dir(),
            self.processed_dir(),
            self.sessions_dir(),
            self.rollback_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        self.ensure_gitignore()?;
        Ok(())
    }

    /// Log file for one execution: timestamped so concurrent executions in
    /// the same project never collide.
    pub fn execution_log_path(&self, request_id: Uuid, now: DateTime<Utc>) -> PathBuf {
        let stamp = now.format("%Y%m%d-%H%M%S%.3f");
        self.logs_dir().join(format!("exec-{stamp}-{request_id}.log"))
    }

    /// Emergency executions log outside any request row.
    pub fn emergency_log_path(&self, now: DateTime<Utc>) -> PathBuf {
        let stamp = now.format("%Y%m%d-%H%M%S%.3f");
        self.logs_dir().join(format!("emergency-{stamp}.log"))
    }

    pub fn pending_snapshot_path(&self, request_id: Uuid) -> PathBuf {
        self.pending_dir().join(format!("{request_id}.json"))
    }

    pub fn processed_snapshot_path(&self, request_id: Uuid) -> PathBuf {
        self.processed_dir().join(format!("{request_id}.json"))
    }

    pub fn rollback_capture_dir(&self, request_id: Uuid) -> PathBuf {
        self.rollback_dir().join(request_id.to_string())
    }

    fn ensure_gitignore(&self) -> Result<()> {
        let gitignore = self.project.join(".gitignore");
        let entry = format!("{STATE_DIR_NAME}/");
        let already_listed = match std::fs::read_to_string(&gitignore) {
            Ok(contents) => contents
                .lines()
                .any(|line| line.trim() == entry || line.trim() == STATE_DIR_NAME),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !already_listed {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&gitignore)?;
            writeln!(file, "{entry}")?;
        }
        Ok(())
    }
}
