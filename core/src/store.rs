//! Durable, transactional repository of sessions, requests, reviews,
//! patterns and audit events.
//!
//! One SQLite file per project, WAL journaling so readers stay concurrent
//! with the single writer. All multi-row writes happen inside a transaction;
//! callers must treat `update_request_status` as a conditional update whose
//! precondition is the current status — the store is the arbiter. The
//! connection lock is never held across an await: every method here is
//! synchronous and short.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;
use slb_protocol::Attachment;
use slb_protocol::Justification;
use slb_protocol::PatternOrigin;
use slb_protocol::RequestStatus;
use slb_protocol::ReviewDecision;
use slb_protocol::RiskTier;
use uuid::Uuid;

use crate::classifier;
use crate::classifier::PatternRow;
use crate::classifier::PatternSet;
use crate::error::Result;
use crate::error::SlbErr;
use crate::hash::CommandSpec;
use crate::lifecycle;
use crate::session::Session;

/// The central entity: one proposed command and everything decided about it.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Uuid,
    /// Monotone insertion cursor (the table rowid), used by polling
    /// watchers to scan for requests they have not seen yet.
    pub seq: i64,
    pub session_id: Uuid,
    pub project_path: PathBuf,
    pub spec: CommandSpec,
    /// Pinned at creation; immutable afterwards.
    pub command_hash: String,
    pub display_command: Option<String>,
    pub risk_tier: RiskTier,
    pub status: RequestStatus,
    pub justification: Justification,
    pub dry_run_command: Option<String>,
    pub dry_run_output: Option<String>,
    pub rollback_path: Option<PathBuf>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub min_approvals: u32,
    pub cross_model: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
    pub log_path: Option<PathBuf>,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
    pub timed_out: bool,
}

impl Request {
    /// The form watchers may show: redacted if one was stored, else raw.
    pub fn display_or_raw(&self) -> &str {
        self.display_command.as_deref().unwrap_or(&self.spec.command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub id: Uuid,
    pub request_id: Uuid,
    pub reviewer_session_id: Uuid,
    pub reviewer_agent: String,
    pub reviewer_model: String,
    pub decision: ReviewDecision,
    pub comments: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of inserting a review and re-counting the votes, all in one
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewOutcome {
    pub approvals: u32,
    pub rejections: u32,
    pub status_changed: bool,
    pub new_status: Option<RequestStatus>,
    /// Approvals still needed when the request stays pending.
    pub approvals_remaining: u32,
}

/// Outcome of one child process run, persisted on the request row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub log_path: PathBuf,
}

impl ExecOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub id: i64,
    pub kind: String,
    pub request_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Audit event kinds. Free-form strings in the table; constants so call
/// sites and tests agree.
pub mod audit_kind {
    pub const SESSION_CREATED: &str = "session_created";
    pub const REQUEST_CREATED: &str = "request_created";
    pub const STATUS_CHANGED: &str = "status_changed";
    pub const REVIEW_SUBMITTED: &str = "review_submitted";
    pub const EXECUTION_ATTEMPT: &str = "execution_attempt";
    pub const EXECUTION_FINISHED: &str = "execution_finished";
    pub const EMERGENCY_BEGIN: &str = "emergency_override_begin";
    pub const EMERGENCY_END: &str = "emergency_override_end";
    pub const ROLLBACK_RECORDED: &str = "rollback_recorded";
    pub const PATTERN_ADDED: &str = "pattern_added";
    pub const PATTERN_REMOVAL_REQUESTED: &str = "pattern_removal_requested";
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
  id           TEXT PRIMARY KEY,
  session_key  TEXT NOT NULL,
  agent        TEXT NOT NULL,
  model        TEXT NOT NULL,
  program      TEXT NOT NULL,
  project_path TEXT NOT NULL,
  created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS requests (
  id              TEXT PRIMARY KEY,
  session_id      TEXT NOT NULL REFERENCES sessions(id),
  project_path    TEXT NOT NULL,
  command         TEXT NOT NULL,
  cwd             TEXT NOT NULL,
  use_shell       INTEGER NOT NULL,
  command_hash    TEXT NOT NULL,
  display_command TEXT,
  risk_tier       TEXT NOT NULL,
  status          TEXT NOT NULL,
  reason          TEXT,
  expected_effect TEXT,
  goal            TEXT,
  safety_argument TEXT,
  dry_run_command TEXT,
  dry_run_output  TEXT,
  rollback_path   TEXT,
  rolled_back_at  TEXT,
  min_approvals   INTEGER NOT NULL,
  cross_model     INTEGER NOT NULL,
  expires_at      TEXT NOT NULL,
  created_at      TEXT NOT NULL,
  updated_at      TEXT NOT NULL,
  attachments     TEXT,
  log_path        TEXT,
  exit_code       INTEGER,
  duration_ms     INTEGER,
  timed_out       INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_requests_project_status
  ON requests(project_path, status);
CREATE INDEX IF NOT EXISTS idx_requests_command_hash
  ON requests(command_hash);

CREATE TABLE IF NOT EXISTS reviews (
  id                  TEXT PRIMARY KEY,
  request_id          TEXT NOT NULL REFERENCES requests(id),
  reviewer_session_id TEXT NOT NULL REFERENCES sessions(id),
  reviewer_agent      TEXT NOT NULL,
  reviewer_model      TEXT NOT NULL,
  decision            TEXT NOT NULL,
  comments            TEXT,
  created_at          TEXT NOT NULL,
  UNIQUE(request_id, reviewer_session_id)
);

CREATE INDEX IF NOT EXISTS idx_reviews_request ON reviews(request_id);

CREATE TABLE IF NOT EXISTS patterns (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  pattern    TEXT NOT NULL,
  tier       TEXT NOT NULL,
  reason     TEXT NOT NULL,
  origin     TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_events (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  kind       TEXT NOT NULL,
  request_id TEXT,
  session_id TEXT,
  payload    TEXT NOT NULL,
  created_at TEXT NOT NULL
);
"#;

const REQUEST_COLUMNS: &str = "id, rowid, session_id, project_path, command, cwd, use_shell, \
     command_hash, display_command, risk_tier, status, reason, expected_effect, goal, \
     safety_argument, dry_run_command, dry_run_output, rollback_path, rolled_back_at, \
     min_approvals, cross_model, expires_at, created_at, updated_at, attachments, log_path, \
     exit_code, duration_ms, timed_out";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the project database and seed the built-in
    /// pattern set on first use.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.seed_builtin_patterns()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock means a previous caller panicked mid-operation;
        // the transaction it held has already rolled back.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn seed_builtin_patterns(&self) -> Result<()> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM patterns", [], |r| r.get(0))?;
        if count > 0 {
            return Ok(());
        }
        let now = fmt_ts(Utc::now());
        for (pattern, tier, reason) in classifier::builtin_patterns() {
            conn.execute(
                "INSERT INTO patterns (pattern, tier, reason, origin, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    pattern,
                    tier.to_string(),
                    reason,
                    PatternOrigin::Builtin.to_string(),
                    now
                ],
            )?;
        }
        tracing::info!("seeded {} builtin patterns", classifier::builtin_patterns().len());
        Ok(())
    }

    // ── sessions ─────────────────────────────────────────────────────

    pub fn create_session(&self, session: &Session) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sessions (id, session_key, agent, model, program, project_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.id.to_string(),
                session.session_key,
                session.agent,
                session.model,
                session.program,
                path_str(&session.project_path),
                fmt_ts(session.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let conn = self.conn();
        let session = conn
            .query_row(
                "SELECT id, session_key, agent, model, program, project_path, created_at
                 FROM sessions WHERE id = ?1",
                params![id.to_string()],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    /// Look up and verify a session in one step. The key comparison is
    /// constant-time; unknown id and wrong key are indistinguishable to the
    /// caller.
    pub fn authenticate_session(&self, id: Uuid, key: &str) -> Result<Session> {
        match self.get_session(id)? {
            Some(session) if session.verify_key(key) => Ok(session),
            _ => Err(SlbErr::AuthFailed),
        }
    }

    /// Distinct agent models with a session created in the recent window,
    /// used to decide the dangerous-tier cross-model default.
    pub fn distinct_recent_models(
        &self,
        project: &Path,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT model FROM sessions
             WHERE project_path = ?1 AND created_at >= ?2 ORDER BY model",
        )?;
        let models = stmt
            .query_map(params![path_str(project), fmt_ts(since)], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(models)
    }

    // ── requests ─────────────────────────────────────────────────────

    /// Insert a freshly-built request row. Fills in `seq` on success.
    pub fn create_request(&self, request: &mut Request) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO requests ({REQUEST_INSERT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)"
            ),
            params![
                request.id.to_string(),
                request.session_id.to_string(),
                path_str(&request.project_path),
                request.spec.command,
                path_str(&request.spec.cwd),
                request.spec.use_shell,
                request.command_hash,
                request.display_command,
                request.risk_tier.to_string(),
                request.status.to_string(),
                request.justification.reason,
                request.justification.expected_effect,
                request.justification.goal,
                request.justification.safety_argument,
                request.dry_run_command,
                request.dry_run_output,
                request.rollback_path.as_deref().map(path_str),
                request.rolled_back_at.map(fmt_ts),
                request.min_approvals,
                request.cross_model,
                fmt_ts(request.expires_at),
                fmt_ts(request.created_at),
                fmt_ts(request.updated_at),
                serde_json::to_string(&request.attachments)?,
                request.log_path.as_deref().map(path_str),
                request.exit_code,
                request.duration_ms,
                request.timed_out,
            ],
        )?;
        request.seq = conn.last_insert_rowid();
        Ok(())
    }

    pub fn get_request(&self, id: Uuid) -> Result<Option<Request>> {
        let conn = self.conn();
        get_request_on(&conn, id)
    }

    /// Conditional transition: the precondition is the request's *current*
    /// status, checked against the lifecycle table inside the transaction.
    pub fn update_request_status(
        &self,
        id: Uuid,
        new_status: RequestStatus,
        now: DateTime<Utc>,
    ) -> Result<Request> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let request = get_request_on(&tx, id)?.ok_or(SlbErr::RequestNotFound(id))?;
        lifecycle::check_transition(request.status, new_status)?;
        set_status_on(&tx, id, request.status, new_status, now)?;
        let updated = get_request_on(&tx, id)?.ok_or(SlbErr::RequestNotFound(id))?;
        tx.commit()?;
        Ok(updated)
    }

    /// Observer path for the approval TTL: transition an expired pending or
    /// approved request to `timeout`. Returns the updated row, or `None`
    /// when the request had already left a timeout-able state.
    pub fn mark_timed_out(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Request>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let request = get_request_on(&tx, id)?.ok_or(SlbErr::RequestNotFound(id))?;
        if !lifecycle::transition_allowed(request.status, RequestStatus::Timeout) {
            return Ok(None);
        }
        set_status_on(&tx, id, request.status, RequestStatus::Timeout, now)?;
        let updated = get_request_on(&tx, id)?.ok_or(SlbErr::RequestNotFound(id))?;
        tx.commit()?;
        Ok(Some(updated))
    }

    /// The execution gate, fused with the claim. In one transaction:
    /// require status `approved`, enforce the TTL (expired requests are
    /// transitioned to `timeout` and the commit stands), run the caller's
    /// gate checks (hash pinning, policy drift), then compare-and-set the
    /// status to `executing`. A gate failure rolls back and the request
    /// stays approved.
    pub fn claim_for_execution(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        gate: impl FnOnce(&Request) -> Result<()>,
    ) -> Result<Request> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let request = get_request_on(&tx, id)?.ok_or(SlbErr::RequestNotFound(id))?;
        if request.status != RequestStatus::Approved {
            return Err(SlbErr::NotReviewable(format!(
                "request is {}, not approved",
                request.status
            )));
        }
        if now > request.expires_at {
            set_status_on(&tx, id, request.status, RequestStatus::Timeout, now)?;
            tx.commit()?;
            return Err(SlbErr::Expired);
        }
        gate(&request)?;
        set_status_on(&tx, id, RequestStatus::Approved, RequestStatus::Executing, now)?;
        let claimed = get_request_on(&tx, id)?.ok_or(SlbErr::RequestNotFound(id))?;
        tx.commit()?;
        Ok(claimed)
    }

    /// Terminal transition after the child has been reaped.
    pub fn finalize_execution(
        &self,
        id: Uuid,
        outcome: &ExecOutcome,
        now: DateTime<Utc>,
    ) -> Result<Request> {
        let new_status = if outcome.succeeded() {
            RequestStatus::Executed
        } else {
            RequestStatus::ExecutionFailed
        };
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let request = get_request_on(&tx, id)?.ok_or(SlbErr::RequestNotFound(id))?;
        lifecycle::check_transition(request.status, new_status)?;
        tx.execute(
            "UPDATE requests SET status = ?2, log_path = ?3, exit_code = ?4, duration_ms = ?5,
                    timed_out = ?6, updated_at = ?7
             WHERE id = ?1 AND status = ?8",
            params![
                id.to_string(),
                new_status.to_string(),
                path_str(&outcome.log_path),
                outcome.exit_code,
                outcome.duration_ms,
                outcome.timed_out,
                fmt_ts(now),
                request.status.to_string(),
            ],
        )?;
        let updated = get_request_on(&tx, id)?.ok_or(SlbErr::RequestNotFound(id))?;
        tx.commit()?;
        Ok(updated)
    }

    /// Record rollback intent: the capture pointer and when it was recorded.
    /// Restoration itself is a downstream concern.
    pub fn record_rollback(
        &self,
        id: Uuid,
        rollback_path: &Path,
        now: DateTime<Utc>,
    ) -> Result<Request> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        get_request_on(&tx, id)?.ok_or(SlbErr::RequestNotFound(id))?;
        tx.execute(
            "UPDATE requests SET rollback_path = ?2, rolled_back_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![id.to_string(), path_str(rollback_path), fmt_ts(now)],
        )?;
        let updated = get_request_on(&tx, id)?.ok_or(SlbErr::RequestNotFound(id))?;
        tx.commit()?;
        Ok(updated)
    }

    /// Pending requests, optionally restricted to one project, oldest first.
    pub fn list_pending(&self, project: Option<&Path>) -> Result<Vec<Request>> {
        let conn = self.conn();
        let mut requests = Vec::new();
        match project {
            Some(project) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM requests
                     WHERE status = 'pending' AND project_path = ?1 ORDER BY rowid"
                ))?;
                let rows = stmt.query_map(params![path_str(project)], request_from_row)?;
                for row in rows {
                    requests.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM requests
                     WHERE status = 'pending' ORDER BY rowid"
                ))?;
                let rows = stmt.query_map([], request_from_row)?;
                for row in rows {
                    requests.push(row?);
                }
            }
        }
        Ok(requests)
    }

    pub fn count_pending_for_session(&self, session_id: Uuid) -> Result<u32> {
        let conn = self.conn();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM requests WHERE session_id = ?1 AND status = 'pending'",
            params![session_id.to_string()],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Iteration primitive for the polling watcher: every request inserted
    /// after `cursor`, plus the advanced cursor.
    pub fn scan_requests_since(&self, cursor: i64) -> Result<(Vec<Request>, i64)> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE rowid > ?1 ORDER BY rowid"
        ))?;
        let rows = stmt.query_map(params![cursor], request_from_row)?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        let next = requests.last().map(|r| r.seq).unwrap_or(cursor);
        Ok((requests, next))
    }

    // ── reviews ──────────────────────────────────────────────────────

    /// Insert the review and drive any resulting transition atomically:
    /// a single reject is terminal, approvals ≥ `min_approvals` approve the
    /// request, anything else leaves it pending.
    pub fn create_review_and_maybe_transition(
        &self,
        review: &Review,
        min_approvals: u32,
        now: DateTime<Utc>,
    ) -> Result<ReviewOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let request = get_request_on(&tx, review.request_id)?
            .ok_or(SlbErr::RequestNotFound(review.request_id))?;
        if request.status != RequestStatus::Pending {
            return Err(SlbErr::NotReviewable(format!(
                "request is {}, not pending",
                request.status
            )));
        }

        let duplicate: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM reviews WHERE request_id = ?1 AND reviewer_session_id = ?2",
                params![
                    review.request_id.to_string(),
                    review.reviewer_session_id.to_string()
                ],
                |r| r.get(0),
            )
            .optional()?;
        if duplicate.is_some() {
            return Err(SlbErr::DuplicateReview);
        }

        tx.execute(
            "INSERT INTO reviews (id, request_id, reviewer_session_id, reviewer_agent,
                                  reviewer_model, decision, comments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                review.id.to_string(),
                review.request_id.to_string(),
                review.reviewer_session_id.to_string(),
                review.reviewer_agent,
                review.reviewer_model,
                review.decision.to_string(),
                review.comments,
                fmt_ts(review.created_at),
            ],
        )
        .map_err(map_unique_violation)?;

        let (approvals, rejections) = count_decisions_on(&tx, review.request_id)?;
        let new_status = if rejections > 0 {
            Some(RequestStatus::Rejected)
        } else if approvals >= min_approvals {
            Some(RequestStatus::Approved)
        } else {
            None
        };
        if let Some(status) = new_status {
            set_status_on(&tx, review.request_id, RequestStatus::Pending, status, now)?;
        }
        tx.commit()?;

        Ok(ReviewOutcome {
            approvals,
            rejections,
            status_changed: new_status.is_some(),
            new_status,
            approvals_remaining: min_approvals.saturating_sub(approvals),
        })
    }

    pub fn list_reviews(&self, request_id: Uuid) -> Result<Vec<Review>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, request_id, reviewer_session_id, reviewer_agent, reviewer_model,
                    decision, comments, created_at
             FROM reviews WHERE request_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![request_id.to_string()], review_from_row)?;
        let mut reviews = Vec::new();
        for row in rows {
            reviews.push(row?);
        }
        Ok(reviews)
    }

    // ── patterns ─────────────────────────────────────────────────────

    pub fn list_patterns(&self, tier: Option<RiskTier>) -> Result<Vec<PatternRow>> {
        let conn = self.conn();
        let mut patterns = Vec::new();
        match tier {
            Some(tier) => {
                let mut stmt = conn.prepare(
                    "SELECT id, pattern, tier, reason, origin FROM patterns
                     WHERE tier = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![tier.to_string()], pattern_from_row)?;
                for row in rows {
                    patterns.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, pattern, tier, reason, origin FROM patterns ORDER BY id",
                )?;
                let rows = stmt.query_map([], pattern_from_row)?;
                for row in rows {
                    patterns.push(row?);
                }
            }
        }
        Ok(patterns)
    }

    /// Validate and insert a pattern. Invalid regexes are rejected here, at
    /// insertion time, never at classify time.
    pub fn add_pattern(
        &self,
        pattern: &str,
        tier: RiskTier,
        reason: &str,
        origin: PatternOrigin,
    ) -> Result<i64> {
        classifier::validate_pattern(pattern)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO patterns (pattern, tier, reason, origin, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pattern,
                tier.to_string(),
                reason,
                origin.to_string(),
                fmt_ts(Utc::now())
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.append_audit_best_effort(
            audit_kind::PATTERN_ADDED,
            None,
            None,
            serde_json::json!({ "id": id, "tier": tier, "origin": origin }),
        );
        Ok(id)
    }

    /// Agents may not remove patterns. This records a `pending_removal`
    /// entry referencing the target for human curation; classification is
    /// unaffected until a human promotes the removal.
    pub fn request_pattern_removal(&self, pattern_id: i64, reason: &str) -> Result<i64> {
        let conn = self.conn();
        let target = conn
            .query_row(
                "SELECT id, pattern, tier, reason, origin FROM patterns WHERE id = ?1",
                params![pattern_id],
                pattern_from_row,
            )
            .optional()?
            .ok_or_else(|| {
                SlbErr::Validation(format!("pattern {pattern_id} does not exist"))
            })?;
        conn.execute(
            "INSERT INTO patterns (pattern, tier, reason, origin, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                target.pattern,
                target.tier.to_string(),
                format!("removal of pattern {pattern_id} requested: {reason}"),
                PatternOrigin::PendingRemoval.to_string(),
                fmt_ts(Utc::now()),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.append_audit_best_effort(
            audit_kind::PATTERN_REMOVAL_REQUESTED,
            None,
            None,
            serde_json::json!({ "id": id, "target_id": pattern_id }),
        );
        Ok(id)
    }

    /// Snapshot of the current classifying pattern set.
    pub fn pattern_set(&self) -> Result<PatternSet> {
        PatternSet::compile(&self.list_patterns(None)?)
    }

    // ── audit ────────────────────────────────────────────────────────

    pub fn append_audit(
        &self,
        kind: &str,
        request_id: Option<Uuid>,
        session_id: Option<Uuid>,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO audit_events (kind, request_id, session_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                kind,
                request_id.map(|id| id.to_string()),
                session_id.map(|id| id.to_string()),
                payload.to_string(),
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Best-effort audit on error paths: failures are logged, not returned.
    pub fn append_audit_best_effort(
        &self,
        kind: &str,
        request_id: Option<Uuid>,
        session_id: Option<Uuid>,
        payload: serde_json::Value,
    ) {
        if let Err(e) = self.append_audit(kind, request_id, session_id, payload) {
            tracing::warn!("audit write failed for {kind}: {e}");
        }
    }

    pub fn list_audit(&self, request_id: Option<Uuid>) -> Result<Vec<AuditEvent>> {
        let conn = self.conn();
        let mut events = Vec::new();
        match request_id {
            Some(id) => {
                let mut stmt = conn.prepare(
                    "SELECT id, kind, request_id, session_id, payload, created_at
                     FROM audit_events WHERE request_id = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![id.to_string()], audit_from_row)?;
                for row in rows {
                    events.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, kind, request_id, session_id, payload, created_at
                     FROM audit_events ORDER BY id",
                )?;
                let rows = stmt.query_map([], audit_from_row)?;
                for row in rows {
                    events.push(row?);
                }
            }
        }
        Ok(events)
    }
}

// ── row mapping ──────────────────────────────────────────────────────

const REQUEST_INSERT_COLUMNS: &str = "id, session_id, project_path, command, cwd, use_shell, \
     command_hash, display_command, risk_tier, status, reason, expected_effect, goal, \
     safety_argument, dry_run_command, dry_run_output, rollback_path, rolled_back_at, \
     min_approvals, cross_model, expires_at, created_at, updated_at, attachments, log_path, \
     exit_code, duration_ms, timed_out";

fn get_request_on(conn: &Connection, id: Uuid) -> Result<Option<Request>> {
    let request = conn
        .query_row(
            &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
            params![id.to_string()],
            request_from_row,
        )
        .optional()?;
    Ok(request)
}

fn set_status_on(
    conn: &Connection,
    id: Uuid,
    from: RequestStatus,
    to: RequestStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE requests SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
        params![id.to_string(), to.to_string(), fmt_ts(now), from.to_string()],
    )?;
    if changed != 1 {
        return Err(SlbErr::NotReviewable(format!(
            "request left status {from} concurrently"
        )));
    }
    Ok(())
}

fn count_decisions_on(conn: &Connection, request_id: Uuid) -> Result<(u32, u32)> {
    let mut stmt = conn.prepare(
        "SELECT decision, COUNT(*) FROM reviews WHERE request_id = ?1 GROUP BY decision",
    )?;
    let rows = stmt.query_map(params![request_id.to_string()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
    })?;
    let mut approvals = 0;
    let mut rejections = 0;
    for row in rows {
        let (decision, count) = row?;
        match decision.as_str() {
            "approve" => approvals = count,
            "reject" => rejections = count,
            _ => {}
        }
    }
    Ok((approvals, rejections))
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<Request> {
    let attachments: Option<String> = row.get(24)?;
    Ok(Request {
        id: parse_uuid(row.get::<_, String>(0)?, 0)?,
        seq: row.get(1)?,
        session_id: parse_uuid(row.get::<_, String>(2)?, 2)?,
        project_path: PathBuf::from(row.get::<_, String>(3)?),
        spec: CommandSpec {
            command: row.get(4)?,
            cwd: PathBuf::from(row.get::<_, String>(5)?),
            use_shell: row.get(6)?,
        },
        command_hash: row.get(7)?,
        display_command: row.get(8)?,
        risk_tier: parse_enum(row.get::<_, String>(9)?, 9)?,
        status: parse_enum(row.get::<_, String>(10)?, 10)?,
        justification: Justification {
            reason: row.get(11)?,
            expected_effect: row.get(12)?,
            goal: row.get(13)?,
            safety_argument: row.get(14)?,
        },
        dry_run_command: row.get(15)?,
        dry_run_output: row.get(16)?,
        rollback_path: row.get::<_, Option<String>>(17)?.map(PathBuf::from),
        rolled_back_at: row
            .get::<_, Option<String>>(18)?
            .map(|s| parse_ts(s, 18))
            .transpose()?,
        min_approvals: row.get(19)?,
        cross_model: row.get(20)?,
        expires_at: parse_ts(row.get::<_, String>(21)?, 21)?,
        created_at: parse_ts(row.get::<_, String>(22)?, 22)?,
        updated_at: parse_ts(row.get::<_, String>(23)?, 23)?,
        attachments: match attachments {
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    24,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            None => Vec::new(),
        },
        log_path: row.get::<_, Option<String>>(25)?.map(PathBuf::from),
        exit_code: row.get(26)?,
        duration_ms: row.get(27)?,
        timed_out: row.get(28)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: parse_uuid(row.get::<_, String>(0)?, 0)?,
        session_key: row.get(1)?,
        agent: row.get(2)?,
        model: row.get(3)?,
        program: row.get(4)?,
        project_path: PathBuf::from(row.get::<_, String>(5)?),
        created_at: parse_ts(row.get::<_, String>(6)?, 6)?,
    })
}

fn review_from_row(row: &Row<'_>) -> rusqlite::Result<Review> {
    Ok(Review {
        id: parse_uuid(row.get::<_, String>(0)?, 0)?,
        request_id: parse_uuid(row.get::<_, String>(1)?, 1)?,
        reviewer_session_id: parse_uuid(row.get::<_, String>(2)?, 2)?,
        reviewer_agent: row.get(3)?,
        reviewer_model: row.get(4)?,
        decision: parse_enum(row.get::<_, String>(5)?, 5)?,
        comments: row.get(6)?,
        created_at: parse_ts(row.get::<_, String>(7)?, 7)?,
    })
}

fn pattern_from_row(row: &Row<'_>) -> rusqlite::Result<PatternRow> {
    Ok(PatternRow {
        id: row.get(0)?,
        pattern: row.get(1)?,
        tier: parse_enum(row.get::<_, String>(2)?, 2)?,
        reason: row.get(3)?,
        origin: parse_enum(row.get::<_, String>(4)?, 4)?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEvent> {
    let payload: String = row.get(4)?;
    Ok(AuditEvent {
        id: row.get(0)?,
        kind: row.get(1)?,
        request_id: row
            .get::<_, Option<String>>(2)?
            .map(|s| parse_uuid(s, 2))
            .transpose()?,
        session_id: row
            .get::<_, Option<String>>(3)?
            .map(|s| parse_uuid(s, 3))
            .transpose()?,
        payload: serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: parse_ts(row.get::<_, String>(5)?, 5)?,
    })
}

fn map_unique_violation(e: rusqlite::Error) -> SlbErr {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            return SlbErr::DuplicateReview;
        }
    }
    SlbErr::Store(e)
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_uuid(s: String, idx: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_enum<T: std::str::FromStr>(s: String, idx: usize) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
