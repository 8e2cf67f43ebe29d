//! The broker context and the submission-side verbs.
//!
//! The core never reads global state: every entry point takes a
//! [`BrokerCtx`] carrying the open store handle, the configuration snapshot
//! and the project paths. Tests construct their own context per case.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Serialize;
use slb_protocol::Attachment;
use slb_protocol::Event;
use slb_protocol::Justification;
use slb_protocol::RequestStatus;
use slb_protocol::RiskTier;
use uuid::Uuid;

use crate::config::Config;
use crate::config::RateLimitAction;
use crate::error::Result;
use crate::error::SlbErr;
use crate::events::EventBus;
use crate::hash::CommandSpec;
use crate::lifecycle;
use crate::paths::ProjectPaths;
use crate::pending;
use crate::session::Session;
use crate::store::Request;
use crate::store::Store;
use crate::store::audit_kind;

/// Credentials presented on every mutating verb.
#[derive(Debug, Clone)]
pub struct SessionAuth {
    pub session_id: Uuid,
    pub session_key: String,
}

pub struct BrokerCtx {
    pub store: Arc<Store>,
    pub config: Config,
    pub paths: ProjectPaths,
    pub bus: EventBus,
}

impl BrokerCtx {
    /// Open (creating on first use) the broker state for one project.
    pub fn open(project: &Path) -> Result<Self> {
        let paths = ProjectPaths::new(project);
        paths.ensure_layout()?;
        let config = Config::load(&paths.config_path())?;
        let store = Arc::new(Store::open(&paths.db_path())?);
        let ctx = Self {
            store,
            config,
            paths,
            bus: EventBus::new(),
        };
        ctx.ensure_auto_reviewer()?;
        Ok(ctx)
    }

    /// The auto-reviewer is a real, pre-provisioned session whose model is
    /// distinct from every human-operated model. Watchers authenticate as
    /// it when auto-approving caution-tier requests.
    fn ensure_auto_reviewer(&self) -> Result<()> {
        if self.auto_reviewer_session()?.is_some() {
            return Ok(());
        }
        let session = Session::new(
            self.config.agents.auto_reviewer_name.clone(),
            self.config.agents.auto_reviewer_model.clone(),
            "slb",
            self.paths.project(),
        );
        self.store.create_session(&session)?;
        self.persist_session_record(&session)?;
        self.store.append_audit(
            audit_kind::SESSION_CREATED,
            None,
            Some(session.id),
            serde_json::json!({ "agent": session.agent, "model": session.model, "auto": true }),
        )?;
        Ok(())
    }

    pub fn auto_reviewer_session(&self) -> Result<Option<Session>> {
        let record = self
            .paths
            .sessions_dir()
            .join(format!("{}.json", self.config.agents.auto_reviewer_name));
        match std::fs::read_to_string(&record) {
            Ok(contents) => {
                let stored: StoredSessionRecord = serde_json::from_str(&contents)?;
                Ok(self.store.get_session(stored.id)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Register a new agent session and hand back its secret key (the only
    /// time the key leaves the broker).
    pub fn create_session(
        &self,
        agent: impl Into<String>,
        model: impl Into<String>,
        program: impl Into<String>,
    ) -> Result<Session> {
        let session = Session::new(agent, model, program, self.paths.project());
        self.store.create_session(&session)?;
        self.persist_session_record(&session)?;
        self.store.append_audit(
            audit_kind::SESSION_CREATED,
            None,
            Some(session.id),
            serde_json::json!({ "agent": session.agent, "model": session.model }),
        )?;
        Ok(session)
    }

    fn persist_session_record(&self, session: &Session) -> Result<()> {
        // Key material stays in the database; the sessions directory holds
        // only the id/name mapping for audit and for auto-reviewer lookup.
        let record = StoredSessionRecord {
            id: session.id,
            agent: session.agent.clone(),
            model: session.model.clone(),
            created_at: session.created_at.to_rfc3339(),
        };
        let path = self.paths.sessions_dir().join(format!("{}.json", session.agent));
        std::fs::write(path, serde_json::to_string_pretty(&record)?)?;
        Ok(())
    }

    /// Propose a command. Safe commands are skipped entirely: no request
    /// row, caller proceeds. Everything else becomes a durable pending
    /// request announced to watchers.
    pub fn submit(&self, auth: &SessionAuth, params: SubmitParams) -> Result<SubmitOutcome> {
        let session = self.store.authenticate_session(auth.session_id, &auth.session_key)?;
        if params.command.trim().is_empty() {
            return Err(SlbErr::Validation("command must not be empty".to_string()));
        }

        let pattern_set = self.store.pattern_set()?;
        let classification = pattern_set.classify(&params.command);
        if !classification.tier.requires_review() {
            tracing::debug!(command = %params.command, "classified safe; skipping");
            return Ok(SubmitOutcome::Skipped {
                tier: RiskTier::Safe,
            });
        }

        self.enforce_rate_limit(&session)?;

        let now = Utc::now();
        let window = Duration::minutes(self.config.general.active_model_window_minutes as i64);
        let recent_models = self
            .store
            .distinct_recent_models(self.paths.project(), now - window)?;
        let multiple_models_active = recent_models
            .iter()
            .filter(|m| *m != &self.config.agents.auto_reviewer_model)
            .count()
            > 1;

        let policy = lifecycle::policy_for_tier(classification.tier, multiple_models_active, &self.config)
            .ok_or_else(|| SlbErr::Validation("safe commands are never persisted".to_string()))?;
        let min_approvals = params.min_approvals.unwrap_or(policy.min_approvals).max(1);
        let cross_model = params.cross_model.unwrap_or(policy.cross_model);

        let ttl_minutes = params
            .ttl_minutes
            .unwrap_or(self.config.general.approval_ttl_minutes);
        let cwd = params.cwd.unwrap_or_else(|| self.paths.project().to_path_buf());
        let spec = CommandSpec::new(params.command, cwd, params.use_shell);

        let mut request = Request {
            id: Uuid::new_v4(),
            seq: 0,
            session_id: session.id,
            project_path: self.paths.project().to_path_buf(),
            command_hash: spec.canonical_hash(),
            spec,
            display_command: params.display_command,
            risk_tier: classification.tier,
            status: RequestStatus::Pending,
            justification: params.justification,
            dry_run_command: params.dry_run.as_ref().map(|d| d.command.clone()),
            dry_run_output: params.dry_run.as_ref().map(|d| d.output.clone()),
            rollback_path: None,
            rolled_back_at: None,
            min_approvals,
            cross_model,
            expires_at: now + Duration::minutes(ttl_minutes as i64),
            created_at: now,
            updated_at: now,
            attachments: params.attachments,
            log_path: None,
            exit_code: None,
            duration_ms: None,
            timed_out: false,
        };
        self.store.create_request(&mut request)?;
        pending::write_snapshot(&self.paths, &request, Some(session.agent.clone()))?;
        self.store.append_audit(
            audit_kind::REQUEST_CREATED,
            Some(request.id),
            Some(session.id),
            serde_json::json!({
                "tier": request.risk_tier,
                "pattern_id": classification.pattern_id,
                "reason": classification.reason,
                "min_approvals": min_approvals,
                "cross_model": cross_model,
                "hash": request.command_hash,
            }),
        )?;
        self.bus.publish(Event::RequestPending {
            request_id: request.id,
            risk_tier: Some(request.risk_tier),
            command: Some(request.display_or_raw().to_string()),
            requestor: Some(session.agent.clone()),
            created_at: Some(request.created_at.to_rfc3339()),
        });

        Ok(SubmitOutcome::Created {
            request_id: request.id,
            status: request.status,
            tier: request.risk_tier,
            reason: classification.reason,
            expires_at: request.expires_at,
        })
    }

    fn enforce_rate_limit(&self, session: &Session) -> Result<()> {
        let pending = self.store.count_pending_for_session(session.id)?;
        let max = self.config.rate_limits.max_pending_per_session;
        if pending < max {
            return Ok(());
        }
        match self.config.rate_limits.action {
            RateLimitAction::Block => Err(SlbErr::Validation(format!(
                "session has {pending} pending requests (limit {max})"
            ))),
            RateLimitAction::Warn => {
                tracing::warn!(
                    session = %session.id,
                    pending,
                    max,
                    "pending-request limit exceeded; letting submission through"
                );
                Ok(())
            }
        }
    }

    /// Cancel a still-pending request. Owner session only.
    pub fn cancel(&self, auth: &SessionAuth, request_id: Uuid) -> Result<Request> {
        let session = self.store.authenticate_session(auth.session_id, &auth.session_key)?;
        let request = self
            .store
            .get_request(request_id)?
            .ok_or(SlbErr::RequestNotFound(request_id))?;
        if request.session_id != session.id {
            return Err(SlbErr::NotReviewable(
                "only the owning session may cancel a request".to_string(),
            ));
        }
        let updated =
            self.store
                .update_request_status(request_id, RequestStatus::Cancelled, Utc::now())?;
        pending::retire_snapshot(&self.paths, &updated)?;
        self.store.append_audit(
            audit_kind::STATUS_CHANGED,
            Some(request_id),
            Some(session.id),
            serde_json::json!({ "from": "pending", "to": "cancelled" }),
        )?;
        self.announce_status(&updated);
        Ok(updated)
    }

    /// Record rollback intent for an executed request: the capture pointer
    /// and the timestamp. Restoration itself is out of scope for the core.
    pub fn rollback(&self, request_id: Uuid, force: bool) -> Result<RollbackRecord> {
        let request = self
            .store
            .get_request(request_id)?
            .ok_or(SlbErr::RequestNotFound(request_id))?;
        let has_executed = matches!(
            request.status,
            RequestStatus::Executed | RequestStatus::ExecutionFailed
        );
        if !has_executed && !force {
            return Err(SlbErr::NotReviewable(format!(
                "request is {}, nothing to roll back (use force to record anyway)",
                request.status
            )));
        }
        let capture = self.paths.rollback_capture_dir(request_id);
        std::fs::create_dir_all(&capture)?;
        let now = Utc::now();
        self.store.record_rollback(request_id, &capture, now)?;
        self.store.append_audit(
            audit_kind::ROLLBACK_RECORDED,
            Some(request_id),
            None,
            serde_json::json!({ "rollback_path": capture, "forced": force }),
        )?;
        Ok(RollbackRecord {
            rollback_path: capture,
            rolled_back_at: now,
        })
    }

    /// Sweep expired requests into `timeout`. Any observer may run this;
    /// watchers do every tick.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Request>> {
        let mut expired = Vec::new();
        for request in self.store.list_pending(Some(self.paths.project()))? {
            if now <= request.expires_at {
                continue;
            }
            if let Some(updated) = self.store.mark_timed_out(request.id, now)? {
                pending::retire_snapshot(&self.paths, &updated)?;
                self.store.append_audit_best_effort(
                    audit_kind::STATUS_CHANGED,
                    Some(updated.id),
                    None,
                    serde_json::json!({ "from": "pending", "to": "timeout" }),
                );
                self.announce_status(&updated);
                expired.push(updated);
            }
        }
        Ok(expired)
    }

    /// Publish the event for a fresh transition and fire the configured
    /// notifier on terminal states.
    pub(crate) fn announce_status(&self, request: &Request) {
        if let Some(event) = Event::for_status(request.id, request.status) {
            if request.status.is_terminal() {
                self.maybe_notify(&event);
            }
            self.bus.publish(event);
        }
    }

    /// Spawn the configured notifier (if any) with the event JSON as the
    /// last argument. Failures are logged but otherwise ignored so that
    /// notification issues never interfere with the lifecycle.
    fn maybe_notify(&self, event: &Event) {
        let Some(notify_command) = &self.config.integrations.notify_command else {
            return;
        };
        if notify_command.is_empty() {
            return;
        }
        let Ok(json) = serde_json::to_string(event) else {
            tracing::error!("failed to serialize notification payload");
            return;
        };
        let mut command = std::process::Command::new(&notify_command[0]);
        if notify_command.len() > 1 {
            command.args(&notify_command[1..]);
        }
        command.arg(json);
        if let Err(e) = command.spawn() {
            tracing::warn!("failed to spawn notifier '{}': {e}", notify_command[0]);
        }
    }
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct StoredSessionRecord {
    id: Uuid,
    agent: String,
    model: String,
    created_at: String,
}

#[derive(Debug, Clone)]
pub struct DryRun {
    pub command: String,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct SubmitParams {
    pub command: String,
    /// Defaults to the project root.
    pub cwd: Option<PathBuf>,
    pub use_shell: bool,
    pub display_command: Option<String>,
    pub justification: Justification,
    pub attachments: Vec<Attachment>,
    pub dry_run: Option<DryRun>,
    /// Policy overrides; the resulting numbers are authoritative.
    pub min_approvals: Option<u32>,
    pub cross_model: Option<bool>,
    pub ttl_minutes: Option<u64>,
}

impl SubmitParams {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            use_shell: true,
            display_command: None,
            justification: Justification::default(),
            attachments: Vec::new(),
            dry_run: None,
            min_approvals: None,
            cross_model: None,
            ttl_minutes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Safe tier: no request row was created; proceed.
    Skipped { tier: RiskTier },
    Created {
        request_id: Uuid,
        status: RequestStatus,
        tier: RiskTier,
        reason: Option<String>,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackRecord {
    pub rollback_path: PathBuf,
    pub rolled_back_at: DateTime<Utc>,
}
