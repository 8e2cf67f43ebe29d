//! Project configuration: `config.toml` inside the state directory.
//!
//! The configuration is a tagged set of recognized keys with typed getters;
//! unknown keys are rejected at the boundary when the file is loaded. The
//! core never reads global state — every entry point receives a
//! configuration snapshot through [`crate::broker::BrokerCtx`].

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::error::SlbErr;

/// Minutes a request stays reviewable/executable after creation.
const DEFAULT_APPROVAL_TTL_MINUTES: u64 = 15;
/// Hard deadline applied to a spawned child unless the caller overrides it.
const DEFAULT_EXECUTION_TIMEOUT_SECONDS: u64 = 300;
/// Poll-watcher tick.
const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 2;
/// Window used to decide whether multiple agent models are "active".
const DEFAULT_ACTIVE_MODEL_WINDOW_MINUTES: u64 = 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub general: General,
    pub rate_limits: RateLimits,
    pub agents: Agents,
    pub integrations: Integrations,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct General {
    pub approval_ttl_minutes: u64,
    pub execution_timeout_seconds: u64,
    pub poll_interval_seconds: u64,
    pub active_model_window_minutes: u64,
    /// Project overrides for the tier → threshold defaults. When unset the
    /// classifier-derived defaults apply.
    pub dangerous_min_approvals: Option<u32>,
    pub critical_min_approvals: Option<u32>,
}

impl Default for General {
    fn default() -> Self {
        Self {
            approval_ttl_minutes: DEFAULT_APPROVAL_TTL_MINUTES,
            execution_timeout_seconds: DEFAULT_EXECUTION_TIMEOUT_SECONDS,
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            active_model_window_minutes: DEFAULT_ACTIVE_MODEL_WINDOW_MINUTES,
            dangerous_min_approvals: None,
            critical_min_approvals: None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RateLimitAction {
    /// Reject the submission with a validation error.
    #[default]
    Block,
    /// Let the submission through but log a warning.
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimits {
    /// Maximum simultaneously-pending requests per owning session.
    pub max_pending_per_session: u32,
    pub action: RateLimitAction,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_pending_per_session: 10,
            action: RateLimitAction::Block,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Agents {
    /// When true, watchers submit an approve review for caution-tier
    /// requests on behalf of the auto-reviewer session.
    pub auto_approve_caution: bool,
    /// Identity of the pre-provisioned auto-reviewer session. Its model is
    /// distinct from every human-operated model so it never trips the
    /// cross-model constraint ambiguously.
    pub auto_reviewer_name: String,
    pub auto_reviewer_model: String,
}

impl Default for Agents {
    fn default() -> Self {
        Self {
            auto_approve_caution: false,
            auto_reviewer_name: "auto-reviewer".to_string(),
            auto_reviewer_model: "slb-auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Integrations {
    /// Program (argv tokens) spawned after each terminal transition, fed the
    /// event JSON on argv. Absent means no notification.
    pub notify_command: Option<Vec<String>>,
}

impl Config {
    /// Load the configuration from `path`, falling back to defaults when the
    /// file does not exist. Unknown keys or malformed values are a
    /// validation error, not a silent default.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&contents)
            .map_err(|e| SlbErr::Validation(format!("config {}: {e}", path.display())))
    }
}
