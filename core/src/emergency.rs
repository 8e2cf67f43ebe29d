//! The emergency override: a human-only fast path that bypasses review and
//! executes immediately.
//!
//! Two acknowledgement forms exist. Non-interactive callers must supply at
//! least 8 hex characters of the canonical command hash; interactive
//! callers type a confirmation token at a TTY behind a cancellable read.
//! A dedicated audit record is written before and after execution.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerCtx;
use crate::error::Result;
use crate::error::SlbErr;
use crate::exec;
use crate::hash;
use crate::hash::CommandSpec;
use crate::store::audit_kind;

/// Token an interactive caller must type to confirm.
pub const CONFIRMATION_TOKEN: &str = "EXECUTE";

#[derive(Debug, Clone)]
pub enum EmergencyAck {
    /// ≥ 8 hex characters forming a prefix of the canonical command hash.
    HashPrefix(String),
    /// Read the confirmation token from stdin (a TTY).
    Interactive,
}

#[derive(Debug, Clone)]
pub struct EmergencyParams {
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub use_shell: bool,
    /// Mandatory human-supplied reason, persisted in the audit trail.
    pub reason: String,
    /// Who is invoking the override (a human name, not a session).
    pub actor: String,
    pub ack: EmergencyAck,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyResult {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub log_path: PathBuf,
    pub hash: String,
    pub timed_out: bool,
}

pub async fn emergency(
    ctx: &BrokerCtx,
    params: EmergencyParams,
    cancel: CancellationToken,
) -> Result<EmergencyResult> {
    if params.reason.trim().is_empty() {
        return Err(SlbErr::Validation(
            "an emergency override requires a reason".to_string(),
        ));
    }
    if params.command.trim().is_empty() {
        return Err(SlbErr::Validation("command must not be empty".to_string()));
    }

    let cwd = params
        .cwd
        .unwrap_or_else(|| ctx.paths.project().to_path_buf());
    let spec = CommandSpec::new(params.command, cwd, params.use_shell);
    let command_hash = spec.canonical_hash();

    match &params.ack {
        EmergencyAck::HashPrefix(ack) => hash::verify_ack(ack, &command_hash)?,
        EmergencyAck::Interactive => confirm_interactive(&cancel).await?,
    }

    let now = Utc::now();
    let log_path = ctx.paths.emergency_log_path(now);
    let timeout = params
        .timeout
        .unwrap_or(Duration::from_secs(ctx.config.general.execution_timeout_seconds));

    // Audit before the spawn so a crash mid-execution still leaves a trace.
    ctx.store.append_audit(
        audit_kind::EMERGENCY_BEGIN,
        None,
        None,
        serde_json::json!({
            "command": spec.command,
            "hash": command_hash,
            "actor": params.actor,
            "reason": params.reason,
            "log_path": log_path,
        }),
    )?;

    let child = exec::spawn_to_log(&spec, &log_path).await?;
    let run = exec::wait_child(child, timeout, &cancel).await?;

    ctx.store.append_audit_best_effort(
        audit_kind::EMERGENCY_END,
        None,
        None,
        serde_json::json!({
            "hash": command_hash,
            "actor": params.actor,
            "exit_code": run.exit_code,
            "duration_ms": run.duration_ms,
            "timed_out": run.timed_out,
            "interrupted": run.interrupted,
            "log_path": log_path,
        }),
    );

    if run.interrupted {
        return Err(SlbErr::Interrupted);
    }

    Ok(EmergencyResult {
        exit_code: run.exit_code.unwrap_or(-1),
        duration_ms: run.duration_ms,
        log_path,
        hash: command_hash,
        timed_out: run.timed_out,
    })
}

/// Cancellable confirmation read. The CLI prints the prompt; we only
/// consume one line so SIGINT tears the whole lifecycle down promptly.
async fn confirm_interactive(cancel: &CancellationToken) -> Result<()> {
    let mut line = String::new();
    let mut reader = BufReader::new(tokio::io::stdin());
    tokio::select! {
        read = reader.read_line(&mut line) => {
            read?;
        }
        _ = cancel.cancelled() => {
            return Err(SlbErr::Interrupted);
        }
    }
    if line.trim() == CONFIRMATION_TOKEN {
        Ok(())
    } else {
        Err(SlbErr::Validation(format!(
            "confirmation token mismatch; type {CONFIRMATION_TOKEN} to proceed"
        )))
    }
}
