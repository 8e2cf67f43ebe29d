//! The executor: runs an approved request exactly once under a
//! policy-rechecked, hash-pinned contract.
//!
//! The gate (status precondition, approval TTL, hash recomputation, fresh
//! classification) is evaluated inside the store transaction that claims
//! the request, so two executors racing on the same request produce exactly
//! one child process. Output streams to a timestamped log file; the
//! deadline and cancellation both kill the whole child process group.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use tokio::process::Child;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::BrokerCtx;
use crate::broker::SessionAuth;
use crate::error::Result;
use crate::error::SlbErr;
use crate::events::EventBus;
use crate::hash::CommandSpec;
use crate::paths::ProjectPaths;
use crate::pending;
use crate::store::ExecOutcome;
use crate::store::Store;
use crate::store::audit_kind;

#[derive(Debug, Clone)]
pub struct ExecuteParams {
    pub request_id: Uuid,
    pub executor: SessionAuth,
    /// Hard deadline for the child; defaults to the configured execution
    /// timeout.
    pub timeout: Option<Duration>,
    /// Return right after spawn; a reaper task applies the terminal
    /// transition when the child exits.
    pub background: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub log_path: PathBuf,
    pub timed_out: bool,
}

#[derive(Debug)]
pub enum ExecuteOutcome {
    Finished(ExecResult),
    /// Background mode: the request is `executing` and will be finalized by
    /// the spawned reaper.
    Spawned {
        request_id: Uuid,
        log_path: PathBuf,
    },
}

pub async fn execute(
    ctx: &BrokerCtx,
    params: ExecuteParams,
    cancel: CancellationToken,
) -> Result<ExecuteOutcome> {
    let executor = ctx
        .store
        .authenticate_session(params.executor.session_id, &params.executor.session_key)?;

    let now = Utc::now();
    let pattern_set = ctx.store.pattern_set()?;
    let claim = ctx.store.claim_for_execution(params.request_id, now, |request| {
        // Tamper detection: the stored spec must still digest to the hash
        // pinned at creation.
        if request.spec.canonical_hash() != request.command_hash {
            return Err(SlbErr::Validation(
                "stored command no longer matches its pinned hash".to_string(),
            ));
        }
        // Policy recheck against the *current* pattern set.
        let classification = pattern_set.classify(&request.spec.command);
        if classification.tier > request.risk_tier {
            return Err(SlbErr::PolicyDrift {
                approved: request.risk_tier,
                now: classification.tier,
            });
        }
        Ok(())
    });
    let request = match claim {
        Ok(request) => request,
        Err(SlbErr::Expired) => {
            // The claim transaction already moved the request to timeout.
            if let Some(updated) = ctx.store.get_request(params.request_id)? {
                pending::retire_snapshot(&ctx.paths, &updated)?;
                ctx.announce_status(&updated);
            }
            return Err(SlbErr::Expired);
        }
        Err(e) => return Err(e),
    };

    let log_path = ctx.paths.execution_log_path(request.id, now);
    let timeout = params
        .timeout
        .unwrap_or(Duration::from_secs(ctx.config.general.execution_timeout_seconds));

    ctx.store.append_audit(
        audit_kind::EXECUTION_ATTEMPT,
        Some(request.id),
        Some(executor.id),
        serde_json::json!({
            "hash": request.command_hash,
            "log_path": log_path,
            "background": params.background,
            "timeout_secs": timeout.as_secs(),
        }),
    )?;

    let reaper = Reaper {
        store: Arc::clone(&ctx.store),
        bus: ctx.bus.clone(),
        paths: ctx.paths.clone(),
        request_id: request.id,
        executor_id: executor.id,
        log_path: log_path.clone(),
        timeout,
        cancel,
    };

    let child = match spawn_to_log(&request.spec, &log_path).await {
        Ok(child) => child,
        Err(e) => {
            let outcome = ExecOutcome {
                exit_code: None,
                duration_ms: 0,
                timed_out: false,
                log_path: log_path.clone(),
            };
            reaper.finalize(&outcome);
            tracing::error!(request = %request.id, "spawn failed: {e}");
            return Err(SlbErr::ExecutionFailed {
                exit_code: None,
                timed_out: false,
                log_path,
            });
        }
    };

    if params.background {
        let request_id = request.id;
        tokio::spawn(async move {
            let _ = reaper.reap(child).await;
        });
        return Ok(ExecuteOutcome::Spawned {
            request_id,
            log_path,
        });
    }

    let run = reaper.reap(child).await?;
    if run.interrupted {
        return Err(SlbErr::Interrupted);
    }
    let result = ExecResult {
        exit_code: run.exit_code.unwrap_or(-1),
        duration_ms: run.duration_ms,
        log_path: log_path.clone(),
        timed_out: run.timed_out,
    };
    if run.exit_code == Some(0) && !run.timed_out {
        Ok(ExecuteOutcome::Finished(result))
    } else {
        Err(SlbErr::ExecutionFailed {
            exit_code: run.exit_code,
            timed_out: run.timed_out,
            log_path,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChildRun {
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub interrupted: bool,
}

struct Reaper {
    store: Arc<Store>,
    bus: EventBus,
    paths: ProjectPaths,
    request_id: Uuid,
    executor_id: Uuid,
    log_path: PathBuf,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Reaper {
    /// Wait for the child (or its deadline, or cancellation), then apply
    /// the terminal transition and announce it.
    async fn reap(self, child: Child) -> Result<ChildRun> {
        let run = match wait_child(child, self.timeout, &self.cancel).await {
            Ok(run) => run,
            Err(e) => {
                // The wait itself failed; the request must still leave
                // `executing`.
                let outcome = ExecOutcome {
                    exit_code: None,
                    duration_ms: 0,
                    timed_out: false,
                    log_path: self.log_path.clone(),
                };
                self.finalize(&outcome);
                return Err(e);
            }
        };
        let outcome = ExecOutcome {
            exit_code: run.exit_code,
            duration_ms: run.duration_ms,
            timed_out: run.timed_out,
            log_path: self.log_path.clone(),
        };
        self.finalize(&outcome);
        Ok(run)
    }

    fn finalize(&self, outcome: &ExecOutcome) {
        match self
            .store
            .finalize_execution(self.request_id, outcome, Utc::now())
        {
            Ok(updated) => {
                self.store.append_audit_best_effort(
                    audit_kind::EXECUTION_FINISHED,
                    Some(self.request_id),
                    Some(self.executor_id),
                    serde_json::json!({
                        "exit_code": outcome.exit_code,
                        "duration_ms": outcome.duration_ms,
                        "timed_out": outcome.timed_out,
                        "status": updated.status,
                    }),
                );
                if let Err(e) = pending::retire_snapshot(&self.paths, &updated) {
                    tracing::warn!("failed to retire snapshot: {e}");
                }
                if let Some(event) =
                    slb_protocol::Event::for_status(updated.id, updated.status)
                {
                    self.bus.publish(event);
                }
            }
            Err(e) => {
                tracing::error!(request = %self.request_id, "finalize failed: {e}");
            }
        }
    }
}

/// Spawn the spec's child with stdout/stderr streaming into `log_path`.
/// Shell-interpreted specs run under `sh -c`; otherwise the command is
/// shlex-split and exec'd directly. The caller's environment is inherited
/// verbatim. On Unix the child gets its own process group so the deadline
/// can kill the whole tree.
pub(crate) async fn spawn_to_log(spec: &CommandSpec, log_path: &Path) -> Result<Child> {
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let stdout_log = tokio::fs::File::from_std(log.try_clone()?);
    let stderr_log = tokio::fs::File::from_std(log);

    let mut cmd = if spec.use_shell {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&spec.command);
        cmd
    } else {
        let argv = shlex::split(&spec.command)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| {
                SlbErr::Validation("command could not be split into argv".to_string())
            })?;
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    };
    cmd.current_dir(&spec.cwd);
    // Do not create a file descriptor for stdin: some commands try to read
    // from it and would hang forever waiting for input.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(copy_stream(stdout, stdout_log));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(copy_stream(stderr, stderr_log));
    }
    Ok(child)
}

async fn copy_stream(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    mut writer: tokio::fs::File,
) {
    use tokio::io::AsyncWriteExt;
    if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
        tracing::debug!("log stream ended with error: {e}");
    }
    let _ = writer.flush().await;
}

/// Wait for the child under a hard deadline and a cancellation signal.
/// Deadline and cancellation both kill the process group and report
/// `timed_out = true`; cancellation additionally flags `interrupted`.
pub(crate) async fn wait_child(
    mut child: Child,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ChildRun> {
    let start = Instant::now();
    let (exit_code, timed_out, interrupted) = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait()) => {
            match result {
                Ok(Ok(status)) => (status.code(), false, false),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    kill_child_group(&mut child).await;
                    (None, true, false)
                }
            }
        }
        _ = cancel.cancelled() => {
            kill_child_group(&mut child).await;
            (None, true, true)
        }
    };
    Ok(ChildRun {
        exit_code,
        duration_ms: start.elapsed().as_millis() as u64,
        timed_out,
        interrupted,
    })
}

#[cfg(unix)]
async fn kill_child_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        // The child was spawned into its own process group; negative pid
        // signals the whole group.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!("kill after deadline: {e}");
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn kill_child_group(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("kill after deadline: {e}");
    }
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;
    use slb_protocol::RequestStatus;
    use slb_protocol::ReviewDecision;
    use slb_protocol::RiskTier;

    use crate::arbiter;
    use crate::arbiter::ReviewParams;
    use crate::broker::SubmitOutcome;
    use crate::broker::SubmitParams;
    use crate::broker::tests::agent_auth;
    use crate::broker::tests::test_ctx;
    use crate::store::audit_kind;

    use super::*;

    fn approved_request(ctx: &BrokerCtx, command: &str) -> (Uuid, SessionAuth) {
        let (_, owner) = agent_auth(ctx, "owner", "m1");
        let (_, reviewer) = agent_auth(ctx, "reviewer", "m1");
        let mut params = SubmitParams::shell(command);
        params.cross_model = Some(false);
        let SubmitOutcome::Created { request_id, .. } = ctx.submit(&owner, params).unwrap() else {
            panic!("expected a created request");
        };
        arbiter::submit_review(
            ctx,
            ReviewParams {
                request_id,
                reviewer: reviewer.clone(),
                decision: ReviewDecision::Approve,
                reason: None,
                comments: None,
            },
        )
        .unwrap();
        (request_id, reviewer)
    }

    fn exec_params(request_id: Uuid, executor: SessionAuth) -> ExecuteParams {
        ExecuteParams {
            request_id,
            executor,
            timeout: Some(Duration::from_secs(5)),
            background: false,
        }
    }

    #[tokio::test]
    async fn successful_execution_reaches_executed() {
        let (_dir, ctx) = test_ctx();
        let (request_id, executor) = approved_request(&ctx, "rm -rf ./nonexistent-build-dir");
        // rm -f on a missing path exits 0, so this is a clean success run.
        let outcome = execute(&ctx, exec_params(request_id, executor), CancellationToken::new())
            .await
            .unwrap();
        let ExecuteOutcome::Finished(result) = outcome else {
            panic!("expected a finished execution");
        };
        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out);
        assert!(result.log_path.exists());
        let name = result
            .log_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert!(name.starts_with("exec-"));

        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Executed);
        assert_eq!(request.exit_code, Some(0));
        assert_eq!(request.log_path, Some(result.log_path));
    }

    #[tokio::test]
    async fn failing_child_reaches_execution_failed() {
        let (_dir, ctx) = test_ctx();
        let (request_id, executor) = approved_request(&ctx, "rm -r ./definitely-missing-dir");
        let err = execute(&ctx, exec_params(request_id, executor), CancellationToken::new())
            .await
            .unwrap_err();
        let SlbErr::ExecutionFailed {
            exit_code,
            timed_out,
            log_path,
        } = err
        else {
            panic!("expected execution_failed");
        };
        assert_ne!(exit_code, Some(0));
        assert!(!timed_out);
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("definitely-missing-dir"));

        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::ExecutionFailed);
    }

    #[tokio::test]
    async fn timeout_kills_the_child_and_records_timed_out() {
        let (_dir, ctx) = test_ctx();
        let (request_id, executor) = approved_request(&ctx, "sudo -k; sleep 30");
        let mut params = exec_params(request_id, executor);
        params.timeout = Some(Duration::from_millis(100));
        let start = Instant::now();
        let err = execute(&ctx, params, CancellationToken::new()).await.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            err,
            SlbErr::ExecutionFailed {
                timed_out: true,
                ..
            }
        ));
        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::ExecutionFailed);
        assert!(request.timed_out);
    }

    #[tokio::test]
    async fn executing_twice_fails_the_gate_without_a_second_spawn() {
        let (_dir, ctx) = test_ctx();
        let (request_id, executor) = approved_request(&ctx, "rm -rf ./nonexistent-build-dir");
        execute(
            &ctx,
            exec_params(request_id, executor.clone()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let err = execute(&ctx, exec_params(request_id, executor), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SlbErr::NotReviewable(_)));

        // exactly one execution attempt was audited
        let attempts = ctx
            .store
            .list_audit(Some(request_id))
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == audit_kind::EXECUTION_ATTEMPT)
            .count();
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn policy_drift_fails_the_gate_and_leaves_request_approved() {
        let (_dir, ctx) = test_ctx();
        let (request_id, executor) = approved_request(&ctx, "rm -rf ./nonexistent-build-dir");

        // Between approval and execution a critical-tier pattern appears
        // that matches the command.
        ctx.store
            .add_pattern(
                r"nonexistent-build-dir",
                RiskTier::Critical,
                "raised after an incident",
                slb_protocol::PatternOrigin::Project,
            )
            .unwrap();

        let err = execute(&ctx, exec_params(request_id, executor), CancellationToken::new())
            .await
            .unwrap_err();
        let SlbErr::PolicyDrift { approved, now } = err else {
            panic!("expected policy drift");
        };
        assert_eq!(approved, RiskTier::Dangerous);
        assert_eq!(now, RiskTier::Critical);

        // no child ran, status still approved
        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Approved);
        assert!(request.log_path.is_none());
    }

    #[tokio::test]
    async fn pending_request_cannot_be_executed() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "owner", "m1");
        let SubmitOutcome::Created { request_id, .. } = ctx
            .submit(&owner, SubmitParams::shell("rm -rf ./build"))
            .unwrap()
        else {
            panic!("expected a created request");
        };
        let err = execute(&ctx, exec_params(request_id, owner), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SlbErr::NotReviewable(_)));
    }

    #[tokio::test]
    async fn background_mode_returns_executing_then_finalizes() {
        let (_dir, ctx) = test_ctx();
        let (request_id, executor) = approved_request(&ctx, "rm -rf ./nonexistent-build-dir");
        let mut params = exec_params(request_id, executor);
        params.background = true;

        let outcome = execute(&ctx, params, CancellationToken::new()).await.unwrap();
        let ExecuteOutcome::Spawned { request_id: id, .. } = outcome else {
            panic!("expected a spawned execution");
        };
        assert_eq!(id, request_id);
        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert!(matches!(
            request.status,
            RequestStatus::Executing | RequestStatus::Executed
        ));

        // the reaper applies the terminal transition
        for _ in 0..50 {
            if ctx
                .store
                .get_request(request_id)
                .unwrap()
                .unwrap()
                .status
                .is_terminal()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Executed);
    }

    #[tokio::test]
    async fn direct_exec_splits_argv() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "owner", "m1");
        let (_, reviewer) = agent_auth(&ctx, "reviewer", "m1");
        let mut params = SubmitParams::shell("rm -rf ./gone");
        params.use_shell = false;
        params.cross_model = Some(false);
        let SubmitOutcome::Created { request_id, .. } = ctx.submit(&owner, params).unwrap() else {
            panic!("expected a created request");
        };
        arbiter::submit_review(
            &ctx,
            ReviewParams {
                request_id,
                reviewer: reviewer.clone(),
                decision: ReviewDecision::Approve,
                reason: None,
                comments: None,
            },
        )
        .unwrap();

        let outcome = execute(&ctx, exec_params(request_id, reviewer), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ExecuteOutcome::Finished(r) if r.exit_code == 0));
    }
}
