//! `slb` — the second-line broker CLI.
//!
//! A thin verb surface over `slb-core`: argument parsing and NDJSON
//! rendering live here, every behavior lives in the core.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use slb_core::BrokerCtx;
use slb_core::arbiter;
use slb_core::arbiter::ReviewParams;
use slb_core::broker::SessionAuth;
use slb_core::broker::SubmitOutcome;
use slb_core::broker::SubmitParams;
use slb_core::emergency;
use slb_core::emergency::EmergencyAck;
use slb_core::emergency::EmergencyParams;
use slb_core::exec;
use slb_core::exec::ExecuteOutcome;
use slb_core::exec::ExecuteParams;
use slb_core::pending::PendingSnapshot;
use slb_core::watcher;
use slb_core::watcher::WatchParams;
use slb_core::watcher::WatchScope;
use slb_protocol::Attachment;
use slb_protocol::AttachmentKind;
use slb_protocol::Justification;
use slb_protocol::PatternOrigin;
use slb_protocol::ReviewDecision;
use slb_protocol::RiskTier;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Second-line broker: agent-proposed shell commands are classified,
/// reviewed by other agents (or a human), and executed under an audited,
/// hash-pinned contract.
#[derive(Debug, Parser)]
#[clap(author, version, name = "slb")]
struct SlbCli {
    /// Project directory holding the broker state (defaults to the cwd).
    #[arg(long, global = true, value_name = "DIR")]
    project: Option<PathBuf>,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Register a new agent session and print its secret key.
    Session(SessionArgs),

    /// Propose a command. Safe commands are skipped; everything else
    /// becomes a pending request.
    Submit(SubmitArgs),

    /// Approve or reject a pending request.
    Review(ReviewArgs),

    /// Cancel your own pending request.
    Cancel(CancelArgs),

    /// Execute an approved request under the gate.
    Execute(ExecuteArgs),

    /// Record rollback intent for an executed request.
    Rollback(RollbackArgs),

    /// Human-only override: run a command immediately, fully audited.
    Emergency(EmergencyArgs),

    /// Stream lifecycle events as NDJSON until interrupted.
    Watch(WatchArgs),

    /// List pending requests.
    Pending(PendingArgs),

    /// Inspect or extend the classification pattern set.
    Patterns(PatternsArgs),
}

#[derive(Debug, clap::Args)]
struct AuthArgs {
    /// Session id issued by `slb session`.
    #[arg(long, value_name = "UUID")]
    session_id: Uuid,

    /// Secret session key issued alongside the id.
    #[arg(long, value_name = "KEY")]
    session_key: String,
}

impl AuthArgs {
    fn into_auth(self) -> SessionAuth {
        SessionAuth {
            session_id: self.session_id,
            session_key: self.session_key,
        }
    }
}

#[derive(Debug, clap::Args)]
struct SessionArgs {
    /// Agent name, e.g. "claude-opus-nightly".
    #[arg(long)]
    agent: String,

    /// Model identity, used for the cross-model review constraint.
    #[arg(long)]
    model: String,

    /// Tool identifier, e.g. "claude-code".
    #[arg(long, default_value = "unknown")]
    program: String,
}

#[derive(Debug, clap::Args)]
struct SubmitArgs {
    #[clap(flatten)]
    auth: AuthArgs,

    /// The command to propose, passed as one string.
    command: String,

    /// Working directory for the command (defaults to the project root).
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Split into argv and exec directly instead of `sh -c`.
    #[arg(long, default_value_t = false)]
    no_shell: bool,

    /// Redacted form shown to watchers instead of the raw command.
    #[arg(long, value_name = "TEXT")]
    display: Option<String>,

    /// Why the command is needed.
    #[arg(long)]
    reason: Option<String>,

    /// What the command is expected to change.
    #[arg(long)]
    expected_effect: Option<String>,

    /// The larger goal this command serves.
    #[arg(long)]
    goal: Option<String>,

    /// Why the command is believed safe.
    #[arg(long)]
    safety_argument: Option<String>,

    /// A dry-run variant that was already executed.
    #[arg(long, value_name = "CMD")]
    dry_run_command: Option<String>,

    /// Output of the dry-run variant.
    #[arg(long, value_name = "TEXT")]
    dry_run_output: Option<String>,

    /// Evidence files attached to the request.
    #[arg(long = "attach", value_name = "FILE")]
    attachments: Vec<PathBuf>,

    /// Override the tier-derived approval count.
    #[arg(long)]
    min_approvals: Option<u32>,

    /// Override the tier-derived cross-model requirement.
    #[arg(long)]
    cross_model: Option<bool>,

    /// Override the approval TTL.
    #[arg(long, value_name = "MINUTES")]
    ttl_minutes: Option<u64>,
}

#[derive(Debug, clap::Args)]
struct ReviewArgs {
    #[clap(flatten)]
    auth: AuthArgs,

    request_id: Uuid,

    /// approve or reject.
    #[arg(long, value_parser = parse_decision)]
    decision: ReviewDecision,

    /// Mandatory when rejecting.
    #[arg(long)]
    reason: Option<String>,

    #[arg(long)]
    comments: Option<String>,
}

#[derive(Debug, clap::Args)]
struct CancelArgs {
    #[clap(flatten)]
    auth: AuthArgs,

    request_id: Uuid,
}

#[derive(Debug, clap::Args)]
struct ExecuteArgs {
    #[clap(flatten)]
    auth: AuthArgs,

    request_id: Uuid,

    /// Hard deadline for the child process.
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Return right after spawn; the terminal transition is applied when
    /// the child exits.
    #[arg(long, default_value_t = false)]
    background: bool,
}

#[derive(Debug, clap::Args)]
struct RollbackArgs {
    request_id: Uuid,

    /// Record intent even when the request has not executed.
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[derive(Debug, clap::Args)]
struct EmergencyArgs {
    /// The command to run, passed as one string.
    command: String,

    /// Mandatory human-supplied reason, persisted in the audit trail.
    #[arg(long)]
    reason: String,

    /// Who is invoking the override.
    #[arg(long, default_value = "human")]
    actor: String,

    /// First 8+ hex characters of the canonical command hash.
    #[arg(long, value_name = "HEX", conflicts_with = "interactive")]
    ack: Option<String>,

    /// Confirm by typing EXECUTE at the terminal instead of supplying the
    /// hash prefix.
    #[arg(long, default_value_t = false)]
    interactive: bool,

    /// Working directory for the command (defaults to the project root).
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Hard deadline for the child process.
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,
}

#[derive(Debug, clap::Args)]
struct WatchArgs {
    /// Watch every project sharing this database, not just this one.
    #[arg(long, default_value_t = false)]
    all: bool,

    /// Auto-approve caution-tier requests as the auto-reviewer session.
    #[arg(long, default_value_t = false)]
    auto_approve_caution: bool,
}

#[derive(Debug, clap::Args)]
struct PendingArgs {
    /// List pending requests across every project sharing this database.
    #[arg(long, default_value_t = false)]
    all: bool,
}

#[derive(Debug, clap::Args)]
struct PatternsArgs {
    #[clap(subcommand)]
    command: PatternsCommand,
}

#[derive(Debug, clap::Subcommand)]
enum PatternsCommand {
    /// List patterns, optionally for one tier.
    List {
        #[arg(long, value_parser = parse_tier)]
        tier: Option<RiskTier>,
    },

    /// Add a pattern; the regex is validated before it is stored.
    Add {
        regex: String,
        #[arg(long, value_parser = parse_tier)]
        tier: RiskTier,
        #[arg(long)]
        reason: String,
    },

    /// Request removal of a pattern. Agents cannot delete patterns; this
    /// records a pending-removal entry for human curation.
    RequestRemoval {
        id: i64,
        #[arg(long)]
        reason: String,
    },
}

fn parse_decision(s: &str) -> Result<ReviewDecision, String> {
    ReviewDecision::from_str(s).map_err(|_| format!("expected approve or reject, got `{s}`"))
}

fn parse_tier(s: &str) -> Result<RiskTier, String> {
    RiskTier::from_str(s)
        .map_err(|_| format!("expected safe, caution, dangerous or critical, got `{s}`"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = SlbCli::parse();
    let project = match &cli.project {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine the current directory")?,
    };
    let project = project
        .canonicalize()
        .with_context(|| format!("project directory {} does not exist", project.display()))?;
    let ctx = BrokerCtx::open(&project)?;

    // Single cancellation root: SIGINT tears every long-lived worker down.
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                tracing::debug!("keyboard interrupt");
                cancel.cancel();
            }
        }
    });

    match cli.subcommand {
        Subcommand::Session(args) => {
            let session = ctx.create_session(args.agent, args.model, args.program)?;
            print_json(&serde_json::json!({
                "session_id": session.id,
                "session_key": session.session_key,
                "agent": session.agent,
                "model": session.model,
            }));
        }
        Subcommand::Submit(args) => {
            let justification = Justification {
                reason: args.reason,
                expected_effect: args.expected_effect,
                goal: args.goal,
                safety_argument: args.safety_argument,
            };
            let dry_run = match (args.dry_run_command, args.dry_run_output) {
                (Some(command), output) => Some(slb_core::broker::DryRun {
                    command,
                    output: output.unwrap_or_default(),
                }),
                (None, Some(_)) => {
                    anyhow::bail!("--dry-run-output requires --dry-run-command");
                }
                (None, None) => None,
            };
            let params = SubmitParams {
                command: args.command,
                cwd: args.cwd,
                use_shell: !args.no_shell,
                display_command: args.display,
                justification,
                attachments: args
                    .attachments
                    .into_iter()
                    .map(|path| Attachment {
                        path,
                        digest: None,
                        kind: AttachmentKind::File,
                    })
                    .collect(),
                dry_run,
                min_approvals: args.min_approvals,
                cross_model: args.cross_model,
                ttl_minutes: args.ttl_minutes,
            };
            match ctx.submit(&args.auth.into_auth(), params)? {
                SubmitOutcome::Skipped { tier } => {
                    print_json(&serde_json::json!({ "status": "skipped", "tier": tier }));
                }
                SubmitOutcome::Created {
                    request_id,
                    status,
                    tier,
                    reason,
                    expires_at,
                } => {
                    print_json(&serde_json::json!({
                        "request_id": request_id,
                        "status": status,
                        "tier": tier,
                        "reason": reason,
                        "expires_at": expires_at.to_rfc3339(),
                    }));
                }
            }
        }
        Subcommand::Review(args) => {
            let outcome = arbiter::submit_review(
                &ctx,
                ReviewParams {
                    request_id: args.request_id,
                    reviewer: args.auth.into_auth(),
                    decision: args.decision,
                    reason: args.reason,
                    comments: args.comments,
                },
            )?;
            print_json(&serde_json::json!({
                "approvals": outcome.approvals,
                "rejections": outcome.rejections,
                "status_changed": outcome.status_changed,
                "new_status": outcome.new_status,
                "approvals_remaining": outcome.approvals_remaining,
            }));
        }
        Subcommand::Cancel(args) => {
            let request = ctx.cancel(&args.auth.into_auth(), args.request_id)?;
            print_json(&serde_json::json!({
                "request_id": request.id,
                "status": request.status,
            }));
        }
        Subcommand::Execute(args) => {
            let params = ExecuteParams {
                request_id: args.request_id,
                executor: args.auth.into_auth(),
                timeout: args.timeout.map(Duration::from_secs),
                background: args.background,
            };
            match exec::execute(&ctx, params, cancel.clone()).await? {
                ExecuteOutcome::Finished(result) => {
                    print_json(&serde_json::json!({
                        "exit_code": result.exit_code,
                        "duration_ms": result.duration_ms,
                        "log_path": result.log_path,
                        "timed_out": result.timed_out,
                    }));
                }
                ExecuteOutcome::Spawned {
                    request_id,
                    log_path,
                } => {
                    print_json(&serde_json::json!({
                        "request_id": request_id,
                        "status": "executing",
                        "log_path": log_path,
                    }));
                }
            }
        }
        Subcommand::Rollback(args) => {
            let record = ctx.rollback(args.request_id, args.force)?;
            print_json(&serde_json::json!({
                "rollback_path": record.rollback_path,
                "rolled_back_at": record.rolled_back_at.to_rfc3339(),
            }));
        }
        Subcommand::Emergency(args) => {
            let ack = match (args.ack, args.interactive) {
                (Some(ack), _) => EmergencyAck::HashPrefix(ack),
                (None, true) => {
                    eprintln!(
                        "About to execute outside review: {}\nType {} to confirm:",
                        args.command,
                        emergency::CONFIRMATION_TOKEN
                    );
                    EmergencyAck::Interactive
                }
                (None, false) => anyhow::bail!(
                    "supply --ack <first 8+ hex chars of the command hash> or --interactive"
                ),
            };
            let result = emergency::emergency(
                &ctx,
                EmergencyParams {
                    command: args.command,
                    cwd: args.cwd,
                    use_shell: true,
                    reason: args.reason,
                    actor: args.actor,
                    ack,
                    timeout: args.timeout.map(Duration::from_secs),
                },
                cancel.clone(),
            )
            .await?;
            print_json(&serde_json::json!({
                "exit_code": result.exit_code,
                "duration_ms": result.duration_ms,
                "log_path": result.log_path,
                "hash": result.hash,
                "timed_out": result.timed_out,
            }));
        }
        Subcommand::Watch(args) => {
            let params = WatchParams {
                scope: if args.all {
                    WatchScope::All
                } else {
                    WatchScope::Project
                },
                auto_approve_caution: args.auto_approve_caution
                    || ctx.config.agents.auto_approve_caution,
            };
            let (tx, mut rx) = tokio::sync::mpsc::channel(64);
            let watcher = tokio::spawn({
                let cancel = cancel.clone();
                let ctx = std::sync::Arc::new(ctx);
                async move { watcher::run_poll_watcher(&ctx, params, tx, cancel).await }
            });
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::error!("failed to serialize event: {e}"),
                }
            }
            watcher.await??;
            return Ok(());
        }
        Subcommand::Pending(args) => {
            let project = if args.all {
                None
            } else {
                Some(ctx.paths.project().to_path_buf())
            };
            let requests = ctx.store.list_pending(project.as_deref())?;
            let mut snapshots = Vec::with_capacity(requests.len());
            for request in &requests {
                let requestor = ctx.store.get_session(request.session_id)?.map(|s| s.agent);
                snapshots.push(PendingSnapshot::of(request, requestor));
            }
            print_json(&snapshots);
        }
        Subcommand::Patterns(args) => match args.command {
            PatternsCommand::List { tier } => {
                let patterns = ctx.store.list_patterns(tier)?;
                let rows: Vec<_> = patterns
                    .iter()
                    .map(|p| {
                        serde_json::json!({
                            "id": p.id,
                            "pattern": p.pattern,
                            "tier": p.tier,
                            "reason": p.reason,
                            "origin": p.origin,
                        })
                    })
                    .collect();
                print_json(&rows);
            }
            PatternsCommand::Add {
                regex,
                tier,
                reason,
            } => {
                let id = ctx
                    .store
                    .add_pattern(&regex, tier, &reason, PatternOrigin::User)?;
                print_json(&serde_json::json!({ "id": id, "tier": tier }));
            }
            PatternsCommand::RequestRemoval { id, reason } => {
                let entry = ctx.store.request_pattern_removal(id, &reason)?;
                print_json(&serde_json::json!({
                    "pending_removal_id": entry,
                    "target_id": id,
                }));
            }
        },
    }

    Ok(())
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!("failed to render output: {e}"),
    }
}
