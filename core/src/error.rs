use std::io;
use std::path::PathBuf;

use slb_protocol::RiskTier;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, SlbErr>;

#[derive(Error, Debug)]
pub enum SlbErr {
    /// Missing required input, malformed hash acknowledgement, bad tier
    /// name. Surfaced to the caller verbatim; never retried.
    #[error("{0}")]
    Validation(String),

    /// Session unknown or session key mismatch. The comparison path is
    /// constant-time; the message deliberately does not say which.
    #[error("session unknown or session key mismatch")]
    AuthFailed,

    /// The request is not in a state that admits the requested operation,
    /// e.g. reviewing an already-approved request or cancelling someone
    /// else's request.
    #[error("not reviewable: {0}")]
    NotReviewable(String),

    #[error("request not found: {0}")]
    RequestNotFound(Uuid),

    /// The execution-time gate discovered that the current pattern set
    /// classifies the command more strictly than what was approved. The
    /// operator may re-submit for fresh approval.
    #[error("policy drift: command now classifies at tier `{now}`, approved at tier `{approved}`")]
    PolicyDrift { approved: RiskTier, now: RiskTier },

    /// Approval TTL elapsed. The lifecycle transitions the request to
    /// `timeout` before this is returned.
    #[error("approval TTL elapsed; request transitioned to timeout")]
    Expired,

    #[error("this session has already reviewed the request")]
    DuplicateReview,

    #[error("a session may not review its own request")]
    SelfReview,

    #[error("cross-model review required: reviewer and owner run the same model")]
    SameModel,

    /// The child process failed (non-zero exit, spawn error or timeout).
    /// The request has already been transitioned to `execution_failed`.
    #[error("execution failed (exit code {exit_code:?}, timed out: {timed_out}); log at {}", log_path.display())]
    ExecutionFailed {
        exit_code: Option<i32>,
        timed_out: bool,
        log_path: PathBuf,
    },

    /// Durability failure. The originating operation fails with no partial
    /// writes; the caller may retry after backoff.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The operation observed cancellation (SIGINT/SIGTERM) and unwound.
    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
