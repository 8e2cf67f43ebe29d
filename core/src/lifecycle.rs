//! The request state machine and the tier → review-threshold mapping.
//!
//! The transition table here is the only ordering the system promises:
//!
//! ```text
//! pending   → approved | rejected | cancelled | timeout
//! approved  → executing | timeout
//! executing → executed | execution_failed
//! ```
//!
//! `executing` is the executor's claim marker: the gate and the status
//! transition are fused into one compare-and-set so a request can never be
//! spawned twice. Terminal states admit no further transitions.

use slb_protocol::RequestStatus;
use slb_protocol::RiskTier;

use crate::config::Config;
use crate::error::Result;
use crate::error::SlbErr;

pub fn transition_allowed(from: RequestStatus, to: RequestStatus) -> bool {
    use RequestStatus::*;
    matches!(
        (from, to),
        (Pending, Approved)
            | (Pending, Rejected)
            | (Pending, Cancelled)
            | (Pending, Timeout)
            | (Approved, Executing)
            | (Approved, Timeout)
            | (Executing, Executed)
            | (Executing, ExecutionFailed)
    )
}

/// Typed rejection for a transition outside the table.
pub fn check_transition(from: RequestStatus, to: RequestStatus) -> Result<()> {
    if transition_allowed(from, to) {
        Ok(())
    } else {
        Err(SlbErr::NotReviewable(format!(
            "transition {from} → {to} is not allowed"
        )))
    }
}

/// Review thresholds attached to a request at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewPolicy {
    pub min_approvals: u32,
    pub cross_model: bool,
}

/// Map a classified tier to its review policy. `None` means the command is
/// safe: no request row is created and the caller proceeds. Project
/// configuration may override the approval counts; the resulting numbers
/// are authoritative for the request's lifetime.
pub fn policy_for_tier(
    tier: RiskTier,
    multiple_models_active: bool,
    config: &Config,
) -> Option<ReviewPolicy> {
    match tier {
        RiskTier::Safe => None,
        RiskTier::Caution => Some(ReviewPolicy {
            min_approvals: 1,
            cross_model: false,
        }),
        RiskTier::Dangerous => Some(ReviewPolicy {
            min_approvals: config.general.dangerous_min_approvals.unwrap_or(1).max(1),
            cross_model: multiple_models_active,
        }),
        RiskTier::Critical => Some(ReviewPolicy {
            min_approvals: config.general.critical_min_approvals.unwrap_or(2).max(1),
            cross_model: true,
        }),
    }
}
