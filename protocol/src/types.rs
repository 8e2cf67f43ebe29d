use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Risk tier assigned to a command by the classifier. Ordered by ascending
/// severity so `tier > approved_tier` expresses policy escalation directly.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskTier {
    /// No request is created; the caller is told to proceed.
    Safe,
    /// Requires a review but is eligible for auto-approval.
    Caution,
    /// Requires at least one human or peer-agent approval.
    Dangerous,
    /// Tightened defaults; only the emergency override bypasses review.
    Critical,
}

impl RiskTier {
    /// Tiers that produce a durable request when classified.
    pub fn requires_review(self) -> bool {
        self != RiskTier::Safe
    }
}

/// Request lifecycle status. The allowed transitions are enforced by the
/// lifecycle engine; see `slb_core::lifecycle`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    /// Claim marker held by the executor between the gate and the terminal
    /// transition. Prevents double-execution.
    Executing,
    Rejected,
    Cancelled,
    Timeout,
    Executed,
    ExecutionFailed,
}

impl RequestStatus {
    /// Once terminal, no further writes may change the status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Rejected
                | RequestStatus::Cancelled
                | RequestStatus::Timeout
                | RequestStatus::Executed
                | RequestStatus::ExecutionFailed
        )
    }
}

/// A reviewer's vote on a pending request.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

/// Where a classification pattern came from. Only `Builtin`, `Project` and
/// `User` patterns participate in classification; `PendingRemoval` and
/// `Suggested` entries wait for human curation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PatternOrigin {
    Builtin,
    Project,
    User,
    PendingRemoval,
    Suggested,
}

impl PatternOrigin {
    pub fn classifies(self) -> bool {
        matches!(
            self,
            PatternOrigin::Builtin | PatternOrigin::Project | PatternOrigin::User
        )
    }
}

/// Free-text rationale supplied by the submitting agent. All fields are
/// optional; reviewers see whatever was provided.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Justification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_effect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_argument: Option<String>,
}

impl Justification {
    pub fn is_empty(&self) -> bool {
        self.reason.is_none()
            && self.expected_effect.is_none()
            && self.goal.is_none()
            && self.safety_argument.is_none()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttachmentKind {
    File,
    CommandContext,
    Screenshot,
}

/// Evidence attached to a request at submission time. Attachments are
/// read-only after the request is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub kind: AttachmentKind,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::str::FromStr;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn tier_ordering_is_ascending_severity() {
        assert!(RiskTier::Safe < RiskTier::Caution);
        assert!(RiskTier::Caution < RiskTier::Dangerous);
        assert!(RiskTier::Dangerous < RiskTier::Critical);
    }

    #[test]
    fn tier_round_trips_through_strings() {
        for tier in [
            RiskTier::Safe,
            RiskTier::Caution,
            RiskTier::Dangerous,
            RiskTier::Critical,
        ] {
            assert_eq!(RiskTier::from_str(&tier.to_string()).unwrap(), tier);
        }
        assert!(RiskTier::from_str("catastrophic").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Approved.is_terminal());
        assert!(!RequestStatus::Executing.is_terminal());
        assert!(RequestStatus::Rejected.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
        assert!(RequestStatus::Timeout.is_terminal());
        assert!(RequestStatus::Executed.is_terminal());
        assert!(RequestStatus::ExecutionFailed.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&RequestStatus::ExecutionFailed).unwrap();
        assert_eq!(json, "\"execution_failed\"");
    }
}
