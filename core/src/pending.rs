//! Pending-request snapshots: one JSON file per pending request under
//! `.slb/pending/`, mirroring the event-stream pending record so shell
//! tooling can inspect the queue without opening the database. On a
//! terminal transition the snapshot moves to `.slb/processed/`.

use serde::Deserialize;
use serde::Serialize;
use slb_protocol::RequestStatus;
use slb_protocol::RiskTier;
use uuid::Uuid;

use crate::error::Result;
use crate::paths::ProjectPaths;
use crate::store::Request;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSnapshot {
    pub request_id: Uuid,
    pub risk_tier: RiskTier,
    pub status: RequestStatus,
    /// Redacted if a redacted form was stored, else raw.
    pub command: String,
    pub requestor: Option<String>,
    pub min_approvals: u32,
    pub cross_model: bool,
    pub created_at: String,
    pub expires_at: String,
}

impl PendingSnapshot {
    pub fn of(request: &Request, requestor: Option<String>) -> Self {
        Self {
            request_id: request.id,
            risk_tier: request.risk_tier,
            status: request.status,
            command: request.display_or_raw().to_string(),
            requestor,
            min_approvals: request.min_approvals,
            cross_model: request.cross_model,
            created_at: request.created_at.to_rfc3339(),
            expires_at: request.expires_at.to_rfc3339(),
        }
    }
}

/// Write the snapshot for a freshly-created pending request.
pub fn write_snapshot(
    paths: &ProjectPaths,
    request: &Request,
    requestor: Option<String>,
) -> Result<()> {
    let snapshot = PendingSnapshot::of(request, requestor);
    let path = paths.pending_snapshot_path(request.id);
    let json = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Move the snapshot out of `pending/` once the request reaches a terminal
/// state. Missing snapshots are tolerated — another observer may have
/// retired the file first.
pub fn retire_snapshot(paths: &ProjectPaths, request: &Request) -> Result<()> {
    let pending = paths.pending_snapshot_path(request.id);
    if !pending.exists() {
        return Ok(());
    }
    let snapshot = PendingSnapshot::of(request, None);
    let json = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(paths.processed_snapshot_path(request.id), json)?;
    std::fs::remove_file(pending)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::path::PathBuf;

    use chrono::Duration;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use slb_protocol::Justification;

    use crate::hash::CommandSpec;

    use super::*;

    fn request() -> Request {
        let spec = CommandSpec::new("rm -rf ./build", "/p", true);
        let now = Utc::now();
        Request {
            id: Uuid::new_v4(),
            seq: 1,
            session_id: Uuid::new_v4(),
            project_path: PathBuf::from("/p"),
            command_hash: spec.canonical_hash(),
            spec,
            display_command: Some("rm -rf <redacted>".to_string()),
            risk_tier: RiskTier::Dangerous,
            status: RequestStatus::Pending,
            justification: Justification::default(),
            dry_run_command: None,
            dry_run_output: None,
            rollback_path: None,
            rolled_back_at: None,
            min_approvals: 1,
            cross_model: false,
            expires_at: now + Duration::minutes(15),
            created_at: now,
            updated_at: now,
            attachments: Vec::new(),
            log_path: None,
            exit_code: None,
            duration_ms: None,
            timed_out: false,
        }
    }

    #[test]
    fn snapshot_prefers_redacted_command() {
        let request = request();
        let snapshot = PendingSnapshot::of(&request, Some("tester".to_string()));
        assert_eq!(snapshot.command, "rm -rf <redacted>");
        assert_eq!(snapshot.requestor.as_deref(), Some("tester"));
    }

    #[test]
    fn snapshots_are_written_and_retired() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        paths.ensure_layout().unwrap();
        let mut request = request();

        write_snapshot(&paths, &request, None).unwrap();
        assert!(paths.pending_snapshot_path(request.id).exists());

        request.status = RequestStatus::Cancelled;
        retire_snapshot(&paths, &request).unwrap();
        assert!(!paths.pending_snapshot_path(request.id).exists());
        let retired = std::fs::read_to_string(paths.processed_snapshot_path(request.id)).unwrap();
        let snapshot: PendingSnapshot = serde_json::from_str(&retired).unwrap();
        assert_eq!(snapshot.status, RequestStatus::Cancelled);

        // retiring twice is fine
        retire_snapshot(&paths, &request).unwrap();
    }
}
