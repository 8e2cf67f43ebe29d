use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::types::RequestStatus;
use crate::types::RiskTier;

/// Lifecycle event delivered to watchers, both over the in-process bus and
/// as one NDJSON object per line on the watch stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    RequestPending {
        request_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        risk_tier: Option<RiskTier>,
        /// Redacted display form when one was stored, else the raw command.
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        requestor: Option<String>,
        /// RFC 3339.
        #[serde(skip_serializing_if = "Option::is_none")]
        created_at: Option<String>,
    },
    RequestApproved {
        request_id: Uuid,
    },
    RequestRejected {
        request_id: Uuid,
    },
    RequestExecuted {
        request_id: Uuid,
    },
    RequestTimeout {
        request_id: Uuid,
    },
    RequestCancelled {
        request_id: Uuid,
    },
    AutoApproveError {
        request_id: Uuid,
        error: String,
    },
}

impl Event {
    pub fn request_id(&self) -> Uuid {
        match self {
            Event::RequestPending { request_id, .. }
            | Event::RequestApproved { request_id }
            | Event::RequestRejected { request_id }
            | Event::RequestExecuted { request_id }
            | Event::RequestTimeout { request_id }
            | Event::RequestCancelled { request_id }
            | Event::AutoApproveError { request_id, .. } => *request_id,
        }
    }

    /// Event announcing that `request_id` reached `status`, if that status
    /// has a corresponding event kind. `Executing` is an internal claim
    /// marker and produces no event; both execution outcomes surface as
    /// `request_executed` (the result itself lives on the request row).
    pub fn for_status(request_id: Uuid, status: RequestStatus) -> Option<Event> {
        match status {
            RequestStatus::Pending | RequestStatus::Executing => None,
            RequestStatus::Approved => Some(Event::RequestApproved { request_id }),
            RequestStatus::Rejected => Some(Event::RequestRejected { request_id }),
            RequestStatus::Cancelled => Some(Event::RequestCancelled { request_id }),
            RequestStatus::Timeout => Some(Event::RequestTimeout { request_id }),
            RequestStatus::Executed | RequestStatus::ExecutionFailed => {
                Some(Event::RequestExecuted { request_id })
            }
        }
    }
}
