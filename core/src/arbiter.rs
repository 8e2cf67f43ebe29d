//! The review arbiter: turns a raw approve/reject submission into an
//! atomic (review-inserted, maybe-status-changed) outcome.
//!
//! Eligibility is checked in a fixed order, each failure fatal: request
//! reviewable, not expired, reviewer authenticated, no self-review, the
//! cross-model constraint, no duplicate vote. The insert and any resulting
//! transition are one store transaction.

use chrono::Utc;
use slb_protocol::RequestStatus;
use slb_protocol::ReviewDecision;
use uuid::Uuid;

use crate::broker::BrokerCtx;
use crate::broker::SessionAuth;
use crate::error::Result;
use crate::error::SlbErr;
use crate::pending;
use crate::store::Review;
use crate::store::ReviewOutcome;
use crate::store::audit_kind;

#[derive(Debug, Clone)]
pub struct ReviewParams {
    pub request_id: Uuid,
    pub reviewer: SessionAuth,
    pub decision: ReviewDecision,
    /// Mandatory for reject; prepended to the comments as a two-line block.
    pub reason: Option<String>,
    pub comments: Option<String>,
}

/// Submit one review. On success reports the vote counts and whether the
/// request changed status in the same transaction.
pub fn submit_review(ctx: &BrokerCtx, params: ReviewParams) -> Result<ReviewOutcome> {
    let now = Utc::now();

    // 1. Request exists and is still pending.
    let request = ctx
        .store
        .get_request(params.request_id)?
        .ok_or_else(|| SlbErr::NotReviewable(format!("request {} not found", params.request_id)))?;
    if request.status != RequestStatus::Pending {
        return Err(SlbErr::NotReviewable(format!(
            "request is {}, not pending",
            request.status
        )));
    }

    // 2. Not expired; an expired request is transitioned before returning.
    if now > request.expires_at {
        if let Some(updated) = ctx.store.mark_timed_out(request.id, now)? {
            pending::retire_snapshot(&ctx.paths, &updated)?;
            ctx.store.append_audit_best_effort(
                audit_kind::STATUS_CHANGED,
                Some(request.id),
                None,
                serde_json::json!({ "from": "pending", "to": "timeout" }),
            );
            ctx.announce_status(&updated);
        }
        return Err(SlbErr::Expired);
    }

    // 3. Reviewer session exists and its key matches (constant-time).
    let reviewer = ctx
        .store
        .authenticate_session(params.reviewer.session_id, &params.reviewer.session_key)?;

    // 4. No self-review.
    if reviewer.id == request.session_id {
        return Err(SlbErr::SelfReview);
    }

    // 5. Cross-model constraint.
    if request.cross_model {
        let owner = ctx
            .store
            .get_session(request.session_id)?
            .ok_or_else(|| SlbErr::NotReviewable("owner session missing".to_string()))?;
        if owner.model == reviewer.model {
            return Err(SlbErr::SameModel);
        }
    }

    // Reject requires a reason, surfaced at the head of the comments.
    let comments = match params.decision {
        ReviewDecision::Reject => {
            let reason = params.reason.as_deref().filter(|r| !r.trim().is_empty()).ok_or_else(
                || SlbErr::Validation("a reject review requires a reason".to_string()),
            )?;
            let block = format!("Reason: {reason}\n");
            Some(match params.comments {
                Some(comments) => format!("{block}\n{comments}"),
                None => block,
            })
        }
        ReviewDecision::Approve => params.comments,
    };

    let review = Review {
        id: Uuid::new_v4(),
        request_id: request.id,
        reviewer_session_id: reviewer.id,
        reviewer_agent: reviewer.agent.clone(),
        reviewer_model: reviewer.model.clone(),
        decision: params.decision,
        comments,
        created_at: now,
    };

    // 6. Duplicate detection and the threshold arithmetic happen inside
    // the same transaction as the insert.
    let outcome = ctx
        .store
        .create_review_and_maybe_transition(&review, request.min_approvals, now)?;

    ctx.store.append_audit(
        audit_kind::REVIEW_SUBMITTED,
        Some(request.id),
        Some(reviewer.id),
        serde_json::json!({
            "decision": review.decision,
            "approvals": outcome.approvals,
            "rejections": outcome.rejections,
            "new_status": outcome.new_status,
        }),
    )?;

    if let Some(new_status) = outcome.new_status {
        if let Some(updated) = ctx.store.get_request(request.id)? {
            // Approved requests leave the pending queue too; their snapshot
            // retires alongside terminal ones.
            pending::retire_snapshot(&ctx.paths, &updated)?;
            ctx.announce_status(&updated);
        }
        tracing::info!(request = %request.id, status = %new_status, "review changed status");
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;
    use slb_protocol::RiskTier;

    use crate::broker::SubmitOutcome;
    use crate::broker::SubmitParams;
    use crate::broker::tests::agent_auth;
    use crate::broker::tests::test_ctx;

    use super::*;

    fn submit_dangerous(ctx: &BrokerCtx, auth: &SessionAuth) -> Uuid {
        let SubmitOutcome::Created { request_id, .. } = ctx
            .submit(auth, SubmitParams::shell("rm -rf ./build"))
            .unwrap()
        else {
            panic!("expected a created request");
        };
        request_id
    }

    fn approve_as(auth: &SessionAuth, request_id: Uuid) -> ReviewParams {
        ReviewParams {
            request_id,
            reviewer: auth.clone(),
            decision: ReviewDecision::Approve,
            reason: None,
            comments: None,
        }
    }

    #[test]
    fn single_approval_approves_in_one_transaction() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        let request_id = submit_dangerous(&ctx, &owner);
        let (_, reviewer) = agent_auth(&ctx, "b", "m1");

        let outcome = submit_review(&ctx, approve_as(&reviewer, request_id)).unwrap();
        assert_eq!(outcome.approvals, 1);
        assert!(outcome.status_changed);
        assert_eq!(outcome.new_status, Some(RequestStatus::Approved));
        assert!(!ctx.paths.pending_snapshot_path(request_id).exists());
    }

    #[test]
    fn self_review_is_refused() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        let request_id = submit_dangerous(&ctx, &owner);

        assert!(matches!(
            submit_review(&ctx, approve_as(&owner, request_id)),
            Err(SlbErr::SelfReview)
        ));
    }

    #[test]
    fn cross_model_is_enforced() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        // a second model makes the dangerous default cross_model = true
        let (_, same_model) = agent_auth(&ctx, "b", "m1");
        let (_, other_model) = agent_auth(&ctx, "c", "m2");
        let request_id = submit_dangerous(&ctx, &owner);
        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert!(request.cross_model);

        assert!(matches!(
            submit_review(&ctx, approve_as(&same_model, request_id)),
            Err(SlbErr::SameModel)
        ));
        // the request is untouched by the failed review
        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Pending);

        let outcome = submit_review(&ctx, approve_as(&other_model, request_id)).unwrap();
        assert_eq!(outcome.new_status, Some(RequestStatus::Approved));
    }

    #[test]
    fn duplicate_review_is_refused() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        let (_, reviewer) = agent_auth(&ctx, "b", "m1");

        // raise the bar so the first approve does not end the pending state
        let mut params = SubmitParams::shell("rm -rf ./other");
        params.min_approvals = Some(2);
        let SubmitOutcome::Created {
            request_id: two_vote,
            ..
        } = ctx.submit(&owner, params).unwrap()
        else {
            panic!("expected a created request");
        };

        let outcome = submit_review(&ctx, approve_as(&reviewer, two_vote)).unwrap();
        assert!(!outcome.status_changed);
        assert_eq!(outcome.approvals_remaining, 1);
        assert!(matches!(
            submit_review(&ctx, approve_as(&reviewer, two_vote)),
            Err(SlbErr::DuplicateReview)
        ));
    }

    #[test]
    fn reject_requires_reason_and_is_terminal() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        let request_id = submit_dangerous(&ctx, &owner);
        let (_, reviewer) = agent_auth(&ctx, "b", "m1");

        let mut params = approve_as(&reviewer, request_id);
        params.decision = ReviewDecision::Reject;
        assert!(matches!(
            submit_review(&ctx, params.clone()),
            Err(SlbErr::Validation(_))
        ));

        params.reason = Some("touches prod data".to_string());
        params.comments = Some("take a backup first".to_string());
        let outcome = submit_review(&ctx, params).unwrap();
        assert_eq!(outcome.new_status, Some(RequestStatus::Rejected));

        let reviews = ctx.store.list_reviews(request_id).unwrap();
        assert_eq!(reviews.len(), 1);
        let comments = reviews[0].comments.as_deref().unwrap();
        assert!(comments.starts_with("Reason: touches prod data\n"));
        assert!(comments.contains("take a backup first"));

        // a rejected request is no longer reviewable
        let (_, late) = agent_auth(&ctx, "c", "m2");
        assert!(matches!(
            submit_review(&ctx, approve_as(&late, request_id)),
            Err(SlbErr::NotReviewable(_))
        ));
    }

    #[test]
    fn expired_request_times_out_on_review() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        let mut params = SubmitParams::shell("rm -rf ./build");
        params.ttl_minutes = Some(0);
        let SubmitOutcome::Created { request_id, .. } = ctx.submit(&owner, params).unwrap() else {
            panic!("expected a created request");
        };
        let (_, reviewer) = agent_auth(&ctx, "b", "m1");

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(matches!(
            submit_review(&ctx, approve_as(&reviewer, request_id)),
            Err(SlbErr::Expired)
        ));
        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Timeout);
    }

    #[test]
    fn wrong_key_fails_before_eligibility() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        let request_id = submit_dangerous(&ctx, &owner);
        let (reviewer_session, _) = agent_auth(&ctx, "b", "m2");

        let bad = SessionAuth {
            session_id: reviewer_session.id,
            session_key: "wrong".to_string(),
        };
        assert!(matches!(
            submit_review(&ctx, approve_as(&bad, request_id)),
            Err(SlbErr::AuthFailed)
        ));
    }

    #[test]
    fn unknown_request_is_not_reviewable() {
        let (_dir, ctx) = test_ctx();
        let (_, reviewer) = agent_auth(&ctx, "b", "m1");
        assert!(matches!(
            submit_review(&ctx, approve_as(&reviewer, Uuid::new_v4())),
            Err(SlbErr::NotReviewable(_))
        ));
    }

    #[test]
    fn min_approvals_two_reports_remaining_then_approves() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        let mut params = SubmitParams::shell("rm -rf ./build");
        params.min_approvals = Some(2);
        let SubmitOutcome::Created { request_id, .. } = ctx.submit(&owner, params).unwrap() else {
            panic!("expected a created request");
        };
        let (_, r1) = agent_auth(&ctx, "b", "m2");
        let (_, r2) = agent_auth(&ctx, "c", "m3");

        let first = submit_review(&ctx, approve_as(&r1, request_id)).unwrap();
        assert_eq!((first.approvals, first.approvals_remaining), (1, 1));
        assert!(!first.status_changed);

        let second = submit_review(&ctx, approve_as(&r2, request_id)).unwrap();
        assert_eq!(second.approvals, 2);
        assert_eq!(second.new_status, Some(RequestStatus::Approved));
    }

    #[test]
    fn tier_reported_on_submit_matches_request_row() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        let SubmitOutcome::Created {
            request_id, tier, ..
        } = ctx
            .submit(&owner, SubmitParams::shell("git push --force origin main"))
            .unwrap()
        else {
            panic!("expected a created request");
        };
        assert_eq!(tier, RiskTier::Dangerous);
        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert_eq!(request.risk_tier, tier);
    }
}
