//! Watchers: long-lived consumers of lifecycle events.
//!
//! Two delivery paths coexist. When the watcher lives in the same process
//! as the broker it subscribes to the event bus and receives events in
//! commit order. Otherwise it polls the store: each tick lists the pending
//! requests, emits `request_pending` for unseen ones and the corresponding
//! event for every observed status change. A seen-map keyed by request id
//! makes emission idempotent — exactly one event per (request, target
//! status) pair over the watcher's lifetime.
//!
//! Watchers recover nothing silently but also never die on an operational
//! error: failures are logged (or surfaced as `auto_approve_error` events)
//! and the loop continues.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use slb_protocol::Event;
use slb_protocol::RequestStatus;
use slb_protocol::ReviewDecision;
use slb_protocol::RiskTier;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::arbiter;
use crate::arbiter::ReviewParams;
use crate::broker::BrokerCtx;
use crate::broker::SessionAuth;
use crate::error::Result;
use crate::store::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    /// Only requests for this broker's project.
    Project,
    /// Every project sharing the database.
    All,
}

#[derive(Debug, Clone)]
pub struct WatchParams {
    pub scope: WatchScope,
    pub auto_approve_caution: bool,
}

/// Poll the store until cancelled, emitting events into `events`.
/// Cancellation is observed at the next tick boundary.
pub async fn run_poll_watcher(
    ctx: &BrokerCtx,
    params: WatchParams,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> Result<()> {
    let tick = Duration::from_secs(ctx.config.general.poll_interval_seconds.max(1));
    let mut seen: HashMap<Uuid, RequestStatus> = HashMap::new();
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        if let Err(e) = poll_once(ctx, &params, &mut seen, &events).await {
            tracing::warn!("watch tick failed: {e}");
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(tick) => {}
        }
    }
}

/// One watcher tick. Public so embedders (and tests) can drive the loop
/// themselves.
pub async fn poll_once(
    ctx: &BrokerCtx,
    params: &WatchParams,
    seen: &mut HashMap<Uuid, RequestStatus>,
    events: &mpsc::Sender<Event>,
) -> Result<()> {
    // Observer duty: sweep expired requests into timeout first so the
    // status change below is seen in the same tick.
    ctx.expire_overdue(Utc::now())?;

    let project = match params.scope {
        WatchScope::Project => Some(ctx.paths.project()),
        WatchScope::All => None,
    };
    let pending = ctx.store.list_pending(project)?;

    for request in &pending {
        if seen.contains_key(&request.id) {
            continue;
        }
        seen.insert(request.id, RequestStatus::Pending);
        let requestor = ctx
            .store
            .get_session(request.session_id)?
            .map(|s| s.agent);
        send(
            events,
            Event::RequestPending {
                request_id: request.id,
                risk_tier: Some(request.risk_tier),
                command: Some(request.display_or_raw().to_string()),
                requestor,
                created_at: Some(request.created_at.to_rfc3339()),
            },
        )
        .await;

        if params.auto_approve_caution && request.risk_tier == RiskTier::Caution {
            if let Some(error_event) = auto_approve(ctx, request) {
                send(events, error_event).await;
            }
        }
    }

    // Re-check everything we have seen whose last observed status can still
    // change; emit on every transition we find.
    let tracked: Vec<(Uuid, RequestStatus)> = seen
        .iter()
        .filter(|(_, status)| !status.is_terminal())
        .map(|(id, status)| (*id, *status))
        .collect();
    for (id, last) in tracked {
        let Some(request) = ctx.store.get_request(id)? else {
            continue;
        };
        if request.status == last {
            continue;
        }
        seen.insert(id, request.status);
        if let Some(event) = Event::for_status(id, request.status) {
            send(events, event).await;
        }
    }
    Ok(())
}

/// Forward bus events until cancelled. Delivery is at-least-once within
/// the subscription; a lagged receiver logs and keeps going.
pub async fn run_push_watcher(
    ctx: &BrokerCtx,
    params: WatchParams,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut rx = ctx.bus.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = rx.recv() => match received {
                Ok(event) => {
                    if params.auto_approve_caution {
                        if let Event::RequestPending {
                            request_id,
                            risk_tier: Some(RiskTier::Caution),
                            ..
                        } = &event
                        {
                            if let Ok(Some(request)) = ctx.store.get_request(*request_id) {
                                if let Some(error_event) = auto_approve(ctx, &request) {
                                    send(&events, error_event).await;
                                }
                            }
                        }
                    }
                    send(&events, event).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("push watcher lagged, {missed} events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// Approve a caution-tier request as the pre-provisioned auto-reviewer.
/// All eligibility rules apply; a failure becomes an `auto_approve_error`
/// event instead of aborting the watcher.
fn auto_approve(ctx: &BrokerCtx, request: &Request) -> Option<Event> {
    let reviewer = match ctx.auto_reviewer_session() {
        Ok(Some(session)) => session,
        Ok(None) => {
            return Some(Event::AutoApproveError {
                request_id: request.id,
                error: "auto-reviewer session is not provisioned".to_string(),
            });
        }
        Err(e) => {
            return Some(Event::AutoApproveError {
                request_id: request.id,
                error: e.to_string(),
            });
        }
    };
    let outcome = arbiter::submit_review(
        ctx,
        ReviewParams {
            request_id: request.id,
            reviewer: SessionAuth {
                session_id: reviewer.id,
                session_key: reviewer.session_key.clone(),
            },
            decision: ReviewDecision::Approve,
            reason: None,
            comments: Some("auto-approved: caution tier".to_string()),
        },
    );
    match outcome {
        Ok(outcome) => {
            tracing::info!(
                request = %request.id,
                approvals = outcome.approvals,
                "auto-approved caution-tier request"
            );
            None
        }
        Err(e) => Some(Event::AutoApproveError {
            request_id: request.id,
            error: e.to_string(),
        }),
    }
}

async fn send(events: &mpsc::Sender<Event>, event: Event) {
    if events.send(event).await.is_err() {
        tracing::debug!("watch consumer dropped");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use crate::broker::SubmitOutcome;
    use crate::broker::SubmitParams;
    use crate::broker::tests::agent_auth;
    use crate::broker::tests::test_ctx;

    use super::*;

    fn watch_params(auto: bool) -> WatchParams {
        WatchParams {
            scope: WatchScope::Project,
            auto_approve_caution: auto,
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn pending_and_terminal_events_are_emitted_exactly_once() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        let SubmitOutcome::Created { request_id, .. } = ctx
            .submit(&owner, SubmitParams::shell("rm -rf ./build"))
            .unwrap()
        else {
            panic!("expected a created request");
        };

        let (tx, mut rx) = mpsc::channel(32);
        let mut seen = HashMap::new();
        let params = watch_params(false);

        poll_once(&ctx, &params, &mut seen, &tx).await.unwrap();
        let first = drain(&mut rx).await;
        assert_eq!(first.len(), 1);
        let Event::RequestPending {
            request_id: id,
            risk_tier,
            requestor,
            ..
        } = &first[0]
        else {
            panic!("expected request_pending");
        };
        assert_eq!(*id, request_id);
        assert_eq!(*risk_tier, Some(RiskTier::Dangerous));
        assert_eq!(requestor.as_deref(), Some("a"));

        // a second tick with no change emits nothing
        poll_once(&ctx, &params, &mut seen, &tx).await.unwrap();
        assert!(drain(&mut rx).await.is_empty());

        // cancel → exactly one cancelled event, then silence
        ctx.cancel(&owner, request_id).unwrap();
        poll_once(&ctx, &params, &mut seen, &tx).await.unwrap();
        let events = drain(&mut rx).await;
        assert_eq!(
            events,
            vec![Event::RequestCancelled { request_id }]
        );
        poll_once(&ctx, &params, &mut seen, &tx).await.unwrap();
        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn observed_timeouts_surface_as_timeout_events() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        let SubmitOutcome::Created { request_id, .. } = ctx
            .submit(&owner, SubmitParams::shell("rm -rf ./build"))
            .unwrap()
        else {
            panic!("expected a created request");
        };

        let (tx, mut rx) = mpsc::channel(32);
        let mut seen = HashMap::new();
        let params = watch_params(false);
        poll_once(&ctx, &params, &mut seen, &tx).await.unwrap();
        assert_eq!(drain(&mut rx).await.len(), 1); // the pending event

        // another observer times the request out between ticks
        ctx.store.mark_timed_out(request_id, Utc::now()).unwrap();

        poll_once(&ctx, &params, &mut seen, &tx).await.unwrap();
        assert_eq!(
            drain(&mut rx).await,
            vec![Event::RequestTimeout { request_id }]
        );
        // and never again
        poll_once(&ctx, &params, &mut seen, &tx).await.unwrap();
        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn caution_requests_are_auto_approved() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        let SubmitOutcome::Created { request_id, .. } = ctx
            .submit(&owner, SubmitParams::shell("git push origin main"))
            .unwrap()
        else {
            panic!("expected a created request");
        };
        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert_eq!(request.risk_tier, RiskTier::Caution);

        let (tx, mut rx) = mpsc::channel(32);
        let mut seen = HashMap::new();
        poll_once(&ctx, &watch_params(true), &mut seen, &tx)
            .await
            .unwrap();
        // first tick: pending event + the approval happened
        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Approved);
        let reviews = ctx.store.list_reviews(request_id).unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].reviewer_agent, "auto-reviewer");

        // second tick notices the transition
        poll_once(&ctx, &watch_params(true), &mut seen, &tx)
            .await
            .unwrap();
        let events = drain(&mut rx).await;
        assert!(events.contains(&Event::RequestApproved { request_id }));
        // no auto_approve_error events
        assert!(events
            .iter()
            .all(|e| !matches!(e, Event::AutoApproveError { .. })));
    }

    #[tokio::test]
    async fn dangerous_requests_are_never_auto_approved() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        let SubmitOutcome::Created { request_id, .. } = ctx
            .submit(&owner, SubmitParams::shell("rm -rf ./build"))
            .unwrap()
        else {
            panic!("expected a created request");
        };

        let (tx, _rx) = mpsc::channel(32);
        let mut seen = HashMap::new();
        poll_once(&ctx, &watch_params(true), &mut seen, &tx)
            .await
            .unwrap();
        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert!(ctx.store.list_reviews(request_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_approve_errors_are_events_not_exits() {
        let (_dir, ctx) = test_ctx();
        let (_, owner) = agent_auth(&ctx, "a", "m1");
        let SubmitOutcome::Created { request_id, .. } = ctx
            .submit(&owner, SubmitParams::shell("git push origin main"))
            .unwrap()
        else {
            panic!("expected a created request");
        };

        // sabotage: retire the auto-reviewer record so lookup fails
        let record = ctx
            .paths
            .sessions_dir()
            .join(format!("{}.json", ctx.config.agents.auto_reviewer_name));
        std::fs::remove_file(record).unwrap();

        let (tx, mut rx) = mpsc::channel(32);
        let mut seen = HashMap::new();
        poll_once(&ctx, &watch_params(true), &mut seen, &tx)
            .await
            .unwrap();
        let events = drain(&mut rx).await;
        assert!(events.iter().any(|e| matches!(
            e,
            Event::AutoApproveError { request_id: id, .. } if *id == request_id
        )));
        // the watcher did not abort and the request is untouched
        let request = ctx.store.get_request(request_id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn push_watcher_forwards_bus_events() {
        let (_dir, ctx) = test_ctx();
        let (tx, mut rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();

        let ctx = std::sync::Arc::new(ctx);
        let bus = ctx.bus.clone();
        let handle = tokio::spawn({
            let ctx = std::sync::Arc::clone(&ctx);
            let cancel = cancel.clone();
            async move { run_push_watcher(&ctx, watch_params(false), tx, cancel).await }
        });

        // give the subscriber a beat to attach
        tokio::time::sleep(Duration::from_millis(20)).await;
        let request_id = Uuid::new_v4();
        bus.publish(Event::RequestApproved { request_id });
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, Event::RequestApproved { request_id });

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn poll_watcher_stops_at_tick_boundary_on_cancel() {
        let (_dir, ctx) = test_ctx();
        let ctx = std::sync::Arc::new(ctx);
        let (tx, _rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let handle = {
            let ctx = std::sync::Arc::clone(&ctx);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_poll_watcher(&ctx, watch_params(false), tx, cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
