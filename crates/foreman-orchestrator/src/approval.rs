use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use foreman_core::error::{ForemanError, Result};
use foreman_core::event::EventBus;
use foreman_core::types::{ApprovalRequest, ApprovalStatus, ApprovalVote, WorkflowEvent};

struct PendingApproval {
    request: ApprovalRequest,
    notify: Arc<Notify>,
}

/// Timeout-bound wait primitive over approval records.
///
/// Each request carries its own waker; `record_decision` wakes the waiting
/// step instead of the step polling on an interval. A request resolves to
/// Approved once every required approver has voted yes, to Rejected on the
/// first no vote, or to Expired at its deadline.
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, PendingApproval>>,
    event_bus: Arc<EventBus>,
}

impl ApprovalGate {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Register a pending request and publish it for approvers.
    ///
    /// The request is inserted before the event goes out, so a subscriber
    /// reacting to `ApprovalRequested` always finds it in the pending map.
    pub async fn open(&self, request: ApprovalRequest) {
        let id = request.id.clone();

        self.pending.lock().await.insert(
            id.clone(),
            PendingApproval {
                request: request.clone(),
                notify: Arc::new(Notify::new()),
            },
        );

        info!(
            request_id = %id,
            workflow_id = %request.workflow_id,
            step_id = %request.step_id,
            approvers = ?request.required_approvers,
            "Approval requested"
        );

        self.event_bus
            .publish(WorkflowEvent::ApprovalRequested { request });
    }

    /// Record one approver's decision and wake the waiting step.
    /// Returns false if the request id is unknown or already resolved.
    pub async fn record_decision(
        &self,
        request_id: &str,
        approver_id: &str,
        approved: bool,
        comment: Option<String>,
    ) -> bool {
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.get_mut(request_id) else {
            warn!(request_id, "Decision for unknown approval request");
            return false;
        };
        if entry.request.status != ApprovalStatus::Pending {
            return false;
        }

        entry.request.approvals.push(ApprovalVote {
            approver_id: approver_id.to_string(),
            approved,
            comment,
            timestamp: Utc::now(),
        });

        // First rejection wins; otherwise resolve once all approvers voted yes.
        if !approved {
            entry.request.status = ApprovalStatus::Rejected;
        } else if entry.request.is_approved() {
            entry.request.status = ApprovalStatus::Approved;
        }

        if entry.request.status != ApprovalStatus::Pending {
            self.event_bus.publish(WorkflowEvent::ApprovalResolved {
                request_id: request_id.to_string(),
                workflow_id: entry.request.workflow_id.clone(),
                status: entry.request.status,
            });
            info!(
                request_id,
                approver_id,
                status = ?entry.request.status,
                "Approval resolved"
            );
        } else {
            debug!(request_id, approver_id, "Approval vote recorded");
        }

        entry.notify.notify_one();
        true
    }

    /// Wait for the request to resolve.
    ///
    /// Returns Ok on approval; maps rejection and expiry to their error
    /// variants. Workflow cancellation interrupts the wait immediately.
    pub async fn wait(&self, request_id: &str, cancel: &CancellationToken) -> Result<()> {
        loop {
            let (notify, deadline) = {
                let mut pending = self.pending.lock().await;
                let Some(entry) = pending.get_mut(request_id) else {
                    return Err(ForemanError::ApprovalNotFound(request_id.to_string()));
                };

                match entry.request.status {
                    ApprovalStatus::Approved => {
                        pending.remove(request_id);
                        return Ok(());
                    }
                    ApprovalStatus::Rejected => {
                        let entry = pending.remove(request_id).map(|p| p.request);
                        return Err(rejection_error(entry.as_ref(), request_id));
                    }
                    ApprovalStatus::Expired => {
                        let step = entry.request.step_id.clone();
                        pending.remove(request_id);
                        return Err(ForemanError::ApprovalTimeout { step });
                    }
                    ApprovalStatus::Pending => {
                        if entry.request.is_expired(Utc::now()) {
                            entry.request.status = ApprovalStatus::Expired;
                            self.event_bus.publish(WorkflowEvent::ApprovalResolved {
                                request_id: request_id.to_string(),
                                workflow_id: entry.request.workflow_id.clone(),
                                status: ApprovalStatus::Expired,
                            });
                            let step = entry.request.step_id.clone();
                            pending.remove(request_id);
                            warn!(request_id, step = %step, "Approval expired");
                            return Err(ForemanError::ApprovalTimeout { step });
                        }
                        let remaining = (entry.request.expires_at - Utc::now())
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        (entry.notify.clone(), remaining)
                    }
                }
            };

            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(deadline) => {}
                _ = cancel.cancelled() => {
                    self.pending.lock().await.remove(request_id);
                    return Err(ForemanError::Cancelled);
                }
            }
        }
    }

    /// All requests still awaiting a decision.
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        self.pending
            .lock()
            .await
            .values()
            .filter(|p| p.request.status == ApprovalStatus::Pending)
            .map(|p| p.request.clone())
            .collect()
    }

    /// Snapshot of one request by id.
    pub async fn get(&self, request_id: &str) -> Option<ApprovalRequest> {
        self.pending
            .lock()
            .await
            .get(request_id)
            .map(|p| p.request.clone())
    }
}

fn rejection_error(request: Option<&ApprovalRequest>, request_id: &str) -> ForemanError {
    match request {
        Some(req) => ForemanError::ApprovalRejected {
            step: req.step_id.clone(),
            approver: req
                .first_rejection()
                .map(|v| v.approver_id.clone())
                .unwrap_or_else(|| "unknown".to_string()),
        },
        None => ForemanError::ApprovalNotFound(request_id.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use foreman_core::types::WorkflowId;

    fn request(id: &str, approvers: &[&str], ttl_ms: i64) -> ApprovalRequest {
        ApprovalRequest {
            id: id.to_string(),
            workflow_id: WorkflowId::new(),
            step_id: "approval_check".into(),
            description: "test approval".into(),
            data: serde_json::Value::Null,
            required_approvers: approvers.iter().map(|s| s.to_string()).collect(),
            approvals: Vec::new(),
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            expires_at: Utc::now() + ChronoDuration::milliseconds(ttl_ms),
        }
    }

    fn gate() -> Arc<ApprovalGate> {
        Arc::new(ApprovalGate::new(Arc::new(EventBus::default())))
    }

    #[tokio::test]
    async fn approve_resolves_waiter() {
        let gate = gate();
        gate.open(request("req-1", &["alice"], 60_000)).await;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait("req-1", &CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(gate.record_decision("req-1", "alice", true, None).await);

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn partial_approval_keeps_waiting() {
        let gate = gate();
        gate.open(request("req-2", &["alice", "bob"], 60_000)).await;

        gate.record_decision("req-2", "alice", true, None).await;
        let snapshot = gate.get("req-2").await.unwrap();
        assert_eq!(snapshot.status, ApprovalStatus::Pending);

        gate.record_decision("req-2", "bob", true, None).await;
        let cancel = CancellationToken::new();
        gate.wait("req-2", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn first_rejection_wins() {
        let gate = gate();
        gate.open(request("req-3", &["alice", "bob"], 60_000)).await;

        gate.record_decision("req-3", "alice", true, None).await;
        gate.record_decision("req-3", "bob", false, Some("too risky".into()))
            .await;

        let err = gate
            .wait("req-3", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ForemanError::ApprovalRejected { approver, .. } => assert_eq!(approver, "bob"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expires_at_deadline() {
        let gate = gate();
        gate.open(request("req-4", &["alice"], 100)).await;

        let start = std::time::Instant::now();
        let err = gate
            .wait("req-4", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::ApprovalTimeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(90));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let gate = gate();
        gate.open(request("req-5", &["alice"], 60_000)).await;

        let cancel = CancellationToken::new();
        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait("req-5", &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ForemanError::Cancelled));
    }

    #[tokio::test]
    async fn decision_for_unknown_request() {
        let gate = gate();
        assert!(!gate.record_decision("ghost", "alice", true, None).await);
    }

    #[tokio::test]
    async fn decision_before_wait_resolves_immediately() {
        let gate = gate();
        gate.open(request("req-6", &["alice"], 60_000)).await;
        gate.record_decision("req-6", "alice", true, None).await;

        // No waiter was registered when the decision landed.
        gate.wait("req-6", &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn decision_from_event_subscriber_is_never_dropped() {
        let event_bus = Arc::new(EventBus::default());
        let gate = Arc::new(ApprovalGate::new(event_bus.clone()));
        let mut rx = event_bus.subscribe();

        // Approve the moment the request event lands; the request must
        // already be registered by then.
        let decider = tokio::spawn({
            let gate = gate.clone();
            async move {
                loop {
                    if let WorkflowEvent::ApprovalRequested { request } =
                        rx.recv().await.unwrap()
                    {
                        return gate.record_decision(&request.id, "alice", true, None).await;
                    }
                }
            }
        });

        gate.open(request("req-7", &["alice"], 60_000)).await;

        assert!(decider.await.unwrap());
        gate.wait("req-7", &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn pending_requests_listed() {
        let gate = gate();
        gate.open(request("req-a", &["alice"], 60_000)).await;
        gate.open(request("req-b", &["alice"], 60_000)).await;
        gate.record_decision("req-b", "alice", false, None).await;

        let pending = gate.pending_requests().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "req-a");
    }
}
