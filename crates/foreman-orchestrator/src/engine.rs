use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use foreman_core::config::OrchestratorConfig;
use foreman_core::error::{ForemanError, Result};
use foreman_core::event::EventBus;
use foreman_core::types::{
    AgentContext, ApprovalRequest, ApprovalStatus, RouteResponse, StepRequest, WorkflowEvent,
    WorkflowId, WorkflowState, WorkflowStatus,
};

use crate::approval::ApprovalGate;
use crate::graph::{StepKind, StepSpec, WorkflowGraph};

/// The bounded worker-dispatch path the engine hands AgentTask steps to.
///
/// Implemented by the orchestrator so every step shares the global
/// concurrency throttle with direct dispatch.
pub trait StepDispatcher: Send + Sync {
    fn dispatch_step(
        &self,
        worker_id: &str,
        request: StepRequest,
        context: AgentContext,
    ) -> BoxFuture<'_, Result<foreman_core::types::ExecutorReply>>;
}

/// Drives a workflow graph to completion.
///
/// Each iteration computes the ready layer, dispatches every ready step
/// concurrently, joins on all of them, and folds results into the state.
/// The first step failure aborts the run; an empty ready set with steps
/// remaining is a stuck workflow, reported loudly rather than treated as
/// success.
pub struct WorkflowEngine {
    gate: Arc<ApprovalGate>,
    event_bus: Arc<EventBus>,
    default_approval_timeout: Duration,
    default_approvers: Vec<String>,
}

// Poisoning must not turn a status read or a terminal-state write into a
// panic; the guarded data is still coherent because writers never hold the
// lock across an await.
fn lock_state(state: &Mutex<WorkflowState>) -> std::sync::MutexGuard<'_, WorkflowState> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl WorkflowEngine {
    pub fn new(gate: Arc<ApprovalGate>, event_bus: Arc<EventBus>, config: &OrchestratorConfig) -> Self {
        Self {
            gate,
            event_bus,
            default_approval_timeout: Duration::from_secs(config.default_approval_timeout_secs),
            default_approvers: config.default_approvers.clone(),
        }
    }

    /// Run the workflow to a terminal state.
    ///
    /// `state` lives behind a mutex so callers can observe progress and the
    /// orchestrator can snapshot status mid-run; the engine is its only
    /// writer.
    pub async fn run(
        &self,
        graph: &WorkflowGraph,
        state: &Mutex<WorkflowState>,
        dispatcher: &dyn StepDispatcher,
        cancel: &CancellationToken,
    ) -> RouteResponse {
        let (workflow_id, workflow_type, data_seed) = {
            let mut state = lock_state(state);
            state.set_status(WorkflowStatus::Running);
            (
                state.workflow_id.clone(),
                state.workflow_type.clone(),
                state.completed_steps.clone(),
            )
        };

        self.event_bus.publish(WorkflowEvent::WorkflowStarted {
            workflow_id: workflow_id.clone(),
            workflow_type: workflow_type.clone(),
            timestamp: Utc::now(),
        });
        info!(workflow_id = %workflow_id, workflow_type = %workflow_type, "Workflow started");

        let mut completed: HashSet<String> = data_seed.into_iter().collect();

        loop {
            if cancel.is_cancelled() {
                warn!(workflow_id = %workflow_id, "Workflow cancelled");
                return self.fail(state, None, ForemanError::Cancelled.to_string());
            }

            let ready = graph.ready_steps(&completed);

            if ready.is_empty() {
                if graph.is_complete(&completed) {
                    break;
                }
                let remaining = graph.remaining(&completed);
                let err = ForemanError::StuckWorkflow {
                    remaining: remaining.len(),
                    total: graph.len(),
                };
                error!(
                    workflow_id = %workflow_id,
                    remaining = ?remaining,
                    "Workflow stuck: no ready steps with steps remaining"
                );
                return self.fail(state, None, err.to_string());
            }

            let (workflow_data, context) = {
                let state = lock_state(state);
                (state.data.clone(), state.context.clone())
            };

            let layer = ready.into_iter().map(|step| {
                let workflow_id = workflow_id.clone();
                let workflow_data = workflow_data.clone();
                let context = context.clone();
                async move {
                    self.event_bus.publish(WorkflowEvent::StepStarted {
                        workflow_id: workflow_id.clone(),
                        step_id: step.id.clone(),
                    });
                    let result = self
                        .run_step(step, &workflow_id, workflow_data, context, dispatcher, cancel)
                        .await;
                    (step.id.clone(), result)
                }
            });

            let results = join_all(layer).await;

            let mut first_failure: Option<(String, ForemanError)> = None;
            for (step_id, result) in results {
                match result {
                    Ok(()) => {
                        completed.insert(step_id.clone());
                        lock_state(state).complete_step(&step_id);
                        self.event_bus.publish(WorkflowEvent::StepCompleted {
                            workflow_id: workflow_id.clone(),
                            step_id: step_id.clone(),
                        });
                        info!(workflow_id = %workflow_id, step_id = %step_id, "Step completed");
                    }
                    Err(e) => {
                        if first_failure.is_none() {
                            first_failure = Some((step_id, e));
                        }
                    }
                }
            }

            // Fail fast: abort on the first failed step, no retry, no
            // rollback of already-completed steps.
            if let Some((step_id, err)) = first_failure {
                error!(workflow_id = %workflow_id, step_id = %step_id, error = %err, "Step failed");
                return self.fail(state, Some(step_id), err.to_string());
            }
        }

        let response = {
            let mut state = lock_state(state);
            state.set_status(WorkflowStatus::Completed);
            let elapsed_ms = (Utc::now() - state.created_at).num_milliseconds().max(0);
            let mut response = RouteResponse::ok(format!(
                "Workflow '{}' completed",
                state.workflow_type
            ));
            response.workflow_id = Some(state.workflow_id.clone());
            response.workflow_type = Some(state.workflow_type.clone());
            response.completed_steps = state.completed_steps.clone();
            response
                .metadata
                .insert("execution_time_ms".into(), serde_json::json!(elapsed_ms));
            response
        };

        self.event_bus.publish(WorkflowEvent::WorkflowCompleted {
            workflow_id: workflow_id.clone(),
            completed_steps: response.completed_steps.clone(),
        });
        info!(workflow_id = %workflow_id, "Workflow completed");

        response
    }

    async fn run_step(
        &self,
        step: &StepSpec,
        workflow_id: &WorkflowId,
        workflow_data: serde_json::Value,
        context: AgentContext,
        dispatcher: &dyn StepDispatcher,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match step.kind {
            StepKind::AgentTask => {
                let worker_id = step.worker_id.as_deref().ok_or_else(|| {
                    ForemanError::StepFailed {
                        step: step.id.clone(),
                        message: "agent task step has no worker id".into(),
                    }
                })?;

                let request = StepRequest {
                    step_id: step.id.clone(),
                    step_name: step.name.clone(),
                    description: step.description.clone(),
                    parameters: step.parameters.clone(),
                    workflow_data,
                };

                let call = dispatcher.dispatch_step(worker_id, request, context);
                let reply = match step.timeout {
                    Some(timeout) => tokio::time::timeout(timeout, call).await.map_err(|_| {
                        ForemanError::StepFailed {
                            step: step.id.clone(),
                            message: format!("step timed out after {}s", timeout.as_secs()),
                        }
                    })?,
                    None => call.await,
                };

                match reply {
                    Ok(reply) if reply.success => Ok(()),
                    Ok(reply) => Err(ForemanError::StepFailed {
                        step: step.id.clone(),
                        message: reply
                            .response
                            .unwrap_or_else(|| "worker reported failure".into()),
                    }),
                    Err(e) => Err(ForemanError::StepFailed {
                        step: step.id.clone(),
                        message: e.to_string(),
                    }),
                }
            }
            StepKind::Approval => {
                let timeout = step.timeout.unwrap_or(self.default_approval_timeout);
                let approvers = approvers_for(step, &self.default_approvers);
                let request = ApprovalRequest {
                    id: Uuid::new_v4().to_string(),
                    workflow_id: workflow_id.clone(),
                    step_id: step.id.clone(),
                    description: step.description.clone(),
                    data: step.parameters.clone(),
                    required_approvers: approvers,
                    approvals: Vec::new(),
                    status: ApprovalStatus::Pending,
                    created_at: Utc::now(),
                    expires_at: Utc::now()
                        + chrono::Duration::from_std(timeout)
                            .unwrap_or_else(|_| chrono::Duration::hours(1)),
                };
                let request_id = request.id.clone();

                self.gate.open(request).await;
                self.gate.wait(&request_id, cancel).await
            }
            // Structural kinds: ordering and fan-out live in the dependency
            // edges, so these complete immediately.
            StepKind::Condition | StepKind::Parallel | StepKind::Sequential => Ok(()),
        }
    }

    fn fail(
        &self,
        state: &Mutex<WorkflowState>,
        failed_step: Option<String>,
        error: String,
    ) -> RouteResponse {
        let mut state = lock_state(state);
        state.set_error(error.clone());

        self.event_bus.publish(WorkflowEvent::WorkflowFailed {
            workflow_id: state.workflow_id.clone(),
            failed_step: failed_step.clone(),
            error: error.clone(),
        });

        let mut response = RouteResponse::failure(error);
        response.workflow_id = Some(state.workflow_id.clone());
        response.workflow_type = Some(state.workflow_type.clone());
        response.completed_steps = state.completed_steps.clone();
        response.failed_step = failed_step;
        let elapsed_ms = (Utc::now() - state.created_at).num_milliseconds().max(0);
        response
            .metadata
            .insert("execution_time_ms".into(), serde_json::json!(elapsed_ms));
        response
    }
}

/// Step parameters may name their own approvers: `{"approvers": ["a", "b"]}`.
fn approvers_for(step: &StepSpec, defaults: &[String]) -> Vec<String> {
    step.parameters
        .get("approvers")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_else(|| defaults.to_vec())
}
