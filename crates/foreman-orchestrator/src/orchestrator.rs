use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::Stream;
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foreman_core::config::OrchestratorConfig;
use foreman_core::error::{ForemanError, Result};
use foreman_core::event::EventBus;
use foreman_core::traits::AgentExecutor;
use foreman_core::types::{
    AgentContext, ExecutorReply, RouteResponse, StepRequest, WorkRequest, WorkflowEvent,
    WorkflowId, WorkflowState,
};

use crate::approval::ApprovalGate;
use crate::context::ContextStore;
use crate::engine::{StepDispatcher, WorkflowEngine};
use crate::graph::WorkflowRegistry;
use crate::router::{Route, Router};

struct ActiveWorkflow {
    state: Arc<StdMutex<WorkflowState>>,
    cancel: CancellationToken,
}

/// Snapshot of the orchestrator's moving parts.
#[derive(Debug, Clone)]
pub struct OrchestratorStatus {
    pub registered_workers: Vec<String>,
    pub active_workflows: usize,
    pub available_permits: usize,
    pub max_concurrent_dispatches: usize,
    pub workflow_types: Vec<String>,
}

/// Composition root: worker registry, workflow table, global dispatch
/// throttle, and the wiring between router, engine, and context store.
///
/// Every worker invocation, direct dispatch and workflow-internal
/// AgentTask steps alike, funnels through the one semaphore, so the
/// concurrency cap is global rather than per-call-path.
pub struct Orchestrator {
    config: OrchestratorConfig,
    workers: RwLock<HashMap<String, Arc<dyn AgentExecutor>>>,
    registry: WorkflowRegistry,
    router: Router,
    contexts: Arc<ContextStore>,
    gate: Arc<ApprovalGate>,
    engine: WorkflowEngine,
    event_bus: Arc<EventBus>,
    active_workflows: Mutex<HashMap<WorkflowId, ActiveWorkflow>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Arc<Self> {
        Self::with_parts(config, Router::financial_defaults(), WorkflowRegistry::with_builtins())
    }

    pub fn with_parts(
        config: OrchestratorConfig,
        router: Router,
        registry: WorkflowRegistry,
    ) -> Arc<Self> {
        let event_bus = Arc::new(EventBus::new(config.event_capacity));
        let gate = Arc::new(ApprovalGate::new(event_bus.clone()));
        let contexts = Arc::new(ContextStore::new(event_bus.clone()));
        let engine = WorkflowEngine::new(gate.clone(), event_bus.clone(), &config);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_dispatches));

        info!(
            max_concurrent_dispatches = config.max_concurrent_dispatches,
            "Orchestrator initialized"
        );

        Arc::new(Self {
            config,
            workers: RwLock::new(HashMap::new()),
            registry,
            router,
            contexts,
            gate,
            engine,
            event_bus,
            active_workflows: Mutex::new(HashMap::new()),
            permits,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn contexts(&self) -> &Arc<ContextStore> {
        &self.contexts
    }

    pub fn approval_gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    /// Register a worker executor under an id. Overwrites with a warning.
    pub async fn register_worker(&self, worker_id: impl Into<String>, executor: Arc<dyn AgentExecutor>) {
        let worker_id = worker_id.into();
        let mut workers = self.workers.write().await;
        if workers.contains_key(&worker_id) {
            warn!(worker_id = %worker_id, "Worker already registered, overwriting");
        }
        workers.insert(worker_id.clone(), executor);
        info!(worker_id = %worker_id, "Worker registered");
    }

    pub async fn unregister_worker(&self, worker_id: &str) -> bool {
        let removed = self.workers.write().await.remove(worker_id).is_some();
        if removed {
            info!(worker_id, "Worker unregistered");
        }
        removed
    }

    /// Spawn the periodic context-expiry sweep.
    pub fn start(self: &Arc<Self>) {
        let store = self.contexts.clone();
        let interval = Duration::from_secs(self.config.cleanup_interval_secs);
        let ttl = Duration::from_secs(self.config.context_ttl_secs);
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            store.run_cleanup(interval, ttl, cancel).await;
        });
        info!("Orchestrator started");
    }

    /// Cancel all active workflows and background tasks.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let mut active = self.active_workflows.lock().await;
        for workflow in active.values() {
            workflow.cancel.cancel();
        }
        active.clear();
        info!("Orchestrator stopped");
    }

    /// Route a request to a worker or workflow per the router's precedence.
    ///
    /// Never panics across this boundary: every failure comes back as a
    /// well-formed `RouteResponse { success: false, error }`.
    pub async fn route(&self, request: WorkRequest) -> RouteResponse {
        let context = self.resolve_context(&request).await;

        let workers: HashSet<String> = self.workers.read().await.keys().cloned().collect();
        let route = self.router.resolve(
            &request,
            |id| workers.contains(id),
            |t| self.registry.contains(t),
        );

        match route {
            Ok(Route::Worker(worker_id)) => self.run_direct(&worker_id, &request, context).await,
            Ok(Route::Workflow(workflow_type)) => {
                self.run_workflow(&workflow_type, &request, Some(&context)).await
            }
            Err(e) => {
                warn!(error = %e, "Request routing failed");
                RouteResponse::failure(e.to_string())
            }
        }
    }

    async fn resolve_context(&self, request: &WorkRequest) -> AgentContext {
        if let Some(session_id) = &request.session_context {
            if let Some(context) = self.contexts.get(session_id).await {
                return context;
            }
            warn!(session_id = %session_id, "Unknown session reference, creating fresh context");
        }
        self.contexts
            .create("orchestrator", "system", "default", Vec::new(), HashMap::new())
            .await
    }

    async fn run_direct(
        &self,
        worker_id: &str,
        request: &WorkRequest,
        context: AgentContext,
    ) -> RouteResponse {
        info!(worker_id, "Dispatching request to worker");
        match self
            .dispatch_direct(worker_id, StepRequest::direct(&request.content), context)
            .await
        {
            Ok(reply) => {
                let mut response = RouteResponse {
                    success: reply.success,
                    response: reply.response.clone(),
                    metadata: reply.metadata,
                    completed_steps: Vec::new(),
                    error: None,
                    workflow_id: None,
                    workflow_type: None,
                    failed_step: None,
                };
                if !reply.success {
                    response.error =
                        Some(reply.response.unwrap_or_else(|| "worker reported failure".into()));
                }
                response
            }
            Err(e) => {
                warn!(worker_id, error = %e, "Worker dispatch failed");
                RouteResponse::failure(e.to_string())
            }
        }
    }

    /// Direct dispatch: rejects immediately when the global cap is reached.
    ///
    /// The permit is held for the whole executor call and released on every
    /// exit path, success or error.
    pub async fn dispatch_direct(
        &self,
        worker_id: &str,
        request: StepRequest,
        context: AgentContext,
    ) -> Result<ExecutorReply> {
        let executor = self
            .workers
            .read()
            .await
            .get(worker_id)
            .cloned()
            .ok_or_else(|| ForemanError::WorkerNotFound(worker_id.to_string()))?;

        let _permit = self.permits.clone().try_acquire_owned().map_err(|_| {
            ForemanError::CapacityExceeded {
                limit: self.config.max_concurrent_dispatches,
            }
        })?;

        executor.execute(worker_id, request, context).await
    }

    /// Run a named workflow to completion.
    pub async fn run_workflow(
        &self,
        workflow_type: &str,
        request: &WorkRequest,
        base_context: Option<&AgentContext>,
    ) -> RouteResponse {
        let Some(graph) = self.registry.get(workflow_type) else {
            return RouteResponse::failure(
                ForemanError::WorkflowNotFound(workflow_type.to_string()).to_string(),
            );
        };

        let (workflow_id, state, cancel) =
            self.admit_workflow(workflow_type, request, base_context).await;
        let response = self.engine.run(&graph, &state, self, &cancel).await;
        self.active_workflows.lock().await.remove(&workflow_id);
        response
    }

    /// Start a workflow and return its event stream.
    ///
    /// The stream replays `workflow_started → {step_started,
    /// step_completed}* → workflow_completed | workflow_failed` for this
    /// workflow only and ends at the terminal event. Cancellation behaves
    /// exactly as for the blocking entry point.
    pub async fn stream_workflow(
        self: &Arc<Self>,
        workflow_type: &str,
        request: WorkRequest,
        base_context: Option<AgentContext>,
    ) -> Result<impl Stream<Item = WorkflowEvent>> {
        let Some(graph) = self.registry.get(workflow_type) else {
            return Err(ForemanError::WorkflowNotFound(workflow_type.to_string()));
        };

        let (workflow_id, state, cancel) = self
            .admit_workflow(workflow_type, &request, base_context.as_ref())
            .await;

        // Subscribe before the run starts so workflow_started is never missed.
        let rx = self.event_bus.subscribe();

        let this = self.clone();
        let spawn_id = workflow_id.clone();
        tokio::spawn(async move {
            let _ = this.engine.run(&graph, &state, this.as_ref(), &cancel).await;
            this.active_workflows.lock().await.remove(&spawn_id);
        });

        Ok(futures::stream::unfold(
            (rx, workflow_id, false),
            |(mut rx, workflow_id, done)| async move {
                if done {
                    return None;
                }
                loop {
                    match rx.recv().await {
                        Ok(event) if event.workflow_id() == Some(&workflow_id) => {
                            let terminal = event.is_terminal();
                            return Some((event, (rx, workflow_id, terminal)));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        ))
    }

    async fn admit_workflow(
        &self,
        workflow_type: &str,
        request: &WorkRequest,
        base_context: Option<&AgentContext>,
    ) -> (WorkflowId, Arc<StdMutex<WorkflowState>>, CancellationToken) {
        let mut state = WorkflowState::new(
            workflow_type,
            serde_json::json!({ "request": request.content }),
            base_context
                .cloned()
                .unwrap_or_else(|| AgentContext::system("workflow_orchestrator")),
        );
        state.context = self.contexts.derive_workflow_context(&state, base_context).await;

        let workflow_id = state.workflow_id.clone();
        // Child of the shutdown token: stop() cancels every run.
        let cancel = self.shutdown.child_token();
        let state = Arc::new(StdMutex::new(state));

        self.active_workflows.lock().await.insert(
            workflow_id.clone(),
            ActiveWorkflow {
                state: state.clone(),
                cancel: cancel.clone(),
            },
        );

        (workflow_id, state, cancel)
    }

    /// Cancel a running workflow. No new step layer starts afterwards and
    /// any in-flight approval wait resolves immediately.
    pub async fn cancel_workflow(&self, workflow_id: &WorkflowId) -> bool {
        let active = self.active_workflows.lock().await;
        match active.get(workflow_id) {
            Some(workflow) => {
                workflow.cancel.cancel();
                info!(workflow_id = %workflow_id, "Workflow cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Snapshot of one active workflow's state, if still running.
    pub async fn workflow_status(&self, workflow_id: &WorkflowId) -> Option<WorkflowState> {
        let active = self.active_workflows.lock().await;
        active.get(workflow_id).map(|w| {
            w.state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        })
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let mut registered_workers: Vec<String> =
            self.workers.read().await.keys().cloned().collect();
        registered_workers.sort();
        OrchestratorStatus {
            registered_workers,
            active_workflows: self.active_workflows.lock().await.len(),
            available_permits: self.permits.available_permits(),
            max_concurrent_dispatches: self.config.max_concurrent_dispatches,
            workflow_types: self.registry.list_types(),
        }
    }
}

impl StepDispatcher for Orchestrator {
    /// Workflow-internal dispatch: shares the global semaphore with
    /// `dispatch_direct` but waits for a permit instead of rejecting, so a
    /// momentarily saturated throttle delays a step rather than failing
    /// the workflow.
    fn dispatch_step(
        &self,
        worker_id: &str,
        request: StepRequest,
        context: AgentContext,
    ) -> BoxFuture<'_, Result<ExecutorReply>> {
        let worker_id = worker_id.to_string();
        Box::pin(async move {
            let executor = self
                .workers
                .read()
                .await
                .get(&worker_id)
                .cloned()
                .ok_or_else(|| ForemanError::WorkerNotFound(worker_id.clone()))?;

            let _permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ForemanError::Cancelled)?;

            executor.execute(&worker_id, request, context).await
        })
    }
}
