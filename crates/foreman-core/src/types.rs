use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique workflow instance identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session identity and mutable state handed to every worker invocation.
///
/// Contexts are owned by the `ContextStore`; callers get cloned snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    pub session_id: SessionId,
    pub worker_id: String,
    pub user_id: String,
    pub company_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub state: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AgentContext {
    pub fn new(
        worker_id: impl Into<String>,
        user_id: impl Into<String>,
        company_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: SessionId::new(),
            worker_id: worker_id.into(),
            user_id: user_id.into(),
            company_id: company_id.into(),
            permissions: Vec::new(),
            state: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Anonymous context used when a request carries no session reference.
    pub fn system(worker_id: impl Into<String>) -> Self {
        Self::new(worker_id, "system", "default")
    }
}

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Mutable state of one running workflow instance.
///
/// Created by the orchestrator at dispatch time and mutated only by the
/// engine executing it. Removed from the active table on terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub completed_steps: Vec<String>,
    pub data: serde_json::Value,
    pub context: AgentContext,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(workflow_type: impl Into<String>, data: serde_json::Value, context: AgentContext) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: WorkflowId::new(),
            workflow_type: workflow_type.into(),
            status: WorkflowStatus::Idle,
            completed_steps: Vec::new(),
            data,
            context,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark a step as completed. Idempotent.
    pub fn complete_step(&mut self, step_id: &str) {
        if !self.completed_steps.iter().any(|s| s == step_id) {
            self.completed_steps.push(step_id.to_string());
        }
        self.updated_at = Utc::now();
    }

    pub fn set_status(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.status = WorkflowStatus::Failed;
        self.updated_at = Utc::now();
    }
}

/// Approval request lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// A single approver's decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalVote {
    pub approver_id: String,
    pub approved: bool,
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Human-in-the-loop approval request bound to one workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub workflow_id: WorkflowId,
    pub step_id: String,
    pub description: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub required_approvers: Vec<String>,
    #[serde(default)]
    pub approvals: Vec<ApprovalVote>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Fully approved: every required approver has an approving vote.
    /// An empty required set counts as approved.
    pub fn is_approved(&self) -> bool {
        self.required_approvers.iter().all(|required| {
            self.approvals
                .iter()
                .any(|v| v.approved && v.approver_id == *required)
        })
    }

    /// First rejection wins: any negative vote rejects the request.
    pub fn first_rejection(&self) -> Option<&ApprovalVote> {
        self.approvals.iter().find(|v| !v.approved)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Inbound work request: a message plus optional routing hints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkRequest {
    pub content: String,
    #[serde(default)]
    pub preferred_worker: Option<String>,
    #[serde(default)]
    pub workflow_type: Option<String>,
    #[serde(default)]
    pub session_context: Option<SessionId>,
}

impl WorkRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.preferred_worker = Some(worker_id.into());
        self
    }

    pub fn with_workflow(mut self, workflow_type: impl Into<String>) -> Self {
        self.workflow_type = Some(workflow_type.into());
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_context = Some(session_id);
        self
    }
}

/// Outbound result for both direct dispatch and workflow runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    pub success: bool,
    pub response: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    pub error: Option<String>,
    pub workflow_id: Option<WorkflowId>,
    pub workflow_type: Option<String>,
    pub failed_step: Option<String>,
}

impl RouteResponse {
    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: Some(response.into()),
            metadata: HashMap::new(),
            completed_steps: Vec::new(),
            error: None,
            workflow_id: None,
            workflow_type: None,
            failed_step: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            response: None,
            metadata: HashMap::new(),
            completed_steps: Vec::new(),
            error: Some(error.into()),
            workflow_id: None,
            workflow_type: None,
            failed_step: None,
        }
    }
}

/// Request payload handed to an executor for one AgentTask step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub step_id: String,
    pub step_name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub workflow_data: serde_json::Value,
}

impl StepRequest {
    /// Request for a direct (non-workflow) dispatch.
    pub fn direct(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            step_id: "direct".to_string(),
            step_name: "direct".to_string(),
            description: content.clone(),
            parameters: serde_json::Value::Null,
            workflow_data: serde_json::json!({ "request": content }),
        }
    }
}

/// What an executor returns. An explicit `success == false` and an `Err`
/// from the executor are treated identically by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorReply {
    pub success: bool,
    pub response: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutorReply {
    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: Some(response.into()),
            metadata: HashMap::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            response: Some(error.into()),
            metadata: HashMap::new(),
        }
    }
}

/// Events published on the bus during orchestration.
///
/// The streaming entry point replays exactly this sequence per workflow:
/// `WorkflowStarted → {StepStarted, StepCompleted}* → WorkflowCompleted |
/// WorkflowFailed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_id: WorkflowId,
        workflow_type: String,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        workflow_id: WorkflowId,
        step_id: String,
    },
    StepCompleted {
        workflow_id: WorkflowId,
        step_id: String,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
        completed_steps: Vec<String>,
    },
    WorkflowFailed {
        workflow_id: WorkflowId,
        failed_step: Option<String>,
        error: String,
    },
    ApprovalRequested {
        request: ApprovalRequest,
    },
    ApprovalResolved {
        request_id: String,
        workflow_id: WorkflowId,
        status: ApprovalStatus,
    },
    ContextExpired {
        session_id: SessionId,
    },
}

impl WorkflowEvent {
    /// The workflow this event belongs to, if any.
    pub fn workflow_id(&self) -> Option<&WorkflowId> {
        match self {
            Self::WorkflowStarted { workflow_id, .. }
            | Self::StepStarted { workflow_id, .. }
            | Self::StepCompleted { workflow_id, .. }
            | Self::WorkflowCompleted { workflow_id, .. }
            | Self::WorkflowFailed { workflow_id, .. }
            | Self::ApprovalResolved { workflow_id, .. } => Some(workflow_id),
            Self::ApprovalRequested { request } => Some(&request.workflow_id),
            Self::ContextExpired { .. } => None,
        }
    }

    /// Whether this event terminates its workflow's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. } | Self::WorkflowFailed { .. }
        )
    }
}
