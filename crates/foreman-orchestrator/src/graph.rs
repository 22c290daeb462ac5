use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Workflow step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Invoke a registered worker through the bounded dispatch path.
    AgentTask,
    /// Block on a human decision until approved, rejected, or timed out.
    Approval,
    /// Structural marker; completes immediately (ordering lives in the edges).
    Condition,
    /// Structural marker; completes immediately.
    Parallel,
    /// Structural marker; completes immediately.
    Sequential,
}

/// Definition of a single workflow step.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub id: String,
    pub kind: StepKind,
    pub name: String,
    pub description: String,
    /// Worker to invoke; required for `AgentTask` steps.
    pub worker_id: Option<String>,
    pub parameters: serde_json::Value,
    pub timeout: Option<Duration>,
}

impl StepSpec {
    /// An agent-task step executed by the named worker.
    pub fn agent(
        id: impl Into<String>,
        name: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::AgentTask,
            name: name.into(),
            description: String::new(),
            worker_id: Some(worker_id.into()),
            parameters: serde_json::Value::Null,
            timeout: None,
        }
    }

    /// A human-approval gate step.
    pub fn approval(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::Approval,
            name: name.into(),
            description: String::new(),
            worker_id: None,
            parameters: serde_json::Value::Null,
            timeout: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Immutable definition of a workflow: steps and their prerequisite edges.
///
/// The dependency relation must be acyclic; the engine fails a run with
/// `StuckWorkflow` if the graph cannot make progress.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    workflow_type: String,
    name: String,
    steps: HashMap<String, StepSpec>,
    step_order: Vec<String>,
    dependencies: HashMap<String, Vec<String>>,
}

impl WorkflowGraph {
    pub fn new(workflow_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            name: name.into(),
            steps: HashMap::new(),
            step_order: Vec::new(),
            dependencies: HashMap::new(),
        }
    }

    /// Add a step with its prerequisite step ids.
    pub fn step(mut self, spec: StepSpec, dependencies: &[&str]) -> Self {
        let id = spec.id.clone();
        self.step_order.push(id.clone());
        self.steps.insert(id.clone(), spec);
        if !dependencies.is_empty() {
            self.dependencies
                .insert(id, dependencies.iter().map(|d| d.to_string()).collect());
        }
        self
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.get(step_id)
    }

    pub fn dependencies_of(&self, step_id: &str) -> &[String] {
        self.dependencies
            .get(step_id)
            .map(|d| d.as_slice())
            .unwrap_or(&[])
    }

    /// Steps whose full dependency set is covered by `completed` and which
    /// have not themselves completed, in declaration order.
    ///
    /// One topological "layer" at a time; the engine calls this repeatedly
    /// as steps finish. A step depending on an id absent from the graph is
    /// never ready and surfaces as a stuck workflow at the engine.
    pub fn ready_steps(&self, completed: &HashSet<String>) -> Vec<&StepSpec> {
        self.step_order
            .iter()
            .filter(|id| !completed.contains(*id))
            .filter(|id| {
                self.dependencies_of(id)
                    .iter()
                    .all(|dep| completed.contains(dep))
            })
            .filter_map(|id| self.steps.get(id))
            .collect()
    }

    /// Whether every step of the graph is in `completed`.
    pub fn is_complete(&self, completed: &HashSet<String>) -> bool {
        self.step_order.iter().all(|id| completed.contains(id))
    }

    /// Step ids not yet completed, for stuck-workflow diagnostics.
    pub fn remaining(&self, completed: &HashSet<String>) -> Vec<&str> {
        self.step_order
            .iter()
            .filter(|id| !completed.contains(*id))
            .map(|id| id.as_str())
            .collect()
    }
}

/// Static table of named workflow definitions.
///
/// Registering new graphs is configuration, not part of the engine's
/// runtime contract. Two built-ins ship with the registry.
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<WorkflowGraph>>,
}

impl WorkflowRegistry {
    /// Empty registry, no built-ins.
    pub fn empty() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in advisory and transactional graphs.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(advisory_workflow());
        registry.register(transactional_workflow());
        registry
    }

    pub fn register(&mut self, graph: WorkflowGraph) {
        self.definitions
            .insert(graph.workflow_type().to_string(), Arc::new(graph));
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<WorkflowGraph>> {
        self.definitions.get(workflow_type).cloned()
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.definitions.contains_key(workflow_type)
    }

    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Built-in advisory workflow: data sync, analysis, then forecasting and
/// risk assessment in parallel, joined by executive reporting.
pub fn advisory_workflow() -> WorkflowGraph {
    WorkflowGraph::new("advisory", "CEO Advisory Workflow")
        .step(
            StepSpec::agent("data_sync", "Data Synchronization", "data_sync_agent")
                .with_description("Sync latest financial data from all sources")
                .with_timeout(Duration::from_secs(10 * 60)),
            &[],
        )
        .step(
            StepSpec::agent("financial_analysis", "Financial Analysis", "ai_cfo_agent")
                .with_description("Perform comprehensive financial analysis")
                .with_timeout(Duration::from_secs(15 * 60)),
            &["data_sync"],
        )
        .step(
            StepSpec::agent("forecasting", "Financial Forecasting", "forecasting_agent")
                .with_description("Generate financial forecasts and projections")
                .with_timeout(Duration::from_secs(20 * 60)),
            &["financial_analysis"],
        )
        .step(
            StepSpec::agent("risk_assessment", "Risk Assessment", "alert_agent")
                .with_description("Assess financial risks and opportunities")
                .with_timeout(Duration::from_secs(10 * 60)),
            &["financial_analysis"],
        )
        .step(
            StepSpec::agent("executive_reporting", "Executive Reporting", "reporting_agent")
                .with_description("Generate executive summary and recommendations")
                .with_timeout(Duration::from_secs(15 * 60)),
            &["forecasting", "risk_assessment"],
        )
}

/// Built-in transactional workflow: straight-line document processing with
/// a human approval gate before money moves.
pub fn transactional_workflow() -> WorkflowGraph {
    WorkflowGraph::new("transactional", "Transactional Automation Workflow")
        .step(
            StepSpec::agent("document_processing", "Document Processing", "ocr_agent")
                .with_description("OCR and document data extraction")
                .with_timeout(Duration::from_secs(5 * 60)),
            &[],
        )
        .step(
            StepSpec::agent("data_standardization", "Data Standardization", "data_sync_agent")
                .with_description("Standardize and validate extracted data")
                .with_timeout(Duration::from_secs(5 * 60)),
            &["document_processing"],
        )
        .step(
            StepSpec::agent("accounting_entries", "Accounting Entries", "accounting_agent")
                .with_description("Create automated accounting entries")
                .with_timeout(Duration::from_secs(10 * 60)),
            &["data_standardization"],
        )
        .step(
            StepSpec::approval("approval_check", "Transaction Approval")
                .with_description("Human approval for high-value transactions")
                .with_timeout(Duration::from_secs(60 * 60)),
            &["accounting_entries"],
        )
        .step(
            StepSpec::agent("payment_execution", "Payment Execution", "payment_agent")
                .with_description("Execute approved payments")
                .with_timeout(Duration::from_secs(10 * 60)),
            &["approval_check"],
        )
        .step(
            StepSpec::agent("reconciliation", "Bank Reconciliation", "reconciliation_agent")
                .with_description("Reconcile transactions with bank statements")
                .with_timeout(Duration::from_secs(15 * 60)),
            &["payment_execution"],
        )
        .step(
            StepSpec::agent("compliance_audit", "Compliance Audit", "compliance_agent")
                .with_description("Validate compliance and create audit trail")
                .with_timeout(Duration::from_secs(10 * 60)),
            &["reconciliation"],
        )
}
