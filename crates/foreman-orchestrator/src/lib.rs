//! Agent orchestration: request routing, DAG workflow execution with
//! human approval gates, bounded worker dispatch, and per-session
//! context management.

pub mod approval;
pub mod context;
pub mod engine;
pub mod graph;
pub mod orchestrator;
pub mod router;

pub use approval::ApprovalGate;
pub use context::{ContextStats, ContextStore};
pub use engine::{StepDispatcher, WorkflowEngine};
pub use graph::{StepKind, StepSpec, WorkflowGraph, WorkflowRegistry};
pub use orchestrator::{Orchestrator, OrchestratorStatus};
pub use router::{Route, RouteRule, Router};
