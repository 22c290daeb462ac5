pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::OrchestratorConfig;
pub use error::{ForemanError, Result};
pub use event::EventBus;
pub use traits::AgentExecutor;
pub use types::{
    AgentContext, ApprovalRequest, ApprovalStatus, ApprovalVote, ExecutorReply, RouteResponse,
    SessionId, StepRequest, WorkRequest, WorkflowEvent, WorkflowId, WorkflowState, WorkflowStatus,
};
