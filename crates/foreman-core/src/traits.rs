use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{AgentContext, ExecutorReply, StepRequest};

/// Agent executor: the external collaborator that actually performs work.
///
/// The engine treats an `Err` and an `Ok` reply with `success == false`
/// identically: both are step failures.
pub trait AgentExecutor: Send + Sync + 'static {
    /// Execute a request as the named worker.
    fn execute(
        &self,
        worker_id: &str,
        request: StepRequest,
        context: AgentContext,
    ) -> BoxFuture<'_, Result<ExecutorReply>>;
}

/// Blanket impl so closures can serve as executors in composition and tests.
impl<F> AgentExecutor for F
where
    F: Fn(&str, StepRequest, AgentContext) -> BoxFuture<'static, Result<ExecutorReply>>
        + Send
        + Sync
        + 'static,
{
    fn execute(
        &self,
        worker_id: &str,
        request: StepRequest,
        context: AgentContext,
    ) -> BoxFuture<'_, Result<ExecutorReply>> {
        self(worker_id, request, context)
    }
}
