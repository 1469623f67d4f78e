use futures::future::BoxFuture;
use tracing::info;

use trellis_core::error::Result;
use trellis_core::traits::{AgentRequest, AgentResponse, AgentRuntime};

/// Stand-in agent runtime for the CLI: logs what the agent would see and
/// succeeds with its input unchanged.
pub struct EchoRuntime;

impl AgentRuntime for EchoRuntime {
    fn run<'a>(&'a self, request: AgentRequest<'a>) -> BoxFuture<'a, Result<AgentResponse>> {
        Box::pin(async move {
            info!(
                task_id = %request.task_id,
                stage_id = request.stage_id,
                context_items = request.context.items().len(),
                tokens_used = request.context.tokens_used(),
                tools = request.tools.len(),
                "Agent invoked"
            );
            Ok(AgentResponse::succeeded(request.input.clone()))
        })
    }
}
