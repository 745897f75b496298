use crate::events::{EventSink, ProgressEvent, ProgressEventKind, deliver};
use crate::tools::{ToolRegistry, is_failure_output, result_preview, tool_error_output};
use crate::AgentError;
use futures::future::join_all;
use loom_llm::{ToolCall, ToolOutput};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Executes provider-requested tool calls against the local registry.
///
/// Tool failures become marker-prefixed outputs; an unknown function name is
/// the only hard error.
#[derive(Clone)]
pub struct ToolBridge {
    registry: Arc<ToolRegistry>,
}

impl ToolBridge {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn execute(
        &self,
        call: &ToolCall,
        session_id: &str,
        sink: Option<&dyn EventSink>,
    ) -> Result<ToolOutput, AgentError> {
        let registered = self
            .registry
            .get(&call.function_name)
            .ok_or_else(|| AgentError::UnknownTool(call.function_name.clone()))?;

        deliver(
            sink,
            ProgressEvent::new(
                session_id,
                ProgressEventKind::ActionStart {
                    call_id: call.id.clone(),
                    function: call.function_name.clone(),
                    arguments: call.arguments.clone(),
                },
            ),
        );

        let start_time = Instant::now();
        let output = match (registered.executor)(call.arguments.clone()).await {
            Ok(output) => output,
            Err(error) => tool_error_output(&error),
        };
        let execution_time_ms = u64::try_from(start_time.elapsed().as_millis()).unwrap_or(u64::MAX);
        let success = !is_failure_output(&output);
        debug!(
            call_id = %call.id,
            function = %call.function_name,
            execution_time_ms,
            success,
            "tool call finished"
        );

        deliver(
            sink,
            ProgressEvent::new(
                session_id,
                ProgressEventKind::ToolCallResult {
                    call_id: call.id.clone(),
                    function: call.function_name.clone(),
                    arguments: call.arguments.clone(),
                    result_preview: result_preview(&output),
                    execution_time_ms,
                    success,
                },
            ),
        );

        Ok(ToolOutput {
            tool_call_id: call.id.clone(),
            output,
        })
    }

    /// Runs a whole `requires_action` batch, returning outputs in call order.
    ///
    /// Every name is checked before anything executes.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        parallel: bool,
        session_id: &str,
        sink: Option<&dyn EventSink>,
    ) -> Result<Vec<ToolOutput>, AgentError> {
        if let Some(unknown) = calls
            .iter()
            .find(|call| !self.registry.contains(&call.function_name))
        {
            return Err(AgentError::UnknownTool(unknown.function_name.clone()));
        }

        let outputs = if parallel && calls.len() > 1 {
            join_all(
                calls
                    .iter()
                    .map(|call| self.execute(call, session_id, sink)),
            )
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?
        } else {
            let mut outputs = Vec::with_capacity(calls.len());
            for call in calls {
                outputs.push(self.execute(call, session_id, sink).await?);
            }
            outputs
        };

        if outputs.len() != calls.len() {
            return Err(AgentError::ToolBatchMismatch {
                calls: calls.len(),
                outputs: outputs.len(),
            });
        }
        Ok(outputs)
    }
}
