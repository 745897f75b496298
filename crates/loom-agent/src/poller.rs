//! Run completion polling.
//!
//! Drives one provider run to a terminal state: polls with adaptive backoff,
//! streams new assistant messages, executes requested tool batches and reports
//! token usage for the whole run.

use crate::events::{EventSink, ProgressEvent, ProgressEventKind, deliver};
use crate::tools::{ToolBridge, ToolRegistry};
use crate::{AgentError, PollerConfig};
use async_trait::async_trait;
use loom_llm::{
    Message, ProviderAdapter, Run, RunStatus, TokenAccountant, TokenUsage, newest_first,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Result text when a completed run left no messages at all.
pub const NO_RESPONSE_MESSAGE: &str = "No response received from the assistant.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunCompletion {
    pub message: String,
    pub token_usage: TokenUsage,
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Requests cancellation of an in-flight poll from another task.
#[derive(Clone, Default)]
pub struct RunAbortHandle {
    abort_requested: Arc<AtomicBool>,
    abort_notify: Arc<Notify>,
}

impl RunAbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        self.abort_notify.notify_waiters();
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }
}

pub struct RunPoller {
    adapter: Arc<dyn ProviderAdapter>,
    tools: ToolBridge,
    config: PollerConfig,
    sleeper: Arc<dyn Sleeper>,
    abort: Option<RunAbortHandle>,
    session_id: Option<String>,
}

impl RunPoller {
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            adapter,
            tools: ToolBridge::new(Arc::new(ToolRegistry::default())),
            config: PollerConfig::default(),
            sleeper: Arc::new(TokioSleeper),
            abort: None,
            session_id: None,
        }
    }

    pub fn with_tools(mut self, tools: ToolBridge) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_abort_handle(mut self, abort: RunAbortHandle) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Session id stamped on emitted events; defaults to the thread id.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub async fn wait_for_run_completion(
        &self,
        thread_id: &str,
        run_id: &str,
        sink: Option<&dyn EventSink>,
    ) -> Result<RunCompletion, AgentError> {
        let session_id = self.session_id.as_deref().unwrap_or(thread_id);
        let mut state = PollState {
            session_id,
            thread_id,
            run_id,
            sink,
            accountant: TokenAccountant::new(self.adapter.usage_reporting()),
            seen_messages: HashSet::new(),
            last_status: RunStatus::Queued,
        };

        let result = self.poll(&mut state).await;
        match &result {
            Ok(_) => info!(run_id, thread_id, "run completed"),
            Err(error) => warn!(run_id, thread_id, %error, "run did not complete"),
        }
        deliver(
            sink,
            ProgressEvent::new(
                session_id,
                ProgressEventKind::ActionComplete {
                    run_id: run_id.to_string(),
                    status: state.last_status,
                },
            ),
        );
        result
    }

    async fn poll(&self, state: &mut PollState<'_>) -> Result<RunCompletion, AgentError> {
        let max_iterations = self.config.max_iterations;
        for iteration in 1..=max_iterations {
            if self.abort_requested() {
                return self.cancel(state).await;
            }

            let run = self
                .adapter
                .retrieve_run(state.thread_id, state.run_id)
                .await?;
            state.observe(&run, iteration);

            match run.status {
                RunStatus::Completed => return self.complete(state).await,
                RunStatus::Failed => {
                    let (code, message) = run
                        .last_error
                        .map(|error| (error.code, error.message))
                        .unwrap_or_else(|| {
                            ("unknown".to_string(), "run failed without details".to_string())
                        });
                    return Err(AgentError::RunFailed {
                        run_id: state.run_id.to_string(),
                        code,
                        message,
                    });
                }
                RunStatus::Cancelled => {
                    return Err(AgentError::RunCancelled {
                        run_id: state.run_id.to_string(),
                    });
                }
                RunStatus::RequiresAction => {
                    self.handle_required_action(state, &run).await?;
                }
                RunStatus::Queued | RunStatus::InProgress => {
                    if state.sink.is_some() {
                        let page = self.fetch_page(state.thread_id).await?;
                        state.emit_new_messages(&page);
                    }
                    if self.pause(self.config.backoff.delay_for(iteration)).await {
                        return self.cancel(state).await;
                    }
                }
            }
        }

        Err(AgentError::Timeout {
            run_id: state.run_id.to_string(),
            iterations: max_iterations,
        })
    }

    async fn handle_required_action(
        &self,
        state: &mut PollState<'_>,
        run: &Run,
    ) -> Result<(), AgentError> {
        deliver(
            state.sink,
            ProgressEvent::new(
                state.session_id,
                ProgressEventKind::ToolCallsRequested {
                    run_id: state.run_id.to_string(),
                    calls: run.required_action.clone(),
                },
            ),
        );
        let outputs = self
            .tools
            .execute_batch(
                &run.required_action,
                self.config.parallel_tool_calls,
                state.session_id,
                state.sink,
            )
            .await?;
        debug!(run_id = state.run_id, outputs = outputs.len(), "submitting tool outputs");
        self.adapter
            .submit_tool_outputs(state.thread_id, state.run_id, outputs)
            .await?;
        Ok(())
    }

    async fn complete(&self, state: &mut PollState<'_>) -> Result<RunCompletion, AgentError> {
        let page = self.fetch_page(state.thread_id).await?;
        state.emit_new_messages(&page);

        let selected = page
            .iter()
            .position(|message| state.is_own_reply(message))
            .or_else(|| (!page.is_empty()).then_some(0));
        let message = selected
            .map(|index| page[index].content.clone())
            .unwrap_or_else(|| NO_RESPONSE_MESSAGE.to_string());

        let prompt_chars: usize = page
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != selected)
            .map(|(_, message)| message.content.chars().count())
            .sum();
        let token_usage = state
            .accountant
            .finish_or_estimate(prompt_chars, message.chars().count());

        Ok(RunCompletion {
            message,
            token_usage,
        })
    }

    async fn cancel(&self, state: &mut PollState<'_>) -> Result<RunCompletion, AgentError> {
        match self
            .adapter
            .cancel_run(state.thread_id, state.run_id)
            .await
        {
            Ok(run) => state.last_status = run.status,
            Err(error) => {
                warn!(run_id = state.run_id, %error, "provider rejected run cancellation");
                state.last_status = RunStatus::Cancelled;
            }
        }
        Err(AgentError::RunCancelled {
            run_id: state.run_id.to_string(),
        })
    }

    /// One page of messages, newest first.
    async fn fetch_page(&self, thread_id: &str) -> Result<Vec<Message>, AgentError> {
        let page = self
            .adapter
            .list_messages(thread_id, Some(self.config.message_page_size))
            .await?;
        Ok(newest_first(page, self.adapter.message_order()))
    }

    fn abort_requested(&self) -> bool {
        self.abort
            .as_ref()
            .is_some_and(RunAbortHandle::is_abort_requested)
    }

    /// Sleeps for `delay`; returns `true` when an abort arrived meanwhile.
    async fn pause(&self, delay: Duration) -> bool {
        let Some(abort) = &self.abort else {
            self.sleeper.sleep(delay).await;
            return false;
        };
        tokio::select! {
            _ = self.sleeper.sleep(delay) => abort.is_abort_requested(),
            _ = abort.abort_notify.notified() => true,
        }
    }
}

struct PollState<'a> {
    session_id: &'a str,
    thread_id: &'a str,
    run_id: &'a str,
    sink: Option<&'a dyn EventSink>,
    accountant: TokenAccountant,
    seen_messages: HashSet<String>,
    last_status: RunStatus,
}

impl PollState<'_> {
    fn observe(&mut self, run: &Run, iteration: usize) {
        debug!(run_id = self.run_id, iteration, status = %run.status, "polled run");
        if !self.last_status.can_transition_to(&run.status) {
            warn!(
                run_id = self.run_id,
                from = %self.last_status,
                to = %run.status,
                "provider reported a backwards run transition"
            );
        }
        self.last_status = run.status;
        if let Some(usage) = &run.usage {
            self.accountant.record(usage);
        }
    }

    /// Emits assistant messages of this run not emitted before, oldest first.
    /// Assistant message not attributed to some other run.
    fn is_own_reply(&self, message: &Message) -> bool {
        message.is_assistant()
            && message
                .run_id
                .as_deref()
                .is_none_or(|run_id| run_id == self.run_id)
    }

    fn emit_new_messages(&mut self, page: &[Message]) {
        if self.sink.is_none() {
            return;
        }
        for message in page.iter().rev() {
            if !self.is_own_reply(message) {
                continue;
            }
            if !self.seen_messages.insert(message.id.clone()) {
                continue;
            }
            deliver(
                self.sink,
                ProgressEvent::new(
                    self.session_id,
                    ProgressEventKind::AssistantMessage {
                        run_id: self.run_id.to_string(),
                        message_id: message.id.clone(),
                        content: message.content.clone(),
                    },
                ),
            );
        }
    }
}

/// `wait_for_run_completion` on any shared adapter, with default settings.
#[async_trait]
pub trait RunCompletionExt {
    async fn wait_for_run_completion(
        &self,
        thread_id: &str,
        run_id: &str,
        sink: Option<&dyn EventSink>,
    ) -> Result<RunCompletion, AgentError>;
}

#[async_trait]
impl RunCompletionExt for Arc<dyn ProviderAdapter> {
    async fn wait_for_run_completion(
        &self,
        thread_id: &str,
        run_id: &str,
        sink: Option<&dyn EventSink>,
    ) -> Result<RunCompletion, AgentError> {
        RunPoller::new(self.clone())
            .wait_for_run_completion(thread_id, run_id, sink)
            .await
    }
}
