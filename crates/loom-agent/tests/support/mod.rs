#![allow(dead_code)]

use async_trait::async_trait;
use loom_agent::{RegisteredTool, Sleeper, ToolError, ToolRegistry};
use loom_llm::{
    AgentDefinition, AgentIdentity, Message, MessageOrder, Metadata, ProviderAdapter,
    ProviderError, ProviderResult, Role, Run, RunError, RunStatus, Thread, TokenUsage, ToolCall,
    ToolDefinition, ToolOutput, UsageReporting,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const THREAD_ID: &str = "thread_1";
pub const RUN_ID: &str = "run_1";

/// Adapter replaying scripted run states and message pages.
///
/// The last scripted run and page repeat once their queues drain.
pub struct ScriptedAdapter {
    pub order: MessageOrder,
    pub reporting: UsageReporting,
    pub runs: Mutex<VecDeque<Run>>,
    pub last_run: Mutex<Option<Run>>,
    pub pages: Mutex<VecDeque<Vec<Message>>>,
    pub last_page: Mutex<Vec<Message>>,
    pub existing_runs: Mutex<Vec<Run>>,
    pub submissions: Mutex<Vec<Vec<ToolOutput>>>,
    pub cancelled: Mutex<Vec<String>>,
    pub added_messages: Mutex<Vec<(Role, String)>>,
    pub agent_calls: AtomicUsize,
    pub threads_created: AtomicUsize,
    pub retrieve_calls: AtomicUsize,
    pub stalled_session: Option<String>,
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self {
            order: MessageOrder::NewestFirst,
            reporting: UsageReporting::Cumulative,
            runs: Mutex::new(VecDeque::new()),
            last_run: Mutex::new(None),
            pages: Mutex::new(VecDeque::new()),
            last_page: Mutex::new(Vec::new()),
            existing_runs: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            added_messages: Mutex::new(Vec::new()),
            agent_calls: AtomicUsize::new(0),
            threads_created: AtomicUsize::new(0),
            retrieve_calls: AtomicUsize::new(0),
            stalled_session: None,
        }
    }
}

impl ScriptedAdapter {
    pub fn new(runs: Vec<Run>, pages: Vec<Vec<Message>>) -> Self {
        Self {
            runs: Mutex::new(runs.into()),
            pages: Mutex::new(pages.into()),
            ..Self::default()
        }
    }

    pub fn with_order(mut self, order: MessageOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_reporting(mut self, reporting: UsageReporting) -> Self {
        self.reporting = reporting;
        self
    }

    /// Thread creation for `session_id` never completes.
    pub fn with_stalled_session(mut self, session_id: &str) -> Self {
        self.stalled_session = Some(session_id.to_string());
        self
    }

    pub fn with_existing_runs(self, runs: Vec<Run>) -> Self {
        *self.existing_runs.lock().expect("existing runs mutex") = runs;
        self
    }

    pub fn submissions(&self) -> Vec<Vec<ToolOutput>> {
        self.submissions.lock().expect("submissions mutex").clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().expect("cancelled mutex").clone()
    }

    pub fn added_messages(&self) -> Vec<(Role, String)> {
        self.added_messages.lock().expect("messages mutex").clone()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn message_order(&self) -> MessageOrder {
        self.order
    }

    fn usage_reporting(&self) -> UsageReporting {
        self.reporting
    }

    async fn is_configured(&self) -> bool {
        true
    }

    async fn get_or_create_agent(
        &self,
        definition: &AgentDefinition,
    ) -> ProviderResult<AgentIdentity> {
        self.agent_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AgentIdentity::new(format!("agent-{}", definition.name)))
    }

    async fn create_thread(&self, metadata: Option<Metadata>) -> ProviderResult<Thread> {
        let session = metadata
            .as_ref()
            .and_then(|metadata| metadata.get("session_id"));
        if session.is_some() && session == self.stalled_session.as_ref() {
            std::future::pending::<()>().await;
        }
        let count = self.threads_created.fetch_add(1, Ordering::SeqCst);
        Ok(Thread {
            id: if count == 0 {
                THREAD_ID.to_string()
            } else {
                format!("thread_{}", count + 1)
            },
            created_at: 0,
            metadata: metadata.unwrap_or_default(),
        })
    }

    async fn retrieve_thread(&self, thread_id: &str) -> ProviderResult<Thread> {
        Ok(Thread {
            id: thread_id.to_string(),
            created_at: 0,
            metadata: Metadata::new(),
        })
    }

    async fn add_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> ProviderResult<Message> {
        self.added_messages
            .lock()
            .expect("messages mutex")
            .push((role, content.to_string()));
        Ok(message("msg_user", thread_id, role, content, 0, None))
    }

    async fn list_messages(
        &self,
        _thread_id: &str,
        _limit: Option<usize>,
    ) -> ProviderResult<Vec<Message>> {
        let next = self.pages.lock().expect("pages mutex").pop_front();
        let mut last = self.last_page.lock().expect("last page mutex");
        if let Some(page) = next {
            *last = page;
        }
        Ok(last.clone())
    }

    async fn create_run(&self, thread_id: &str, agent_id: &AgentIdentity) -> ProviderResult<Run> {
        Ok(Run::queued(RUN_ID, thread_id, agent_id.as_str()))
    }

    async fn retrieve_run(&self, _thread_id: &str, run_id: &str) -> ProviderResult<Run> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.runs.lock().expect("runs mutex").pop_front();
        let mut last = self.last_run.lock().expect("last run mutex");
        if let Some(run) = next {
            *last = Some(run);
        }
        last.clone()
            .ok_or_else(|| ProviderError::not_found("run", run_id))
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> ProviderResult<Run> {
        self.submissions
            .lock()
            .expect("submissions mutex")
            .push(outputs);
        Ok(run(RunStatus::InProgress, thread_id, run_id))
    }

    async fn list_runs(&self, _thread_id: &str, _limit: Option<usize>) -> ProviderResult<Vec<Run>> {
        Ok(self.existing_runs.lock().expect("existing runs mutex").clone())
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> ProviderResult<Run> {
        self.cancelled
            .lock()
            .expect("cancelled mutex")
            .push(run_id.to_string());
        Ok(Run::synthesized_cancelled(thread_id, run_id))
    }
}

/// Records requested delays and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    pub delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays_ms(&self) -> Vec<u64> {
        self.delays
            .lock()
            .expect("delays mutex")
            .iter()
            .map(|delay| delay.as_millis() as u64)
            .collect()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().expect("delays mutex").push(duration);
        tokio::task::yield_now().await;
    }
}

pub fn run(status: RunStatus, thread_id: &str, run_id: &str) -> Run {
    let mut run = Run::queued(run_id, thread_id, "agent-helper");
    run.status = status;
    run
}

pub fn status(status: RunStatus) -> Run {
    run(status, THREAD_ID, RUN_ID)
}

pub fn with_usage(mut run: Run, prompt: u64, completion: u64) -> Run {
    run.usage = Some(TokenUsage::new(prompt, completion));
    run
}

pub fn failed(code: &str, text: &str) -> Run {
    let mut run = status(RunStatus::Failed);
    run.last_error = Some(RunError {
        code: code.to_string(),
        message: text.to_string(),
    });
    run
}

pub fn requires_action(calls: Vec<ToolCall>) -> Run {
    let mut run = status(RunStatus::RequiresAction);
    run.required_action = calls;
    run
}

pub fn message(
    id: &str,
    thread_id: &str,
    role: Role,
    content: &str,
    created_at: u64,
    run_id: Option<&str>,
) -> Message {
    Message {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        role,
        content: content.to_string(),
        created_at,
        run_id: run_id.map(str::to_string),
    }
}

pub fn assistant(id: &str, content: &str, created_at: u64) -> Message {
    message(id, THREAD_ID, Role::Assistant, content, created_at, Some(RUN_ID))
}

pub fn user(id: &str, content: &str, created_at: u64) -> Message {
    message(id, THREAD_ID, Role::User, content, created_at, None)
}

/// Registry with `lookup` (succeeds) and `explode` (returns a tool error).
pub fn tool_registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::default();
    registry.register(RegisteredTool::from_fn(
        ToolDefinition {
            name: "lookup".to_string(),
            description: "Look a key up".to_string(),
            parameters: json!({"type": "object", "properties": {"key": {"type": "string"}}}),
        },
        |args| async move { Ok(format!("value for {}", args["key"].as_str().unwrap_or("?"))) },
    ));
    registry.register(RegisteredTool::from_fn(
        ToolDefinition {
            name: "explode".to_string(),
            description: "Always fails".to_string(),
            parameters: json!({"type": "object"}),
        },
        |_args| async move { Err(ToolError::Execution("kaboom".to_string())) },
    ));
    Arc::new(registry)
}

pub fn agent_definition() -> AgentDefinition {
    AgentDefinition {
        name: "helper".to_string(),
        instructions: "Answer briefly.".to_string(),
        tools: Vec::new(),
        model: "test-model".to_string(),
        remote_id: None,
    }
}
