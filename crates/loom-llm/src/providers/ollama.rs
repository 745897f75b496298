//! Local Ollama adapter.
//!
//! Ollama exposes a stateless chat endpoint, so threads, messages and runs are
//! simulated in process. A run performs its chat call lazily on the first
//! `retrieve_run` after it is queued or after tool outputs are submitted.

use crate::agents::{AgentIdentityCache, LocalAgentRegistry};
use crate::errors::{ProviderError, ProviderResult};
use crate::provider::{ProviderAdapter, ProviderFactory};
use crate::store::ConversationStore;
use crate::types::{
    AgentDefinition, AgentIdentity, CachedAgentDescriptor, Message, MessageOrder, Metadata, Role,
    Run, RunStatus, Thread, TokenUsage, ToolCall, ToolOutput,
};
use crate::usage::UsageReporting;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const OLLAMA_PROVIDER: &str = "ollama";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OllamaConfig {
    pub base_url: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
        }
    }
}

impl OllamaConfig {
    /// `OLLAMA_BASE_URL` or the local default; the local provider is always
    /// registered and reports reachability through `is_configured`.
    pub fn from_env() -> Self {
        std::env::var("OLLAMA_BASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(|base_url| Self { base_url })
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ChatToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatToolCall {
    pub function: ChatFunctionCall,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    pub stream: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
}

#[async_trait]
pub trait OllamaChatClient: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> ProviderResult<ChatResponse>;

    /// Names of locally available models; doubles as the reachability probe.
    async fn list_models(&self) -> ProviderResult<Vec<String>>;
}

pub struct ReqwestOllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestOllamaClient {
    pub fn new(config: &OllamaConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.clone(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagsModel>,
}

#[derive(Deserialize)]
struct TagsModel {
    name: String,
}

async fn read_json<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> ProviderResult<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| ProviderError::Transport(format!("reading response body failed: {err}")))?;
    if !status.is_success() {
        return Err(ProviderError::Api {
            status: status.as_u16(),
            message: text.trim().to_string(),
        });
    }
    serde_json::from_str(&text)
        .map_err(|err| ProviderError::InvalidResponse(format!("json decode failed: {err}")))
}

#[async_trait]
impl OllamaChatClient for ReqwestOllamaClient {
    async fn chat(&self, request: ChatRequest) -> ProviderResult<ChatResponse> {
        let url = self.endpoint("api/chat");
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(format!("POST {url} failed: {err}")))?;
        read_json(response).await
    }

    async fn list_models(&self) -> ProviderResult<Vec<String>> {
        let url = self.endpoint("api/tags");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(format!("GET {url} failed: {err}")))?;
        let tags: TagsResponse = read_json(response).await?;
        Ok(tags.models.into_iter().map(|model| model.name).collect())
    }
}

#[derive(Debug)]
struct RunRecord {
    run: Run,
    sequence: u64,
    needs_completion: bool,
    transcript: Vec<ChatMessage>,
}

type RunSlot = Arc<tokio::sync::Mutex<RunRecord>>;

#[derive(Default)]
struct RunTable {
    runs: HashMap<String, RunSlot>,
    next_sequence: u64,
}

pub struct OllamaAdapter {
    client: Arc<dyn OllamaChatClient>,
    base_url: String,
    store: ConversationStore,
    runs: Mutex<RunTable>,
    agents: AgentIdentityCache,
    registry: LocalAgentRegistry,
}

impl OllamaAdapter {
    pub fn new(config: OllamaConfig) -> Self {
        let client = Arc::new(ReqwestOllamaClient::new(&config));
        Self::with_client(client, config.base_url)
    }

    pub fn with_client(client: Arc<dyn OllamaChatClient>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            store: ConversationStore::new(),
            runs: Mutex::new(RunTable::default()),
            agents: AgentIdentityCache::new(),
            registry: LocalAgentRegistry::new(),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    fn table(&self) -> ProviderResult<std::sync::MutexGuard<'_, RunTable>> {
        self.runs
            .lock()
            .map_err(|_| ProviderError::InvalidState("run table mutex poisoned".to_string()))
    }

    /// Callers must check the locked record's thread id.
    fn run_slot(&self, run_id: &str) -> ProviderResult<RunSlot> {
        self.table()?
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| ProviderError::not_found("run", run_id))
    }

    fn build_request(
        &self,
        agent: &CachedAgentDescriptor,
        record: &RunRecord,
    ) -> ProviderResult<ChatRequest> {
        let mut messages = Vec::new();
        if !agent.instructions.trim().is_empty() {
            messages.push(ChatMessage::new("system", agent.instructions.clone()));
        }
        for message in self.store.read_recent(&record.run.thread_id, None)? {
            messages.push(ChatMessage::new(message.role.as_str(), message.content));
        }
        messages.extend(record.transcript.iter().cloned());

        let tools = agent
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();

        Ok(ChatRequest {
            model: agent.model.clone(),
            messages,
            tools,
            stream: false,
        })
    }

    async fn advance(&self, record: &mut RunRecord) -> ProviderResult<()> {
        record.needs_completion = false;
        let request = match self
            .registry
            .get_by_identity(&record.run.agent_id)
            .and_then(|agent| self.build_request(&agent, record))
        {
            Ok(request) => request,
            Err(error) => {
                warn!(run_id = %record.run.id, %error, "ollama run could not be prepared");
                record.run.fail("provider_error", error.to_string());
                return Ok(());
            }
        };
        record.run.transition_to(RunStatus::InProgress);

        let prompt_chars: usize = request
            .messages
            .iter()
            .map(|message| message.content.chars().count())
            .sum();
        debug!(run_id = %record.run.id, model = %request.model, messages = request.messages.len(), "ollama chat request");

        let response = match self.client.chat(request).await {
            Ok(response) => response,
            Err(error) => {
                warn!(run_id = %record.run.id, %error, "ollama chat call failed");
                record.run.fail("provider_error", error.to_string());
                return Ok(());
            }
        };

        let call_usage = match (response.prompt_eval_count, response.eval_count) {
            (None, None) => {
                TokenUsage::estimate(prompt_chars, response.message.content.chars().count())
            }
            (prompt, completion) => {
                TokenUsage::new(prompt.unwrap_or_default(), completion.unwrap_or_default())
            }
        };
        record.run.usage = Some(record.run.usage.unwrap_or_default() + call_usage);

        if response.message.tool_calls.is_empty() {
            self.store.append_message(
                &record.run.thread_id,
                Role::Assistant,
                response.message.content,
                Some(record.run.id.clone()),
            )?;
            record.run.transition_to(RunStatus::Completed);
            info!(run_id = %record.run.id, "ollama run completed");
            return Ok(());
        }

        let calls: Vec<ToolCall> = response
            .message
            .tool_calls
            .iter()
            .map(|call| {
                ToolCall::from_value(
                    format!("call_{}", Uuid::new_v4().simple()),
                    call.function.name.clone(),
                    call.function.arguments.clone(),
                )
            })
            .collect();
        record.transcript.push(response.message);
        record.run.transition_to(RunStatus::RequiresAction);
        record.run.required_action = calls;
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        OLLAMA_PROVIDER
    }

    fn message_order(&self) -> MessageOrder {
        MessageOrder::OldestFirst
    }

    fn usage_reporting(&self) -> UsageReporting {
        UsageReporting::Cumulative
    }

    async fn is_configured(&self) -> bool {
        self.client.list_models().await.is_ok()
    }

    async fn ensure_ready(&self) -> ProviderResult<()> {
        match self.client.list_models().await {
            Ok(_) => Ok(()),
            Err(error) => Err(ProviderError::ProviderUnavailable {
                provider: OLLAMA_PROVIDER.to_string(),
                message: format!("Ollama is not reachable at {}: {error}", self.base_url),
                remediation: vec![
                    "Start the server with `ollama serve`".to_string(),
                    "Pull the agent's model with `ollama pull <model>`".to_string(),
                    "Set OLLAMA_BASE_URL if the server runs elsewhere".to_string(),
                ],
            }),
        }
    }

    async fn get_or_create_agent(
        &self,
        definition: &AgentDefinition,
    ) -> ProviderResult<AgentIdentity> {
        self.agents.reconcile(definition, &self.registry).await
    }

    async fn create_thread(&self, metadata: Option<Metadata>) -> ProviderResult<Thread> {
        self.store.create_thread(metadata)
    }

    async fn retrieve_thread(&self, thread_id: &str) -> ProviderResult<Thread> {
        self.store.get_thread(thread_id)
    }

    async fn add_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> ProviderResult<Message> {
        self.store.append_message(thread_id, role, content, None)
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> ProviderResult<Vec<Message>> {
        self.store.read_recent(thread_id, limit)
    }

    async fn create_run(&self, thread_id: &str, agent_id: &AgentIdentity) -> ProviderResult<Run> {
        self.store.get_thread(thread_id)?;
        self.registry.get_by_identity(agent_id.as_str())?;

        let run = Run::queued(
            format!("run_{}", Uuid::new_v4().simple()),
            thread_id,
            agent_id.as_str(),
        );
        let mut table = self.table()?;
        let sequence = table.next_sequence;
        table.next_sequence += 1;
        table.runs.insert(
            run.id.clone(),
            Arc::new(tokio::sync::Mutex::new(RunRecord {
                run: run.clone(),
                sequence,
                needs_completion: false,
                transcript: Vec::new(),
            })),
        );
        Ok(run)
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> ProviderResult<Run> {
        let slot = self.run_slot(run_id)?;
        let mut record = slot.lock().await;
        if record.run.thread_id != thread_id {
            return Err(ProviderError::not_found("run", run_id));
        }
        let pending = record.run.status == RunStatus::Queued
            || (record.run.status == RunStatus::InProgress && record.needs_completion);
        if pending {
            self.advance(&mut record).await?;
        }
        Ok(record.run.clone())
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> ProviderResult<Run> {
        let slot = self.run_slot(run_id)?;
        let mut record = slot.lock().await;
        if record.run.thread_id != thread_id {
            return Err(ProviderError::not_found("run", run_id));
        }
        if record.run.status != RunStatus::RequiresAction {
            return Err(ProviderError::InvalidState(format!(
                "run {run_id} is {} and does not accept tool outputs",
                record.run.status
            )));
        }

        let pending: HashSet<&str> = record
            .run
            .required_action
            .iter()
            .map(|call| call.id.as_str())
            .collect();
        let submitted: HashSet<&str> = outputs
            .iter()
            .map(|output| output.tool_call_id.as_str())
            .collect();
        if pending != submitted || outputs.len() != pending.len() {
            return Err(ProviderError::InvalidState(format!(
                "tool output batch for run {run_id} must answer each of the {} pending calls exactly once",
                pending.len()
            )));
        }

        let names: HashMap<String, String> = record
            .run
            .required_action
            .iter()
            .map(|call| (call.id.clone(), call.function_name.clone()))
            .collect();
        for output in outputs {
            let mut message = ChatMessage::new("tool", output.output);
            message.tool_name = names.get(&output.tool_call_id).cloned();
            record.transcript.push(message);
        }
        record.run.transition_to(RunStatus::InProgress);
        record.needs_completion = true;
        Ok(record.run.clone())
    }

    async fn list_runs(&self, thread_id: &str, limit: Option<usize>) -> ProviderResult<Vec<Run>> {
        self.store.get_thread(thread_id)?;
        let slots: Vec<RunSlot> = self.table()?.runs.values().cloned().collect();
        let mut runs = Vec::new();
        for slot in slots {
            let record = slot.lock().await;
            if record.run.thread_id == thread_id {
                runs.push((record.sequence, record.run.clone()));
            }
        }
        runs.sort_by(|left, right| right.0.cmp(&left.0));
        let runs = runs.into_iter().map(|(_, run)| run);
        Ok(match limit {
            Some(limit) => runs.take(limit).collect(),
            None => runs.collect(),
        })
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> ProviderResult<Run> {
        let slot = self.run_slot(run_id)?;
        let mut record = slot.lock().await;
        if record.run.thread_id != thread_id {
            return Err(ProviderError::not_found("run", run_id));
        }
        if !record.run.is_terminal() {
            record.run.transition_to(RunStatus::Cancelled);
            record.needs_completion = false;
            info!(run_id, "ollama run cancelled");
        }
        Ok(record.run.clone())
    }
}

pub struct OllamaFactory;

impl ProviderFactory for OllamaFactory {
    fn provider_id(&self) -> &'static str {
        OLLAMA_PROVIDER
    }

    fn from_env(&self) -> Option<Arc<dyn ProviderAdapter>> {
        Some(Arc::new(OllamaAdapter::new(OllamaConfig::from_env())))
    }
}
