//! OpenAI Assistants adapter.

use crate::agents::{AgentIdentityCache, AgentRegistry};
use crate::errors::{ProviderError, ProviderResult};
use crate::provider::{ProviderAdapter, ProviderFactory};
use crate::providers::threads::{
    HttpMethod, ReqwestThreadsTransport, ThreadsApi, ThreadsTransport, TransportAuth,
};
use crate::types::{
    AgentDefinition, AgentIdentity, CachedAgentDescriptor, Message, MessageOrder, Metadata, Role,
    Run, Thread, ToolDefinition, ToolOutput,
};
use crate::usage::UsageReporting;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

pub const OPENAI_PROVIDER: &str = "openai";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ASSISTANT_PAGE_SIZE: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
        }
    }

    /// Reads `OPENAI_API_KEY` and optional `OPENAI_BASE_URL`.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty())?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());
        Some(Self { api_key, base_url })
    }

    pub fn transport(&self) -> ReqwestThreadsTransport {
        ReqwestThreadsTransport::new(
            self.base_url.clone(),
            TransportAuth::Bearer(self.api_key.clone()),
        )
        .header("OpenAI-Beta", "assistants=v2")
    }
}

#[derive(Debug, Deserialize)]
struct WireAssistant {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    tools: Vec<WireAssistantTool>,
}

#[derive(Debug, Deserialize)]
struct WireAssistantTool {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    function: Option<WireFunctionDefinition>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDefinition {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireAssistantPage {
    data: Vec<WireAssistant>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

impl WireAssistant {
    fn into_descriptor(self) -> CachedAgentDescriptor {
        let tools = self
            .tools
            .into_iter()
            .filter(|tool| tool.kind == "function")
            .filter_map(|tool| tool.function)
            .map(|function| ToolDefinition {
                name: function.name,
                description: function.description.unwrap_or_default(),
                parameters: function.parameters.unwrap_or_else(|| json!({})),
            })
            .collect();
        CachedAgentDescriptor {
            name: self.name.unwrap_or_default(),
            instructions: self.instructions.unwrap_or_default(),
            tools,
            model: self.model,
            identity: AgentIdentity::new(self.id),
        }
    }
}

fn assistant_body(definition: &AgentDefinition) -> Value {
    let tools: Vec<Value> = definition
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
    json!({
        "name": definition.name,
        "instructions": definition.instructions,
        "model": definition.model,
        "tools": tools,
    })
}

fn decode_assistant(value: Value) -> ProviderResult<WireAssistant> {
    serde_json::from_value(value)
        .map_err(|err| ProviderError::InvalidResponse(format!("malformed assistant: {err}")))
}

/// The provider-hosted assistant registry.
pub struct OpenAiAssistantRegistry {
    transport: Arc<dyn ThreadsTransport>,
}

impl OpenAiAssistantRegistry {
    pub fn new(transport: Arc<dyn ThreadsTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl AgentRegistry for OpenAiAssistantRegistry {
    async fn find_by_name(&self, name: &str) -> ProviderResult<Option<CachedAgentDescriptor>> {
        let mut after: Option<String> = None;
        loop {
            let mut path = format!("assistants?limit={ASSISTANT_PAGE_SIZE}&order=desc");
            if let Some(cursor) = &after {
                path.push_str(&format!("&after={cursor}"));
            }
            let value = self.transport.send(HttpMethod::Get, &path, None).await?;
            let page: WireAssistantPage = serde_json::from_value(value).map_err(|err| {
                ProviderError::InvalidResponse(format!("malformed assistant list: {err}"))
            })?;
            let next_cursor = page
                .last_id
                .clone()
                .or_else(|| page.data.last().map(|assistant| assistant.id.clone()));
            if let Some(found) = page
                .data
                .into_iter()
                .find(|assistant| assistant.name.as_deref() == Some(name))
            {
                return Ok(Some(found.into_descriptor()));
            }
            match next_cursor {
                Some(cursor) if page.has_more => after = Some(cursor),
                _ => return Ok(None),
            }
        }
    }

    async fn create(&self, definition: &AgentDefinition) -> ProviderResult<AgentIdentity> {
        let value = self
            .transport
            .send(HttpMethod::Post, "assistants", Some(assistant_body(definition)))
            .await?;
        Ok(AgentIdentity::new(decode_assistant(value)?.id))
    }

    async fn update(
        &self,
        identity: &AgentIdentity,
        definition: &AgentDefinition,
    ) -> ProviderResult<AgentIdentity> {
        let value = self
            .transport
            .send(
                HttpMethod::Post,
                &format!("assistants/{identity}"),
                Some(assistant_body(definition)),
            )
            .await?;
        Ok(AgentIdentity::new(decode_assistant(value)?.id))
    }
}

pub struct OpenAiAssistantsAdapter {
    api: ThreadsApi,
    registry: OpenAiAssistantRegistry,
    agents: AgentIdentityCache,
    configured: bool,
}

impl OpenAiAssistantsAdapter {
    pub fn new(config: OpenAiConfig) -> Self {
        let configured = !config.api_key.trim().is_empty();
        let mut adapter = Self::with_transport(Arc::new(config.transport()));
        adapter.configured = configured;
        adapter
    }

    pub fn with_transport(transport: Arc<dyn ThreadsTransport>) -> Self {
        Self {
            api: ThreadsApi::new(transport.clone()),
            registry: OpenAiAssistantRegistry::new(transport),
            agents: AgentIdentityCache::new(),
            configured: true,
        }
    }

    pub fn agent_cache(&self) -> &AgentIdentityCache {
        &self.agents
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAssistantsAdapter {
    fn name(&self) -> &str {
        OPENAI_PROVIDER
    }

    fn message_order(&self) -> MessageOrder {
        MessageOrder::NewestFirst
    }

    fn usage_reporting(&self) -> UsageReporting {
        UsageReporting::Cumulative
    }

    async fn is_configured(&self) -> bool {
        self.configured
    }

    async fn ensure_ready(&self) -> ProviderResult<()> {
        if self.configured {
            return Ok(());
        }
        Err(ProviderError::configuration(
            "OPENAI_API_KEY is not set; export it or add it to .env",
        ))
    }

    async fn get_or_create_agent(
        &self,
        definition: &AgentDefinition,
    ) -> ProviderResult<AgentIdentity> {
        self.ensure_ready().await?;
        self.agents.reconcile(definition, &self.registry).await
    }

    async fn create_thread(&self, metadata: Option<Metadata>) -> ProviderResult<Thread> {
        self.api.create_thread(metadata).await
    }

    async fn retrieve_thread(&self, thread_id: &str) -> ProviderResult<Thread> {
        self.api.retrieve_thread(thread_id).await
    }

    async fn add_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> ProviderResult<Message> {
        self.api.add_message(thread_id, role, content).await
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> ProviderResult<Vec<Message>> {
        self.api.list_messages(thread_id, limit).await
    }

    async fn create_run(&self, thread_id: &str, agent_id: &AgentIdentity) -> ProviderResult<Run> {
        self.api.create_run(thread_id, agent_id.as_str()).await
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> ProviderResult<Run> {
        self.api.retrieve_run(thread_id, run_id).await
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> ProviderResult<Run> {
        self.api
            .submit_tool_outputs(thread_id, run_id, outputs)
            .await
    }

    async fn list_runs(&self, thread_id: &str, limit: Option<usize>) -> ProviderResult<Vec<Run>> {
        self.api.list_runs(thread_id, limit).await
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> ProviderResult<Run> {
        self.api.cancel_run(thread_id, run_id).await
    }
}

pub struct OpenAiFactory;

impl ProviderFactory for OpenAiFactory {
    fn provider_id(&self) -> &'static str {
        OPENAI_PROVIDER
    }

    fn from_env(&self) -> Option<Arc<dyn ProviderAdapter>> {
        OpenAiConfig::from_env()
            .map(|config| Arc::new(OpenAiAssistantsAdapter::new(config)) as Arc<dyn ProviderAdapter>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunStatus;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<ProviderResult<Value>>>,
        requests: Mutex<Vec<(HttpMethod, String, Option<Value>)>>,
    }

    impl ScriptedTransport {
        fn with(responses: Vec<ProviderResult<Value>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<(HttpMethod, String, Option<Value>)> {
            self.requests.lock().expect("requests mutex").clone()
        }
    }

    #[async_trait]
    impl ThreadsTransport for ScriptedTransport {
        async fn send(
            &self,
            method: HttpMethod,
            path: &str,
            body: Option<Value>,
        ) -> ProviderResult<Value> {
            self.requests
                .lock()
                .expect("requests mutex")
                .push((method, path.to_string(), body));
            self.responses
                .lock()
                .expect("responses mutex")
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Transport("script exhausted".to_string())))
        }
    }

    fn definition() -> AgentDefinition {
        AgentDefinition {
            name: "helper".to_string(),
            instructions: "be helpful".to_string(),
            tools: vec![ToolDefinition {
                name: "read_file".to_string(),
                description: "Read a file".to_string(),
                parameters: json!({"type": "object"}),
            }],
            model: "gpt-4o".to_string(),
            remote_id: None,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn identical_definitions_create_the_assistant_once() {
        let transport = ScriptedTransport::with(vec![
            Ok(json!({"data": [], "has_more": false})),
            Ok(json!({"id": "asst_1", "name": "helper", "model": "gpt-4o", "tools": []})),
        ]);
        let adapter = OpenAiAssistantsAdapter::with_transport(transport.clone());

        let first = adapter.get_or_create_agent(&definition()).await.expect("first");
        let second = adapter.get_or_create_agent(&definition()).await.expect("second");

        assert_eq!(first, AgentIdentity::new("asst_1"));
        assert_eq!(first, second);
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].0, HttpMethod::Post);
        assert_eq!(requests[1].1, "assistants");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lookup_follows_pagination_cursor() {
        let transport = ScriptedTransport::with(vec![
            Ok(json!({
                "data": [{"id": "asst_9", "name": "other", "model": "gpt-4o"}],
                "has_more": true,
                "last_id": "asst_9"
            })),
            Ok(json!({
                "data": [{
                    "id": "asst_2",
                    "name": "helper",
                    "instructions": "be helpful",
                    "model": "gpt-4o",
                    "tools": [
                        {"type": "code_interpreter"},
                        {"type": "function", "function": {"name": "read_file", "description": "Read a file", "parameters": {"type": "object"}}}
                    ]
                }],
                "has_more": false
            })),
        ]);
        let adapter = OpenAiAssistantsAdapter::with_transport(transport.clone());

        let identity = adapter.get_or_create_agent(&definition()).await.expect("agent");

        assert_eq!(identity, AgentIdentity::new("asst_2"));
        let requests = transport.requests();
        assert_eq!(requests.len(), 2, "an identical remote assistant needs no write");
        assert!(requests[1].1.ends_with("&after=asst_9"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn changed_definition_updates_in_place() {
        let transport = ScriptedTransport::with(vec![
            Ok(json!({"data": [], "has_more": false})),
            Ok(json!({"id": "asst_1"})),
            Ok(json!({"id": "asst_1"})),
        ]);
        let adapter = OpenAiAssistantsAdapter::with_transport(transport.clone());

        adapter.get_or_create_agent(&definition()).await.expect("create");
        let mut changed = definition();
        changed.instructions = "be terse".to_string();
        adapter.get_or_create_agent(&changed).await.expect("update");

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].1, "assistants/asst_1");
        assert_eq!(
            requests[2].2.as_ref().expect("body")["instructions"],
            "be terse"
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn system_messages_are_sent_as_user() {
        let transport = ScriptedTransport::with(vec![Ok(json!({
            "id": "msg_1",
            "thread_id": "thread_1",
            "role": "user",
            "content": [{"type": "text", "text": {"value": "note"}}]
        }))]);
        let adapter = OpenAiAssistantsAdapter::with_transport(transport.clone());

        adapter
            .add_message("thread_1", Role::System, "note")
            .await
            .expect("message");

        let requests = transport.requests();
        assert_eq!(requests[0].1, "threads/thread_1/messages");
        assert_eq!(requests[0].2.as_ref().expect("body")["role"], "user");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_run_maps_to_not_found() {
        let transport = ScriptedTransport::with(vec![Err(ProviderError::Api {
            status: 404,
            message: "No run found".to_string(),
        })]);
        let adapter = OpenAiAssistantsAdapter::with_transport(transport);

        let error = adapter
            .retrieve_run("thread_1", "run_missing")
            .await
            .expect_err("missing run");
        assert_eq!(error, ProviderError::not_found("run", "run_missing"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn submit_tool_outputs_sends_one_batch() {
        let transport = ScriptedTransport::with(vec![Ok(json!({
            "id": "run_1",
            "thread_id": "thread_1",
            "assistant_id": "asst_1",
            "status": "in_progress"
        }))]);
        let adapter = OpenAiAssistantsAdapter::with_transport(transport.clone());

        let run = adapter
            .submit_tool_outputs(
                "thread_1",
                "run_1",
                vec![
                    ToolOutput {
                        tool_call_id: "call_a".to_string(),
                        output: "a".to_string(),
                    },
                    ToolOutput {
                        tool_call_id: "call_b".to_string(),
                        output: "b".to_string(),
                    },
                ],
            )
            .await
            .expect("submit");

        assert_eq!(run.status, RunStatus::InProgress);
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        let body = requests[0].2.as_ref().expect("body");
        assert_eq!(body["tool_outputs"].as_array().expect("array").len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_key_is_a_configuration_error() {
        let adapter = OpenAiAssistantsAdapter::new(OpenAiConfig::new(""));
        assert!(!adapter.is_configured().await);
        let error = adapter
            .get_or_create_agent(&definition())
            .await
            .expect_err("unconfigured");
        assert!(matches!(error, ProviderError::Configuration(_)));
    }
}
