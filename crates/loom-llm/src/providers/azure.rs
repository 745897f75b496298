//! Azure AI Agents adapter.
//!
//! Agents are provisioned out of band; this adapter never writes to the
//! agent registry and resolves identities from the definition's `remote_id`.

use crate::agents::AgentIdentityCache;
use crate::errors::{ProviderError, ProviderResult};
use crate::provider::{ProviderAdapter, ProviderFactory};
use crate::providers::threads::{
    ReqwestThreadsTransport, ThreadsApi, ThreadsTransport, TransportAuth,
};
use crate::retry::RetryPolicy;
use crate::types::{
    AgentDefinition, AgentIdentity, Message, MessageOrder, Metadata, Role, Run, Thread,
    ToolOutput,
};
use crate::usage::UsageReporting;
use async_trait::async_trait;
use std::sync::Arc;

pub const AZURE_PROVIDER: &str = "azure";
pub const DEFAULT_AZURE_API_VERSION: &str = "2025-05-01";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AzureAgentsConfig {
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
}

impl AzureAgentsConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            api_version: DEFAULT_AZURE_API_VERSION.to_string(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let endpoint = read("AZURE_AI_AGENTS_ENDPOINT")?;
        let api_key = read("AZURE_AI_AGENTS_API_KEY")?;
        let api_version = read("AZURE_AI_AGENTS_API_VERSION")
            .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string());
        Some(Self {
            endpoint,
            api_key,
            api_version,
        })
    }

    /// Reads are retried up to 3 attempts, 500 ms doubling, capped at 8 s.
    pub fn retry_policy() -> RetryPolicy {
        RetryPolicy::exponential(3, 500, 8_000)
    }

    pub fn transport(&self) -> ReqwestThreadsTransport {
        ReqwestThreadsTransport::new(
            self.endpoint.clone(),
            TransportAuth::ApiKeyHeader(self.api_key.clone()),
        )
        .query_param("api-version", self.api_version.clone())
        .retry_policy(Self::retry_policy())
    }
}

pub struct AzureAgentsAdapter {
    api: ThreadsApi,
    agents: AgentIdentityCache,
    configured: bool,
}

impl AzureAgentsAdapter {
    pub fn new(config: AzureAgentsConfig) -> Self {
        let configured = !config.endpoint.is_empty() && !config.api_key.is_empty();
        let mut adapter = Self::with_transport(Arc::new(config.transport()));
        adapter.configured = configured;
        adapter
    }

    pub fn with_transport(transport: Arc<dyn ThreadsTransport>) -> Self {
        Self {
            api: ThreadsApi::new(transport),
            agents: AgentIdentityCache::new(),
            configured: true,
        }
    }
}

#[async_trait]
impl ProviderAdapter for AzureAgentsAdapter {
    fn name(&self) -> &str {
        AZURE_PROVIDER
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
            "AZURE_AI_AGENTS_ENDPOINT and AZURE_AI_AGENTS_API_KEY must both be set",
        ))
    }

    async fn get_or_create_agent(
        &self,
        definition: &AgentDefinition,
    ) -> ProviderResult<AgentIdentity> {
        if definition.name.trim().is_empty() {
            return Err(ProviderError::configuration("agent name must not be empty"));
        }
        self.agents
            .resolve_provisioned(definition, AZURE_PROVIDER)
            .await
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

pub struct AzureAgentsFactory;

impl ProviderFactory for AzureAgentsFactory {
    fn provider_id(&self) -> &'static str {
        AZURE_PROVIDER
    }

    fn from_env(&self) -> Option<Arc<dyn ProviderAdapter>> {
        AzureAgentsConfig::from_env()
            .map(|config| Arc::new(AzureAgentsAdapter::new(config)) as Arc<dyn ProviderAdapter>)
    }
}
