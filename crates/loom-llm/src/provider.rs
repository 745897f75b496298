//! Provider adapter contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{ProviderError, ProviderResult};
use crate::types::{
    AgentDefinition, AgentIdentity, Message, MessageOrder, Metadata, Role, Run, Thread,
    ToolOutput,
};
use crate::usage::UsageReporting;

/// Thread, message and run primitives over one provider's transport.
///
/// Callers must not assume a universal message order; use
/// [`ProviderAdapter::message_order`] together with [`crate::newest_first`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn message_order(&self) -> MessageOrder;

    fn usage_reporting(&self) -> UsageReporting {
        UsageReporting::Delta
    }

    async fn is_configured(&self) -> bool;

    /// Fails fast when the adapter cannot be used.
    async fn ensure_ready(&self) -> ProviderResult<()> {
        if self.is_configured().await {
            return Ok(());
        }
        Err(ProviderError::configuration(format!(
            "provider '{}' is not configured",
            self.name()
        )))
    }

    async fn get_or_create_agent(
        &self,
        definition: &AgentDefinition,
    ) -> ProviderResult<AgentIdentity>;

    async fn create_thread(&self, metadata: Option<Metadata>) -> ProviderResult<Thread>;

    async fn retrieve_thread(&self, thread_id: &str) -> ProviderResult<Thread>;

    async fn add_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> ProviderResult<Message>;

    async fn list_messages(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> ProviderResult<Vec<Message>>;

    async fn create_run(&self, thread_id: &str, agent_id: &AgentIdentity) -> ProviderResult<Run>;

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> ProviderResult<Run>;

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> ProviderResult<Run>;

    async fn list_runs(&self, thread_id: &str, limit: Option<usize>) -> ProviderResult<Vec<Run>> {
        let _ = (thread_id, limit);
        Ok(Vec::new())
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> ProviderResult<Run> {
        Ok(Run::synthesized_cancelled(thread_id, run_id))
    }
}

/// Builds an adapter from environment configuration.
pub trait ProviderFactory: Send + Sync {
    fn provider_id(&self) -> &'static str;

    /// `None` when the environment carries no configuration for the provider.
    fn from_env(&self) -> Option<Arc<dyn ProviderAdapter>>;
}

/// Named adapters with a default.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new(
        providers: HashMap<String, Arc<dyn ProviderAdapter>>,
        default_provider: Option<String>,
    ) -> Self {
        Self {
            providers,
            default_provider,
        }
    }

    pub fn from_factories(factories: &[Arc<dyn ProviderFactory>]) -> Self {
        let mut registry = Self::default();
        for factory in factories {
            if let Some(adapter) = factory.from_env() {
                registry.register(adapter);
            }
        }
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn ProviderAdapter>) {
        let name = provider.name().to_string();
        if self.default_provider.is_none() {
            self.default_provider = Some(name.clone());
        }
        self.providers.insert(name, provider);
    }

    pub fn set_default_provider(&mut self, provider: impl Into<String>) {
        self.default_provider = Some(provider.into());
    }

    pub fn default_provider(&self) -> Option<&str> {
        self.default_provider.as_deref()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Resolves an explicit provider name, or the default when `None`.
    pub fn resolve(&self, provider: Option<&str>) -> ProviderResult<Arc<dyn ProviderAdapter>> {
        let name = match provider.map(str::trim).filter(|value| !value.is_empty()) {
            Some(name) => name.to_string(),
            None => self
                .default_provider
                .clone()
                .ok_or_else(|| ProviderError::configuration("no provider configured"))?,
        };
        self.providers.get(&name).cloned().ok_or_else(|| {
            ProviderError::configuration(format!("provider '{name}' is not registered"))
        })
    }
}
