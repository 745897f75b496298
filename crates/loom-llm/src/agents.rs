//! Agent identity reconciliation.
//!
//! The cache keeps the last definition written for each agent name so that a
//! message turn with an unchanged agent costs no registry traffic at all.

use crate::errors::{ProviderError, ProviderResult};
use crate::types::{AgentDefinition, AgentIdentity, CachedAgentDescriptor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry holding agent definitions on the provider side.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn find_by_name(&self, name: &str) -> ProviderResult<Option<CachedAgentDescriptor>>;

    async fn create(&self, definition: &AgentDefinition) -> ProviderResult<AgentIdentity>;

    async fn update(
        &self,
        identity: &AgentIdentity,
        definition: &AgentDefinition,
    ) -> ProviderResult<AgentIdentity>;
}

type Slot = Arc<tokio::sync::Mutex<Option<CachedAgentDescriptor>>>;

#[derive(Clone, Default)]
pub struct AgentIdentityCache {
    entries: Arc<Mutex<HashMap<String, Slot>>>,
}

impl AgentIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: &str) -> ProviderResult<Slot> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ProviderError::InvalidState("agent cache mutex poisoned".to_string()))?;
        Ok(entries.entry(name.to_string()).or_default().clone())
    }

    /// Returns a stable identity for `definition`, writing to `registry` only
    /// when the definition differs from what the registry already holds.
    pub async fn reconcile(
        &self,
        definition: &AgentDefinition,
        registry: &dyn AgentRegistry,
    ) -> ProviderResult<AgentIdentity> {
        if definition.name.trim().is_empty() {
            return Err(ProviderError::configuration("agent name must not be empty"));
        }

        let slot = self.slot(&definition.name)?;
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if cached.matches(definition) {
                debug!(agent = %definition.name, identity = %cached.identity, "agent cache hit");
                return Ok(cached.identity.clone());
            }
            let identity = registry.update(&cached.identity, definition).await?;
            info!(agent = %definition.name, identity = %identity, "agent definition changed; updated");
            *entry = Some(CachedAgentDescriptor::from_definition(
                definition,
                identity.clone(),
            ));
            return Ok(identity);
        }

        let identity = match registry.find_by_name(&definition.name).await? {
            Some(existing) if existing.matches(definition) => {
                debug!(agent = %definition.name, identity = %existing.identity, "agent found in registry");
                existing.identity
            }
            Some(existing) => {
                let identity = registry.update(&existing.identity, definition).await?;
                info!(agent = %definition.name, identity = %identity, "registry agent out of date; updated");
                identity
            }
            None => {
                let identity = registry.create(definition).await?;
                info!(agent = %definition.name, identity = %identity, "agent created");
                identity
            }
        };

        *entry = Some(CachedAgentDescriptor::from_definition(
            definition,
            identity.clone(),
        ));
        Ok(identity)
    }

    /// Resolves an agent whose registry is managed out of band.
    ///
    /// Falls back to the agent name when no provisioned identity was given.
    pub async fn resolve_provisioned(
        &self,
        definition: &AgentDefinition,
        provider: &str,
    ) -> ProviderResult<AgentIdentity> {
        let slot = self.slot(&definition.name)?;
        let mut entry = slot.lock().await;
        if let Some(cached) = entry.as_ref() {
            if cached.matches(definition) && definition.remote_id.is_none() {
                return Ok(cached.identity.clone());
            }
        }

        let identity = match definition
            .remote_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            Some(remote_id) => AgentIdentity::new(remote_id),
            None => {
                warn!(
                    provider,
                    agent = %definition.name,
                    "no pre-provisioned agent id configured; agents for this provider are \
                     managed out of band, falling back to the agent name as its identity"
                );
                AgentIdentity::new(definition.name.clone())
            }
        };

        *entry = Some(CachedAgentDescriptor::from_definition(
            definition,
            identity.clone(),
        ));
        Ok(identity)
    }

    pub async fn get(&self, name: &str) -> ProviderResult<Option<CachedAgentDescriptor>> {
        let slot = {
            let entries = self
                .entries
                .lock()
                .map_err(|_| ProviderError::InvalidState("agent cache mutex poisoned".to_string()))?;
            entries.get(name).cloned()
        };
        match slot {
            Some(slot) => Ok(slot.lock().await.clone()),
            None => Ok(None),
        }
    }

    pub fn forget(&self, name: &str) -> ProviderResult<bool> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ProviderError::InvalidState("agent cache mutex poisoned".to_string()))?;
        Ok(entries.remove(name).is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process registry for providers without a remote agent registry.
#[derive(Clone, Default)]
pub struct LocalAgentRegistry {
    agents: Arc<Mutex<HashMap<String, CachedAgentDescriptor>>>,
}

impl LocalAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_by_identity(&self, identity: &str) -> ProviderResult<CachedAgentDescriptor> {
        let agents = self.lock()?;
        agents
            .values()
            .find(|agent| agent.identity.as_str() == identity)
            .cloned()
            .ok_or_else(|| ProviderError::not_found("agent", identity))
    }

    fn lock(
        &self,
    ) -> ProviderResult<std::sync::MutexGuard<'_, HashMap<String, CachedAgentDescriptor>>> {
        self.agents
            .lock()
            .map_err(|_| ProviderError::InvalidState("local agent registry mutex poisoned".to_string()))
    }
}

#[async_trait]
impl AgentRegistry for LocalAgentRegistry {
    async fn find_by_name(&self, name: &str) -> ProviderResult<Option<CachedAgentDescriptor>> {
        Ok(self.lock()?.get(name).cloned())
    }

    async fn create(&self, definition: &AgentDefinition) -> ProviderResult<AgentIdentity> {
        let identity = AgentIdentity::new(format!("local-agent-{}", Uuid::new_v4()));
        self.lock()?.insert(
            definition.name.clone(),
            CachedAgentDescriptor::from_definition(definition, identity.clone()),
        );
        Ok(identity)
    }

    async fn update(
        &self,
        identity: &AgentIdentity,
        definition: &AgentDefinition,
    ) -> ProviderResult<AgentIdentity> {
        let mut agents = self.lock()?;
        let known = agents
            .values()
            .any(|agent| &agent.identity == identity);
        if !known {
            return Err(ProviderError::not_found("agent", identity.as_str()));
        }
        agents.retain(|_, agent| &agent.identity != identity);
        agents.insert(
            definition.name.clone(),
            CachedAgentDescriptor::from_definition(definition, identity.clone()),
        );
        Ok(identity.clone())
    }
}
