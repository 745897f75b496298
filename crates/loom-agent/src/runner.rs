use crate::events::{EventSink, FanoutSink, MonitorRegistry};
use crate::poller::{RunAbortHandle, RunCompletion, RunPoller, Sleeper, TokioSleeper};
use crate::tools::{ToolBridge, ToolRegistry};
use crate::{AgentError, PollerConfig};
use loom_llm::{AgentDefinition, Metadata, ProviderAdapter, Role};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Runs listed when looking for a session's unfinished runs.
const STALE_RUN_SCAN_LIMIT: usize = 10;

type ThreadSlot = Arc<Mutex<Option<String>>>;

/// Maps caller sessions onto provider threads.
///
/// Each session owns its own slot, so thread creation only serializes turns of
/// the same session.
#[derive(Default)]
pub struct SessionThreads {
    slots: Mutex<HashMap<String, ThreadSlot>>,
}

impl SessionThreads {
    async fn slot(&self, session_id: &str) -> ThreadSlot {
        self.slots
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn get(&self, session_id: &str) -> Option<String> {
        let slot = self.slots.lock().await.get(session_id).cloned()?;
        slot.lock().await.clone()
    }

    pub async fn insert(&self, session_id: impl Into<String>, thread_id: impl Into<String>) {
        let session_id: String = session_id.into();
        let slot = self.slot(&session_id).await;
        *slot.lock().await = Some(thread_id.into());
    }

    pub async fn forget(&self, session_id: &str) -> Option<String> {
        let slot = self.slots.lock().await.remove(session_id)?;
        slot.lock().await.take()
    }
}

/// One user message in, one assistant answer out, against a single provider.
pub struct ConversationRunner {
    adapter: Arc<dyn ProviderAdapter>,
    tools: ToolBridge,
    config: PollerConfig,
    sleeper: Arc<dyn Sleeper>,
    monitors: MonitorRegistry,
    threads: SessionThreads,
}

impl ConversationRunner {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            adapter,
            tools: ToolBridge::new(tools),
            config: PollerConfig::default(),
            sleeper: Arc::new(TokioSleeper),
            monitors: MonitorRegistry::new(),
            threads: SessionThreads::default(),
        }
    }

    pub fn with_config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_monitors(mut self, monitors: MonitorRegistry) -> Self {
        self.monitors = monitors;
        self
    }

    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    pub fn monitors(&self) -> &MonitorRegistry {
        &self.monitors
    }

    pub fn threads(&self) -> &SessionThreads {
        &self.threads
    }

    /// Returns the session's thread, creating it on first use.
    pub async fn thread_for_session(&self, session_id: &str) -> Result<String, AgentError> {
        let slot = self.threads.slot(session_id).await;
        let mut entry = slot.lock().await;
        if let Some(thread_id) = entry.as_ref() {
            return Ok(thread_id.clone());
        }
        let metadata = Metadata::from([("session_id".to_string(), session_id.to_string())]);
        let thread = self.adapter.create_thread(Some(metadata)).await?;
        info!(session_id, thread_id = %thread.id, provider = self.adapter.name(), "thread created");
        *entry = Some(thread.id.clone());
        Ok(thread.id)
    }

    pub async fn send_message(
        &self,
        session_id: &str,
        agent: &AgentDefinition,
        content: &str,
        sink: Arc<dyn EventSink>,
        abort: Option<RunAbortHandle>,
    ) -> Result<RunCompletion, AgentError> {
        self.adapter.ensure_ready().await?;
        let agent_id = self.adapter.get_or_create_agent(agent).await?;
        let thread_id = self.thread_for_session(session_id).await?;
        self.cancel_stale_runs(&thread_id).await;

        self.adapter
            .add_message(&thread_id, Role::User, content)
            .await?;
        let run = self.adapter.create_run(&thread_id, &agent_id).await?;
        info!(session_id, thread_id = %thread_id, run_id = %run.id, agent = %agent.name, "run started");

        let mut poller = RunPoller::new(self.adapter.clone())
            .with_tools(self.tools.clone())
            .with_config(self.config.clone())
            .with_sleeper(self.sleeper.clone())
            .with_session_id(session_id);
        if let Some(abort) = abort {
            poller = poller.with_abort_handle(abort);
        }
        let fanout = FanoutSink::new(session_id, sink, self.monitors.clone());
        poller
            .wait_for_run_completion(&thread_id, &run.id, Some(&fanout))
            .await
    }

    /// Cancels unfinished runs an earlier turn left on the thread.
    async fn cancel_stale_runs(&self, thread_id: &str) {
        let runs = match self
            .adapter
            .list_runs(thread_id, Some(STALE_RUN_SCAN_LIMIT))
            .await
        {
            Ok(runs) => runs,
            Err(error) => {
                warn!(thread_id, %error, "could not list runs before starting a new one");
                return;
            }
        };
        for run in runs.into_iter().filter(|run| !run.is_terminal()) {
            match self.adapter.cancel_run(thread_id, &run.id).await {
                Ok(_) => info!(thread_id, run_id = %run.id, "cancelled stale run"),
                Err(error) => warn!(thread_id, run_id = %run.id, %error, "stale run cancel failed"),
            }
        }
    }
}
