use crate::AgentError;
use loom_llm::{RunStatus, Timestamp, ToolCall, current_timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEventKind {
    AssistantMessage {
        run_id: String,
        message_id: String,
        content: String,
    },
    ToolCallsRequested {
        run_id: String,
        calls: Vec<ToolCall>,
    },
    ActionStart {
        call_id: String,
        function: String,
        arguments: Value,
    },
    ToolCallResult {
        call_id: String,
        function: String,
        arguments: Value,
        result_preview: String,
        execution_time_ms: u64,
        success: bool,
    },
    ActionComplete {
        run_id: String,
        status: RunStatus,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: String,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub kind: ProgressEventKind,
}

impl ProgressEvent {
    pub fn new(session_id: impl Into<String>, kind: ProgressEventKind) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: current_timestamp(),
            kind,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self.kind {
            ProgressEventKind::AssistantMessage { .. } => "assistant_message",
            ProgressEventKind::ToolCallsRequested { .. } => "tool_calls_requested",
            ProgressEventKind::ActionStart { .. } => "action_start",
            ProgressEventKind::ToolCallResult { .. } => "tool_call_result",
            ProgressEventKind::ActionComplete { .. } => "action_complete",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent) -> Result<(), AgentError>;
}

/// Emits to an optional sink; delivery failures are logged, never raised.
pub(crate) fn deliver(sink: Option<&dyn EventSink>, event: ProgressEvent) {
    let Some(sink) = sink else {
        return;
    };
    if let Err(error) = sink.emit(&event) {
        warn!(event = event.event_name(), %error, "progress event not delivered");
    }
}

#[derive(Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &ProgressEvent) -> Result<(), AgentError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct BufferedEventSink {
    inner: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl BufferedEventSink {
    pub fn snapshot(&self) -> Vec<ProgressEvent> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl EventSink for BufferedEventSink {
    fn emit(&self, event: &ProgressEvent) -> Result<(), AgentError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| AgentError::Event("buffered sink mutex poisoned".to_string()))?;
        guard.push(event.clone());
        Ok(())
    }
}

pub type ProgressEventSender = mpsc::UnboundedSender<ProgressEvent>;
pub type ProgressEventReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

pub fn progress_event_channel() -> (ProgressEventSender, ProgressEventReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Clone)]
pub struct ChannelEventSink {
    sender: ProgressEventSender,
}

impl ChannelEventSink {
    pub fn new(sender: ProgressEventSender) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: &ProgressEvent) -> Result<(), AgentError> {
        self.sender
            .send(event.clone())
            .map_err(|_| AgentError::Event("progress receiver dropped".to_string()))
    }
}

type MonitorTable = HashMap<String, HashMap<String, ProgressEventSender>>;

/// Passive observers of other sessions' progress.
///
/// A monitor only receives events emitted after it subscribed.
#[derive(Clone, Default)]
pub struct MonitorRegistry {
    inner: Arc<Mutex<MonitorTable>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MonitorTable> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribes `monitor_id` to `session_id`, replacing any previous
    /// subscription with the same id.
    pub fn subscribe(
        &self,
        session_id: impl Into<String>,
        monitor_id: impl Into<String>,
    ) -> ProgressEventReceiver {
        let (sender, receiver) = progress_event_channel();
        self.lock()
            .entry(session_id.into())
            .or_default()
            .insert(monitor_id.into(), sender);
        receiver
    }

    pub fn unsubscribe(&self, session_id: &str, monitor_id: &str) -> bool {
        let mut table = self.lock();
        let Some(monitors) = table.get_mut(session_id) else {
            return false;
        };
        let removed = monitors.remove(monitor_id).is_some();
        if monitors.is_empty() {
            table.remove(session_id);
        }
        removed
    }

    pub fn subscriptions(&self, session_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .get(session_id)
            .map(|monitors| monitors.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Delivers to every live monitor of `session_id` and drops closed ones.
    pub fn broadcast(&self, session_id: &str, event: &ProgressEvent) -> usize {
        let mut table = self.lock();
        let Some(monitors) = table.get_mut(session_id) else {
            return 0;
        };
        monitors.retain(|_, sender| sender.send(event.clone()).is_ok());
        let delivered = monitors.len();
        if monitors.is_empty() {
            table.remove(session_id);
        }
        delivered
    }
}

/// Delivers to the primary sink first, then to the session's monitors.
#[derive(Clone)]
pub struct FanoutSink {
    session_id: String,
    primary: Arc<dyn EventSink>,
    monitors: MonitorRegistry,
}

impl FanoutSink {
    pub fn new(
        session_id: impl Into<String>,
        primary: Arc<dyn EventSink>,
        monitors: MonitorRegistry,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            primary,
            monitors,
        }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &ProgressEvent) -> Result<(), AgentError> {
        let primary = self.primary.emit(event);
        self.monitors.broadcast(&self.session_id, event);
        primary
    }
}
