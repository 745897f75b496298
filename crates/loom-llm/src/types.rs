use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::ops::{Add, AddAssign};
use std::time::{SystemTime, UNIX_EPOCH};

pub type Timestamp = u64;
pub type Metadata = HashMap<String, String>;

pub fn current_timestamp() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub created_at: Timestamp,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: Timestamp,
    /// Run that authored the message, when the provider reports one.
    #[serde(default)]
    pub run_id: Option<String>,
}

impl Message {
    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

/// Native ordering of a provider's message listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageOrder {
    NewestFirst,
    OldestFirst,
}

/// Reorders a provider page so the newest message comes first.
///
/// Messages are sorted by `created_at`; messages sharing a timestamp keep the
/// relative order implied by the provider's native ordering.
pub fn newest_first(mut messages: Vec<Message>, order: MessageOrder) -> Vec<Message> {
    if order == MessageOrder::OldestFirst {
        messages.reverse();
    }
    messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    messages
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: &RunStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }

        match self {
            Self::Queued => matches!(next, Self::InProgress | Self::RequiresAction),
            Self::InProgress => matches!(next, Self::RequiresAction),
            Self::RequiresAction => matches!(next, Self::InProgress),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub thread_id: String,
    pub agent_id: String,
    pub status: RunStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
    pub cancelled_at: Option<Timestamp>,
    pub last_error: Option<RunError>,
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub required_action: Vec<ToolCall>,
}

impl Run {
    pub fn queued(
        id: impl Into<String>,
        thread_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            agent_id: agent_id.into(),
            status: RunStatus::Queued,
            created_at: current_timestamp(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            last_error: None,
            usage: None,
            required_action: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the run forward, stamping lifecycle timestamps.
    ///
    /// Returns `false` and leaves the run untouched when the move would go
    /// backwards through the state machine.
    pub fn transition_to(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(&next) {
            return false;
        }
        let now = current_timestamp();
        match next {
            RunStatus::InProgress => {
                self.started_at.get_or_insert(now);
            }
            RunStatus::Completed => self.completed_at = Some(now),
            RunStatus::Cancelled => self.cancelled_at = Some(now),
            RunStatus::Failed => self.failed_at = Some(now),
            RunStatus::Queued | RunStatus::RequiresAction => {}
        }
        if next != RunStatus::RequiresAction {
            self.required_action.clear();
        }
        if next != RunStatus::Failed {
            self.last_error = None;
        }
        self.status = next;
        true
    }

    pub fn fail(&mut self, code: impl Into<String>, message: impl Into<String>) -> bool {
        if !self.transition_to(RunStatus::Failed) {
            return false;
        }
        self.last_error = Some(RunError {
            code: code.into(),
            message: message.into(),
        });
        true
    }

    /// Terminal run used by providers without native cancellation.
    pub fn synthesized_cancelled(thread_id: &str, run_id: &str) -> Self {
        let mut run = Self::queued(run_id, thread_id, "");
        run.transition_to(RunStatus::Cancelled);
        run
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    pub raw_arguments: String,
    pub arguments: Value,
}

impl ToolCall {
    /// Builds a tool call, parsing arguments best-effort.
    ///
    /// Unparseable arguments are wrapped as `{"raw": <raw string>}`.
    pub fn new(
        id: impl Into<String>,
        function_name: impl Into<String>,
        raw_arguments: impl Into<String>,
    ) -> Self {
        let raw_arguments = raw_arguments.into();
        let arguments = parse_arguments(&raw_arguments);
        Self {
            id: id.into(),
            function_name: function_name.into(),
            raw_arguments,
            arguments,
        }
    }

    pub fn from_value(
        id: impl Into<String>,
        function_name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self {
            id: id.into(),
            function_name: function_name.into(),
            raw_arguments: arguments.to_string(),
            arguments,
        }
    }
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| serde_json::json!({ "raw": raw }))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub instructions: String,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    pub model: String,
    /// Identity assigned out of band, for registries this engine cannot write.
    #[serde(default)]
    pub remote_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentIdentity(pub String);

impl AgentIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedAgentDescriptor {
    pub name: String,
    pub instructions: String,
    pub tools: Vec<ToolDefinition>,
    pub model: String,
    pub identity: AgentIdentity,
}

impl CachedAgentDescriptor {
    pub fn from_definition(definition: &AgentDefinition, identity: AgentIdentity) -> Self {
        Self {
            name: definition.name.clone(),
            instructions: definition.instructions.clone(),
            tools: definition.tools.clone(),
            model: definition.model.clone(),
            identity,
        }
    }

    /// Structural comparison against a desired definition.
    ///
    /// Tool lists compare as sets: order does not matter.
    pub fn matches(&self, definition: &AgentDefinition) -> bool {
        self.instructions == definition.instructions
            && self.model == definition.model
            && same_tool_set(&self.tools, &definition.tools)
    }
}

pub fn same_tool_set(left: &[ToolDefinition], right: &[ToolDefinition]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut left: Vec<&ToolDefinition> = left.iter().collect();
    let mut right: Vec<&ToolDefinition> = right.iter().collect();
    left.sort_by(|a, b| a.name.cmp(&b.name));
    right.sort_by(|a, b| a.name.cmp(&b.name));
    left == right
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
