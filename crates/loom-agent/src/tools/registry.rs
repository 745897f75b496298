use crate::AgentError;
use crate::tools::ToolError;
use loom_llm::ToolDefinition;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>;
pub type ToolExecutor = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub executor: ToolExecutor,
}

impl RegisteredTool {
    pub fn from_fn<F, Fut>(definition: ToolDefinition, executor: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        Self {
            definition,
            executor: Arc::new(move |args| Box::pin(executor(args))),
        }
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: RegisteredTool) {
        self.tools.insert(tool.definition.name.clone(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> Option<RegisteredTool> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| tool.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Resolves an agent's tool permissions to definitions, in the given order.
    pub fn definitions_for<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<ToolDefinition>, AgentError> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.get(name)
                    .map(|tool| tool.definition.clone())
                    .ok_or_else(|| AgentError::UnknownTool(name.to_string()))
            })
            .collect()
    }
}
