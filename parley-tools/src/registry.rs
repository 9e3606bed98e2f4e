use crate::error::ToolError;
use crate::traits::Tool;
use async_trait::async_trait;
use parley_llm::{ToolCallResult, ToolExecutionError, ToolExecutor};
use std::collections::HashMap;
use std::sync::Arc;

/// Name-keyed tool dispatch; the concrete `ToolExecutor` handed to the
/// gateway's orchestrator.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.spec().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<ToolCallResult, ToolExecutionError> {
        let Some(tool) = self.tools.get(name) else {
            let e = ToolError::UnknownTool(name.to_string());
            return Err(ToolExecutionError(e.to_string()));
        };
        let content = tool
            .execute(arguments)
            .await
            .map_err(|e| ToolExecutionError(e.to_string()))?;
        Ok(ToolCallResult { content })
    }
}
