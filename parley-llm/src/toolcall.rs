use crate::adapter::ProviderAdapter;
use crate::error::Result;
use crate::types::{
    GenerationRequest, GenerationResponse, Message, Role, ToolCallResult, ToolDefinition,
};
use async_trait::async_trait;
use thiserror::Error;

/// Failure inside an external capability. Swallowed by the
/// orchestrator: the exchange degrades to an empty tool result instead
/// of aborting.
#[derive(Debug, Error)]
#[error("tool execution failed: {0}")]
pub struct ToolExecutionError(pub String);

/// Injected external capability. Callable concurrently; expected to
/// complete within the same timeout envelope as provider calls.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> std::result::Result<ToolCallResult, ToolExecutionError>;
}

/// Tool support is model-specific, not provider-wide: a model is
/// eligible only if its name contains one of the configured patterns.
#[derive(Debug, Clone, Default)]
pub struct ToolUsePolicy {
    patterns: Vec<String>,
}

impl ToolUsePolicy {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns: patterns.into_iter().map(|p| p.to_ascii_lowercase()).collect(),
        }
    }

    pub fn allows(&self, model: &str) -> bool {
        let model = model.to_ascii_lowercase();
        self.patterns.iter().any(|p| model.contains(p))
    }
}

/// Runs the bounded two-step tool protocol: one tool-aware call, the
/// declared capabilities executed in order, one follow-up call with
/// tools omitted. Never more than one extra round trip.
pub struct ToolCallOrchestrator {
    executor: std::sync::Arc<dyn ToolExecutor>,
    tool: ToolDefinition,
}

impl ToolCallOrchestrator {
    pub fn new(executor: std::sync::Arc<dyn ToolExecutor>, tool: ToolDefinition) -> Self {
        Self { executor, tool }
    }

    #[tracing::instrument(level = "info", skip_all, fields(tool = %self.tool.name))]
    pub async fn run(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &GenerationRequest,
        http: &reqwest::Client,
    ) -> Result<GenerationResponse> {
        let tools = std::slice::from_ref(&self.tool);
        let exchange = adapter.generate_with_tools(request, tools, http).await?;

        if exchange.tool_calls.is_empty() {
            // Common path: single round trip, no capability invoked.
            return Ok(exchange.response);
        }

        let mut results = Vec::with_capacity(exchange.tool_calls.len());
        for call in &exchange.tool_calls {
            match self.executor.execute(&call.name, &call.arguments).await {
                Ok(result) => results.push(result.content),
                Err(e) => {
                    tracing::warn!(tool = %call.name, error = %e, "tool failed, substituting empty result");
                    results.push(String::new());
                }
            }
        }

        // Re-issue with the assistant's partial turn and the tool
        // results appended; tools are omitted, so a second tool request
        // cannot start another round.
        let mut followup = request.clone();
        followup
            .messages
            .push(Message::new(Role::Assistant, exchange.response.message.content.clone()));
        followup
            .messages
            .push(Message::new(Role::System, results.join("\n\n")));

        adapter.generate(&followup, http).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ChunkStream, ToolExchange};
    use crate::types::{GenerationRequest, ToolCallRequest, Usage};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedAdapter {
        // Tool calls returned by every tool-aware round. The follow-up
        // round goes through `generate`, which carries no tools, so a
        // scripted adapter that always wants tools still cannot force a
        // third call.
        tool_calls: Vec<ToolCallRequest>,
        calls: AtomicUsize,
        seen_followups: std::sync::Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedAdapter {
        fn new(tool_calls: Vec<ToolCallRequest>) -> Self {
            Self {
                tool_calls,
                calls: AtomicUsize::new(0),
                seen_followups: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn response(content: &str) -> GenerationResponse {
            GenerationResponse {
                message: Message::new(Role::Assistant, content),
                model: "scripted".to_string(),
                usage: Some(Usage {
                    prompt_tokens: Some(1),
                    completion_tokens: Some(1),
                    total_tokens: Some(2),
                }),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn id(&self) -> &str {
            "scripted"
        }

        fn default_model(&self) -> &str {
            "scripted"
        }

        fn supports_tools(&self) -> bool {
            true
        }

        async fn generate(
            &self,
            request: &GenerationRequest,
            _http: &reqwest::Client,
        ) -> Result<GenerationResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_followups.lock().unwrap().push(request.clone());
            Ok(Self::response(&format!("final-{n}")))
        }

        async fn stream(
            &self,
            _request: &GenerationRequest,
            _http: &reqwest::Client,
        ) -> Result<ChunkStream> {
            unimplemented!("not used by orchestrator tests")
        }

        async fn generate_with_tools(
            &self,
            _request: &GenerationRequest,
            _tools: &[ToolDefinition],
            _http: &reqwest::Client,
        ) -> Result<ToolExchange> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ToolExchange {
                response: Self::response("partial"),
                tool_calls: self.tool_calls.clone(),
            })
        }
    }

    struct RecordingExecutor {
        fail: bool,
        executed: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolExecutor for RecordingExecutor {
        async fn execute(
            &self,
            name: &str,
            arguments: &serde_json::Value,
        ) -> std::result::Result<ToolCallResult, ToolExecutionError> {
            self.executed.lock().unwrap().push(name.to_string());
            if self.fail {
                return Err(ToolExecutionError("boom".to_string()));
            }
            Ok(ToolCallResult {
                content: format!("{name}:{}", arguments["query"].as_str().unwrap_or("")),
            })
        }
    }

    fn tool_def() -> ToolDefinition {
        ToolDefinition {
            name: "web_search".to_string(),
            description: "search".to_string(),
            parameters: json!({"type": "object"}),
        }
    }

    fn user_request() -> GenerationRequest {
        GenerationRequest::new(vec![Message::new(Role::User, "look this up")])
    }

    fn search_call() -> ToolCallRequest {
        ToolCallRequest {
            name: "web_search".to_string(),
            arguments: json!({"query": "rust"}),
        }
    }

    #[tokio::test]
    async fn no_tool_calls_means_single_round_trip() {
        let adapter = ScriptedAdapter::new(vec![]);
        let executor = Arc::new(RecordingExecutor {
            fail: false,
            executed: std::sync::Mutex::new(Vec::new()),
        });
        let orchestrator = ToolCallOrchestrator::new(executor.clone(), tool_def());

        let http = reqwest::Client::new();
        let response = orchestrator
            .run(&adapter, &user_request(), &http)
            .await
            .unwrap();

        assert_eq!(response.message.content, "partial");
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert!(executor.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tool_call_round_trip_performs_exactly_two_adapter_calls() {
        let adapter = ScriptedAdapter::new(vec![search_call()]);
        let executor = Arc::new(RecordingExecutor {
            fail: false,
            executed: std::sync::Mutex::new(Vec::new()),
        });
        let orchestrator = ToolCallOrchestrator::new(executor.clone(), tool_def());

        let http = reqwest::Client::new();
        let request = user_request();
        let response = orchestrator.run(&adapter, &request, &http).await.unwrap();

        assert_eq!(response.message.content, "final-1");
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*executor.executed.lock().unwrap(), vec!["web_search"]);

        // Input request is never mutated.
        assert_eq!(request.messages.len(), 1);

        // The follow-up carries the partial assistant turn plus the
        // synthesized tool-result message.
        let followups = adapter.seen_followups.lock().unwrap();
        let followup = &followups[0];
        assert_eq!(followup.messages.len(), 3);
        assert_eq!(followup.messages[1].role, Role::Assistant);
        assert_eq!(followup.messages[1].content, "partial");
        assert_eq!(followup.messages[2].role, Role::System);
        assert_eq!(followup.messages[2].content, "web_search:rust");
    }

    #[tokio::test]
    async fn failed_tool_degrades_to_empty_result() {
        let adapter = ScriptedAdapter::new(vec![search_call()]);
        let executor = Arc::new(RecordingExecutor {
            fail: true,
            executed: std::sync::Mutex::new(Vec::new()),
        });
        let orchestrator = ToolCallOrchestrator::new(executor, tool_def());

        let http = reqwest::Client::new();
        let response = orchestrator
            .run(&adapter, &user_request(), &http)
            .await
            .unwrap();

        // The exchange completes despite the capability failure.
        assert_eq!(response.message.content, "final-1");
        let followups = adapter.seen_followups.lock().unwrap();
        assert_eq!(followups[0].messages[2].content, "");
    }

    #[test]
    fn tool_policy_matches_case_insensitive_substrings() {
        let policy = ToolUsePolicy::new(vec!["llama".to_string(), "gpt-oss".to_string()]);
        assert!(policy.allows("Llama3.1:8b"));
        assert!(policy.allows("gpt-oss-20b"));
        assert!(!policy.allows("qwen2.5"));
        assert!(!ToolUsePolicy::default().allows("llama3.1"));
    }
}
