use crate::error::Result;
use crate::types::{
    GenerationRequest, GenerationResponse, StreamChunk, ToolCallRequest, ToolDefinition,
};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// Lazy, forward-only chunk sequence. Once exhausted or errored it is
/// never resumed; a mid-stream failure is the final item.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Result of a tool-aware generation round: the canonical response plus
/// any tool invocations the provider asked for.
pub struct ToolExchange {
    pub response: GenerationResponse,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Translation layer for one provider's wire format.
///
/// Adapters borrow the pooled client for the duration of a single
/// native call and never own or close it. They translate failures into
/// the gateway taxonomy and never retry.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider identifier used for pool and registry keys.
    fn id(&self) -> &str;

    /// Model used when the request does not name one.
    fn default_model(&self) -> &str;

    /// Whether this provider's protocol carries tool calls.
    fn supports_tools(&self) -> bool {
        false
    }

    /// One network call, one canonical response.
    async fn generate(
        &self,
        request: &GenerationRequest,
        http: &reqwest::Client,
    ) -> Result<GenerationResponse>;

    /// One network call requesting incremental delivery. Chunks arrive
    /// in provider order and are pulled lazily.
    async fn stream(
        &self,
        request: &GenerationRequest,
        http: &reqwest::Client,
    ) -> Result<ChunkStream>;

    /// Tool-aware generation. The default ignores the declared tools,
    /// for providers without tool support.
    async fn generate_with_tools(
        &self,
        request: &GenerationRequest,
        _tools: &[ToolDefinition],
        http: &reqwest::Client,
    ) -> Result<ToolExchange> {
        Ok(ToolExchange {
            response: self.generate(request, http).await?,
            tool_calls: Vec::new(),
        })
    }
}

/// `request.model` wins over the adapter default.
pub fn resolve_model(request: &GenerationRequest, default_model: &str) -> String {
    request
        .model
        .clone()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| default_model.to_string())
}
