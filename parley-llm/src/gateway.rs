use crate::adapter::{ChunkStream, ProviderAdapter, resolve_model};
use crate::error::{GatewayError, Result};
use crate::pool::ClientManager;
use crate::toolcall::{ToolCallOrchestrator, ToolUsePolicy};
use crate::types::{GenerationRequest, GenerationResponse, UsageRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Optional per-request accounting collaborator. Must not block.
pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Single entry point over the registered provider adapters.
///
/// Selects an adapter by the request's provider override or the
/// process-wide default, validates before any network call, and never
/// mutates the input request.
pub struct Gateway {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    pool: Arc<ClientManager>,
    default_provider: String,
    tool_policy: ToolUsePolicy,
    orchestrator: Option<ToolCallOrchestrator>,
    usage_sink: Option<Arc<dyn UsageSink>>,
}

impl Gateway {
    pub fn new(
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        pool: Arc<ClientManager>,
        default_provider: impl Into<String>,
    ) -> Self {
        let adapters = adapters
            .into_iter()
            .map(|a| (a.id().to_string(), a))
            .collect();
        Self {
            adapters,
            pool,
            default_provider: default_provider.into(),
            tool_policy: ToolUsePolicy::default(),
            orchestrator: None,
            usage_sink: None,
        }
    }

    pub fn with_tool_support(
        mut self,
        orchestrator: ToolCallOrchestrator,
        policy: ToolUsePolicy,
    ) -> Self {
        self.orchestrator = Some(orchestrator);
        self.tool_policy = policy;
        self
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    pub fn providers(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    fn select_adapter(&self, request: &GenerationRequest) -> Result<&Arc<dyn ProviderAdapter>> {
        let id = request
            .provider
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.default_provider);
        self.adapters
            .get(id)
            .ok_or_else(|| GatewayError::Configuration(format!("unknown provider: {id}")))
    }

    fn tool_eligible(&self, adapter: &dyn ProviderAdapter, request: &GenerationRequest) -> bool {
        request.tool_use_enabled
            && adapter.supports_tools()
            && self
                .tool_policy
                .allows(&resolve_model(request, adapter.default_model()))
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider, model))]
    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        request.validate()?;
        let adapter = self.select_adapter(request)?;
        tracing::Span::current().record("provider", adapter.id());
        tracing::Span::current().record(
            "model",
            resolve_model(request, adapter.default_model()).as_str(),
        );

        let http = self.pool.acquire(adapter.id())?;
        let started = Instant::now();

        let response = match self.orchestrator.as_ref() {
            Some(orchestrator) if self.tool_eligible(adapter.as_ref(), request) => {
                orchestrator.run(adapter.as_ref(), request, &http).await?
            }
            _ => adapter.generate(request, &http).await?,
        };

        if let Some(sink) = self.usage_sink.as_ref() {
            sink.record(UsageRecord::from_response(&response, started.elapsed()));
        }

        Ok(response)
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider))]
    pub async fn stream(&self, request: &GenerationRequest) -> Result<ChunkStream> {
        request.validate()?;
        let adapter = self.select_adapter(request)?;
        tracing::Span::current().record("provider", adapter.id());

        let http = self.pool.acquire(adapter.id())?;
        adapter.stream(request, &http).await
    }
}
