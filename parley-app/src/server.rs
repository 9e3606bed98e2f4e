//! Parley server wiring.
//!
//! Builds the gateway from configuration, mounts the chat routes, and
//! owns process lifecycle (bind, graceful shutdown, pool drain).

use crate::agent::ChatAgent;
use crate::config::AppConfig;
use crate::routes;
use anyhow::{Context, Result, bail};
use axum::Extension;
use axum::http::Request;
use axum::response::Response;
use parley_llm::{
    AnthropicAdapter, ClientManager, Gateway, OllamaAdapter, OpenAiAdapter, ProviderAdapter,
    ToolCallOrchestrator, ToolUsePolicy, UsageRecord, UsageSink,
};
use parley_tools::{SearchTool, ToolRegistry, to_tool_definition};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub agent: ChatAgent,
    pub pool: Arc<ClientManager>,
}

/// Accounting sink that writes one structured line per completed
/// generation. Counters the provider omitted log as absent, not zero.
struct LogUsageSink;

impl UsageSink for LogUsageSink {
    fn record(&self, record: UsageRecord) {
        tracing::info!(
            model = %record.model,
            prompt_tokens = ?record.prompt_tokens,
            completion_tokens = ?record.completion_tokens,
            total_tokens = ?record.total_tokens,
            response_time_ms = record.response_time.as_millis() as u64,
            "usage recorded"
        );
    }
}

/// Register one adapter per configured provider. Credentialed backends
/// join only when a key is present; Ollama needs none and always joins.
pub fn build_gateway(cfg: &AppConfig, pool: Arc<ClientManager>) -> Result<Gateway> {
    let mut adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::new();

    if let Some(key) = cfg.keys.openai_api_key.as_ref() {
        let mut adapter = OpenAiAdapter::new(key.clone(), cfg.providers.openai.model.clone());
        if let Some(url) = cfg.providers.openai.base_url.as_deref() {
            adapter = adapter.with_base_url(url);
        }
        adapters.push(Arc::new(adapter));
    }
    if let Some(key) = cfg.keys.anthropic_api_key.as_ref() {
        let mut adapter =
            AnthropicAdapter::new(key.clone(), cfg.providers.anthropic.model.clone());
        if let Some(url) = cfg.providers.anthropic.base_url.as_deref() {
            adapter = adapter.with_base_url(url);
        }
        adapters.push(Arc::new(adapter));
    }
    adapters.push(Arc::new(
        OllamaAdapter::new(cfg.providers.ollama.model.clone())
            .with_base_url(cfg.providers.ollama.base_url.clone()),
    ));

    let registered: Vec<String> = adapters.iter().map(|a| a.id().to_string()).collect();
    if !registered.contains(&cfg.general.default_provider) {
        bail!(
            "default provider {:?} has no registered adapter (configured: {registered:?}); \
             is its API key set?",
            cfg.general.default_provider
        );
    }

    let mut gateway = Gateway::new(adapters, pool, cfg.general.default_provider.clone())
        .with_usage_sink(Arc::new(LogUsageSink));

    if cfg.tools.web_search {
        let Some(key) = cfg.keys.exa_api_key.as_ref() else {
            bail!("tools.web_search is enabled but no Exa API key is configured");
        };
        let search = Arc::new(SearchTool::new(key.clone()));
        let definition = to_tool_definition(search.as_ref());
        let mut registry = ToolRegistry::new();
        registry.register(search);
        gateway = gateway.with_tool_support(
            ToolCallOrchestrator::new(Arc::new(registry), definition),
            ToolUsePolicy::new(cfg.tools.tool_models.clone()),
        );
        tracing::info!("web_search tool registered");
    }

    Ok(gateway)
}

pub async fn serve(config_path: &Path) -> Result<()> {
    let cfg = AppConfig::load(config_path)?;
    let pool = Arc::new(ClientManager::new(cfg.pool()));
    let gateway = build_gateway(&cfg, pool.clone())?;
    tracing::info!(
        default_provider = %gateway.default_provider(),
        providers = ?gateway.providers(),
        web_search = cfg.tools.web_search,
        "gateway ready"
    );

    let state = Arc::new(AppState {
        agent: ChatAgent::new(Arc::new(gateway)),
        pool: pool.clone(),
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.max_in_flight))
        .layer(trace_layer);

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", cfg.server.host, cfg.server.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind failed for {addr}"))?;

    tracing::info!(%addr, "parley serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.release_all();
    tracing::info!("pool drained, shutdown complete");
    Ok(())
}

/// Validate config and adapter wiring without binding a socket.
pub async fn doctor(config_path: &Path) -> Result<()> {
    let cfg = AppConfig::load(config_path)?;
    let pool = Arc::new(ClientManager::new(cfg.pool()));
    let gateway = build_gateway(&cfg, pool)?;
    tracing::info!(
        default_provider = %gateway.default_provider(),
        providers = ?gateway.providers(),
        web_search = cfg.tools.web_search,
        config_path = %config_path.display(),
        "config ok"
    );
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; ctrl-c only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to await ctrl-c signal");
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_llm::PoolConfig;

    fn pool() -> Arc<ClientManager> {
        Arc::new(ClientManager::new(PoolConfig::default()))
    }

    #[test]
    fn ollama_is_always_registered() {
        let mut cfg = AppConfig::default();
        cfg.general.default_provider = "ollama".to_string();

        let gateway = build_gateway(&cfg, pool()).unwrap();
        assert_eq!(gateway.providers(), vec!["ollama".to_string()]);
    }

    #[test]
    fn credentialed_providers_join_only_with_keys() {
        let mut cfg = AppConfig::default();
        cfg.general.default_provider = "ollama".to_string();
        cfg.keys.openai_api_key = Some("sk-test".to_string());
        cfg.keys.anthropic_api_key = Some("sk-ant-test".to_string());

        let gateway = build_gateway(&cfg, pool()).unwrap();
        let mut providers = gateway.providers();
        providers.sort();
        assert_eq!(providers, vec!["anthropic", "ollama", "openai"]);
    }

    #[test]
    fn missing_key_for_the_default_provider_is_fatal() {
        // Default is openai but no key is set.
        let cfg = AppConfig::default();
        let Err(err) = build_gateway(&cfg, pool()) else {
            panic!("expected gateway construction to fail");
        };
        assert!(err.to_string().contains("default provider"));
    }

    #[test]
    fn web_search_without_an_exa_key_is_fatal() {
        let mut cfg = AppConfig::default();
        cfg.general.default_provider = "ollama".to_string();
        cfg.tools.web_search = true;

        let Err(err) = build_gateway(&cfg, pool()) else {
            panic!("expected gateway construction to fail");
        };
        assert!(err.to_string().contains("Exa"));
    }
}
