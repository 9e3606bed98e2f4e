//! Parley configuration loader.
//!
//! Settings come from an optional TOML file with environment overrides
//! for credentials (loaded through dotenv in `main`).

use anyhow::{Context, bail};
use parley_llm::PoolConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub pool: Option<PoolConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_provider")]
    pub default_provider: String,
}

fn default_provider() -> String {
    "openai".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub exa_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub anthropic: AnthropicConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            model: default_openai_model(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicConfig {
    #[serde(default = "default_anthropic_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_anthropic_model() -> String {
    "claude-3-5-sonnet-latest".to_string()
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            model: default_anthropic_model(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_model")]
    pub model: String,
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
}

fn default_ollama_model() -> String {
    "llama3.1".to_string()
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            model: default_ollama_model(),
            base_url: default_ollama_base_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Cap on concurrently served HTTP requests.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_in_flight() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub web_search: bool,
    /// Model-name substrings eligible for tool use.
    #[serde(default = "default_tool_models")]
    pub tool_models: Vec<String>,
}

fn default_tool_models() -> Vec<String> {
    vec!["llama".to_string(), "gpt-oss".to_string()]
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            web_search: false,
            tool_models: default_tool_models(),
        }
    }
}

const KNOWN_PROVIDERS: &[&str] = &["openai", "anthropic", "ollama"];

impl AppConfig {
    /// Load from `path` when it exists, otherwise start from defaults.
    /// Environment variables override file-supplied credentials.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("EXA_API_KEY") {
            self.keys.exa_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("PARLEY_DEFAULT_PROVIDER") {
            self.general.default_provider = v;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        let provider = self.general.default_provider.as_str();
        if !KNOWN_PROVIDERS.contains(&provider) {
            bail!("default_provider must be one of {KNOWN_PROVIDERS:?}, got {provider:?}");
        }
        Ok(())
    }

    pub fn pool(&self) -> PoolConfig {
        self.pool.clone().unwrap_or_default()
    }
}
