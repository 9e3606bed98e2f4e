use crate::error::{GatewayError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// HTTP pool sizing shared by every per-provider client.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Upper bound on any single provider call; exceeding it surfaces
    /// as a provider error with the timeout flag set, never a hang.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_idle_per_host() -> usize {
    20
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_max_idle_per_host(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Owns exactly one reusable, connection-pooled client per provider id.
///
/// Clients are built lazily on first acquisition under a double-checked
/// write lock, so concurrent first callers observe a single build. The
/// returned `reqwest::Client` is a cheap handle onto the shared pool and
/// is safe for concurrent in-flight requests.
pub struct ClientManager {
    config: PoolConfig,
    clients: RwLock<HashMap<String, reqwest::Client>>,
    builds: AtomicUsize,
}

impl ClientManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            clients: RwLock::new(HashMap::new()),
            builds: AtomicUsize::new(0),
        }
    }

    /// Return the pooled client for `provider_id`, building it on first
    /// use. A build failure is reported as a configuration error and is
    /// not cached; the next acquisition retries.
    pub fn acquire(&self, provider_id: &str) -> Result<reqwest::Client> {
        {
            let clients = match self.clients.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(client) = clients.get(provider_id) {
                return Ok(client.clone());
            }
        }

        let mut clients = match self.clients.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Re-check under the write lock: another caller may have built
        // the client between our read and write acquisitions.
        if let Some(client) = clients.get(provider_id) {
            return Ok(client.clone());
        }

        let client = self.build_client()?;
        self.builds.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            provider = provider_id,
            max_idle_per_host = self.config.max_idle_per_host,
            request_timeout_secs = self.config.request_timeout_secs,
            "built pooled http client"
        );
        clients.insert(provider_id.to_string(), client.clone());
        Ok(client)
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .pool_max_idle_per_host(self.config.max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(self.config.idle_timeout_secs))
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Configuration(format!("http client build failed: {e}")))
    }

    /// Drop every held client. In-flight requests on already-borrowed
    /// handles may fail with a connection-closed error; intended for
    /// process shutdown only.
    pub fn release_all(&self) {
        let mut clients = match self.clients.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = clients.len();
        clients.clear();
        tracing::info!(released = count, "released all pooled clients");
    }

    pub fn active_providers(&self) -> Vec<String> {
        let clients = match self.clients.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        clients.keys().cloned().collect()
    }

    /// Number of clients ever built; lets callers verify
    /// once-per-provider construction.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_reuses_the_same_client_per_provider() {
        let manager = ClientManager::new(PoolConfig::default());
        let _a = manager.acquire("openai").unwrap();
        let _b = manager.acquire("openai").unwrap();
        let _c = manager.acquire("anthropic").unwrap();
        assert_eq!(manager.builds(), 2);
        let mut providers = manager.active_providers();
        providers.sort();
        assert_eq!(providers, vec!["anthropic", "openai"]);
    }

    #[tokio::test]
    async fn concurrent_first_acquisitions_build_exactly_once() {
        let manager = Arc::new(ClientManager::new(PoolConfig::default()));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { manager.acquire("openai").map(|_| ()) }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(manager.builds(), 1);
        assert_eq!(manager.active_providers(), vec!["openai"]);
    }

    #[test]
    fn release_all_empties_the_pool_map() {
        let manager = ClientManager::new(PoolConfig::default());
        manager.acquire("ollama").unwrap();
        manager.release_all();
        assert!(manager.active_providers().is_empty());

        // A later acquire rebuilds rather than resurrecting.
        manager.acquire("ollama").unwrap();
        assert_eq!(manager.builds(), 2);
    }
}
