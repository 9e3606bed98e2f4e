//! Thread-facing pipeline wrapping the gateway facade.
//!
//! Three working states (initialize, generate, finalize) with an
//! absorbing failure state; the finalize step only observes, it never
//! rewrites a response.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_llm::{Gateway, GatewayError, GenerationRequest, GenerationResponse, Message};
use std::sync::Arc;

pub const DEFAULT_THREAD_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Initializing,
    Generating,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug)]
pub struct AgentOutcome {
    pub thread_id: String,
    pub started_at: DateTime<Utc>,
    pub state: AgentState,
    pub response: Option<GenerationResponse>,
    pub error: Option<GatewayError>,
}

pub struct ChatAgent {
    gateway: Arc<Gateway>,
    // Append-only per-thread transcript; continuity is best-effort and
    // never consulted by the gateway itself.
    transcripts: DashMap<String, Vec<Message>>,
}

impl ChatAgent {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            transcripts: DashMap::new(),
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    #[tracing::instrument(level = "info", skip_all, fields(thread_id))]
    pub async fn invoke(
        &self,
        request: &GenerationRequest,
        thread_id: Option<&str>,
    ) -> AgentOutcome {
        // Initializing: stamp the run and seed thread context.
        let mut state = AgentState::Initializing;
        let started_at = Utc::now();
        let thread_id = thread_id
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_THREAD_ID)
            .to_string();
        tracing::Span::current().record("thread_id", thread_id.as_str());
        tracing::debug!(?state, "agent run starting");

        // Generating: any gateway failure absorbs the run.
        state = AgentState::Generating;
        tracing::debug!(?state, "dispatching to gateway");
        let response = match self.gateway.generate(request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(error = %error, "generation failed");
                return AgentOutcome {
                    thread_id,
                    started_at,
                    state: AgentState::Failed,
                    response: None,
                    error: Some(error),
                };
            }
        };

        // Finalizing: content scan for alerting plus transcript append.
        state = AgentState::Finalizing;
        tracing::debug!(?state, "post-processing response");
        let markers = find_sensitive_markers(&response.message.content);
        if !markers.is_empty() {
            tracing::warn!(
                thread_id = %thread_id,
                markers = ?markers,
                "response contains sensitive-looking content"
            );
        }
        self.append_transcript(&thread_id, request, &response);

        AgentOutcome {
            thread_id,
            started_at,
            state: AgentState::Done,
            response: Some(response),
            error: None,
        }
    }

    fn append_transcript(
        &self,
        thread_id: &str,
        request: &GenerationRequest,
        response: &GenerationResponse,
    ) {
        let mut transcript = self.transcripts.entry(thread_id.to_string()).or_default();
        if let Some(last) = request.messages.last() {
            transcript.push(last.clone());
        }
        transcript.push(response.message.clone());
    }

    pub fn transcript(&self, thread_id: &str) -> Vec<Message> {
        self.transcripts
            .get(thread_id)
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

const SENSITIVE_MARKERS: &[&str] = &[
    "api_key",
    "apikey",
    "password",
    "secret_key",
    "-----begin",
    "bearer ",
];

/// Case-insensitive scan for credential-looking substrings. Purely an
/// observation; callers log, they do not block or mutate.
fn find_sensitive_markers(content: &str) -> Vec<&'static str> {
    let lowered = content.to_lowercase();
    SENSITIVE_MARKERS
        .iter()
        .copied()
        .filter(|marker| lowered.contains(marker))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_llm::{
        ChunkStream, ClientManager, Message, PoolConfig, ProviderAdapter, Result, Role, Usage,
    };

    struct CannedAdapter {
        content: &'static str,
    }

    #[async_trait]
    impl ProviderAdapter for CannedAdapter {
        fn id(&self) -> &str {
            "canned"
        }

        fn default_model(&self) -> &str {
            "canned-model"
        }

        async fn generate(
            &self,
            _request: &GenerationRequest,
            _http: &reqwest::Client,
        ) -> Result<GenerationResponse> {
            Ok(GenerationResponse {
                message: Message::new(Role::Assistant, self.content),
                model: self.default_model().to_string(),
                usage: Some(Usage::default()),
            })
        }

        async fn stream(
            &self,
            _request: &GenerationRequest,
            _http: &reqwest::Client,
        ) -> Result<ChunkStream> {
            unimplemented!("not used by agent tests")
        }
    }

    fn agent_with(content: &'static str) -> ChatAgent {
        let gateway = Gateway::new(
            vec![Arc::new(CannedAdapter { content }) as Arc<dyn ProviderAdapter>],
            Arc::new(ClientManager::new(PoolConfig::default())),
            "canned",
        );
        ChatAgent::new(Arc::new(gateway))
    }

    fn user_request(content: &str) -> GenerationRequest {
        GenerationRequest::new(vec![Message::new(Role::User, content)])
    }

    #[tokio::test]
    async fn successful_run_ends_in_done_with_a_response() {
        let agent = agent_with("hello");
        let outcome = agent.invoke(&user_request("hi"), Some("t1")).await;

        assert_eq!(outcome.state, AgentState::Done);
        assert_eq!(outcome.thread_id, "t1");
        assert!(outcome.error.is_none());
        assert_eq!(outcome.response.unwrap().message.content, "hello");
    }

    #[tokio::test]
    async fn missing_thread_id_defaults() {
        let agent = agent_with("hello");
        let outcome = agent.invoke(&user_request("hi"), None).await;
        assert_eq!(outcome.thread_id, DEFAULT_THREAD_ID);

        let outcome = agent.invoke(&user_request("hi"), Some("")).await;
        assert_eq!(outcome.thread_id, DEFAULT_THREAD_ID);
    }

    #[tokio::test]
    async fn gateway_failure_absorbs_into_failed_state() {
        let agent = agent_with("hello");
        let mut request = user_request("hi");
        request.provider = Some("unknown".to_string());

        let outcome = agent.invoke(&request, Some("t1")).await;
        assert_eq!(outcome.state, AgentState::Failed);
        assert!(outcome.response.is_none());
        assert!(matches!(
            outcome.error,
            Some(GatewayError::Configuration(_))
        ));

        // A failed run leaves no transcript entry behind.
        assert!(agent.transcript("t1").is_empty());
    }

    #[tokio::test]
    async fn transcripts_accumulate_per_thread() {
        let agent = agent_with("pong");
        agent.invoke(&user_request("ping"), Some("t1")).await;
        agent.invoke(&user_request("ping again"), Some("t1")).await;
        agent.invoke(&user_request("other"), Some("t2")).await;

        let t1 = agent.transcript("t1");
        assert_eq!(t1.len(), 4);
        assert_eq!(t1[0].content, "ping");
        assert_eq!(t1[1].content, "pong");
        assert_eq!(agent.transcript("t2").len(), 2);
    }

    #[test]
    fn sensitive_scan_finds_markers_without_mutating() {
        let content = "your API_KEY is sk-123 and the Password is hunter2";
        let markers = find_sensitive_markers(content);
        assert!(markers.contains(&"api_key"));
        assert!(markers.contains(&"password"));
        assert!(find_sensitive_markers("nothing to see").is_empty());
    }
}
