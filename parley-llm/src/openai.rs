use crate::adapter::{ChunkStream, ProviderAdapter, resolve_model};
use crate::error::{GatewayError, Result};
use crate::sse::{SseEvent, decode_sse};
use crate::types::{
    GenerationRequest, GenerationResponse, Message, Role, StreamChunk, Usage,
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

const PROVIDER_ID: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible chat completions adapter. Also fronts any endpoint
/// speaking the same protocol when constructed with a custom base URL.
pub struct OpenAiAdapter {
    api_key: String,
    base_url: String,
    default_model: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: default_model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn generate(
        &self,
        request: &GenerationRequest,
        http: &reqwest::Client,
    ) -> Result<GenerationResponse> {
        let model = resolve_model(request, &self.default_model);
        let wire = ChatCompletionRequest::new(&model, request, false);

        let response = http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&wire)
            .send()
            .await
            .map_err(|e| GatewayError::from_transport(PROVIDER_ID, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::from_transport(PROVIDER_ID, e))?;
        if !status.is_success() {
            return Err(GatewayError::from_status(PROVIDER_ID, status, &body));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::bad_payload(PROVIDER_ID, e))?;
        parsed.into_canonical(model)
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn stream(
        &self,
        request: &GenerationRequest,
        http: &reqwest::Client,
    ) -> Result<ChunkStream> {
        let model = resolve_model(request, &self.default_model);
        let wire = ChatCompletionRequest::new(&model, request, true);

        let response = http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&wire)
            .send()
            .await
            .map_err(|e| GatewayError::from_transport(PROVIDER_ID, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(PROVIDER_ID, status, &body));
        }

        Ok(Box::pin(chunks_from_events(decode_sse(
            response.bytes_stream(),
            PROVIDER_ID,
        ))))
    }
}

/// Translate decoded SSE events into chunks. The `[DONE]` sentinel
/// carries the last usage payload seen; after it, or after an error,
/// nothing further is yielded.
fn chunks_from_events<S>(events: S) -> impl Stream<Item = Result<StreamChunk>> + Send
where
    S: Stream<Item = Result<SseEvent>> + Send + 'static,
{
    futures_util::stream::unfold(
        (Box::pin(events), None::<Usage>, false),
        |(mut events, mut usage, finished)| async move {
            if finished {
                return None;
            }
            loop {
                let event = match events.next().await? {
                    Ok(v) => v,
                    Err(e) => return Some((Err(e), (events, usage, true))),
                };

                if event.data.trim() == "[DONE]" {
                    return Some((
                        Ok(StreamChunk::Done { usage: usage.take() }),
                        (events, usage, true),
                    ));
                }

                let chunk: StreamResponseChunk = match serde_json::from_str(&event.data) {
                    Ok(v) => v,
                    Err(e) => {
                        return Some((
                            Err(GatewayError::bad_payload(
                                PROVIDER_ID,
                                format!("chunk json error={e} data={}", event.data),
                            )),
                            (events, usage, true),
                        ));
                    }
                };

                if let Some(u) = chunk.usage {
                    usage = Some(u.into_canonical());
                }

                let Some(choice) = chunk.choices.first() else {
                    continue;
                };
                if let Some(text) = choice.delta.content.as_ref() {
                    // Blank deltas are dropped, not forwarded.
                    if !text.trim().is_empty() {
                        return Some((
                            Ok(StreamChunk::Delta { text: text.clone() }),
                            (events, usage, false),
                        ));
                    }
                }
            }
        },
    )
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

impl ChatCompletionRequest {
    fn new(model: &str, request: &GenerationRequest, stream: bool) -> Self {
        Self {
            model: model.to_string(),
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: m.content.clone(),
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: stream.then_some(true),
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl WireUsage {
    fn into_canonical(self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

impl ChatCompletionResponse {
    fn into_canonical(self, model: String) -> Result<GenerationResponse> {
        let choice = self.choices.into_iter().next().ok_or_else(|| {
            GatewayError::bad_payload(PROVIDER_ID, "response missing choices")
        })?;

        Ok(GenerationResponse {
            message: Message::new(Role::Assistant, choice.message.content.unwrap_or_default()),
            model,
            usage: self
                .usage
                .map(WireUsage::into_canonical)
                .filter(|u| !u.is_empty()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponseChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
