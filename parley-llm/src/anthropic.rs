use crate::adapter::{ChunkStream, ProviderAdapter, resolve_model};
use crate::error::{GatewayError, Result};
use crate::sse::{SseEvent, decode_sse};
use crate::types::{
    GenerationRequest, GenerationResponse, Message, Role, StreamChunk, Usage,
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

const PROVIDER_ID: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

// The messages endpoint requires max_tokens; used when the request
// leaves it unset.
const FALLBACK_MAX_TOKENS: u32 = 1024;

pub struct AnthropicAdapter {
    api_key: String,
    base_url: String,
    default_model: String,
}

impl AnthropicAdapter {
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

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn post(&self, http: &reqwest::Client, wire: &MessagesRequest) -> reqwest::RequestBuilder {
        http.post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(wire)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
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
        let wire = MessagesRequest::new(&model, request, false);

        let response = self
            .post(http, &wire)
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

        let parsed: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::bad_payload(PROVIDER_ID, e))?;
        Ok(parsed.into_canonical(model))
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn stream(
        &self,
        request: &GenerationRequest,
        http: &reqwest::Client,
    ) -> Result<ChunkStream> {
        let model = resolve_model(request, &self.default_model);
        let wire = MessagesRequest::new(&model, request, true);

        let response = self
            .post(http, &wire)
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

/// Translate decoded SSE events into chunks. Usage accumulates across
/// events (`message_start` carries input tokens, `message_delta` output
/// tokens); each event updates only the counters it reports. After an
/// error or `message_stop` nothing further is yielded.
fn chunks_from_events<S>(events: S) -> impl Stream<Item = Result<StreamChunk>> + Send
where
    S: Stream<Item = Result<SseEvent>> + Send + 'static,
{
    futures_util::stream::unfold(
        (Box::pin(events), Usage::default(), false),
        |(mut events, mut usage, finished)| async move {
            if finished {
                return None;
            }
            loop {
                let event = match events.next().await? {
                    Ok(v) => v,
                    Err(e) => return Some((Err(e), (events, usage, true))),
                };

                match event.event.as_str() {
                    "message_start" => {
                        if let Ok(v) = serde_json::from_str::<MessageStart>(&event.data) {
                            v.message.usage.merge_into(&mut usage);
                        }
                    }
                    "content_block_delta" => {
                        let v: ContentBlockDelta = match serde_json::from_str(&event.data) {
                            Ok(v) => v,
                            Err(e) => {
                                return Some((
                                    Err(GatewayError::bad_payload(
                                        PROVIDER_ID,
                                        format!("delta json error={e} data={}", event.data),
                                    )),
                                    (events, usage, true),
                                ));
                            }
                        };
                        if let Delta::TextDelta { text } = v.delta {
                            if !text.trim().is_empty() {
                                return Some((
                                    Ok(StreamChunk::Delta { text }),
                                    (events, usage, false),
                                ));
                            }
                        }
                    }
                    "message_delta" => {
                        if let Ok(v) = serde_json::from_str::<MessageDelta>(&event.data) {
                            if let Some(u) = v.usage {
                                u.merge_into(&mut usage);
                            }
                        }
                    }
                    "message_stop" => {
                        let done = StreamChunk::Done {
                            usage: Some(usage.clone()).filter(|u| !u.is_empty()),
                        };
                        return Some((Ok(done), (events, usage, true)));
                    }
                    _ => {}
                }
            }
        },
    )
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
}

impl MessagesRequest {
    fn new(model: &str, request: &GenerationRequest, stream: bool) -> Self {
        // System messages are lifted into the dedicated field; the
        // messages array only carries user/assistant turns.
        let mut system = String::new();
        let mut messages = Vec::new();

        for m in &request.messages {
            match m.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(m.content.trim());
                }
                Role::User | Role::Assistant => messages.push(WireMessage {
                    role: m.role.as_str(),
                    content: vec![ContentBlock::Text {
                        text: m.content.clone(),
                    }],
                }),
            }
        }

        Self {
            model: model.to_string(),
            max_tokens: request.max_tokens.unwrap_or(FALLBACK_MAX_TOKENS),
            temperature: request.temperature,
            system,
            messages,
            stream: stream.then_some(true),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

impl WireUsage {
    fn into_canonical(self) -> Usage {
        let total = match (self.input_tokens, self.output_tokens) {
            (Some(i), Some(o)) => Some(i + o),
            _ => None,
        };
        Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: total,
        }
    }

    /// Fold into an accumulator, overwriting only the counters this
    /// event reports. The total is recomputed once both sides are known.
    fn merge_into(self, usage: &mut Usage) {
        if self.input_tokens.is_some() {
            usage.prompt_tokens = self.input_tokens;
        }
        if self.output_tokens.is_some() {
            usage.completion_tokens = self.output_tokens;
        }
        usage.total_tokens = match (usage.prompt_tokens, usage.completion_tokens) {
            (Some(i), Some(o)) => Some(i + o),
            _ => None,
        };
    }
}

impl MessagesResponse {
    fn into_canonical(self, model: String) -> GenerationResponse {
        let mut content = String::new();
        for block in self.content {
            let ContentBlock::Text { text } = block;
            content.push_str(&text);
        }

        GenerationResponse {
            message: Message::new(Role::Assistant, content),
            model,
            usage: self
                .usage
                .map(WireUsage::into_canonical)
                .filter(|u| !u.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Debug, Deserialize)]
struct MessageStartInner {
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    #[serde(default)]
    usage: Option<WireUsage>,
}
