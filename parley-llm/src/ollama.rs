use crate::adapter::{ChunkStream, ProviderAdapter, ToolExchange, resolve_model};
use crate::error::{GatewayError, Result};
use crate::types::{
    GenerationRequest, GenerationResponse, Message, Role, StreamChunk, ToolCallRequest,
    ToolDefinition, Usage,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

const PROVIDER_ID: &str = "ollama";
const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Local model adapter speaking Ollama's native API. The only adapter
/// in the set whose protocol carries tool calls; streaming is
/// newline-delimited JSON rather than SSE.
pub struct OllamaAdapter {
    base_url: String,
    default_model: String,
}

impl OllamaAdapter {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: default_model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    async fn call(
        &self,
        request: &GenerationRequest,
        tools: &[ToolDefinition],
        http: &reqwest::Client,
    ) -> Result<(GenerationResponse, Vec<ToolCallRequest>)> {
        let model = resolve_model(request, &self.default_model);
        let wire = ChatRequest::new(&model, request, tools, false);

        let response = http
            .post(self.chat_url())
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

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::bad_payload(PROVIDER_ID, e))?;
        Ok(parsed.into_canonical(model))
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn supports_tools(&self) -> bool {
        true
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn generate(
        &self,
        request: &GenerationRequest,
        http: &reqwest::Client,
    ) -> Result<GenerationResponse> {
        let (response, _) = self.call(request, &[], http).await?;
        Ok(response)
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn generate_with_tools(
        &self,
        request: &GenerationRequest,
        tools: &[ToolDefinition],
        http: &reqwest::Client,
    ) -> Result<ToolExchange> {
        let (response, tool_calls) = self.call(request, tools, http).await?;
        Ok(ToolExchange {
            response,
            tool_calls,
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn stream(
        &self,
        request: &GenerationRequest,
        http: &reqwest::Client,
    ) -> Result<ChunkStream> {
        let model = resolve_model(request, &self.default_model);
        let wire = ChatRequest::new(&model, request, &[], true);

        let response = http
            .post(self.chat_url())
            .json(&wire)
            .send()
            .await
            .map_err(|e| GatewayError::from_transport(PROVIDER_ID, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(PROVIDER_ID, status, &body));
        }

        Ok(Box::pin(chunks_from_lines(decode_ndjson(
            response.bytes_stream(),
        ))))
    }
}

/// Translate NDJSON lines into chunks. The `done` line maps to the
/// end-of-stream marker; after it, or after an error, nothing further
/// is yielded.
fn chunks_from_lines<S>(lines: S) -> impl Stream<Item = Result<StreamChunk>> + Send
where
    S: Stream<Item = Result<String>> + Send + 'static,
{
    futures_util::stream::unfold(
        (Box::pin(lines), false),
        |(mut lines, finished)| async move {
            if finished {
                return None;
            }
            loop {
                let line = match lines.next().await? {
                    Ok(v) => v,
                    Err(e) => return Some((Err(e), (lines, true))),
                };

                let chunk: ChatResponse = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        return Some((
                            Err(GatewayError::bad_payload(
                                PROVIDER_ID,
                                format!("ndjson error={e} line={line}"),
                            )),
                            (lines, true),
                        ));
                    }
                };

                if chunk.done {
                    let usage = chunk.usage();
                    return Some((Ok(StreamChunk::Done { usage }), (lines, true)));
                }

                if let Some(message) = chunk.message {
                    if !message.content.trim().is_empty() {
                        return Some((
                            Ok(StreamChunk::Delta {
                                text: message.content,
                            }),
                            (lines, false),
                        ));
                    }
                }
            }
        },
    )
}

/// Split the body into complete lines, buffering partial ones across
/// network chunks.
fn decode_ndjson<S>(bytes_stream: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = buffer.find('\n') {
                    let line = buffer[..idx].trim().to_string();
                    buffer = buffer[idx + 1..].to_string();
                    if line.is_empty() {
                        continue;
                    }
                    return Some((Ok(line), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(GatewayError::from_transport(PROVIDER_ID, e)),
                            (stream, buffer),
                        ));
                    }
                    None => {
                        // Flush a trailing line without a newline.
                        let line = buffer.trim().to_string();
                        if line.is_empty() {
                            return None;
                        }
                        buffer.clear();
                        return Some((Ok(line), (stream, buffer)));
                    }
                }
            }
        },
    )
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    options: ChatOptions,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: i64,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    r#type: &'static str,
    function: WireToolFunction,
}

#[derive(Debug, Serialize)]
struct WireToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl ChatRequest {
    fn new(
        model: &str,
        request: &GenerationRequest,
        tools: &[ToolDefinition],
        stream: bool,
    ) -> Self {
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
            options: ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens.map(i64::from).unwrap_or(-1),
            },
            stream,
            tools: tools
                .iter()
                .map(|t| WireTool {
                    r#type: "function",
                    function: WireToolFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: ResponseToolFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseToolFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

impl ChatResponse {
    fn usage(&self) -> Option<Usage> {
        let total = match (self.prompt_eval_count, self.eval_count) {
            (Some(p), Some(e)) => Some(p + e),
            _ => None,
        };
        let usage = Usage {
            prompt_tokens: self.prompt_eval_count,
            completion_tokens: self.eval_count,
            total_tokens: total,
        };
        (!usage.is_empty()).then_some(usage)
    }

    fn into_canonical(self, model: String) -> (GenerationResponse, Vec<ToolCallRequest>) {
        let usage = self.usage();
        let (content, tool_calls) = match self.message {
            Some(m) => (
                m.content,
                m.tool_calls
                    .into_iter()
                    .map(|tc| ToolCallRequest {
                        name: tc.function.name,
                        arguments: tc.function.arguments,
                    })
                    .collect(),
            ),
            None => (String::new(), Vec::new()),
        };

        (
            GenerationResponse {
                message: Message::new(Role::Assistant, content),
                model,
                usage,
            },
            tool_calls,
        )
    }
}
