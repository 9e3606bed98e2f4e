use crate::agent::AgentState;
use crate::server::AppState;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use bytes::Bytes;
use futures_util::StreamExt;
use parley_llm::{GatewayError, GenerationRequest, StreamChunk, Usage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
}

#[derive(Debug, Deserialize)]
struct ChatPayload {
    #[serde(flatten)]
    request: GenerationRequest,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatResponseBody {
    thread_id: String,
    role: &'static str,
    content: String,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
}

#[tracing::instrument(level = "info", skip_all)]
async fn chat(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<ChatPayload>,
) -> Response {
    let outcome = state
        .agent
        .invoke(&payload.request, payload.thread_id.as_deref())
        .await;

    match (outcome.state, outcome.response, outcome.error) {
        (AgentState::Done, Some(response), _) => Json(ChatResponseBody {
            thread_id: outcome.thread_id,
            role: response.message.role.as_str(),
            content: response.message.content,
            model: response.model,
            usage: response.usage,
        })
        .into_response(),
        (_, _, Some(error)) => error_response(&error),
        // Unreachable by construction; kept total for the compiler.
        (state, _, None) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("agent ended in {state:?}") })),
        )
            .into_response(),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn chat_stream(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<ChatPayload>,
) -> Response {
    let gateway = state.agent.gateway();
    let chunks = match gateway.stream(&payload.request).await {
        Ok(chunks) => chunks,
        Err(error) => return error_response(&error),
    };

    // Deltas become raw body bytes. A mid-stream failure surfaces as a
    // trailing error line since the status is already committed.
    let body = Body::from_stream(futures_util::stream::unfold(
        Some(chunks),
        |state| async move {
            let mut chunks = state?;
            match chunks.next().await? {
                Ok(StreamChunk::Delta { text }) => {
                    Some((Ok::<_, std::convert::Infallible>(Bytes::from(text)), Some(chunks)))
                }
                Ok(StreamChunk::Done { .. }) => None,
                Err(error) => {
                    tracing::error!(error = %error, "stream aborted mid-flight");
                    Some((Ok(Bytes::from(format!("\nError: {error}"))), None))
                }
            }
        },
    ));

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

fn error_response(error: &GatewayError) -> Response {
    let status = error_status(error);
    tracing::warn!(error = %error, status = status.as_u16(), "request failed");
    (
        status,
        Json(serde_json::json!({ "error": error.to_string() })),
    )
        .into_response()
}

fn error_status(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::Schema(_) | GatewayError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        GatewayError::Auth { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::Throttle { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::Provider { .. } => StatusCode::BAD_GATEWAY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_llm::{Message, Role};

    #[test]
    fn payload_flattens_request_fields_with_thread_id() {
        let raw = r#"{
            "messages": [{"role": "user", "content": "hi"}],
            "model": "gpt-4o-mini",
            "thread_id": "t-42"
        }"#;
        let payload: ChatPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.thread_id.as_deref(), Some("t-42"));
        assert_eq!(payload.request.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(payload.request.messages.len(), 1);
        assert_eq!(payload.request.messages[0].role, Role::User);
    }

    #[test]
    fn payload_rejects_unknown_roles() {
        let raw = r#"{"messages": [{"role": "bot", "content": "hi"}]}"#;
        assert!(serde_json::from_str::<ChatPayload>(raw).is_err());
    }

    #[test]
    fn status_mapping_covers_the_taxonomy() {
        assert_eq!(
            error_status(&GatewayError::Schema("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&GatewayError::Configuration("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            error_status(&GatewayError::Auth {
                provider: "openai".into(),
                message: "bad key".into()
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_status(&GatewayError::Throttle {
                provider: "openai".into(),
                message: "slow down".into()
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            error_status(&GatewayError::Provider {
                provider: "ollama".into(),
                message: "boom".into(),
                timed_out: false
            }),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn response_body_serializes_without_empty_usage() {
        let body = ChatResponseBody {
            thread_id: "t".into(),
            role: Role::Assistant.as_str(),
            content: Message::new(Role::Assistant, "hi").content,
            model: "m".into(),
            usage: None,
        };
        let rendered = serde_json::to_value(&body).unwrap();
        assert!(rendered.get("usage").is_none());
        assert_eq!(rendered["role"], "assistant");
    }
}
