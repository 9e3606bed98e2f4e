//! Provider gateway for Parley.
//!
//! Normalizes chat requests into each backend provider's wire format,
//! manages one pooled HTTP client per provider, and maps provider
//! failures into a single error taxonomy. Pure HTTP client, no SDKs.

mod adapter;
mod anthropic;
mod error;
mod gateway;
mod ollama;
mod openai;
mod pool;
mod sse;
mod toolcall;
mod types;

pub use adapter::{ChunkStream, ProviderAdapter, ToolExchange, resolve_model};
pub use anthropic::AnthropicAdapter;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, UsageSink};
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use pool::{ClientManager, PoolConfig};
pub use toolcall::{ToolCallOrchestrator, ToolExecutionError, ToolExecutor, ToolUsePolicy};
pub use types::{
    GenerationRequest, GenerationResponse, Message, Role, StreamChunk, ToolCallRequest,
    ToolCallResult, ToolDefinition, Usage, UsageRecord,
};
