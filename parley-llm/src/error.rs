use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// One taxonomy covering every provider's native failure modes.
/// Adapters translate and propagate; nothing in this crate retries.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed input. Caller's fault, not retriable.
    #[error("schema error: {0}")]
    Schema(String),

    /// Unknown provider/model or missing credentials. Fatal to the
    /// request; fixing it requires a configuration change.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Provider rejected the credentials.
    #[error("auth error ({provider}): {message}")]
    Auth { provider: String, message: String },

    /// Provider rate/quota limit. Retriable after backoff, but the
    /// retry policy lives with the caller.
    #[error("throttled ({provider}): {message}")]
    Throttle { provider: String, message: String },

    /// Provider rejected the request shape. Not retriable as-is.
    #[error("invalid request ({provider}): {message}")]
    InvalidRequest { provider: String, message: String },

    /// Catch-all native failure, timeouts included.
    #[error("provider error ({provider}): {message}")]
    Provider {
        provider: String,
        message: String,
        timed_out: bool,
    },
}

impl GatewayError {
    /// Translate an HTTP status from a provider into the taxonomy.
    pub fn from_status(provider: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("status={status} body={body}");
        let provider = provider.to_string();
        match status.as_u16() {
            401 | 403 => Self::Auth { provider, message },
            429 => Self::Throttle { provider, message },
            400 | 413 | 422 => Self::InvalidRequest { provider, message },
            _ => Self::Provider {
                provider,
                message,
                timed_out: false,
            },
        }
    }

    /// Translate a transport-level failure, flagging timeouts.
    pub fn from_transport(provider: &str, e: reqwest::Error) -> Self {
        Self::Provider {
            provider: provider.to_string(),
            message: e.to_string(),
            timed_out: e.is_timeout(),
        }
    }

    /// Unexpected response/stream payload from the provider.
    pub fn bad_payload(provider: &str, detail: impl std::fmt::Display) -> Self {
        Self::Provider {
            provider: provider.to_string(),
            message: format!("unexpected payload: {detail}"),
            timed_out: false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Provider { timed_out: true, .. })
    }

    /// Whether a caller-side retry could plausibly succeed.
    pub fn retriable(&self) -> bool {
        matches!(self, Self::Throttle { .. } | Self::Provider { .. })
    }
}
