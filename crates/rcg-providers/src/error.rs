use rcg_schemas::ProviderName;

/// Typed provider failure. The variant decides the retry ladder's behavior:
/// only `Transport` is retryable.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Connection reset, timeout, HTTP ≥ 500. Safe to retry — the upstream
    /// either never saw the request or answered out of band.
    #[error("{provider} transport error: {reason}")]
    Transport {
        provider: ProviderName,
        reason: String,
    },

    /// HTTP 403. Terminal: retrying with the same key/nip cannot succeed.
    #[error("{provider} rejected credentials")]
    Credentials { provider: ProviderName },

    /// The provider processed the request and said no (MST `<Error>` payload,
    /// TAECEL `success: false`). No money charged; not retryable.
    #[error("{provider} domain error: {message}")]
    Domain {
        provider: ProviderName,
        message: String,
    },

    /// Parsed 2xx body that doesn't match the documented shape. Not
    /// retryable — a malformed success might still have charged, so the item
    /// is surfaced for manual review rather than re-dispatched.
    #[error("{provider} invalid response: {reason}")]
    InvalidResponse {
        provider: ProviderName,
        reason: String,
    },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transport { .. })
    }

    pub fn provider(&self) -> ProviderName {
        match self {
            ProviderError::Transport { provider, .. }
            | ProviderError::Credentials { provider }
            | ProviderError::Domain { provider, .. }
            | ProviderError::InvalidResponse { provider, .. } => *provider,
        }
    }

    pub(crate) fn transport(provider: ProviderName, reason: impl Into<String>) -> Self {
        ProviderError::Transport {
            provider,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(provider: ProviderName, reason: impl Into<String>) -> Self {
        ProviderError::InvalidResponse {
            provider,
            reason: reason.into(),
        }
    }

    pub(crate) fn domain(provider: ProviderName, message: impl Into<String>) -> Self {
        ProviderError::Domain {
            provider,
            message: message.into(),
        }
    }

    /// Map a reqwest failure plus the HTTP status (when one arrived) into the
    /// right variant.
    pub(crate) fn from_http(
        provider: ProviderName,
        status: Option<reqwest::StatusCode>,
        err: impl std::fmt::Display,
    ) -> Self {
        match status {
            Some(s) if s == reqwest::StatusCode::FORBIDDEN => {
                ProviderError::Credentials { provider }
            }
            Some(s) if s.is_server_error() => {
                Self::transport(provider, format!("http {s}: {err}"))
            }
            Some(s) => Self::invalid(provider, format!("unexpected http {s}: {err}")),
            None => Self::transport(provider, err.to_string()),
        }
    }
}
