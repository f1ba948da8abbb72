use axum::http::StatusCode;

use crate::receivers::WebhookResponse;
use crate::secrets::SecretError;

/// Failures that keep a receiver from being built. Raised before any
/// request is served.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no receiver registered for config {name:?} (providers: [{}])", .providers.join(", "))]
    NoReceiver { name: String, providers: Vec<&'static str> },

    #[error("receiver {name:?} configures more than one provider: [{}]", .providers.join(", "))]
    MultipleProviders { name: String, providers: Vec<&'static str> },

    #[error("secret {secret:?} has no value for required key {key:?}")]
    MissingSecretKey { secret: String, key: String },

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("receivers {first:?} and {second:?} resolve to the same path {path}")]
    DuplicatePath {
        first: String,
        second: String,
        path: String,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Terminal outcomes of request handling that stop before refresh.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    /// Logged with its reason; the response never says which check failed.
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("{message}")]
    UnsupportedEvent { status: StatusCode, message: String },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl HandleError {
    pub fn unsupported(status: StatusCode, message: impl Into<String>) -> Self {
        Self::UnsupportedEvent {
            status,
            message: message.into(),
        }
    }

    pub fn malformed(err: impl std::fmt::Display) -> Self {
        Self::MalformedPayload(err.to_string())
    }
}

impl From<HandleError> for WebhookResponse {
    fn from(err: HandleError) -> Self {
        match err {
            HandleError::Unauthorized(_) => WebhookResponse::unauthorized(),
            HandleError::UnsupportedEvent { status, message } if status.is_success() => {
                WebhookResponse::msg(status, message)
            }
            HandleError::UnsupportedEvent { status, message } => WebhookResponse::error(status, message),
            err @ HandleError::MalformedPayload(_) => {
                WebhookResponse::error(StatusCode::BAD_REQUEST, err.to_string())
            }
        }
    }
}
