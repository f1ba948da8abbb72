//! Provider receivers: authenticate a delivery, normalize its payload and
//! hand the result to the [`Refresher`].

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, HandleError};
use crate::refresh::{Refresher, TargetResult};
use crate::secrets::SecretData;
use crate::types::{NormalizedSignal, ReceiverDetails};

pub mod artifactory;
pub mod azure;
pub mod bitbucket;
pub mod dockerhub;
pub mod generic;
pub mod gitea;
pub mod github;
pub mod gitlab;
pub mod harbor;
mod registry;
pub mod static_targets;

pub use generic::{GenericAction, GenericConfig};
pub use registry::{Factory, Predicate, Registry};
pub use static_targets::StaticConfig;

pub const DEFAULT_BASE_PATH: &str = "/webhook";

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// An inbound delivery with its body already read into memory.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl WebhookRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            uri,
            headers,
            body: body.into(),
        }
    }

    /// First value of `name` if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Decodes the body as JSON. Any failure is a malformed payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandleError> {
        serde_json::from_slice(&self.body).map_err(HandleError::malformed)
    }
}

/// Status plus a JSON body: `{"msg"}`, `{"error"}` or `{"results"}`.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    status: StatusCode,
    body: Value,
}

impl WebhookResponse {
    pub fn msg(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "msg": msg.into() }),
        }
    }

    pub fn error(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": error.into() }),
        }
    }

    pub fn unauthorized() -> Self {
        Self::error(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn results(status: StatusCode, results: Value) -> Self {
        Self {
            status,
            body: json!({ "results": results }),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &Value {
        &self.body
    }
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Receiver contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Receiver: Send + Sync {
    fn receiver_type(&self) -> &'static str;

    /// Secret keys whose values feed the receiver path, in hashing order.
    fn required_secret_keys(&self) -> &'static [&'static str];

    fn details(&self) -> &ReceiverDetails;

    async fn handle(&self, cancel: &CancellationToken, request: WebhookRequest) -> WebhookResponse;
}

/// Provider-specific half of a signal-driven receiver.
///
/// `authenticate` runs before anything reads the body. `normalize` either
/// yields the change signal or an early [`HandleError`] (ack or reject).
pub trait SignalAdapter: Send + Sync + 'static {
    const TYPE: &'static str;
    const SECRET_KEYS: &'static [&'static str];

    fn authenticate(&self, secret: &SecretData, request: &WebhookRequest) -> Result<(), HandleError>;

    fn normalize(&self, request: &WebhookRequest) -> Result<NormalizedSignal, HandleError>;
}

/// What every receiver owns regardless of provider.
pub struct ReceiverBase {
    pub project: String,
    pub secret: SecretData,
    pub details: ReceiverDetails,
    pub refresher: Arc<Refresher>,
}

impl ReceiverBase {
    /// Validates that every required key is present and non-empty, then
    /// derives the receiver's path and URL from them.
    pub fn new(
        ctx: &ReceiverContext,
        project: &str,
        config: &WebhookReceiverConfig,
        receiver_type: &str,
        secret: SecretData,
        required_keys: &[&str],
    ) -> Result<Self, ConfigError> {
        let mut values = Vec::with_capacity(required_keys.len());
        for key in required_keys {
            match secret.get(key) {
                Some(value) if !value.is_empty() => values.push(value),
                _ => {
                    return Err(ConfigError::MissingSecretKey {
                        secret: config.secret_ref.clone(),
                        key: key.to_string(),
                    })
                }
            }
        }

        let path = webhook_path(&ctx.base_path, receiver_type, project, &config.name, &values);
        let url = format!("{}{path}", ctx.base_url.trim_end_matches('/'));
        Ok(Self {
            project: project.to_string(),
            details: ReceiverDetails {
                name: config.name.clone(),
                path,
                url,
            },
            secret,
            refresher: ctx.refresher.clone(),
        })
    }
}

/// Signal-driven receiver: authenticate, normalize, refresh by signal.
pub struct SignalReceiver<A> {
    base: ReceiverBase,
    adapter: A,
}

impl<A: SignalAdapter> SignalReceiver<A> {
    pub fn new(
        ctx: &ReceiverContext,
        project: &str,
        config: &WebhookReceiverConfig,
        secret: SecretData,
        adapter: A,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            base: ReceiverBase::new(ctx, project, config, A::TYPE, secret, A::SECRET_KEYS)?,
            adapter,
        })
    }
}

#[async_trait]
impl<A: SignalAdapter> Receiver for SignalReceiver<A> {
    fn receiver_type(&self) -> &'static str {
        A::TYPE
    }

    fn required_secret_keys(&self) -> &'static [&'static str] {
        A::SECRET_KEYS
    }

    fn details(&self) -> &ReceiverDetails {
        &self.base.details
    }

    async fn handle(&self, cancel: &CancellationToken, request: WebhookRequest) -> WebhookResponse {
        if let Err(e) = self.adapter.authenticate(&self.base.secret, &request) {
            warn!(error = %e, "rejecting webhook");
            return e.into();
        }

        let signal = match self.adapter.normalize(&request) {
            Ok(signal) => signal,
            Err(e) => {
                info!(reason = %e, "webhook not processed");
                return e.into();
            }
        };
        debug!(
            repo_urls = ?signal.repo_urls,
            qualifiers = ?signal.qualifiers,
            "normalized webhook"
        );

        self.base
            .refresher
            .refresh_by_signal(cancel, &self.base.project, &signal.repo_urls, &signal.qualifiers)
            .await
            .into_response()
    }
}

/// Value of `key`, or empty when absent. Construction already rejected
/// missing keys.
pub(crate) fn secret_value<'a>(secret: &'a SecretData, key: &str) -> &'a [u8] {
    secret.get(key).unwrap_or_default()
}

/// `{base_path}/{type}/{hex(sha256(project + name + values...))}`.
pub fn webhook_path(base_path: &str, receiver_type: &str, project: &str, name: &str, values: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project.as_bytes());
    hasher.update(name.as_bytes());
    for value in values {
        hasher.update(value);
    }
    let base_path = base_path.trim_end_matches('/');
    format!("{base_path}/{receiver_type}/{}", hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Construction inputs
// ---------------------------------------------------------------------------

/// Shared dependencies handed to every factory.
#[derive(Clone)]
pub struct ReceiverContext {
    pub refresher: Arc<Refresher>,
    pub base_url: String,
    pub base_path: String,
}

impl ReceiverContext {
    pub fn new(refresher: Arc<Refresher>, base_url: impl Into<String>) -> Self {
        Self {
            refresher,
            base_url: base_url.into(),
            base_path: DEFAULT_BASE_PATH.to_string(),
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }
}

/// Providers that need no options beyond the shared secret.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderOptions {}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArtifactoryConfig {
    /// Reported in place of the payload's `repo_key` when pushes land in a
    /// local repository aggregated behind this virtual one.
    #[serde(default)]
    pub virtual_repo_name: Option<String>,
}

/// One receiver's configuration. Exactly one provider block is set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReceiverConfig {
    pub name: String,
    pub secret_ref: String,
    #[serde(default)]
    pub github: Option<ProviderOptions>,
    #[serde(default)]
    pub gitlab: Option<ProviderOptions>,
    #[serde(default)]
    pub gitea: Option<ProviderOptions>,
    #[serde(default)]
    pub bitbucket: Option<ProviderOptions>,
    #[serde(default)]
    pub artifactory: Option<ArtifactoryConfig>,
    #[serde(default)]
    pub harbor: Option<ProviderOptions>,
    #[serde(default)]
    pub dockerhub: Option<ProviderOptions>,
    #[serde(default)]
    pub azure: Option<ProviderOptions>,
    #[serde(default)]
    pub generic: Option<GenericConfig>,
    #[serde(default, rename = "static")]
    pub static_targets: Option<StaticConfig>,
}

impl WebhookReceiverConfig {
    /// Names of the provider blocks that are set.
    pub fn provider_keys(&self) -> Vec<&'static str> {
        [
            ("github", self.github.is_some()),
            ("gitlab", self.gitlab.is_some()),
            ("gitea", self.gitea.is_some()),
            ("bitbucket", self.bitbucket.is_some()),
            ("artifactory", self.artifactory.is_some()),
            ("harbor", self.harbor.is_some()),
            ("dockerhub", self.dockerhub.is_some()),
            ("azure", self.azure.is_some()),
            ("generic", self.generic.is_some()),
            ("static", self.static_targets.is_some()),
        ]
        .into_iter()
        .filter_map(|(key, set)| set.then_some(key))
        .collect()
    }
}

/// 500 if any target failed to list or refresh, 200 otherwise.
pub(crate) fn targets_status<'a>(results: impl IntoIterator<Item = &'a TargetResult>) -> StatusCode {
    if results.into_iter().any(TargetResult::has_failures) {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};

    use super::*;
    use crate::expr::TemplateEvaluator;
    use crate::qualifiers::DefaultSelectors;
    use crate::store::MemoryStore;
    use crate::types::Warehouse;

    pub fn context(warehouses: Vec<Warehouse>) -> (ReceiverContext, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_warehouses(warehouses));
        let refresher = Refresher::new(store.clone(), Arc::new(DefaultSelectors), Arc::new(TemplateEvaluator));
        (
            ReceiverContext::new(Arc::new(refresher), "https://hooks.example.com"),
            store,
        )
    }

    pub fn request(headers: &[(&str, &str)], body: &str) -> WebhookRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        WebhookRequest::new(
            Method::POST,
            Uri::from_static("/webhook/test"),
            map,
            body.to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_deterministic_and_secret_bound() {
        let a = webhook_path("/webhook", "github", "proj", "gh", &[b"s3cret"]);
        let b = webhook_path("/webhook/", "github", "proj", "gh", &[b"s3cret"]);
        let c = webhook_path("/webhook", "github", "proj", "gh", &[b"other"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("/webhook/github/"));
        assert_eq!(a.rsplit('/').next().unwrap().len(), 64);

        // project + name + secret, no separators
        let joined = webhook_path("/webhook", "github", "pro", "jgh", &[b"s3cret"]);
        assert_eq!(a, joined);
    }

    #[test]
    fn missing_secret_key_fails_construction() {
        let (ctx, _) = test_support::context(vec![]);
        let config = WebhookReceiverConfig {
            name: "gh".into(),
            secret_ref: "gh-secret".into(),
            github: Some(ProviderOptions::default()),
            ..Default::default()
        };
        let secret = SecretData::new("gh-secret").with("other", "x");
        let err = ReceiverBase::new(&ctx, "proj", &config, "github", secret, &["secret"])
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingSecretKey { key, .. } if key == "secret"));

        let empty = SecretData::new("gh-secret").with("secret", "");
        assert!(ReceiverBase::new(&ctx, "proj", &config, "github", empty, &["secret"]).is_err());
    }

    #[test]
    fn provider_keys_lists_set_blocks() {
        let config: WebhookReceiverConfig = serde_json::from_value(json!({
            "name": "r",
            "secretRef": "s",
            "github": {},
            "static": {"targets": []}
        }))
        .unwrap();
        assert_eq!(config.provider_keys(), vec!["github", "static"]);
    }
}
