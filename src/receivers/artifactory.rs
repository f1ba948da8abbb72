use std::sync::Arc;

use axum::http::StatusCode;
use serde::Deserialize;
use url::Url;

use super::{secret_value, Receiver, ReceiverContext, SignalAdapter, SignalReceiver, WebhookReceiverConfig, WebhookRequest};
use crate::error::{ConfigError, HandleError};
use crate::secrets::SecretData;
use crate::types::NormalizedSignal;
use crate::{urls, verification};

const AUTH_HEADER: &str = "x-jfrog-event-auth";

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(default)]
    domain: String,
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    data: Data,
    #[serde(default)]
    jpd_origin: String,
}

#[derive(Debug, Default, Deserialize)]
struct Data {
    #[serde(default)]
    repo_key: String,
    #[serde(default)]
    image_name: String,
    #[serde(default)]
    tag: String,
}

/// JFrog Artifactory docker-domain push events.
#[derive(Debug, Default)]
pub struct Artifactory {
    virtual_repo_name: Option<String>,
}

impl Artifactory {
    pub fn new(virtual_repo_name: Option<String>) -> Self {
        Self {
            virtual_repo_name: virtual_repo_name.filter(|n| !n.is_empty()),
        }
    }
}

impl SignalAdapter for Artifactory {
    const TYPE: &'static str = "artifactory";
    const SECRET_KEYS: &'static [&'static str] = &["secret-token"];

    fn authenticate(&self, secret: &SecretData, request: &WebhookRequest) -> Result<(), HandleError> {
        let token = request
            .header(AUTH_HEADER)
            .ok_or_else(|| HandleError::Unauthorized(format!("missing {AUTH_HEADER} header")))?;
        if !verification::verify_token(secret_value(secret, "secret-token"), token) {
            return Err(HandleError::Unauthorized("token mismatch".into()));
        }
        Ok(())
    }

    fn normalize(&self, request: &WebhookRequest) -> Result<NormalizedSignal, HandleError> {
        let event: Event = request.json()?;
        if event.domain != "docker" || event.event_type != "pushed" {
            return Err(HandleError::unsupported(
                StatusCode::OK,
                format!("ignoring {}/{} event", event.domain, event.event_type),
            ));
        }

        let origin = Url::parse(&event.jpd_origin).map_err(|e| {
            HandleError::malformed(format!("jpd_origin {:?}: {e}", event.jpd_origin))
        })?;
        let host = match (origin.host_str(), origin.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(HandleError::malformed("jpd_origin has no host")),
        };
        let repo_key = self.virtual_repo_name.as_deref().unwrap_or(&event.data.repo_key);
        let repo = format!("{host}/{repo_key}/{}", event.data.image_name);

        // Artifactory does not report a media type.
        Ok(NormalizedSignal::new(urls::oci_repo_urls(&repo, None), [event.data.tag]))
    }
}

pub fn factory(
    ctx: &ReceiverContext,
    project: &str,
    config: &WebhookReceiverConfig,
    secret: SecretData,
) -> Result<Arc<dyn Receiver>, ConfigError> {
    let adapter = Artifactory::new(config.artifactory.as_ref().and_then(|a| a.virtual_repo_name.clone()));
    Ok(Arc::new(SignalReceiver::new(ctx, project, config, secret, adapter)?))
}
