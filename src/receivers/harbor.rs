use std::sync::Arc;

use axum::http::StatusCode;
use serde::Deserialize;

use super::{secret_value, Receiver, ReceiverContext, SignalAdapter, SignalReceiver, WebhookReceiverConfig, WebhookRequest};
use crate::error::{ConfigError, HandleError};
use crate::secrets::SecretData;
use crate::types::NormalizedSignal;
use crate::{urls, verification};

const AUTH_HEADER: &str = "authorization";

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    event_data: EventData,
}

#[derive(Debug, Default, Deserialize)]
struct EventData {
    #[serde(default)]
    resources: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    #[serde(default)]
    tag: String,
    #[serde(default)]
    resource_url: String,
}

/// Harbor `PUSH_ARTIFACT`. The Authorization header carries the configured
/// value verbatim.
#[derive(Debug, Default)]
pub struct Harbor;

impl SignalAdapter for Harbor {
    const TYPE: &'static str = "harbor";
    const SECRET_KEYS: &'static [&'static str] = &["auth-header"];

    fn authenticate(&self, secret: &SecretData, request: &WebhookRequest) -> Result<(), HandleError> {
        let value = request
            .header(AUTH_HEADER)
            .ok_or_else(|| HandleError::Unauthorized("missing authorization header".into()))?;
        if !verification::verify_token(secret_value(secret, "auth-header"), value) {
            return Err(HandleError::Unauthorized("authorization mismatch".into()));
        }
        Ok(())
    }

    fn normalize(&self, request: &WebhookRequest) -> Result<NormalizedSignal, HandleError> {
        let event: Event = request.json()?;
        if event.event_type != "PUSH_ARTIFACT" {
            return Err(HandleError::unsupported(
                StatusCode::OK,
                format!("ignoring {:?} event", event.event_type),
            ));
        }

        let mut repo_urls = Vec::new();
        let mut tags = Vec::new();
        for resource in event.event_data.resources {
            if !resource.resource_url.is_empty() {
                repo_urls.extend(urls::oci_repo_urls(&resource.resource_url, None));
            }
            tags.push(resource.tag);
        }
        Ok(NormalizedSignal::new(repo_urls, tags))
    }
}

pub fn factory(
    ctx: &ReceiverContext,
    project: &str,
    config: &WebhookReceiverConfig,
    secret: SecretData,
) -> Result<Arc<dyn Receiver>, ConfigError> {
    Ok(Arc::new(SignalReceiver::new(ctx, project, config, secret, Harbor)?))
}
