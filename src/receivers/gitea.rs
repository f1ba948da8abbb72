use std::sync::Arc;

use axum::http::StatusCode;
use serde::Deserialize;

use super::{secret_value, Receiver, ReceiverContext, SignalAdapter, SignalReceiver, WebhookReceiverConfig, WebhookRequest};
use crate::error::{ConfigError, HandleError};
use crate::secrets::SecretData;
use crate::types::NormalizedSignal;
use crate::{urls, verification};

/// Bare hex HMAC-SHA256, no `sha256=` prefix.
const SIGNATURE_HEADER: &str = "x-gitea-signature";
const EVENT_HEADER: &str = "x-gitea-event";

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref", default)]
    git_ref: String,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct Repository {
    #[serde(default)]
    clone_url: String,
    #[serde(default)]
    ssh_url: String,
}

#[derive(Debug, Default)]
pub struct Gitea;

impl SignalAdapter for Gitea {
    const TYPE: &'static str = "gitea";
    const SECRET_KEYS: &'static [&'static str] = &["secret"];

    fn authenticate(&self, secret: &SecretData, request: &WebhookRequest) -> Result<(), HandleError> {
        let signature = request
            .header(SIGNATURE_HEADER)
            .ok_or_else(|| HandleError::Unauthorized(format!("missing {SIGNATURE_HEADER} header")))?;
        if !verification::verify_hmac_sha256(secret_value(secret, "secret"), &request.body, signature, "") {
            return Err(HandleError::Unauthorized("signature mismatch".into()));
        }
        Ok(())
    }

    fn normalize(&self, request: &WebhookRequest) -> Result<NormalizedSignal, HandleError> {
        let event = request.header(EVENT_HEADER).unwrap_or_default();
        if event != "push" {
            return Err(HandleError::unsupported(
                StatusCode::BAD_REQUEST,
                format!("event type {event:?} is not supported"),
            ));
        }
        let push: PushEvent = request.json()?;
        let urls = [&push.repository.clone_url, &push.repository.ssh_url]
            .into_iter()
            .filter(|u| !u.is_empty())
            .map(|u| urls::normalize_git(u));
        Ok(NormalizedSignal::new(urls, [push.git_ref]))
    }
}

pub fn factory(
    ctx: &ReceiverContext,
    project: &str,
    config: &WebhookReceiverConfig,
    secret: SecretData,
) -> Result<Arc<dyn Receiver>, ConfigError> {
    Ok(Arc::new(SignalReceiver::new(ctx, project, config, secret, Gitea)?))
}
