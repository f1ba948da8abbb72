use std::sync::Arc;

use axum::http::StatusCode;
use serde::Deserialize;

use super::{secret_value, Receiver, ReceiverContext, SignalAdapter, SignalReceiver, WebhookReceiverConfig, WebhookRequest};
use crate::error::{ConfigError, HandleError};
use crate::secrets::SecretData;
use crate::types::NormalizedSignal;
use crate::{urls, verification};

const SIGNATURE_HEADER: &str = "x-hub-signature";
const EVENT_HEADER: &str = "x-event-key";

#[derive(Debug, Deserialize)]
struct PushEvent {
    repository: Repository,
    push: Push,
}

#[derive(Debug, Deserialize)]
struct Repository {
    links: Links,
}

#[derive(Debug, Deserialize)]
struct Links {
    html: Link,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

#[derive(Debug, Deserialize)]
struct Push {
    #[serde(default)]
    changes: Vec<Change>,
}

#[derive(Debug, Deserialize)]
struct Change {
    /// Absent when the ref was deleted.
    #[serde(default)]
    new: Option<RefState>,
}

#[derive(Debug, Deserialize)]
struct RefState {
    #[serde(rename = "type")]
    kind: String,
    name: String,
}

impl RefState {
    fn qualifier(&self) -> Option<String> {
        match self.kind.as_str() {
            "branch" => Some(format!("refs/heads/{}", self.name)),
            "tag" | "annotated_tag" => Some(format!("refs/tags/{}", self.name)),
            _ => None,
        }
    }
}

/// Bitbucket Cloud `repo:push`.
#[derive(Debug, Default)]
pub struct Bitbucket;

impl SignalAdapter for Bitbucket {
    const TYPE: &'static str = "bitbucket";
    const SECRET_KEYS: &'static [&'static str] = &["secret"];

    fn authenticate(&self, secret: &SecretData, request: &WebhookRequest) -> Result<(), HandleError> {
        let signature = request
            .header(SIGNATURE_HEADER)
            .ok_or_else(|| HandleError::Unauthorized(format!("missing {SIGNATURE_HEADER} header")))?;
        if !verification::verify_hmac_sha256(secret_value(secret, "secret"), &request.body, signature, "sha256=") {
            return Err(HandleError::Unauthorized("signature mismatch".into()));
        }
        Ok(())
    }

    fn normalize(&self, request: &WebhookRequest) -> Result<NormalizedSignal, HandleError> {
        let event = request.header(EVENT_HEADER).unwrap_or_default();
        if event != "repo:push" {
            return Err(HandleError::unsupported(
                StatusCode::BAD_REQUEST,
                format!("event type {event:?} is not supported"),
            ));
        }
        let push: PushEvent = request.json()?;
        let qualifiers: Vec<String> = push
            .push
            .changes
            .iter()
            .filter_map(|change| change.new.as_ref()?.qualifier())
            .collect();
        Ok(NormalizedSignal::new(
            [urls::normalize_git(&push.repository.links.html.href)],
            qualifiers,
        ))
    }
}

pub fn factory(
    ctx: &ReceiverContext,
    project: &str,
    config: &WebhookReceiverConfig,
    secret: SecretData,
) -> Result<Arc<dyn Receiver>, ConfigError> {
    Ok(Arc::new(SignalReceiver::new(ctx, project, config, secret, Bitbucket)?))
}
