use std::sync::Arc;

use serde::Deserialize;

use super::{Receiver, ReceiverContext, SignalAdapter, SignalReceiver, WebhookReceiverConfig, WebhookRequest};
use crate::error::{ConfigError, HandleError};
use crate::secrets::SecretData;
use crate::types::NormalizedSignal;
use crate::urls;

#[derive(Debug, Deserialize)]
struct Event {
    push_data: PushData,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct PushData {
    #[serde(default)]
    tag: String,
}

#[derive(Debug, Deserialize)]
struct Repository {
    repo_name: String,
}

/// Docker Hub signs nothing; the unguessable path is the only credential.
#[derive(Debug, Default)]
pub struct DockerHub;

impl SignalAdapter for DockerHub {
    const TYPE: &'static str = "dockerhub";
    const SECRET_KEYS: &'static [&'static str] = &["secret"];

    fn authenticate(&self, _secret: &SecretData, _request: &WebhookRequest) -> Result<(), HandleError> {
        Ok(())
    }

    fn normalize(&self, request: &WebhookRequest) -> Result<NormalizedSignal, HandleError> {
        let event: Event = request.json()?;
        if event.repository.repo_name.is_empty() {
            return Err(HandleError::malformed("repository.repo_name is empty"));
        }
        let repo = format!("docker.io/{}", event.repository.repo_name);
        Ok(NormalizedSignal::new([urls::normalize_image(&repo)], [event.push_data.tag]))
    }
}

pub fn factory(
    ctx: &ReceiverContext,
    project: &str,
    config: &WebhookReceiverConfig,
    secret: SecretData,
) -> Result<Arc<dyn Receiver>, ConfigError> {
    Ok(Arc::new(SignalReceiver::new(ctx, project, config, secret, DockerHub)?))
}
