//! Azure: Container Registry and Azure DevOps (Repos) share one receiver and
//! are told apart by `User-Agent`.

use std::sync::Arc;

use axum::http::StatusCode;
use serde::Deserialize;

use super::{Receiver, ReceiverContext, SignalAdapter, SignalReceiver, WebhookReceiverConfig, WebhookRequest};
use crate::error::{ConfigError, HandleError};
use crate::secrets::SecretData;
use crate::types::NormalizedSignal;
use crate::urls;

const ACR_AGENT: &str = "AzureContainerRegistry/";
const DEVOPS_AGENT: &str = "VSServices/";

#[derive(Debug, Deserialize)]
struct RegistryEvent {
    #[serde(default)]
    action: String,
    #[serde(default)]
    target: Target,
    #[serde(default)]
    request: RegistryRequest,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Target {
    #[serde(default)]
    repository: String,
    #[serde(default)]
    tag: String,
    #[serde(default)]
    media_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RegistryRequest {
    #[serde(default)]
    host: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DevOpsEvent {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    resource: Option<DevOpsResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DevOpsResource {
    repository: DevOpsRepository,
    #[serde(default)]
    ref_updates: Vec<RefUpdate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DevOpsRepository {
    remote_url: String,
}

#[derive(Debug, Deserialize)]
struct RefUpdate {
    name: String,
}

#[derive(Debug, Default)]
pub struct Azure;

impl Azure {
    fn registry(request: &WebhookRequest) -> Result<NormalizedSignal, HandleError> {
        let event: RegistryEvent = request.json()?;
        let repo = format!("{}/{}", event.request.host, event.target.repository);
        let repo_urls = match event.action.as_str() {
            "push" => urls::oci_repo_urls(&repo, event.target.media_type.as_deref()),
            "chart_push" => vec![urls::normalize_chart(&repo)],
            other => {
                return Err(HandleError::unsupported(
                    StatusCode::OK,
                    format!("ignoring registry action {other:?}"),
                ))
            }
        };
        if event.request.host.is_empty() || event.target.repository.is_empty() {
            return Err(HandleError::malformed("registry event has no host or repository"));
        }
        Ok(NormalizedSignal::new(repo_urls, [event.target.tag]))
    }

    fn devops(request: &WebhookRequest) -> Result<NormalizedSignal, HandleError> {
        let event: DevOpsEvent = request.json()?;
        if event.event_type != "git.push" {
            return Err(HandleError::unsupported(
                StatusCode::OK,
                format!("ignoring event type {:?}", event.event_type),
            ));
        }
        let resource = event
            .resource
            .ok_or_else(|| HandleError::malformed("git.push event has no resource"))?;
        Ok(NormalizedSignal::new(
            [urls::normalize_git(&resource.repository.remote_url)],
            resource.ref_updates.into_iter().map(|r| r.name),
        ))
    }
}

impl SignalAdapter for Azure {
    const TYPE: &'static str = "azure";
    const SECRET_KEYS: &'static [&'static str] = &["secret"];

    /// Neither service signs deliveries; the path is the credential.
    fn authenticate(&self, _secret: &SecretData, _request: &WebhookRequest) -> Result<(), HandleError> {
        Ok(())
    }

    fn normalize(&self, request: &WebhookRequest) -> Result<NormalizedSignal, HandleError> {
        let agent = request.header("user-agent").unwrap_or_default();
        if agent.starts_with(ACR_AGENT) {
            Self::registry(request)
        } else if agent.starts_with(DEVOPS_AGENT) {
            Self::devops(request)
        } else {
            Err(HandleError::unsupported(
                StatusCode::BAD_REQUEST,
                format!("unrecognized user agent {agent:?}"),
            ))
        }
    }
}

pub fn factory(
    ctx: &ReceiverContext,
    project: &str,
    config: &WebhookReceiverConfig,
    secret: SecretData,
) -> Result<Arc<dyn Receiver>, ConfigError> {
    Ok(Arc::new(SignalReceiver::new(ctx, project, config, secret, Azure)?))
}
