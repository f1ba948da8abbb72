//! Static receiver: a fixed list of targets refreshed on every authorized
//! delivery. The payload is never read.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::generic::{authenticate_bearer, request_env};
use super::{targets_status, Receiver, ReceiverBase, ReceiverContext, WebhookReceiverConfig, WebhookRequest, WebhookResponse};
use crate::error::ConfigError;
use crate::secrets::SecretData;
use crate::selector::TargetSelectionCriteria;
use crate::types::ReceiverDetails;

const TYPE: &str = "static";
const SECRET_KEYS: &[&str] = &["secret"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticConfig {
    #[serde(default)]
    pub targets: Vec<TargetSelectionCriteria>,
}

pub struct StaticReceiver {
    base: ReceiverBase,
    targets: Vec<TargetSelectionCriteria>,
}

impl StaticReceiver {
    pub fn new(
        ctx: &ReceiverContext,
        project: &str,
        config: &WebhookReceiverConfig,
        secret: SecretData,
    ) -> Result<Self, ConfigError> {
        let targets = config
            .static_targets
            .as_ref()
            .map(|s| s.targets.clone())
            .unwrap_or_default();
        Ok(Self {
            base: ReceiverBase::new(ctx, project, config, TYPE, secret, SECRET_KEYS)?,
            targets,
        })
    }
}

#[async_trait]
impl Receiver for StaticReceiver {
    fn receiver_type(&self) -> &'static str {
        TYPE
    }

    fn required_secret_keys(&self) -> &'static [&'static str] {
        SECRET_KEYS
    }

    fn details(&self) -> &ReceiverDetails {
        &self.base.details
    }

    async fn handle(&self, cancel: &CancellationToken, request: WebhookRequest) -> WebhookResponse {
        if let Err(e) = authenticate_bearer(&self.base.secret, &request) {
            warn!(error = %e, "rejecting webhook");
            return e.into();
        }

        let env = request_env(&request, &self.base.details.url, false);
        let results = self
            .base
            .refresher
            .refresh_by_targets(cancel, &self.base.project, &env, &self.targets)
            .await;
        let status = targets_status(&results);
        info!(targets = results.len(), status = status.as_u16(), "processed static webhook");
        WebhookResponse::results(status, json!(results))
    }
}

pub fn factory(
    ctx: &ReceiverContext,
    project: &str,
    config: &WebhookReceiverConfig,
    secret: SecretData,
) -> Result<Arc<dyn Receiver>, ConfigError> {
    Ok(Arc::new(StaticReceiver::new(ctx, project, config, secret)?))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::http::StatusCode;

    use super::*;
    use crate::receivers::test_support::{context, request};
    use crate::types::{ObjectKey, Warehouse};

    #[tokio::test]
    async fn refreshes_label_selected_warehouses() {
        let labelled = |name: &str, team: &str| Warehouse {
            namespace: "proj".into(),
            name: name.into(),
            labels: BTreeMap::from([("team".to_string(), team.to_string())]),
            annotations: BTreeMap::new(),
            subscriptions: vec![],
        };
        let (ctx, store) = context(vec![labelled("a", "web"), labelled("b", "data")]);
        let config: WebhookReceiverConfig = serde_json::from_value(json!({
            "name": "nightly",
            "secretRef": "nightly-secret",
            "static": {"targets": [{"kind": "Warehouse", "labelSelector": {"matchLabels": {"team": "web"}}}]}
        }))
        .unwrap();
        let secret = SecretData::new("nightly-secret").with("secret", "tok");
        let receiver = StaticReceiver::new(&ctx, "proj", &config, secret).unwrap();

        let response = receiver
            .handle(
                &CancellationToken::new(),
                request(&[("Authorization", "Bearer tok")], "ignored"),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.body(),
            &json!({"results": [{"kind": "Warehouse", "selectedObjects": [{"key": {"namespace": "proj", "name": "a"}}]}]})
        );
        assert_eq!(store.refresh_count(&ObjectKey::new("proj", "b")).await, 0);
    }
}
