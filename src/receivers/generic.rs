//! Generic receiver: user-authored actions gated by conditions over the
//! request, each refreshing the objects its targets select.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{secret_value, targets_status, Receiver, ReceiverBase, ReceiverContext, WebhookReceiverConfig, WebhookRequest, WebhookResponse};
use crate::conditions::{self, BatchResult, Condition, ConditionSelector};
use crate::error::{ConfigError, HandleError};
use crate::refresh::TargetResult;
use crate::secrets::SecretData;
use crate::selector::TargetSelectionCriteria;
use crate::types::ReceiverDetails;
use crate::verification;

const TYPE: &str = "generic";
const SECRET_KEYS: &[&str] = &["secret"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericConfig {
    #[serde(default)]
    pub actions: Vec<GenericAction>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    #[default]
    Refresh,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericAction {
    #[serde(default)]
    pub action_type: ActionType,
    #[serde(default)]
    pub when_expression: Option<String>,
    #[serde(default)]
    pub match_expressions: Vec<ConditionSelector>,
    #[serde(default)]
    pub target_selection_criteria: Vec<TargetSelectionCriteria>,
}

impl GenericAction {
    fn conditions(&self) -> Vec<Condition<'_>> {
        self.when_expression
            .as_deref()
            .map(Condition::When)
            .into_iter()
            .chain(self.match_expressions.iter().map(Condition::Selector))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionOutcome {
    Success,
    Failed,
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub action_type: ActionType,
    pub conditions: BatchResult,
    pub result: ActionOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub target_results: Vec<TargetResult>,
}

pub struct GenericReceiver {
    base: ReceiverBase,
    actions: Vec<GenericAction>,
}

impl GenericReceiver {
    pub fn new(
        ctx: &ReceiverContext,
        project: &str,
        config: &WebhookReceiverConfig,
        secret: SecretData,
    ) -> Result<Self, ConfigError> {
        let actions = config.generic.as_ref().map(|g| g.actions.clone()).unwrap_or_default();
        Ok(Self {
            base: ReceiverBase::new(ctx, project, config, TYPE, secret, SECRET_KEYS)?,
            actions,
        })
    }

    async fn run_action(&self, cancel: &CancellationToken, action: &GenericAction, env: &Value) -> ActionResult {
        let refresher = &self.base.refresher;
        let conditions = conditions::evaluate_all(refresher.evaluator(), &action.conditions(), env);
        if !conditions.satisfied {
            debug!(conditions = ?conditions.conditions, "action conditions not met");
            return ActionResult {
                action_type: action.action_type,
                conditions,
                result: ActionOutcome::NotApplicable,
                target_results: Vec::new(),
            };
        }

        let target_results = refresher
            .refresh_by_targets(cancel, &self.base.project, env, &action.target_selection_criteria)
            .await;
        let result = if target_results.iter().any(TargetResult::has_failures) {
            ActionOutcome::Failed
        } else {
            ActionOutcome::Success
        };
        ActionResult {
            action_type: action.action_type,
            conditions,
            result,
            target_results,
        }
    }
}

#[async_trait]
impl Receiver for GenericReceiver {
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

        let env = request_env(&request, &self.base.details.url, true);
        let mut results = Vec::with_capacity(self.actions.len());
        for action in &self.actions {
            results.push(self.run_action(cancel, action, &env).await);
        }

        let status = targets_status(results.iter().flat_map(|r| &r.target_results));
        info!(
            actions = results.len(),
            applied = results.iter().filter(|r| r.result != ActionOutcome::NotApplicable).count(),
            status = status.as_u16(),
            "processed generic webhook"
        );
        WebhookResponse::results(status, json!(results))
    }
}

/// `Authorization: Bearer <secret>`.
pub(crate) fn authenticate_bearer(secret: &SecretData, request: &WebhookRequest) -> Result<(), HandleError> {
    let authorization = request
        .header("authorization")
        .ok_or_else(|| HandleError::Unauthorized("missing authorization header".into()))?;
    if !verification::verify_bearer(secret_value(secret, "secret"), authorization) {
        return Err(HandleError::Unauthorized("bearer token mismatch".into()));
    }
    Ok(())
}

/// `{request: {method, url, path, headers, body?}}` for expression evaluation.
///
/// `url` is the receiver's external URL plus the request's query string, since
/// behind the router the request URI only carries the path.
/// Header names are lowercase and repeated headers are joined with `", "`.
/// The body is the decoded JSON, or the raw text when it is not JSON.
pub(crate) fn request_env(request: &WebhookRequest, receiver_url: &str, with_body: bool) -> Value {
    let mut headers = Map::new();
    for name in request.headers.keys() {
        let joined = request
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        headers.insert(name.as_str().to_string(), Value::String(joined));
    }

    let url = match request.uri.query() {
        Some(query) => format!("{receiver_url}?{query}"),
        None => receiver_url.to_string(),
    };
    let mut env = json!({
        "method": request.method.as_str(),
        "url": url,
        "path": request.uri.path(),
        "headers": headers,
    });
    if with_body {
        let body = serde_json::from_slice(&request.body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&request.body).into_owned()));
        env["body"] = body;
    }
    json!({ "request": env })
}

pub fn factory(
    ctx: &ReceiverContext,
    project: &str,
    config: &WebhookReceiverConfig,
    secret: SecretData,
) -> Result<Arc<dyn Receiver>, ConfigError> {
    Ok(Arc::new(GenericReceiver::new(ctx, project, config, secret)?))
}
