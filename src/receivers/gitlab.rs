use std::sync::Arc;

use axum::http::StatusCode;
use serde::Deserialize;

use super::{secret_value, Receiver, ReceiverContext, SignalAdapter, SignalReceiver, WebhookReceiverConfig, WebhookRequest};
use crate::error::{ConfigError, HandleError};
use crate::secrets::SecretData;
use crate::types::NormalizedSignal;
use crate::{urls, verification};

const TOKEN_HEADER: &str = "x-gitlab-token";
const EVENT_HEADER: &str = "x-gitlab-event";

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref", default)]
    git_ref: String,
    project: Project,
}

#[derive(Debug, Deserialize)]
struct Project {
    #[serde(default)]
    git_http_url: String,
    #[serde(default)]
    git_ssh_url: String,
}

/// Push and tag push hooks, authenticated by the shared token header.
#[derive(Debug, Default)]
pub struct GitLab;

impl SignalAdapter for GitLab {
    const TYPE: &'static str = "gitlab";
    const SECRET_KEYS: &'static [&'static str] = &["secret-token"];

    fn authenticate(&self, secret: &SecretData, request: &WebhookRequest) -> Result<(), HandleError> {
        let token = request
            .header(TOKEN_HEADER)
            .ok_or_else(|| HandleError::Unauthorized(format!("missing {TOKEN_HEADER} header")))?;
        if !verification::verify_token(secret_value(secret, "secret-token"), token) {
            return Err(HandleError::Unauthorized("token mismatch".into()));
        }
        Ok(())
    }

    fn normalize(&self, request: &WebhookRequest) -> Result<NormalizedSignal, HandleError> {
        match request.header(EVENT_HEADER).unwrap_or_default() {
            "Push Hook" | "Tag Push Hook" => {
                let event: PushEvent = request.json()?;
                let urls = [&event.project.git_http_url, &event.project.git_ssh_url]
                    .into_iter()
                    .filter(|u| !u.is_empty())
                    .map(|u| urls::normalize_git(u));
                Ok(NormalizedSignal::new(urls, [event.git_ref]))
            }
            other => Err(HandleError::unsupported(
                StatusCode::BAD_REQUEST,
                format!("event type {other:?} is not supported"),
            )),
        }
    }
}

pub fn factory(
    ctx: &ReceiverContext,
    project: &str,
    config: &WebhookReceiverConfig,
    secret: SecretData,
) -> Result<Arc<dyn Receiver>, ConfigError> {
    Ok(Arc::new(SignalReceiver::new(ctx, project, config, secret, GitLab)?))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::receivers::test_support::request;

    #[test]
    fn token_must_match_exactly() {
        let secret = SecretData::new("gl").with("secret-token", "tok");
        assert!(GitLab.authenticate(&secret, &request(&[(TOKEN_HEADER, "tok")], "{}")).is_ok());
        assert!(GitLab.authenticate(&secret, &request(&[(TOKEN_HEADER, "tok2")], "{}")).is_err());
        assert!(GitLab.authenticate(&secret, &request(&[], "{}")).is_err());
    }

    #[test]
    fn tag_push_hook_yields_tag_ref() {
        let body = json!({
            "ref": "refs/tags/v1.0.0",
            "project": {
                "git_http_url": "https://gitlab.com/group/project.git",
                "git_ssh_url": "git@gitlab.com:group/project.git"
            }
        })
        .to_string();
        let signal = GitLab
            .normalize(&request(&[(EVENT_HEADER, "Tag Push Hook")], &body))
            .unwrap();
        assert_eq!(
            signal.repo_urls,
            vec!["https://gitlab.com/group/project", "ssh://git@gitlab.com/group/project"]
        );
        assert_eq!(signal.qualifiers, vec!["refs/tags/v1.0.0"]);

        assert!(matches!(
            GitLab.normalize(&request(&[(EVENT_HEADER, "Merge Request Hook")], &body)),
            Err(HandleError::UnsupportedEvent { .. })
        ));
    }
}
