//! GitHub: `push` for repositories, `package` for GHCR container pushes.

use std::sync::Arc;

use axum::http::StatusCode;
use serde::Deserialize;

use super::{secret_value, Receiver, ReceiverContext, SignalAdapter, SignalReceiver, WebhookReceiverConfig, WebhookRequest};
use crate::error::{ConfigError, HandleError};
use crate::secrets::SecretData;
use crate::types::NormalizedSignal;
use crate::{urls, verification};

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";

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

#[derive(Debug, Deserialize)]
struct PackageEvent {
    #[serde(default)]
    action: String,
    package: Package,
}

#[derive(Debug, Deserialize)]
struct Package {
    #[serde(default)]
    package_type: String,
    package_version: PackageVersion,
}

#[derive(Debug, Deserialize)]
struct PackageVersion {
    #[serde(default)]
    package_url: String,
    #[serde(default)]
    container_metadata: Option<ContainerMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerMetadata {
    #[serde(default)]
    tag: Option<Tag>,
    #[serde(default)]
    manifest: Option<Manifest>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    media_type: Option<String>,
}

#[derive(Debug, Default)]
pub struct GitHub;

impl SignalAdapter for GitHub {
    const TYPE: &'static str = "github";
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
        match request.header(EVENT_HEADER).unwrap_or_default() {
            "ping" => Err(HandleError::unsupported(StatusCode::OK, "pong")),
            "push" => {
                let event: PushEvent = request.json()?;
                let urls = [&event.repository.clone_url, &event.repository.ssh_url]
                    .into_iter()
                    .filter(|u| !u.is_empty())
                    .map(|u| urls::normalize_git(u));
                Ok(NormalizedSignal::new(urls, [event.git_ref]))
            }
            "package" => {
                let event: PackageEvent = request.json()?;
                if event.action != "published" {
                    return Err(HandleError::unsupported(
                        StatusCode::OK,
                        format!("ignoring package event with action {:?}", event.action),
                    ));
                }
                if !event.package.package_type.eq_ignore_ascii_case("container") {
                    return Err(HandleError::unsupported(
                        StatusCode::OK,
                        format!("ignoring {:?} package", event.package.package_type),
                    ));
                }
                let version = event.package.package_version;
                let metadata = version.container_metadata.unwrap_or_default();
                let media_type = metadata.manifest.and_then(|m| m.media_type);
                let tag = metadata.tag.map(|t| t.name).unwrap_or_default();
                Ok(NormalizedSignal::new(
                    urls::oci_repo_urls(&version.package_url, media_type.as_deref()),
                    [tag],
                ))
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
    Ok(Arc::new(SignalReceiver::new(ctx, project, config, secret, GitHub)?))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::receivers::test_support::request;

    fn secret() -> SecretData {
        SecretData::new("gh").with("secret", "s3cret")
    }

    fn signed(event: &str, body: &str) -> WebhookRequest {
        let sig = format!("sha256={}", verification::sign_hmac_sha256(b"s3cret", body.as_bytes()));
        request(&[(EVENT_HEADER, event), (SIGNATURE_HEADER, &sig)], body)
    }

    #[test]
    fn rejects_missing_or_bad_signature() {
        let body = r#"{"ref":"refs/heads/main"}"#;
        let unsigned = request(&[(EVENT_HEADER, "push")], body);
        assert!(matches!(GitHub.authenticate(&secret(), &unsigned), Err(HandleError::Unauthorized(_))));

        let forged = request(&[(EVENT_HEADER, "push"), (SIGNATURE_HEADER, "sha256=00")], body);
        assert!(GitHub.authenticate(&secret(), &forged).is_err());
        assert!(GitHub.authenticate(&secret(), &signed("push", body)).is_ok());
    }

    #[test]
    fn push_yields_both_clone_urls_and_ref() {
        let body = json!({
            "ref": "refs/heads/main",
            "repository": {
                "clone_url": "https://github.com/Org/Repo.git",
                "ssh_url": "git@github.com:Org/Repo.git"
            }
        })
        .to_string();
        let signal = GitHub.normalize(&signed("push", &body)).unwrap();
        assert_eq!(
            signal.repo_urls,
            vec!["https://github.com/org/repo", "ssh://git@github.com/org/repo"]
        );
        assert_eq!(signal.qualifiers, vec!["refs/heads/main"]);
    }

    #[test]
    fn package_media_type_picks_the_form() {
        let body = |media_type: &str| {
            json!({
                "action": "published",
                "package": {
                    "package_type": "CONTAINER",
                    "package_version": {
                        "package_url": "ghcr.io/org/app:1.2.3",
                        "container_metadata": {
                            "tag": {"name": "1.2.3"},
                            "manifest": {"media_type": media_type}
                        }
                    }
                }
            })
            .to_string()
        };

        let image = GitHub
            .normalize(&signed("package", &body("application/vnd.docker.distribution.manifest.v2+json")))
            .unwrap();
        assert_eq!(image.repo_urls, vec!["ghcr.io/org/app"]);
        assert_eq!(image.qualifiers, vec!["1.2.3"]);

        let chart = GitHub
            .normalize(&signed("package", &body("application/vnd.cncf.helm.config.v1+json")))
            .unwrap();
        assert_eq!(chart.repo_urls, vec!["oci://ghcr.io/org/app"]);

        let unknown = GitHub
            .normalize(&signed("package", &body("application/vnd.oci.image.manifest.v1+json")))
            .unwrap();
        assert_eq!(unknown.repo_urls, vec!["ghcr.io/org/app", "oci://ghcr.io/org/app"]);
    }

    #[test]
    fn ping_and_unknown_events_stop_early() {
        match GitHub.normalize(&signed("ping", "{}")) {
            Err(HandleError::UnsupportedEvent { status, .. }) => assert_eq!(status, StatusCode::OK),
            other => panic!("unexpected {other:?}"),
        }
        match GitHub.normalize(&signed("issues", "{}")) {
            Err(HandleError::UnsupportedEvent { status, .. }) => assert_eq!(status, StatusCode::BAD_REQUEST),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            GitHub.normalize(&signed("push", "not json")),
            Err(HandleError::MalformedPayload(_))
        ));
    }
}
