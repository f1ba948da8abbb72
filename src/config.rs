use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::http_server::DEFAULT_MAX_BODY_BYTES;
use crate::receivers::{WebhookReceiverConfig, DEFAULT_BASE_PATH};
use crate::refresh::DEFAULT_CONCURRENCY;
use crate::secrets::SecretSource;
use crate::types::Warehouse;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Externally reachable origin, used only to render receiver URLs.
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_refresh_concurrency")]
    pub refresh_concurrency: usize,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

/// A project owns its secrets, receivers and Warehouses. Warehouses live in
/// the namespace named after the project.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub secrets: BTreeMap<String, BTreeMap<String, SecretSource>>,
    #[serde(default)]
    pub receivers: Vec<WebhookReceiverConfig>,
    #[serde(default)]
    pub warehouses: Vec<Warehouse>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_base_path() -> String {
    DEFAULT_BASE_PATH.to_string()
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_refresh_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config file: {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("failed to parse config")?;
    validate_config(&config)?;
    Ok(config)
}

/// Checks that cannot be expressed with serde alone.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.base_path.starts_with('/'), "basePath must start with '/'");
    anyhow::ensure!(config.max_body_bytes > 0, "maxBodyBytes must be positive");
    anyhow::ensure!(config.refresh_concurrency > 0, "refreshConcurrency must be positive");

    let mut projects = HashSet::new();
    for project in &config.projects {
        anyhow::ensure!(!project.name.is_empty(), "project name must not be empty");
        anyhow::ensure!(
            projects.insert(project.name.as_str()),
            "duplicate project {:?}",
            project.name
        );

        let mut receivers = HashSet::new();
        for receiver in &project.receivers {
            anyhow::ensure!(
                receivers.insert(receiver.name.as_str()),
                "project {:?}: duplicate receiver {:?}",
                project.name,
                receiver.name
            );
            let providers = receiver.provider_keys();
            if providers.len() > 1 {
                return Err(ConfigError::MultipleProviders {
                    name: receiver.name.clone(),
                    providers,
                })
                .with_context(|| format!("project {:?}", project.name));
            }
            anyhow::ensure!(
                project.secrets.contains_key(&receiver.secret_ref),
                "project {:?}: receiver {:?} references unknown secret {:?}",
                project.name,
                receiver.name,
                receiver.secret_ref
            );
        }

        for warehouse in &project.warehouses {
            anyhow::ensure!(
                warehouse.namespace.is_empty() || warehouse.namespace == project.name,
                "project {:?}: warehouse {:?} declares namespace {:?}",
                project.name,
                warehouse.name,
                warehouse.namespace
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
baseUrl: https://hooks.example.com
projects:
  - name: shop
    secrets:
      gh:
        secret:
          value: s3cret
    receivers:
      - name: github
        secretRef: gh
        github: {}
    warehouses:
      - name: storefront
        subscriptions:
          - git:
              repoURL: https://github.com/acme/storefront
              branch: main
"#;

    #[test]
    fn parses_with_defaults() {
        let config = parse_config(CONFIG).unwrap();
        assert_eq!(config.listen, default_listen());
        assert_eq!(config.base_path, "/webhook");
        assert_eq!(config.max_body_bytes, 2 * 1024 * 1024);
        assert_eq!(config.refresh_concurrency, 8);
        let project = &config.projects[0];
        assert_eq!(project.receivers[0].provider_keys(), vec!["github"]);
        assert_eq!(project.warehouses[0].subscriptions.len(), 1);
    }

    #[test]
    fn unknown_secret_reference_is_rejected() {
        let bad = CONFIG.replace("secretRef: gh", "secretRef: missing");
        let err = parse_config(&bad).unwrap_err();
        assert!(format!("{err:#}").contains("unknown secret"), "{err:#}");
    }

    #[test]
    fn duplicate_receivers_and_multiple_providers_are_rejected() {
        let dup = CONFIG.replace(
            "        github: {}\n",
            "        github: {}\n      - name: github\n        secretRef: gh\n        gitea: {}\n",
        );
        assert!(format!("{:#}", parse_config(&dup).unwrap_err()).contains("duplicate receiver"));

        let multi = CONFIG.replace("        github: {}\n", "        github: {}\n        gitea: {}\n");
        assert!(format!("{:#}", parse_config(&multi).unwrap_err()).contains("more than one provider"));
    }

    #[test]
    fn yaml_subscriptions_of_every_kind_parse() {
        let yaml = r#"
projects:
  - name: shop
    warehouses:
      - name: mixed
        subscriptions:
          - git:
              repoURL: https://GitHub.com/acme/storefront.git
              commitSelectionStrategy: SemVer
          - image:
              repoURL: nginx
          - chart:
              repoURL: oci://ghcr.io/acme/charts/app
"#;
        let config = parse_config(yaml).unwrap();
        let warehouse = &config.projects[0].warehouses[0];
        let kinds: Vec<_> = warehouse.subscriptions.iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, vec!["git", "image", "chart"]);
        assert_eq!(
            warehouse.subscribed_urls(),
            vec![
                "docker.io/library/nginx",
                "https://github.com/acme/storefront",
                "oci://ghcr.io/acme/charts/app",
            ]
        );
    }

    #[test]
    fn yaml_subscription_with_two_kinds_is_rejected() {
        let yaml = r#"
projects:
  - name: shop
    warehouses:
      - name: confused
        subscriptions:
          - git:
              repoURL: https://github.com/acme/storefront
            image:
              repoURL: nginx
"#;
        let err = parse_config(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("only one of"), "{err:#}");
    }
}
