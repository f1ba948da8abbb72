//! Secret material bound to receivers at construction time.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Key/value secret contents. Values never appear in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretData {
    name: String,
    data: BTreeMap<String, Vec<u8>>,
}

impl SecretData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }
}

impl fmt::Debug for SecretData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretData")
            .field("name", &self.name)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SecretError {
    #[error("secret {name:?} not found in project {project:?}")]
    NotFound { project: String, name: String },

    #[error("secret {secret:?} key {key:?}: environment variable {var} is not set")]
    MissingEnv { secret: String, key: String, var: String },
}

/// Resolves a named secret within a project.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, project: &str, name: &str) -> Result<SecretData, SecretError>;
}

/// Where one secret value comes from.
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum SecretSource {
    /// Read from an environment variable when the receiver is built.
    Env { env: String },
    /// Literal value embedded in the configuration file.
    Value { value: String },
}

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env { env } => f.debug_struct("SecretSource::Env").field("env", env).finish(),
            Self::Value { .. } => f
                .debug_struct("SecretSource::Value")
                .field("value", &"<REDACTED>")
                .finish(),
        }
    }
}

/// Secrets declared in the configuration file, keyed by project then name.
#[derive(Debug, Clone, Default)]
pub struct ConfigSecretStore {
    secrets: BTreeMap<String, BTreeMap<String, BTreeMap<String, SecretSource>>>,
}

impl ConfigSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        project: impl Into<String>,
        name: impl Into<String>,
        keys: BTreeMap<String, SecretSource>,
    ) {
        self.secrets
            .entry(project.into())
            .or_default()
            .insert(name.into(), keys);
    }
}

#[async_trait]
impl SecretStore for ConfigSecretStore {
    async fn get(&self, project: &str, name: &str) -> Result<SecretData, SecretError> {
        let keys = self
            .secrets
            .get(project)
            .and_then(|secrets| secrets.get(name))
            .ok_or_else(|| SecretError::NotFound {
                project: project.to_string(),
                name: name.to_string(),
            })?;

        let mut data = SecretData::new(name);
        for (key, source) in keys {
            let value = match source {
                SecretSource::Value { value } => value.clone(),
                SecretSource::Env { env } => std::env::var(env).map_err(|_| SecretError::MissingEnv {
                    secret: name.to_string(),
                    key: key.clone(),
                    var: env.clone(),
                })?,
            };
            data = data.with(key.as_str(), value);
        }
        debug!(project, secret = name, "resolved secret");
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_is_redacted() {
        let data = SecretData::new("gh").with("secret", "hunter2");
        let rendered = format!("{data:?}");
        assert!(rendered.contains("secret"));
        assert!(!rendered.contains("hunter2"));

        let source = SecretSource::Value {
            value: "hunter2".into(),
        };
        assert!(!format!("{source:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn resolves_literal_values_and_reports_missing() {
        let mut store = ConfigSecretStore::new();
        store.insert(
            "proj",
            "gh",
            BTreeMap::from([(
                "secret".to_string(),
                SecretSource::Value {
                    value: "s3cret".into(),
                },
            )]),
        );
        let data = store.get("proj", "gh").await.unwrap();
        assert_eq!(data.get("secret"), Some(b"s3cret".as_slice()));

        assert!(matches!(
            store.get("other", "gh").await,
            Err(SecretError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn missing_env_var_is_an_error() {
        let mut store = ConfigSecretStore::new();
        store.insert(
            "proj",
            "gh",
            BTreeMap::from([(
                "secret".to_string(),
                SecretSource::Env {
                    env: "WAREHOUSE_WEBHOOKS_TEST_UNSET_VAR".into(),
                },
            )]),
        );
        assert!(matches!(
            store.get("proj", "gh").await,
            Err(SecretError::MissingEnv { .. })
        ));
    }
}
