use std::sync::Arc;

use tracing::debug;

use super::{
    artifactory, azure, bitbucket, dockerhub, generic, gitea, github, gitlab, harbor, static_targets,
    Receiver, ReceiverContext, WebhookReceiverConfig,
};
use crate::error::ConfigError;
use crate::secrets::SecretData;

pub type Predicate = Box<dyn Fn(&WebhookReceiverConfig) -> bool + Send + Sync>;

pub type Factory = Box<
    dyn Fn(&ReceiverContext, &str, &WebhookReceiverConfig, SecretData) -> Result<Arc<dyn Receiver>, ConfigError>
        + Send
        + Sync,
>;

/// Ordered (predicate, factory) pairs. The first predicate that accepts a
/// config builds its receiver.
#[derive(Default)]
pub struct Registry {
    entries: Vec<(Predicate, Factory)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in provider.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(|c| c.github.is_some(), github::factory);
        registry.register(|c| c.gitlab.is_some(), gitlab::factory);
        registry.register(|c| c.gitea.is_some(), gitea::factory);
        registry.register(|c| c.bitbucket.is_some(), bitbucket::factory);
        registry.register(|c| c.artifactory.is_some(), artifactory::factory);
        registry.register(|c| c.harbor.is_some(), harbor::factory);
        registry.register(|c| c.dockerhub.is_some(), dockerhub::factory);
        registry.register(|c| c.azure.is_some(), azure::factory);
        registry.register(|c| c.generic.is_some(), generic::factory);
        registry.register(|c| c.static_targets.is_some(), static_targets::factory);
        registry
    }

    pub fn register<P, F>(&mut self, predicate: P, factory: F)
    where
        P: Fn(&WebhookReceiverConfig) -> bool + Send + Sync + 'static,
        F: Fn(&ReceiverContext, &str, &WebhookReceiverConfig, SecretData) -> Result<Arc<dyn Receiver>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.entries.push((Box::new(predicate), Box::new(factory)));
    }

    /// Builds the receiver for `config` owned by `project`.
    pub fn resolve(
        &self,
        ctx: &ReceiverContext,
        project: &str,
        config: &WebhookReceiverConfig,
        secret: SecretData,
    ) -> Result<Arc<dyn Receiver>, ConfigError> {
        let (_, factory) = self
            .entries
            .iter()
            .find(|(predicate, _)| predicate(config))
            .ok_or_else(|| ConfigError::NoReceiver {
                name: config.name.clone(),
                providers: config.provider_keys(),
            })?;

        let receiver = factory(ctx, project, config, secret)?;
        debug!(
            project,
            receiver = %config.name,
            provider = receiver.receiver_type(),
            path = %receiver.details().path,
            "built receiver"
        );
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receivers::test_support;
    use crate::receivers::ProviderOptions;

    fn config() -> WebhookReceiverConfig {
        WebhookReceiverConfig {
            name: "hook".into(),
            secret_ref: "hook-secret".into(),
            ..Default::default()
        }
    }

    #[test]
    fn resolves_the_configured_provider() {
        let (ctx, _) = test_support::context(vec![]);
        let registry = Registry::with_defaults();

        let mut cfg = config();
        cfg.gitlab = Some(ProviderOptions::default());
        let secret = SecretData::new("hook-secret").with("secret-token", "tok");
        let receiver = registry.resolve(&ctx, "proj", &cfg, secret).unwrap();
        assert_eq!(receiver.receiver_type(), "gitlab");
        assert_eq!(receiver.required_secret_keys(), &["secret-token"]);
        assert!(receiver.details().path.starts_with("/webhook/gitlab/"));
        assert!(receiver
            .details()
            .url
            .starts_with("https://hooks.example.com/webhook/gitlab/"));
    }

    #[test]
    fn every_provider_key_resolves_to_its_receiver() {
        let (ctx, _) = test_support::context(vec![]);
        let registry = Registry::with_defaults();
        let secret = SecretData::new("hook-secret")
            .with("secret", "s")
            .with("secret-token", "t")
            .with("auth-header", "a");
        for provider in [
            "github", "gitlab", "gitea", "bitbucket", "artifactory", "harbor", "dockerhub", "azure", "generic", "static",
        ] {
            let cfg: WebhookReceiverConfig = serde_json::from_value(serde_json::json!({
                "name": "hook",
                "secretRef": "hook-secret",
                (provider): {}
            }))
            .unwrap();
            let receiver = registry.resolve(&ctx, "proj", &cfg, secret.clone()).unwrap();
            assert_eq!(receiver.receiver_type(), provider);
        }
    }

    #[test]
    fn no_match_names_the_config() {
        let (ctx, _) = test_support::context(vec![]);
        let err = Registry::new()
            .resolve(&ctx, "proj", &config(), SecretData::new("hook-secret"))
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            r#"no receiver registered for config "hook" (providers: [])"#
        );
    }

    #[test]
    fn first_registered_predicate_wins() {
        let (ctx, _) = test_support::context(vec![]);
        let mut registry = Registry::new();
        registry.register(|_| true, github::factory);
        registry.register(|_| true, |_, _, _, _| Err(ConfigError::Invalid("unreachable".into())));

        let secret = SecretData::new("hook-secret").with("secret", "s");
        let receiver = registry.resolve(&ctx, "proj", &config(), secret).unwrap();
        assert_eq!(receiver.receiver_type(), "github");
    }
}
