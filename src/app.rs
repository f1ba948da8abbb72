//! Wires a loaded [`Config`] into live receivers and a router.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::expr::TemplateEvaluator;
use crate::http_server;
use crate::qualifiers::DefaultSelectors;
use crate::receivers::{Receiver, ReceiverContext, Registry};
use crate::refresh::Refresher;
use crate::secrets::{ConfigSecretStore, SecretStore};
use crate::store::{MemoryStore, WarehouseStore};

pub struct App {
    pub receivers: Vec<Arc<dyn Receiver>>,
    pub router: Router,
}

/// In-memory store holding every project's Warehouses in the project's
/// namespace.
pub async fn seed_store(config: &Config) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for project in &config.projects {
        for warehouse in &project.warehouses {
            let mut warehouse = warehouse.clone();
            warehouse.namespace = project.name.clone();
            store.insert(warehouse).await;
        }
    }
    store
}

impl App {
    pub async fn from_config(config: &Config, shutdown: CancellationToken) -> Result<Self> {
        let store = seed_store(config).await;
        info!(warehouses = store.len().await, "seeded warehouse store");
        Self::build(config, store, &Registry::with_defaults(), shutdown).await
    }

    /// Builds every configured receiver against `store` and assembles the
    /// router. Any receiver that cannot be built fails the whole startup.
    pub async fn build(
        config: &Config,
        store: Arc<dyn WarehouseStore>,
        registry: &Registry,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let refresher = Refresher::new(store, Arc::new(DefaultSelectors), Arc::new(TemplateEvaluator))
            .with_concurrency(config.refresh_concurrency);
        let ctx = ReceiverContext::new(Arc::new(refresher), config.base_url.clone())
            .with_base_path(config.base_path.clone());

        let mut secrets = ConfigSecretStore::new();
        for project in &config.projects {
            for (name, keys) in &project.secrets {
                secrets.insert(&project.name, name, keys.clone());
            }
        }

        let mut receivers = Vec::new();
        for project in &config.projects {
            for receiver_config in &project.receivers {
                let secret = secrets
                    .get(&project.name, &receiver_config.secret_ref)
                    .await
                    .with_context(|| format!("receiver {:?} in project {:?}", receiver_config.name, project.name))?;
                let receiver = registry
                    .resolve(&ctx, &project.name, receiver_config, secret)
                    .with_context(|| format!("receiver {:?} in project {:?}", receiver_config.name, project.name))?;
                info!(
                    project = %project.name,
                    receiver = %receiver.details().name,
                    provider = receiver.receiver_type(),
                    url = %receiver.details().url,
                    "receiver ready"
                );
                receivers.push(receiver);
            }
        }

        let router = http_server::router(&receivers, shutdown, config.max_body_bytes)?;
        Ok(Self { receivers, router })
    }
}
