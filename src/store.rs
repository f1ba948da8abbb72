use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::selector::QueryPredicate;
use crate::types::{ObjectKey, ResourceKind, Warehouse, NAME_INDEX, REFRESH_ANNOTATION, SUBSCRIBED_URLS_INDEX};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("no index registered for field {0:?}")]
    UnknownIndex(String),

    #[error("{kind} {key} not found")]
    NotFound { kind: ResourceKind, key: ObjectKey },

    #[error("{0}")]
    Backend(String),
}

/// The resource store the pipeline reads Warehouses from and refreshes.
#[async_trait]
pub trait WarehouseStore: Send + Sync {
    /// Objects of `kind` matching every predicate.
    async fn list(&self, kind: ResourceKind, predicates: &[QueryPredicate]) -> Result<Vec<Warehouse>, StoreError>;

    /// Requests a refresh of one object. One call is one attempt.
    async fn refresh(&self, key: &ObjectKey) -> Result<(), StoreError>;
}

/// Values of `index` for one Warehouse.
pub fn index_values(index: &str, warehouse: &Warehouse) -> Result<Vec<String>, StoreError> {
    match index {
        SUBSCRIBED_URLS_INDEX => Ok(warehouse.subscribed_urls()),
        NAME_INDEX => Ok(vec![warehouse.name.clone()]),
        "metadata.namespace" => Ok(vec![warehouse.namespace.clone()]),
        other => Err(StoreError::UnknownIndex(other.to_string())),
    }
}

/// Whether `warehouse` satisfies every predicate.
pub fn matches_all(predicates: &[QueryPredicate], warehouse: &Warehouse) -> Result<bool, StoreError> {
    for predicate in predicates {
        let ok = match predicate {
            QueryPredicate::InNamespace(ns) => warehouse.namespace == *ns,
            QueryPredicate::Field(field) => field.matches(&index_values(&field.key, warehouse)?),
            QueryPredicate::Labels(selector) => selector.matches(&warehouse.labels),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// In-process store keyed by namespace/name.
#[derive(Default)]
pub struct MemoryStore {
    warehouses: RwLock<BTreeMap<ObjectKey, Warehouse>>,
    refresh_counts: RwLock<HashMap<ObjectKey, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_warehouses(warehouses: impl IntoIterator<Item = Warehouse>) -> Self {
        let map = warehouses.into_iter().map(|w| (w.key(), w)).collect();
        Self {
            warehouses: RwLock::new(map),
            refresh_counts: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a Warehouse, replacing any with the same key.
    pub async fn insert(&self, warehouse: Warehouse) {
        self.warehouses.write().await.insert(warehouse.key(), warehouse);
    }

    pub async fn get(&self, key: &ObjectKey) -> Option<Warehouse> {
        self.warehouses.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.warehouses.read().await.len()
    }

    /// Number of refreshes requested for `key` since startup.
    pub async fn refresh_count(&self, key: &ObjectKey) -> u64 {
        self.refresh_counts.read().await.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl WarehouseStore for MemoryStore {
    async fn list(&self, kind: ResourceKind, predicates: &[QueryPredicate]) -> Result<Vec<Warehouse>, StoreError> {
        let warehouses = self.warehouses.read().await;
        let mut out = Vec::new();
        for warehouse in warehouses.values() {
            if matches_all(predicates, warehouse)? {
                out.push(warehouse.clone());
            }
        }
        debug!(%kind, matched = out.len(), "listed objects");
        Ok(out)
    }

    async fn refresh(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut warehouses = self.warehouses.write().await;
        let warehouse = warehouses.get_mut(key).ok_or_else(|| StoreError::NotFound {
            kind: ResourceKind::Warehouse,
            key: key.clone(),
        })?;
        warehouse
            .annotations
            .insert(REFRESH_ANNOTATION.to_string(), Utc::now().to_rfc3339());
        drop(warehouses);

        *self.refresh_counts.write().await.entry(key.clone()).or_default() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::FieldPredicate;
    use crate::types::{GitSubscription, Subscription};

    fn warehouse(ns: &str, name: &str, url: &str) -> Warehouse {
        Warehouse {
            namespace: ns.into(),
            name: name.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            subscriptions: vec![Subscription::Git(GitSubscription {
                repo_url: url.into(),
                branch: None,
                commit_selection_strategy: Default::default(),
                semver_constraint: None,
                allow_tags: None,
                ignore_tags: vec![],
            })],
        }
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_index() {
        let store = MemoryStore::with_warehouses([
            warehouse("a", "one", "https://example.com/org/repo.git"),
            warehouse("a", "two", "https://example.com/org/other"),
            warehouse("b", "three", "https://example.com/org/repo"),
        ]);
        let found = store
            .list(
                ResourceKind::Warehouse,
                &[
                    QueryPredicate::InNamespace("a".into()),
                    QueryPredicate::Field(FieldPredicate::equals(
                        SUBSCRIBED_URLS_INDEX,
                        "https://example.com/org/repo",
                    )),
                ],
            )
            .await
            .unwrap();
        let names: Vec<_> = found.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["one"]);
    }

    #[tokio::test]
    async fn unknown_index_is_a_listing_error() {
        let store = MemoryStore::with_warehouses([warehouse("a", "one", "https://x/y")]);
        let err = store
            .list(
                ResourceKind::Warehouse,
                &[QueryPredicate::Field(FieldPredicate::equals("region", "us"))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownIndex(key) if key == "region"));
    }

    #[tokio::test]
    async fn refresh_stamps_annotation_and_counts() {
        let store = MemoryStore::with_warehouses([warehouse("a", "one", "https://x/y")]);
        let key = ObjectKey::new("a", "one");
        store.refresh(&key).await.unwrap();
        store.refresh(&key).await.unwrap();
        assert_eq!(store.refresh_count(&key).await, 2);
        let stored = store.get(&key).await.unwrap();
        assert!(stored.annotations.contains_key(REFRESH_ANNOTATION));

        let missing = store.refresh(&ObjectKey::new("a", "nope")).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }
}
