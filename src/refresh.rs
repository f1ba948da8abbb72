//! Turns a change signal or a set of declarative targets into refresh calls
//! against the store and aggregates the per-object outcomes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::http::StatusCode;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::expr::Evaluator;
use crate::qualifiers::SelectorFactory;
use crate::receivers::WebhookResponse;
use crate::selector::{self, FieldPredicate, QueryPredicate, TargetSelectionCriteria};
use crate::store::WarehouseStore;
use crate::types::{dedupe, ObjectKey, ResourceKind, Warehouse, SUBSCRIBED_URLS_INDEX};

pub const DEFAULT_CONCURRENCY: usize = 8;
const CANCELLED: &str = "refresh cancelled";

pub struct Refresher {
    store: Arc<dyn WarehouseStore>,
    selectors: Arc<dyn SelectorFactory>,
    evaluator: Arc<dyn Evaluator>,
    concurrency: usize,
}

/// Aggregate of one signal-driven refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalOutcome {
    pub refreshed: Vec<ObjectKey>,
    pub failed: Vec<(ObjectKey, String)>,
    /// `(repo url, error)` for each URL whose listing failed.
    pub list_errors: Vec<(String, String)>,
}

impl SignalOutcome {
    pub fn attempted(&self) -> usize {
        self.refreshed.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.list_errors.is_empty()
    }

    pub fn into_response(self) -> WebhookResponse {
        let total = self.attempted();
        if self.is_success() {
            return WebhookResponse::msg(StatusCode::OK, format!("refreshed {total} warehouse(s)"));
        }

        let mut message = format!("failed to refresh {} of {total} warehouse(s)", self.failed.len());
        for (url, err) in &self.list_errors {
            message.push_str(&format!("; error listing warehouses for {url}: {err}"));
        }
        for (key, err) in &self.failed {
            message.push_str(&format!("; {key}: {err}"));
        }
        WebhookResponse::error(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResult {
    pub key: ObjectKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome for one target. A listing error means no objects were attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResult {
    pub kind: ResourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub selected_objects: Vec<ObjectResult>,
}

impl TargetResult {
    pub fn has_failures(&self) -> bool {
        self.list_error.is_some() || self.selected_objects.iter().any(|o| o.error.is_some())
    }
}

impl Refresher {
    pub fn new(
        store: Arc<dyn WarehouseStore>,
        selectors: Arc<dyn SelectorFactory>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        Self {
            store,
            selectors,
            evaluator,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn evaluator(&self) -> &dyn Evaluator {
        self.evaluator.as_ref()
    }

    /// Refreshes every Warehouse in `project` subscribed to one of
    /// `repo_urls` whose selector accepts one of `qualifiers`. Empty
    /// qualifiers accept every URL match.
    pub async fn refresh_by_signal(
        &self,
        cancel: &CancellationToken,
        project: &str,
        repo_urls: &[String],
        qualifiers: &[String],
    ) -> SignalOutcome {
        let repo_urls = dedupe(repo_urls.to_vec());
        let qualifiers = dedupe(qualifiers.to_vec());
        let mut outcome = SignalOutcome::default();

        let mut candidates: BTreeMap<ObjectKey, Warehouse> = BTreeMap::new();
        for url in &repo_urls {
            let mut predicates = Vec::with_capacity(2);
            if !project.is_empty() {
                predicates.push(QueryPredicate::InNamespace(project.to_string()));
            }
            predicates.push(QueryPredicate::Field(FieldPredicate::equals(SUBSCRIBED_URLS_INDEX, url)));

            match self.store.list(ResourceKind::Warehouse, &predicates).await {
                Ok(found) => {
                    for warehouse in found {
                        candidates.entry(warehouse.key()).or_insert(warehouse);
                    }
                }
                Err(e) => {
                    warn!(repo_url = %url, error = %e, "error listing warehouses");
                    outcome.list_errors.push((url.clone(), e.to_string()));
                }
            }
        }

        let url_set: BTreeSet<&str> = repo_urls.iter().map(String::as_str).collect();
        let selected: Vec<ObjectKey> = candidates
            .into_values()
            .filter(|warehouse| qualifiers.is_empty() || self.accepts(warehouse, &url_set, &qualifiers))
            .map(|warehouse| warehouse.key())
            .collect();
        debug!(
            repo_urls = ?repo_urls,
            qualifiers = ?qualifiers,
            selected = selected.len(),
            "selected warehouses for refresh"
        );

        for (key, result) in self.refresh_all(cancel, selected).await {
            match result {
                Ok(()) => outcome.refreshed.push(key),
                Err(e) => outcome.failed.push((key, e)),
            }
        }
        info!(
            project,
            refreshed = outcome.refreshed.len(),
            failed = outcome.failed.len(),
            "refreshed warehouses"
        );
        outcome
    }

    /// Resolves each target against `env`, lists and refreshes what it
    /// selects. A failing target never stops the others.
    pub async fn refresh_by_targets(
        &self,
        cancel: &CancellationToken,
        project: &str,
        env: &Value,
        targets: &[TargetSelectionCriteria],
    ) -> Vec<TargetResult> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            results.push(self.refresh_target(cancel, project, env, target).await);
        }
        results
    }

    async fn refresh_target(
        &self,
        cancel: &CancellationToken,
        project: &str,
        env: &Value,
        target: &TargetSelectionCriteria,
    ) -> TargetResult {
        let failed = |err: String| TargetResult {
            kind: target.kind,
            list_error: Some(err),
            selected_objects: Vec::new(),
        };

        let predicates = match selector::build(self.evaluator.as_ref(), project, target, env) {
            Ok(p) => p,
            Err(e) => {
                warn!(kind = %target.kind, error = %e, "error building target selector");
                return failed(e.to_string());
            }
        };
        let found = match self.store.list(target.kind, &predicates).await {
            Ok(found) => found,
            Err(e) => {
                warn!(kind = %target.kind, error = %e, "error listing target objects");
                return failed(e.to_string());
            }
        };

        let keys = found.iter().map(Warehouse::key).collect();
        let selected_objects = self
            .refresh_all(cancel, keys)
            .await
            .into_iter()
            .map(|(key, result)| ObjectResult {
                key,
                error: result.err(),
            })
            .collect();
        TargetResult {
            kind: target.kind,
            list_error: None,
            selected_objects,
        }
    }

    fn accepts(&self, warehouse: &Warehouse, urls: &BTreeSet<&str>, qualifiers: &[String]) -> bool {
        warehouse
            .subscriptions
            .iter()
            .filter(|sub| urls.contains(sub.repo_url().as_str()))
            .any(|sub| match self.selectors.new_selector(sub) {
                Ok(sel) => qualifiers.iter().any(|q| sel.matches(q)),
                Err(e) => {
                    warn!(
                        warehouse = %warehouse.key(),
                        subscription = sub.kind(),
                        error = %e,
                        "error building qualifier selector"
                    );
                    false
                }
            })
    }

    /// Refreshes `keys` with bounded concurrency. Results come back in key
    /// order. Objects not yet attempted when `cancel` fires are reported as
    /// cancelled.
    async fn refresh_all(
        &self,
        cancel: &CancellationToken,
        keys: Vec<ObjectKey>,
    ) -> Vec<(ObjectKey, Result<(), String>)> {
        let mut results: Vec<_> = stream::iter(keys)
            .map(|key| async move {
                if cancel.is_cancelled() {
                    return (key, Err(CANCELLED.to_string()));
                }
                let result = self.store.refresh(&key).await.map_err(|e| {
                    warn!(warehouse = %key, error = %e, "error refreshing warehouse");
                    e.to_string()
                });
                (key, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::expr::TemplateEvaluator;
    use crate::qualifiers::DefaultSelectors;
    use crate::selector::{IndexOperator, IndexSelector, IndexSelectorRequirement};
    use crate::store::{MemoryStore, StoreError};
    use crate::types::{GitSubscription, ImageSubscription, Subscription};

    fn git_warehouse(name: &str, url: &str, branch: &str) -> Warehouse {
        Warehouse {
            namespace: "proj".into(),
            name: name.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            subscriptions: vec![Subscription::Git(GitSubscription {
                repo_url: url.into(),
                branch: Some(branch.into()),
                commit_selection_strategy: Default::default(),
                semver_constraint: None,
                allow_tags: None,
                ignore_tags: vec![],
            })],
        }
    }

    fn refresher(store: Arc<dyn WarehouseStore>) -> Refresher {
        Refresher::new(store, Arc::new(DefaultSelectors), Arc::new(TemplateEvaluator))
    }

    /// Store that fails refreshes for one name.
    struct FlakyStore {
        inner: MemoryStore,
        fail: &'static str,
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl WarehouseStore for FlakyStore {
        async fn list(&self, kind: ResourceKind, predicates: &[QueryPredicate]) -> Result<Vec<Warehouse>, StoreError> {
            self.inner.list(kind, predicates).await
        }

        async fn refresh(&self, key: &ObjectKey) -> Result<(), StoreError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if key.name == self.fail {
                return Err(StoreError::Backend("conflict".into()));
            }
            self.inner.refresh(key).await
        }
    }

    #[tokio::test]
    async fn branch_qualifier_picks_the_right_warehouse() {
        let store = Arc::new(MemoryStore::with_warehouses([
            git_warehouse("main", "https://github.com/org/repo", "main"),
            git_warehouse("dev", "https://github.com/org/repo", "dev"),
        ]));
        let outcome = refresher(store.clone())
            .refresh_by_signal(
                &CancellationToken::new(),
                "proj",
                &["https://github.com/org/repo".into()],
                &["refs/heads/main".into()],
            )
            .await;

        assert_eq!(outcome.refreshed, vec![ObjectKey::new("proj", "main")]);
        assert_eq!(store.refresh_count(&ObjectKey::new("proj", "dev")).await, 0);
        let response = outcome.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &json!({"msg": "refreshed 1 warehouse(s)"}));
    }

    #[tokio::test]
    async fn candidates_are_deduplicated_across_urls() {
        let mut warehouse = git_warehouse("both", "https://github.com/org/repo", "main");
        warehouse.subscriptions.push(Subscription::Image(ImageSubscription {
            repo_url: "ghcr.io/org/repo".into(),
            image_selection_strategy: Default::default(),
            constraint: None,
            allow_tags: None,
            ignore_tags: vec![],
        }));
        let store = Arc::new(MemoryStore::with_warehouses([warehouse]));
        let refresher = refresher(store.clone());
        let urls = vec![
            "https://github.com/org/repo".to_string(),
            "ghcr.io/org/repo".to_string(),
            "ghcr.io/org/repo".to_string(),
        ];

        for _ in 0..2 {
            let outcome = refresher
                .refresh_by_signal(&CancellationToken::new(), "proj", &urls, &[])
                .await;
            assert_eq!(outcome.attempted(), 1);
        }
        assert_eq!(store.refresh_count(&ObjectKey::new("proj", "both")).await, 2);
    }

    #[tokio::test]
    async fn partial_failure_yields_500() {
        let inner = MemoryStore::with_warehouses([
            git_warehouse("ok", "https://x.io/a", "main"),
            git_warehouse("bad", "https://x.io/a", "main"),
        ]);
        let store = Arc::new(FlakyStore {
            inner,
            fail: "bad",
            refreshes: AtomicUsize::new(0),
        });
        let outcome = refresher(store.clone())
            .refresh_by_signal(&CancellationToken::new(), "proj", &["https://x.io/a".into()], &[])
            .await;

        assert_eq!(store.refreshes.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.refreshed.len(), 1);
        let response = outcome.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let error = response.body()["error"].as_str().unwrap();
        assert!(error.starts_with("failed to refresh 1 of 2 warehouse(s)"), "{error}");
    }

    #[tokio::test]
    async fn cancelled_token_issues_no_refreshes() {
        let store = Arc::new(MemoryStore::with_warehouses([git_warehouse(
            "main",
            "https://x.io/a",
            "main",
        )]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = refresher(store.clone())
            .refresh_by_signal(&cancel, "proj", &["https://x.io/a".into()], &[])
            .await;

        assert_eq!(
            outcome.failed,
            vec![(ObjectKey::new("proj", "main"), CANCELLED.to_string())]
        );
        assert_eq!(store.refresh_count(&ObjectKey::new("proj", "main")).await, 0);
    }

    #[tokio::test]
    async fn targets_record_list_errors_per_target() {
        let store = Arc::new(MemoryStore::with_warehouses([git_warehouse(
            "main",
            "https://x.io/a",
            "main",
        )]));
        let by_name = TargetSelectionCriteria {
            name: Some("${{ request.body.name }}".into()),
            ..Default::default()
        };
        let by_unknown_index = TargetSelectionCriteria {
            index_selector: IndexSelector {
                match_indices: vec![IndexSelectorRequirement {
                    key: "region".into(),
                    operator: IndexOperator::Equal,
                    value: "us".into(),
                }],
            },
            ..Default::default()
        };
        let env = json!({"request": {"body": {"name": "main"}}});

        let results = refresher(store)
            .refresh_by_targets(&CancellationToken::new(), "proj", &env, &[by_name, by_unknown_index])
            .await;

        assert!(!results[0].has_failures());
        assert_eq!(results[0].selected_objects[0].key, ObjectKey::new("proj", "main"));
        assert!(results[1].list_error.as_deref().unwrap().contains("region"));
        assert!(results[1].selected_objects.is_empty());
    }
}
