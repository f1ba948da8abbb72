use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::urls;

/// Index over the normalized repository URLs a Warehouse subscribes to.
pub const SUBSCRIBED_URLS_INDEX: &str = "subscribedURLs";
/// Index over object names.
pub const NAME_INDEX: &str = "metadata.name";
/// Annotation stamped on a Warehouse each time a refresh is requested.
pub const REFRESH_ANNOTATION: &str = "warehouse-webhooks/refresh-requested";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Kinds of resources a declarative target may select.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    #[default]
    Warehouse,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Warehouse => f.write_str("Warehouse"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warehouse {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

impl Warehouse {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// Normalized repository URLs across all subscriptions, sorted and unique.
    pub fn subscribed_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.subscriptions.iter().map(Subscription::repo_url).collect();
        urls.sort();
        urls.dedup();
        urls
    }
}

/// One artifact source of a Warehouse. Exactly one kind per subscription.
///
/// On the wire this is a map with one of `git`, `image` or `chart` set,
/// which reads the same from YAML and JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "SubscriptionFields", into = "SubscriptionFields")]
pub enum Subscription {
    Git(GitSubscription),
    Image(ImageSubscription),
    Chart(ChartSubscription),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git: Option<GitSubscription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<ImageSubscription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chart: Option<ChartSubscription>,
}

impl TryFrom<SubscriptionFields> for Subscription {
    type Error = String;

    fn try_from(fields: SubscriptionFields) -> Result<Self, Self::Error> {
        match (fields.git, fields.image, fields.chart) {
            (Some(git), None, None) => Ok(Subscription::Git(git)),
            (None, Some(image), None) => Ok(Subscription::Image(image)),
            (None, None, Some(chart)) => Ok(Subscription::Chart(chart)),
            (None, None, None) => Err("subscription must set one of git, image or chart".to_string()),
            _ => Err("subscription must set only one of git, image or chart".to_string()),
        }
    }
}

impl From<Subscription> for SubscriptionFields {
    fn from(subscription: Subscription) -> Self {
        match subscription {
            Subscription::Git(git) => Self { git: Some(git), ..Self::default() },
            Subscription::Image(image) => Self { image: Some(image), ..Self::default() },
            Subscription::Chart(chart) => Self { chart: Some(chart), ..Self::default() },
        }
    }
}

impl Subscription {
    /// The subscription's repository URL, normalized for its kind.
    pub fn repo_url(&self) -> String {
        match self {
            Subscription::Git(git) => urls::normalize_git(&git.repo_url),
            Subscription::Image(image) => urls::normalize_image(&image.repo_url),
            Subscription::Chart(chart) => urls::normalize_chart(&chart.repo_url),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Subscription::Git(_) => "git",
            Subscription::Image(_) => "image",
            Subscription::Chart(_) => "chart",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitSelectionStrategy {
    #[default]
    NewestFromBranch,
    SemVer,
    Lexical,
    NewestTag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSubscription {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit_selection_strategy: CommitSelectionStrategy,
    #[serde(default)]
    pub semver_constraint: Option<String>,
    #[serde(default)]
    pub allow_tags: Option<String>,
    #[serde(default)]
    pub ignore_tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSelectionStrategy {
    #[default]
    SemVer,
    Lexical,
    NewestBuild,
    Digest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSubscription {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default)]
    pub image_selection_strategy: ImageSelectionStrategy,
    /// Semver range for `SemVer`, the tracked mutable tag for `Digest`.
    #[serde(default)]
    pub constraint: Option<String>,
    #[serde(default)]
    pub allow_tags: Option<String>,
    #[serde(default)]
    pub ignore_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSubscription {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub semver_constraint: Option<String>,
}

/// Identity of a live receiver and where external senders deliver to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiverDetails {
    pub name: String,
    pub path: String,
    pub url: String,
}

/// Canonical "repository changed" signal every signal-driven receiver emits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedSignal {
    pub repo_urls: Vec<String>,
    pub qualifiers: Vec<String>,
}

impl NormalizedSignal {
    pub fn new<U, Q>(repo_urls: U, qualifiers: Q) -> Self
    where
        U: IntoIterator,
        U::Item: Into<String>,
        Q: IntoIterator,
        Q::Item: Into<String>,
    {
        Self {
            repo_urls: dedupe(repo_urls.into_iter().map(Into::into).collect()),
            qualifiers: dedupe(qualifiers.into_iter().map(Into::into).collect()),
        }
    }
}

/// Sorts, removes duplicates and drops the empty string.
pub fn dedupe(mut values: Vec<String>) -> Vec<String> {
    values.sort();
    values.dedup();
    if values.first().is_some_and(|v| v.is_empty()) {
        values.remove(0);
    }
    values
}
