//! Decides whether a single qualifier (a git ref, an image tag or a chart
//! version) is one a subscription would pick up.

use regex::Regex;
use semver::{Version, VersionReq};

use crate::types::{
    ChartSubscription, CommitSelectionStrategy, GitSubscription, ImageSelectionStrategy,
    ImageSubscription, Subscription,
};

const BRANCH_PREFIX: &str = "refs/heads/";
const TAG_PREFIX: &str = "refs/tags/";

pub trait QualifierSelector: Send + Sync {
    fn matches(&self, qualifier: &str) -> bool;
}

/// Builds the selector appropriate for a subscription's kind.
pub trait SelectorFactory: Send + Sync {
    fn new_selector(&self, subscription: &Subscription) -> Result<Box<dyn QualifierSelector>, QualifierError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QualifierError {
    #[error("invalid allowTags pattern {pattern:?}: {source}")]
    AllowTags {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid semver constraint {constraint:?}: {source}")]
    Constraint {
        constraint: String,
        #[source]
        source: semver::Error,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSelectors;

impl SelectorFactory for DefaultSelectors {
    fn new_selector(&self, subscription: &Subscription) -> Result<Box<dyn QualifierSelector>, QualifierError> {
        Ok(match subscription {
            Subscription::Git(git) => Box::new(GitSelector::new(git)?),
            Subscription::Image(image) => Box::new(ImageSelector::new(image)?),
            Subscription::Chart(chart) => Box::new(ChartSelector::new(chart)?),
        })
    }
}

/// Tag filtering shared by git tag strategies and images.
struct TagFilter {
    allow: Option<Regex>,
    ignore: Vec<String>,
}

impl TagFilter {
    fn new(allow_tags: Option<&str>, ignore_tags: &[String]) -> Result<Self, QualifierError> {
        let allow = allow_tags
            .filter(|p| !p.is_empty())
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| QualifierError::AllowTags {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .transpose()?;
        Ok(Self {
            allow,
            ignore: ignore_tags.to_vec(),
        })
    }

    fn permits(&self, tag: &str) -> bool {
        !self.ignore.iter().any(|ignored| ignored == tag)
            && self.allow.as_ref().map_or(true, |re| re.is_match(tag))
    }
}

fn parse_constraint(constraint: Option<&str>) -> Result<Option<VersionReq>, QualifierError> {
    constraint
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| {
            VersionReq::parse(c).map_err(|source| QualifierError::Constraint {
                constraint: c.to_string(),
                source,
            })
        })
        .transpose()
}

/// Parses `v1.2.3` or `1.2.3`.
fn parse_version(value: &str) -> Option<Version> {
    let value = value.trim();
    Version::parse(value.strip_prefix('v').unwrap_or(value)).ok()
}

fn satisfies(req: Option<&VersionReq>, value: &str) -> bool {
    match (req, parse_version(value)) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(req), Some(version)) => req.matches(&version),
    }
}

pub struct GitSelector {
    strategy: CommitSelectionStrategy,
    branch: Option<String>,
    tags: TagFilter,
    constraint: Option<VersionReq>,
}

impl GitSelector {
    pub fn new(sub: &GitSubscription) -> Result<Self, QualifierError> {
        Ok(Self {
            strategy: sub.commit_selection_strategy,
            branch: sub.branch.clone().filter(|b| !b.is_empty()),
            tags: TagFilter::new(sub.allow_tags.as_deref(), &sub.ignore_tags)?,
            constraint: parse_constraint(sub.semver_constraint.as_deref())?,
        })
    }
}

impl QualifierSelector for GitSelector {
    /// Branch strategies match `refs/heads/<branch>` (or a bare branch name);
    /// with no branch configured any branch ref matches. Tag strategies match
    /// `refs/tags/<tag>` refs that survive the tag filters.
    fn matches(&self, qualifier: &str) -> bool {
        match self.strategy {
            CommitSelectionStrategy::NewestFromBranch => {
                if qualifier.starts_with(TAG_PREFIX) {
                    return false;
                }
                let branch = qualifier.strip_prefix(BRANCH_PREFIX).unwrap_or(qualifier);
                self.branch.as_deref().map_or(true, |wanted| wanted == branch)
            }
            CommitSelectionStrategy::SemVer
            | CommitSelectionStrategy::Lexical
            | CommitSelectionStrategy::NewestTag => {
                let Some(tag) = qualifier.strip_prefix(TAG_PREFIX) else {
                    return false;
                };
                if !self.tags.permits(tag) {
                    return false;
                }
                self.strategy != CommitSelectionStrategy::SemVer
                    || satisfies(self.constraint.as_ref(), tag)
            }
        }
    }
}

pub struct ImageSelector {
    strategy: ImageSelectionStrategy,
    tags: TagFilter,
    constraint: Option<String>,
    range: Option<VersionReq>,
}

impl ImageSelector {
    pub fn new(sub: &ImageSubscription) -> Result<Self, QualifierError> {
        let range = match sub.image_selection_strategy {
            ImageSelectionStrategy::SemVer => parse_constraint(sub.constraint.as_deref())?,
            _ => None,
        };
        Ok(Self {
            strategy: sub.image_selection_strategy,
            tags: TagFilter::new(sub.allow_tags.as_deref(), &sub.ignore_tags)?,
            constraint: sub.constraint.clone(),
            range,
        })
    }
}

impl QualifierSelector for ImageSelector {
    fn matches(&self, tag: &str) -> bool {
        if !self.tags.permits(tag) {
            return false;
        }
        match self.strategy {
            ImageSelectionStrategy::SemVer => satisfies(self.range.as_ref(), tag),
            ImageSelectionStrategy::Digest => self.constraint.as_deref() == Some(tag),
            ImageSelectionStrategy::Lexical | ImageSelectionStrategy::NewestBuild => true,
        }
    }
}

pub struct ChartSelector {
    range: Option<VersionReq>,
}

impl ChartSelector {
    pub fn new(sub: &ChartSubscription) -> Result<Self, QualifierError> {
        Ok(Self {
            range: parse_constraint(sub.semver_constraint.as_deref())?,
        })
    }
}

impl QualifierSelector for ChartSelector {
    fn matches(&self, version: &str) -> bool {
        satisfies(self.range.as_ref(), version)
    }
}
