//! CI provider capability.
//!
//! A [`CiBackend`] speaks one provider's wire protocol and nothing else. The
//! [`Provider`] wraps a backend with everything that is shared across
//! backends: credentials, the owned entity tree, pacing, the concurrency gate
//! and the in-flight request registry.
//!
//! Backends report failures as [`ProviderError`]; the provider converts every
//! one of them into a status update at a single call site, so refresh callers
//! only ever see a [`RefreshOutcome`].

pub mod active;
pub mod azure_devops;
pub mod github;
mod handle;
pub mod http;
pub mod mock;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::BuildWatchError;
use crate::id::{BuildId, BuildName, OwnerName, RepositoryId, RepositoryName, RunId};
use crate::model::RunSnapshot;
use crate::pacing::{PacingConfig, RateLimitBudget};

pub use active::{ActiveRequestGuard, ActiveRequests};
pub use azure_devops::AzureDevOpsBackend;
pub use github::GitHubBackend;
pub use handle::Provider;
pub use mock::MockBackend;

/// Everything that can go wrong with one provider request
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// Entity deleted upstream
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored credentials were rejected
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Request budget exhausted
    #[error("Rate limited")]
    RateLimited {
        reset_at: Option<DateTime<Utc>>,
        budget: Option<RateLimitBudget>,
    },

    /// Network, timeout or unexpected HTTP failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Provider returned a status/conclusion pair we do not understand
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl ProviderError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// A backend response plus the budget its headers reported
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub budget: Option<RateLimitBudget>,
}

impl<T> Fetched<T> {
    pub fn new(value: T) -> Self {
        Self { value, budget: None }
    }

    pub fn with_budget(mut self, budget: Option<RateLimitBudget>) -> Self {
        self.budget = budget;
        self
    }
}

pub type FetchResult<T> = std::result::Result<Fetched<T>, ProviderError>;

/// Credentials stored for a provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub account_id: String,
    pub token: String,
}

impl Credentials {
    pub fn new(account_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            token: token.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.account_id.is_empty() && !self.token.is_empty()
    }
}

/// Credentials resolved for one request, after owner overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAuth {
    pub account_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub id: RepositoryId,
    pub name: RepositoryName,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDefinition {
    pub id: BuildId,
    pub name: BuildName,
}

/// Names and ids a backend needs to address a repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    pub owner: OwnerName,
    pub id: RepositoryId,
    pub name: RepositoryName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRef {
    pub repository: RepositoryRef,
    pub id: BuildId,
    pub name: BuildName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRef {
    pub build: BuildRef,
    pub id: RunId,
}

/// Wire protocol for one CI provider
#[async_trait]
pub trait CiBackend: Send + Sync {
    /// Owners visible to the authenticated account
    async fn discover_owners(&self, _auth: &RequestAuth) -> FetchResult<Vec<OwnerName>> {
        Ok(Fetched::new(Vec::new()))
    }

    async fn list_repositories(&self, auth: &RequestAuth, owner: &OwnerName) -> FetchResult<Vec<RepositoryInfo>>;

    async fn list_build_definitions(
        &self,
        auth: &RequestAuth,
        repository: &RepositoryRef,
    ) -> FetchResult<Vec<BuildDefinition>>;

    /// Most recent page of runs for a build
    async fn list_recent_runs(&self, auth: &RequestAuth, build: &BuildRef) -> FetchResult<Vec<RunSnapshot>>;

    async fn get_run(&self, auth: &RequestAuth, run: &RunRef) -> FetchResult<RunSnapshot>;

    /// Human-readable failure reasons for a failed run
    async fn fetch_run_errors(&self, _auth: &RequestAuth, _run: &RunRef) -> FetchResult<Vec<String>> {
        Ok(Fetched::new(Vec::new()))
    }
}

/// Result of one refresh operation, after errors were folded into provider status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated,
    /// Entity was deleted upstream and removed from its parent
    NotFound,
    /// Not attempted: disabled, missing credentials, or no longer in the tree
    Skipped,
    /// Failed; provider status records why
    Failed,
}

/// Supported backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    GitHub,
    AzureDevOps,
}

impl ProviderKind {
    pub fn all() -> [ProviderKind; 2] {
        [ProviderKind::GitHub, ProviderKind::AzureDevOps]
    }

    /// Construct the HTTP backend for this kind
    pub fn backend(&self, timeout: Duration) -> Result<Arc<dyn CiBackend>, BuildWatchError> {
        Ok(match self {
            ProviderKind::GitHub => Arc::new(GitHubBackend::new(timeout)?),
            ProviderKind::AzureDevOps => Arc::new(AzureDevOpsBackend::new(timeout)?),
        })
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::GitHub => f.write_str("GitHub"),
            ProviderKind::AzureDevOps => f.write_str("AzureDevOps"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = BuildWatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "github" => Ok(ProviderKind::GitHub),
            "azuredevops" | "azure" | "ado" => Ok(ProviderKind::AzureDevOps),
            _ => Err(BuildWatchError::UnknownProvider(s.to_string())),
        }
    }
}

/// Options shared by every provider instance
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOptions {
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub pacing: PacingConfig,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            request_timeout: Duration::from_secs(30),
            pacing: PacingConfig::default(),
        }
    }
}

impl ProviderOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
        self.pacing = pacing;
        self
    }
}
