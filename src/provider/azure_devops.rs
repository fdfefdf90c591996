//! Azure DevOps Pipelines backend.
//!
//! The account id is the organization. Each project is an owner with exactly
//! one repository (the project itself); builds are pipeline definitions.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::id::OwnerName;
use crate::model::{RunSnapshot, RunStatus};
use crate::provider::http::{self, RawResponse};
use crate::provider::{
    BuildDefinition, BuildRef, CiBackend, FetchResult, Fetched, ProviderError, RepositoryInfo, RepositoryRef,
    RequestAuth, RunRef,
};

const API_URL: &str = "https://dev.azure.com";
const API_VERSION: &str = "7.0";
const RECENT_RUNS: usize = 10;
const BRANCH_PREFIX: &str = "refs/heads/";

#[derive(Debug, Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Project {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Definition {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureBuild {
    id: u64,
    build_number: Option<String>,
    status: Option<String>,
    result: Option<String>,
    source_branch: Option<String>,
    start_time: Option<DateTime<Utc>>,
    queue_time: Option<DateTime<Utc>>,
    finish_time: Option<DateTime<Utc>>,
}

fn map_status(status: Option<&str>, result: Option<&str>) -> std::result::Result<RunStatus, ProviderError> {
    match (status.unwrap_or_default(), result) {
        ("notStarted" | "postponed", _) => Ok(RunStatus::Pending),
        ("inProgress" | "cancelling", _) => Ok(RunStatus::Running),
        ("completed", Some("succeeded" | "partiallySucceeded")) => Ok(RunStatus::Success),
        ("completed", Some("canceled")) => Ok(RunStatus::Canceled),
        ("completed", Some("failed") | None) => Ok(RunStatus::Failure),
        (status, result) => Err(ProviderError::InvariantViolation(format!(
            "unknown build state {}/{}",
            status,
            result.unwrap_or("none")
        ))),
    }
}

impl AzureBuild {
    fn into_snapshot(self) -> std::result::Result<RunSnapshot, ProviderError> {
        let status = map_status(self.status.as_deref(), self.result.as_deref())?;
        let now = Utc::now();
        let branch = self.source_branch.unwrap_or_default();
        let branch = branch.strip_prefix(BRANCH_PREFIX).unwrap_or(&branch).to_string();
        Ok(RunSnapshot {
            id: self.id.to_string().into(),
            name: self.build_number.unwrap_or_else(|| self.id.to_string()).into(),
            status,
            started: self.start_time.or(self.queue_time).unwrap_or(now),
            last_updated: self.finish_time.unwrap_or(now),
            branch: branch.into(),
        })
    }
}

fn classify(response: &RawResponse, what: &str) -> ProviderError {
    match response.status {
        // 203 is the sign-in page served for a bad PAT
        StatusCode::UNAUTHORIZED | StatusCode::NON_AUTHORITATIVE_INFORMATION => {
            ProviderError::AuthFailed(format!("personal access token rejected for {}", what))
        }
        // PAT is valid but lacks scope on this project; other owners still work
        StatusCode::FORBIDDEN => ProviderError::transport(format!("access denied for {}", what)),
        StatusCode::TOO_MANY_REQUESTS => http::rate_limited(&response.headers),
        StatusCode::NOT_FOUND => ProviderError::not_found(what),
        status => ProviderError::transport(format!("HTTP {} for {}", status.as_u16(), what)),
    }
}

pub struct AzureDevOpsBackend {
    client: Client,
    base_url: String,
}

impl AzureDevOpsBackend {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(API_URL, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http::client(timeout)?,
            base_url: base_url.into(),
        })
    }

    /// `{base}/{organization}/{segments...}?api-version=7.0`
    fn url(&self, auth: &RequestAuth, segments: &[&str]) -> std::result::Result<Url, ProviderError> {
        let mut all = Vec::with_capacity(segments.len() + 1);
        all.push(auth.account_id.as_str());
        all.extend_from_slice(segments);
        let mut url = http::url(&self.base_url, &all)?;
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, auth: &RequestAuth, url: Url, what: &str) -> FetchResult<T> {
        debug!("AzureDevOps GET {}", url);
        let request = self.client.get(url).basic_auth("", Some(&auth.token));
        let response = http::send(request).await?;
        if response.status != StatusCode::OK {
            return Err(classify(&response, what));
        }
        Ok(Fetched::new(response.json(what)?).with_budget(response.budget()))
    }

    async fn projects(&self, auth: &RequestAuth) -> FetchResult<Vec<Project>> {
        let url = self.url(auth, &["_apis", "projects"])?;
        let fetched: Fetched<List<Project>> = self.get_json(auth, url, "projects").await?;
        Ok(Fetched::new(fetched.value.value).with_budget(fetched.budget))
    }
}

#[async_trait]
impl CiBackend for AzureDevOpsBackend {
    async fn discover_owners(&self, auth: &RequestAuth) -> FetchResult<Vec<OwnerName>> {
        let fetched = self.projects(auth).await?;
        let owners = fetched.value.into_iter().map(|p| OwnerName::new(p.name)).collect();
        Ok(Fetched::new(owners).with_budget(fetched.budget))
    }

    async fn list_repositories(&self, auth: &RequestAuth, owner: &OwnerName) -> FetchResult<Vec<RepositoryInfo>> {
        let fetched = self.projects(auth).await?;
        let project = fetched
            .value
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(owner.as_str()))
            .ok_or_else(|| {
                ProviderError::not_found(format!("project {} in organization {}", owner, auth.account_id))
            })?;
        let info = RepositoryInfo {
            id: project.id.into(),
            name: project.name.into(),
            archived: false,
        };
        Ok(Fetched::new(vec![info]).with_budget(fetched.budget))
    }

    async fn list_build_definitions(
        &self,
        auth: &RequestAuth,
        repository: &RepositoryRef,
    ) -> FetchResult<Vec<BuildDefinition>> {
        let url = self.url(auth, &[repository.owner.as_str(), "_apis", "build", "definitions"])?;
        let fetched: Fetched<List<Definition>> = self.get_json(auth, url, "build definitions").await?;
        let definitions = fetched
            .value
            .value
            .into_iter()
            .map(|d| BuildDefinition {
                id: d.id.to_string().into(),
                name: d.name.into(),
            })
            .collect();
        Ok(Fetched::new(definitions).with_budget(fetched.budget))
    }

    async fn list_recent_runs(&self, auth: &RequestAuth, build: &BuildRef) -> FetchResult<Vec<RunSnapshot>> {
        let mut url = self.url(auth, &[build.repository.owner.as_str(), "_apis", "build", "builds"])?;
        url.query_pairs_mut()
            .append_pair("definitions", build.id.as_str())
            .append_pair("$top", &RECENT_RUNS.to_string());
        let fetched: Fetched<List<AzureBuild>> = self.get_json(auth, url, "builds").await?;
        let snapshots = fetched
            .value
            .value
            .into_iter()
            .map(AzureBuild::into_snapshot)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Fetched::new(snapshots).with_budget(fetched.budget))
    }

    async fn get_run(&self, auth: &RequestAuth, run: &RunRef) -> FetchResult<RunSnapshot> {
        let url = self.url(
            auth,
            &[run.build.repository.owner.as_str(), "_apis", "build", "builds", run.id.as_str()],
        )?;
        let fetched: Fetched<AzureBuild> = self.get_json(auth, url, "build").await?;
        Ok(Fetched::new(fetched.value.into_snapshot()?).with_budget(fetched.budget))
    }
}
