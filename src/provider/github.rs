//! GitHub Actions backend.
//!
//! Owners are users or organizations, builds are workflows and runs are
//! workflow runs. Failure reasons come from the logs of failed jobs.

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use regex::Regex;
use reqwest::header::{ACCEPT, HeaderMap};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::id::OwnerName;
use crate::model::{RunSnapshot, RunStatus};
use crate::pacing::RateLimitBudget;
use crate::provider::http::{self, RawResponse};
use crate::provider::{
    BuildDefinition, BuildRef, CiBackend, FetchResult, Fetched, ProviderError, RepositoryInfo, RepositoryRef,
    RequestAuth, RunRef,
};

const API_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const PAGE_SIZE: usize = 100;
const MAX_PAGES: u32 = 10;
const RECENT_RUNS: usize = 10;
const MAX_LOG_ERRORS: usize = 10;
/// Job logs read per failed run; later failed jobs report their failed steps
const MAX_JOB_LOGS: usize = 3;
const ERROR_MARKER: &str = "##[error]";

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Organization {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Repository {
    id: u64,
    name: String,
    #[serde(default)]
    archived: bool,
}

#[derive(Debug, Deserialize)]
struct WorkflowList {
    #[serde(default)]
    workflows: Vec<Workflow>,
}

#[derive(Debug, Deserialize)]
struct Workflow {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunList {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRun {
    id: u64,
    name: Option<String>,
    run_number: Option<u64>,
    status: Option<String>,
    conclusion: Option<String>,
    head_branch: Option<String>,
    run_started_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct JobList {
    #[serde(default)]
    jobs: Vec<Job>,
}

#[derive(Debug, Deserialize)]
struct Job {
    id: u64,
    name: String,
    conclusion: Option<String>,
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
struct Step {
    name: String,
    conclusion: Option<String>,
}

/// Failed step names of a job, or a bare marker when no step is flagged
fn step_errors(job: &Job) -> Vec<String> {
    let failed_steps: Vec<_> = job
        .steps
        .iter()
        .filter(|step| step.conclusion.as_deref() == Some("failure"))
        .map(|step| format!("[{}] {}", job.name, step.name))
        .collect();
    if failed_steps.is_empty() {
        vec![format!("[{}] Failed", job.name)]
    } else {
        failed_steps
    }
}

/// Map a workflow run's status/conclusion pair onto our lifecycle
fn map_status(status: Option<&str>, conclusion: Option<&str>) -> std::result::Result<RunStatus, ProviderError> {
    match (status.unwrap_or_default(), conclusion) {
        ("requested" | "queued" | "waiting" | "pending", _) => Ok(RunStatus::Pending),
        ("in_progress", _) => Ok(RunStatus::Running),
        ("completed", Some("success" | "neutral")) => Ok(RunStatus::Success),
        ("completed", Some("failure" | "startup_failure" | "timed_out" | "action_required" | "stale")) => {
            Ok(RunStatus::Failure)
        }
        ("completed", Some("cancelled" | "skipped")) => Ok(RunStatus::Canceled),
        (status, conclusion) => Err(ProviderError::InvariantViolation(format!(
            "unknown workflow run state {}/{}",
            status,
            conclusion.unwrap_or("none")
        ))),
    }
}

impl WorkflowRun {
    fn into_snapshot(self) -> std::result::Result<RunSnapshot, ProviderError> {
        let status = map_status(self.status.as_deref(), self.conclusion.as_deref())?;
        let now = Utc::now();
        let name = match (self.name, self.run_number) {
            (Some(name), _) if !name.is_empty() => name,
            (_, Some(number)) => format!("#{}", number),
            _ => self.id.to_string(),
        };
        Ok(RunSnapshot {
            id: self.id.to_string().into(),
            name: name.into(),
            status,
            started: self.run_started_at.or(self.created_at).unwrap_or(now),
            last_updated: self.updated_at.unwrap_or(now),
            branch: self.head_branch.unwrap_or_default().into(),
        })
    }
}

fn error_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)(?:^|\s)error\s*:(.*)").ok())
        .as_ref()
}

/// Pull error messages out of a job log: `##[error]` annotations first, then
/// lines shaped like `error: ...`. Deduplicated ignoring case, at most ten.
pub fn parse_log_errors(log: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut errors = Vec::new();

    for line in log.lines() {
        let line = line.trim();
        let lower = line.to_ascii_lowercase();
        let message = if let Some(index) = lower.find(ERROR_MARKER) {
            Some(line[index + ERROR_MARKER.len()..].trim())
        } else {
            error_pattern()
                .and_then(|pattern| pattern.captures(line))
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim())
        };

        if let Some(message) = message
            && !message.is_empty()
            && seen.insert(message.to_ascii_lowercase())
        {
            errors.push(message.to_string());
        }
    }

    errors.truncate(MAX_LOG_ERRORS);
    errors
}

/// Turn a non-success response into the matching error
fn classify(response: &RawResponse, what: &str) -> ProviderError {
    classify_parts(response.status, &response.headers, &response.body, what)
}

fn classify_parts(status: StatusCode, headers: &HeaderMap, body: &str, what: &str) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED => ProviderError::AuthFailed(format!("token rejected for {}", what)),
        // 403 covers both exhausted budgets and missing permissions
        StatusCode::FORBIDDEN => {
            if http::budget_exhausted(headers) || body.to_ascii_lowercase().contains("rate limit") {
                http::rate_limited(headers)
            } else {
                ProviderError::AuthFailed(format!("access denied for {}", what))
            }
        }
        StatusCode::TOO_MANY_REQUESTS => http::rate_limited(headers),
        StatusCode::NOT_FOUND => ProviderError::not_found(what),
        status => ProviderError::transport(format!("HTTP {} for {}", status.as_u16(), what)),
    }
}

pub struct GitHubBackend {
    client: Client,
    base_url: String,
}

impl GitHubBackend {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(API_URL, timeout)
    }

    /// Point at a GitHub Enterprise API root or a test server
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http::client(timeout)?,
            base_url: base_url.into(),
        })
    }

    fn url(&self, segments: &[&str]) -> std::result::Result<Url, ProviderError> {
        http::url(&self.base_url, segments)
    }

    async fn get(
        &self,
        auth: &RequestAuth,
        url: Url,
        what: &str,
    ) -> std::result::Result<RawResponse, ProviderError> {
        debug!("GitHub GET {}", url);
        let request = self
            .client
            .get(url)
            .bearer_auth(&auth.token)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        let response = http::send(request).await?;
        if response.status.is_success() {
            Ok(response)
        } else {
            Err(classify(&response, what))
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, auth: &RequestAuth, url: Url, what: &str) -> FetchResult<T> {
        let response = self.get(auth, url, what).await?;
        Ok(Fetched::new(response.json(what)?).with_budget(response.budget()))
    }

    /// Follow `page=` until a short page or the page cap
    async fn get_pages<P, T>(
        &self,
        auth: &RequestAuth,
        segments: &[&str],
        what: &str,
        items: impl Fn(P) -> Vec<T>,
    ) -> FetchResult<Vec<T>>
    where
        P: DeserializeOwned,
    {
        let mut all = Vec::new();
        let mut budget: Option<RateLimitBudget> = None;
        for page in 1..=MAX_PAGES {
            let mut url = self.url(segments)?;
            url.query_pairs_mut()
                .append_pair("per_page", &PAGE_SIZE.to_string())
                .append_pair("page", &page.to_string());
            let fetched: Fetched<P> = self.get_json(auth, url, what).await?;
            budget = fetched.budget.or(budget);
            let batch = items(fetched.value);
            let done = batch.len() < PAGE_SIZE;
            all.extend(batch);
            if done {
                break;
            }
        }
        Ok(Fetched::new(all).with_budget(budget))
    }

    async fn current_user(&self, auth: &RequestAuth) -> FetchResult<User> {
        self.get_json(auth, self.url(&["user"])?, "current user").await
    }

    async fn job_log_errors(&self, auth: &RequestAuth, owner: &str, repo: &str, job_id: u64) -> Vec<String> {
        let job_id = job_id.to_string();
        let url = match self.url(&["repos", owner, repo, "actions", "jobs", &job_id, "logs"]) {
            Ok(url) => url,
            Err(_) => return Vec::new(),
        };
        match self.get(auth, url, "job log").await {
            Ok(response) => parse_log_errors(&response.body),
            Err(e) => {
                debug!("GitHub: could not read log for job {}: {}", job_id, e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl CiBackend for GitHubBackend {
    async fn discover_owners(&self, auth: &RequestAuth) -> FetchResult<Vec<OwnerName>> {
        let user = self.current_user(auth).await?;
        let orgs: Fetched<Vec<Organization>> = self
            .get_pages(auth, &["user", "orgs"], "organizations", |page: Vec<Organization>| page)
            .await?;

        let mut owners = vec![OwnerName::new(user.value.login)];
        owners.extend(orgs.value.into_iter().map(|org| OwnerName::new(org.login)));
        Ok(Fetched::new(owners).with_budget(orgs.budget.or(user.budget)))
    }

    async fn list_repositories(&self, auth: &RequestAuth, owner: &OwnerName) -> FetchResult<Vec<RepositoryInfo>> {
        // Private repositories of the authenticated user only show up under /user/repos
        let user = match self.current_user(auth).await {
            Ok(user) => Some(user.value),
            Err(ProviderError::AuthFailed(_)) => None,
            Err(e) => return Err(e),
        };

        let identity = |page: Vec<Repository>| page;
        let (repositories, budget) = if user.is_some_and(|u| u.login.eq_ignore_ascii_case(owner.as_str())) {
            let fetched = self
                .get_pages(auth, &["user", "repos"], "user repositories", identity)
                .await?;
            (fetched.value, fetched.budget)
        } else {
            let mut repositories = Vec::new();
            let mut budget = None;
            let mut found = false;
            for kind in ["users", "orgs"] {
                match self
                    .get_pages(auth, &[kind, owner.as_str(), "repos"], "repositories", identity)
                    .await
                {
                    Ok(fetched) => {
                        found = true;
                        budget = fetched.budget.or(budget);
                        repositories.extend(fetched.value);
                    }
                    Err(ProviderError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            if !found {
                return Err(ProviderError::not_found(format!("owner {}", owner)));
            }
            (repositories, budget)
        };

        let mut seen = HashSet::new();
        let infos = repositories
            .into_iter()
            .filter(|repo| seen.insert(repo.id))
            .map(|repo| RepositoryInfo {
                id: repo.id.to_string().into(),
                name: repo.name.into(),
                archived: repo.archived,
            })
            .collect();
        Ok(Fetched::new(infos).with_budget(budget))
    }

    async fn list_build_definitions(
        &self,
        auth: &RequestAuth,
        repository: &RepositoryRef,
    ) -> FetchResult<Vec<BuildDefinition>> {
        let segments = [
            "repos",
            repository.owner.as_str(),
            repository.name.as_str(),
            "actions",
            "workflows",
        ];
        let fetched = self
            .get_pages(auth, &segments, "workflows", |page: WorkflowList| page.workflows)
            .await?;
        let definitions = fetched
            .value
            .into_iter()
            .map(|workflow| BuildDefinition {
                id: workflow.id.to_string().into(),
                name: workflow.name.into(),
            })
            .collect();
        Ok(Fetched::new(definitions).with_budget(fetched.budget))
    }

    async fn list_recent_runs(&self, auth: &RequestAuth, build: &BuildRef) -> FetchResult<Vec<RunSnapshot>> {
        let repository = &build.repository;
        let mut url = self.url(&[
            "repos",
            repository.owner.as_str(),
            repository.name.as_str(),
            "actions",
            "workflows",
            build.id.as_str(),
            "runs",
        ])?;
        url.query_pairs_mut()
            .append_pair("per_page", &RECENT_RUNS.to_string())
            .append_pair("page", "1");

        let fetched: Fetched<WorkflowRunList> = self.get_json(auth, url, "workflow runs").await?;
        let snapshots = fetched
            .value
            .workflow_runs
            .into_iter()
            .map(WorkflowRun::into_snapshot)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Fetched::new(snapshots).with_budget(fetched.budget))
    }

    async fn get_run(&self, auth: &RequestAuth, run: &RunRef) -> FetchResult<RunSnapshot> {
        let repository = &run.build.repository;
        let url = self.url(&[
            "repos",
            repository.owner.as_str(),
            repository.name.as_str(),
            "actions",
            "runs",
            run.id.as_str(),
        ])?;
        let fetched: Fetched<WorkflowRun> = self.get_json(auth, url, "workflow run").await?;
        Ok(Fetched::new(fetched.value.into_snapshot()?).with_budget(fetched.budget))
    }

    async fn fetch_run_errors(&self, auth: &RequestAuth, run: &RunRef) -> FetchResult<Vec<String>> {
        let repository = &run.build.repository;
        let (owner, repo) = (repository.owner.as_str(), repository.name.as_str());
        let url = self.url(&["repos", owner, repo, "actions", "runs", run.id.as_str(), "jobs"])?;
        let fetched: Fetched<JobList> = self.get_json(auth, url, "workflow jobs").await?;

        let mut errors = Vec::new();
        let failed = fetched
            .value
            .jobs
            .iter()
            .filter(|job| job.conclusion.as_deref() == Some("failure"));
        for (index, job) in failed.enumerate() {
            if index < MAX_JOB_LOGS {
                let log_errors = self.job_log_errors(auth, owner, repo, job.id).await;
                if !log_errors.is_empty() {
                    errors.extend(log_errors.into_iter().map(|e| format!("[{}] {}", job.name, e)));
                    continue;
                }
            }
            errors.extend(step_errors(job));
        }
        Ok(Fetched::new(errors).with_budget(fetched.budget))
    }
}
