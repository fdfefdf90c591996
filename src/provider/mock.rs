//! In-memory backend with scripted data and injectable failures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::id::{BuildId, OwnerName, RepositoryId, RunId};
use crate::model::RunSnapshot;
use crate::pacing::RateLimitBudget;
use crate::provider::{
    BuildDefinition, BuildRef, CiBackend, FetchResult, Fetched, ProviderError, RepositoryInfo, RepositoryRef,
    RequestAuth, RunRef,
};

const RECENT_RUNS: usize = 10;

#[derive(Debug, Default)]
struct Data {
    owners: Vec<OwnerName>,
    repositories: HashMap<OwnerName, Vec<RepositoryInfo>>,
    definitions: HashMap<RepositoryId, Vec<BuildDefinition>>,
    runs: HashMap<BuildId, Vec<RunSnapshot>>,
    errors: HashMap<RunId, Vec<String>>,
    failures: VecDeque<ProviderError>,
    build_failures: HashMap<BuildId, ProviderError>,
    budget: Option<RateLimitBudget>,
    last_token: Option<String>,
}

#[derive(Debug, Default)]
pub struct MockBackend {
    data: Mutex<Data>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call sleeps this long, to exercise gating and timeouts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_owner(self, owner: &str) -> Self {
        self.data().owners.push(owner.into());
        self
    }

    pub fn with_repository(self, owner: &str, repository: RepositoryInfo) -> Self {
        self.data()
            .repositories
            .entry(owner.into())
            .or_default()
            .push(repository);
        self
    }

    pub fn with_definition(self, repository_id: &str, definition: BuildDefinition) -> Self {
        self.data()
            .definitions
            .entry(repository_id.into())
            .or_default()
            .push(definition);
        self
    }

    pub fn with_run(self, build_id: &str, run: RunSnapshot) -> Self {
        self.upsert_run(build_id, run);
        self
    }

    pub fn with_run_errors(self, run_id: &str, errors: Vec<String>) -> Self {
        self.data().errors.insert(run_id.into(), errors);
        self
    }

    pub fn with_budget(self, budget: RateLimitBudget) -> Self {
        self.data().budget = Some(budget);
        self
    }

    pub fn set_repositories(&self, owner: &str, repositories: Vec<RepositoryInfo>) {
        self.data().repositories.insert(owner.into(), repositories);
    }

    pub fn set_definitions(&self, repository_id: &str, definitions: Vec<BuildDefinition>) {
        self.data().definitions.insert(repository_id.into(), definitions);
    }

    pub fn set_runs(&self, build_id: &str, runs: Vec<RunSnapshot>) {
        self.data().runs.insert(build_id.into(), runs);
    }

    /// Replace the run with the same id, or add it at the front
    pub fn upsert_run(&self, build_id: &str, run: RunSnapshot) {
        let mut data = self.data();
        let runs = data.runs.entry(build_id.into()).or_default();
        match runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run,
            None => runs.insert(0, run),
        }
    }

    /// The next call fails with `error`
    pub fn fail_next(&self, error: ProviderError) {
        self.data().failures.push_back(error);
    }

    /// Every run listing for `build_id` fails with `error`
    pub fn fail_build(&self, build_id: &str, error: ProviderError) {
        self.data().build_failures.insert(build_id.into(), error);
    }

    pub fn clear_failures(&self) {
        let mut data = self.data();
        data.failures.clear();
        data.build_failures.clear();
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls seen running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn last_token(&self) -> Option<String> {
        self.data().last_token.clone()
    }

    /// Bookkeeping shared by every call; returns a scripted failure if one is queued
    async fn enter(&self, auth: &RequestAuth) -> Result<InFlight<'_>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut data = self.data();
        data.last_token = Some(auth.token.clone());
        match data.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(guard),
        }
    }

    fn fetched<T>(&self, value: T) -> FetchResult<T> {
        Ok(Fetched::new(value).with_budget(self.data().budget))
    }
}

#[async_trait]
impl CiBackend for MockBackend {
    async fn discover_owners(&self, auth: &RequestAuth) -> FetchResult<Vec<OwnerName>> {
        let _guard = self.enter(auth).await?;
        let owners = self.data().owners.clone();
        self.fetched(owners)
    }

    async fn list_repositories(&self, auth: &RequestAuth, owner: &OwnerName) -> FetchResult<Vec<RepositoryInfo>> {
        let _guard = self.enter(auth).await?;
        let repositories = self.data().repositories.get(owner).cloned();
        match repositories {
            Some(repositories) => self.fetched(repositories),
            None => Err(ProviderError::not_found(format!("owner {}", owner))),
        }
    }

    async fn list_build_definitions(
        &self,
        auth: &RequestAuth,
        repository: &RepositoryRef,
    ) -> FetchResult<Vec<BuildDefinition>> {
        let _guard = self.enter(auth).await?;
        let definitions = self
            .data()
            .definitions
            .get(&repository.id)
            .cloned()
            .unwrap_or_default();
        self.fetched(definitions)
    }

    async fn list_recent_runs(&self, auth: &RequestAuth, build: &BuildRef) -> FetchResult<Vec<RunSnapshot>> {
        let _guard = self.enter(auth).await?;
        let result = {
            let data = self.data();
            match data.build_failures.get(&build.id) {
                Some(error) => Err(error.clone()),
                None => Ok(data
                    .runs
                    .get(&build.id)
                    .map(|runs| runs.iter().take(RECENT_RUNS).cloned().collect())
                    .unwrap_or_default()),
            }
        };
        self.fetched(result?)
    }

    async fn get_run(&self, auth: &RequestAuth, run: &RunRef) -> FetchResult<RunSnapshot> {
        let _guard = self.enter(auth).await?;
        let snapshot = self
            .data()
            .runs
            .get(&run.build.id)
            .and_then(|runs| runs.iter().find(|r| r.id == run.id).cloned());
        match snapshot {
            Some(snapshot) => self.fetched(snapshot),
            None => Err(ProviderError::not_found(format!("run {}", run.id))),
        }
    }

    async fn fetch_run_errors(&self, auth: &RequestAuth, run: &RunRef) -> FetchResult<Vec<String>> {
        let _guard = self.enter(auth).await?;
        let errors = self.data().errors.get(&run.id).cloned().unwrap_or_default();
        self.fetched(errors)
    }
}
