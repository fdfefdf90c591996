//! The per-provider wrapper around a backend.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::Semaphore;

use crate::id::{BuildKey, OwnerKey, OwnerName, ProviderName, RepositoryKey, RunKey};
use crate::model::{Build, KeyedMap, Owner, Repository, Run, RunSnapshot, RunStatus};
use crate::pacing::{Pacer, ProviderStatus};
use crate::provider::active::ActiveRequests;
use crate::provider::{
    BuildRef, CiBackend, Credentials, FetchResult, ProviderError, ProviderOptions, RefreshOutcome, RepositoryRef,
    RequestAuth, RunRef,
};
use crate::settings::SaveSignal;

/// Result of a paced request after errors were recorded as status
enum Outcome<T> {
    Done(T),
    NotFound,
    Failed,
}

/// One configured CI provider: credentials, owned entity tree, pacing and gate.
pub struct Provider {
    name: ProviderName,
    backend: Arc<dyn CiBackend>,
    credentials: RwLock<Credentials>,
    owners: KeyedMap<OwnerName, Owner>,
    pacer: Mutex<Pacer>,
    gate: Semaphore,
    active: ActiveRequests,
    save: SaveSignal,
    request_timeout: Duration,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("owners", &self.owners.len())
            .field("status", &self.status())
            .finish()
    }
}

impl Provider {
    pub fn new(name: ProviderName, backend: Arc<dyn CiBackend>, options: ProviderOptions, save: SaveSignal) -> Self {
        Self {
            name,
            backend,
            credentials: RwLock::new(Credentials::default()),
            owners: KeyedMap::new(),
            pacer: Mutex::new(Pacer::new(options.pacing)),
            gate: Semaphore::new(options.concurrency.max(1)),
            active: ActiveRequests::new(),
            save,
            request_timeout: options.request_timeout,
        }
    }

    pub fn name(&self) -> &ProviderName {
        &self.name
    }

    pub fn owners(&self) -> &KeyedMap<OwnerName, Owner> {
        &self.owners
    }

    pub fn active_requests(&self) -> &ActiveRequests {
        &self.active
    }

    fn pacer(&self) -> MutexGuard<'_, Pacer> {
        self.pacer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the pacing state for display
    pub fn pacing(&self) -> Pacer {
        self.pacer().clone()
    }

    pub fn status(&self) -> ProviderStatus {
        self.pacer().status()
    }

    pub fn status_message(&self) -> String {
        self.pacer().message().to_string()
    }

    pub fn rate_limit_display(&self) -> Option<String> {
        self.pacer().rate_limit_display()
    }

    pub fn rate_limit_detailed_status(&self) -> Option<String> {
        self.pacer().detailed_status_at(chrono::Utc::now())
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Store new credentials and lift any auth failure
    pub fn set_credentials(&self, credentials: Credentials) {
        self.restore_credentials(credentials);
        self.pacer().clear_auth_failure();
        self.save.queue();
        info!("{}: Credentials updated", self.name);
    }

    /// Load credentials from settings without queueing a save
    pub fn restore_credentials(&self, credentials: Credentials) {
        *self.credentials.write().unwrap_or_else(PoisonError::into_inner) = credentials;
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials().is_complete()
    }

    fn on_auth_failure(&self, path: &str, reason: &str) {
        error!("{}: Authentication failed for '{}' - {}", self.name, path, reason);
        *self.credentials.write().unwrap_or_else(PoisonError::into_inner) = Credentials::default();
        self.pacer().record_auth_failure();
        self.save.queue();
    }

    /// Requests stop after an auth failure until credentials are re-supplied
    fn is_auth_blocked(&self) -> bool {
        self.status() == ProviderStatus::AuthFailed || self.credentials().account_id.is_empty()
    }

    /// Credentials for a request, preferring an owner's token override
    fn auth_for(&self, owner_token: Option<String>) -> Option<RequestAuth> {
        let credentials = self.credentials();
        let token = owner_token.unwrap_or(credentials.token);
        if credentials.account_id.is_empty() || token.is_empty() {
            return None;
        }
        Some(RequestAuth {
            account_id: credentials.account_id,
            token,
        })
    }

    /// Build an owner stamped with this provider's name. Does not insert it.
    pub fn create_owner(&self, name: OwnerName) -> Owner {
        Owner::new(OwnerKey::new(self.name.clone(), name))
    }

    /// Track an owner; returns it and whether it was new
    pub fn add_owner(&self, name: OwnerName) -> (Arc<Owner>, bool) {
        let (owner, inserted) = self.owners.get_or_insert_with(name.clone(), || self.create_owner(name));
        if inserted {
            info!("{}: Added owner {}", self.name, owner.name());
            self.save.queue();
        }
        (owner, inserted)
    }

    pub fn remove_owner(&self, name: &OwnerName) -> bool {
        let removed = self.owners.remove(name).is_some();
        if removed {
            info!("{}: Removed owner {}", self.name, name);
            self.save.queue();
        }
        removed
    }

    /// Drop every discovered repository, keeping owners and credentials
    pub fn clear_data(&self) {
        for owner in self.owners.values() {
            owner.repositories().clear();
        }
        self.save.queue();
    }

    pub fn find_repository(&self, key: &RepositoryKey) -> Option<Arc<Repository>> {
        if key.provider != self.name {
            return None;
        }
        self.owners.get(&key.owner)?.repositories().get(&key.repository)
    }

    pub fn find_build(&self, key: &BuildKey) -> Option<Arc<Build>> {
        self.find_repository(&key.repository_key())?.builds().get(&key.build)
    }

    pub fn find_run(&self, key: &RunKey) -> Option<Arc<Run>> {
        self.find_build(&key.build_key())?.runs().get(&key.run)
    }

    /// True when the build and every ancestor is enabled
    pub fn is_build_active(&self, key: &BuildKey) -> bool {
        let Some(owner) = self.owners.get(&key.owner) else {
            return false;
        };
        let Some(repository) = owner.repositories().get(&key.repository) else {
            return false;
        };
        owner.is_enabled()
            && repository.is_enabled()
            && repository.builds().get(&key.build).is_some_and(|build| build.is_enabled())
    }

    /// Every build in the tree
    pub fn builds(&self) -> Vec<Arc<Build>> {
        self.owners
            .values()
            .iter()
            .flat_map(|owner| owner.repositories().values())
            .flat_map(|repo| repo.builds().values())
            .collect()
    }

    fn repository_ref(&self, repository: &Repository) -> RepositoryRef {
        RepositoryRef {
            owner: repository.key().owner.clone(),
            id: repository.id().clone(),
            name: repository.name().clone(),
        }
    }

    fn build_ref(&self, build: &Build) -> Option<BuildRef> {
        let repository = self.find_repository(&build.key().repository_key())?;
        Some(BuildRef {
            repository: self.repository_ref(&repository),
            id: build.id().clone(),
            name: build.name(),
        })
    }

    /// `{provider}/{owner}/{repo}/{build}` using display names
    pub fn build_path(&self, build: &Build) -> String {
        let key = build.key();
        let repo = self
            .find_repository(&key.repository_key())
            .map(|r| r.name().to_string())
            .unwrap_or_else(|| key.repository.to_string());
        format!("{}/{}/{}/{}", self.name, key.owner, repo, build.name())
    }

    /// True while any request for the build or one of its runs is in flight
    pub fn is_build_updating(&self, build: &Build) -> bool {
        self.active.any_with_prefix(&self.build_path(build))
    }

    /// Gate, pace, register and run one backend call. Every error becomes a
    /// status update here; only not-found is reported back distinctly.
    async fn request<T, F, Fut>(&self, path: String, call: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<T>>,
    {
        let _permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("{}: Request gate closed for '{}' - {}", self.name, path, e);
                return Outcome::Failed;
            }
        };
        if self.is_auth_blocked() {
            debug!("{}: Dropping '{}', credentials need re-entry", self.name, path);
            return Outcome::Failed;
        }

        let wait = self.pacer().wait_time();
        if wait > self.pacer().config().base_delay() {
            tracing::debug!(provider = %self.name, path = %path, wait_ms = wait.as_millis() as u64, "Pacing request");
        }
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
            if self.is_auth_blocked() {
                debug!("{}: Dropping '{}', credentials need re-entry", self.name, path);
                return Outcome::Failed;
            }
        }

        let _active = self.active.begin(path.clone());
        let result = match tokio::time::timeout(self.request_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::transport(format!(
                "request timed out after {}s",
                self.request_timeout.as_secs()
            ))),
        };

        match result {
            Ok(fetched) => {
                self.pacer().record_success(fetched.budget);
                Outcome::Done(fetched.value)
            }
            Err(ProviderError::NotFound(resource)) => {
                debug!("{}: Not found '{}' ({})", self.name, path, resource);
                Outcome::NotFound
            }
            Err(ProviderError::AuthFailed(reason)) => {
                self.on_auth_failure(&path, &reason);
                Outcome::Failed
            }
            Err(ProviderError::RateLimited { reset_at, budget }) => {
                warn!("{}: Rate limited on '{}'", self.name, path);
                self.pacer().record_rate_limit(reset_at, budget);
                Outcome::Failed
            }
            Err(ProviderError::Transport(message)) => {
                error!("{}: Connection error for '{}' - {}", self.name, path, message);
                self.pacer().record_error(format!("Connection error: {}", message));
                Outcome::Failed
            }
            Err(ProviderError::InvariantViolation(message)) => {
                error!("{}: Unexpected provider data for '{}' - {}", self.name, path, message);
                self.pacer().record_error(format!("Unexpected provider data: {}", message));
                Outcome::Failed
            }
        }
    }

    /// Ask the backend which owners the account can see and track new ones.
    pub async fn discover_owners(&self) -> RefreshOutcome {
        let Some(auth) = self.auth_for(None) else {
            return RefreshOutcome::Skipped;
        };
        info!("{}: Discovering owners for account {}", self.name, auth.account_id);

        let path = format!("{}/discover", self.name);
        match self.request(path, || self.backend.discover_owners(&auth)).await {
            Outcome::Done(names) => {
                for name in names {
                    if self.add_owner(name.clone()).1 {
                        info!("{}: Discovered owner {}", self.name, name);
                    }
                }
                info!("{}: Owner discovery complete, {} owners", self.name, self.owners.len());
                RefreshOutcome::Updated
            }
            Outcome::NotFound => RefreshOutcome::NotFound,
            Outcome::Failed => RefreshOutcome::Failed,
        }
    }

    /// Sync an owner's repository list. Archived repositories are dropped.
    pub async fn refresh_repositories(&self, owner: &Arc<Owner>) -> RefreshOutcome {
        if !owner.is_enabled() {
            return RefreshOutcome::Skipped;
        }
        let Some(auth) = self.auth_for(owner.token()) else {
            return RefreshOutcome::Skipped;
        };

        let path = format!("{}/{}", self.name, owner.name());
        let repositories = match self
            .request(path, || self.backend.list_repositories(&auth, owner.name()))
            .await
        {
            Outcome::Done(repositories) => repositories,
            Outcome::NotFound => {
                warn!("{}: Owner {} not found", self.name, owner.name());
                self.pacer().record_error(format!("Owner '{}' not found", owner.name()));
                return RefreshOutcome::NotFound;
            }
            Outcome::Failed => return RefreshOutcome::Failed,
        };

        let mut added = 0;
        let mut archived = 0;
        for info in repositories {
            if info.archived {
                if owner.repositories().remove(&info.id).is_some() {
                    archived += 1;
                    self.save.queue();
                }
                continue;
            }
            let (repository, inserted) = owner
                .repositories()
                .get_or_insert_with(info.id.clone(), || owner.create_repository(info.name.clone(), info.id.clone()));
            if inserted {
                added += 1;
                info!("{}: Discovered repository {}/{}", self.name, owner.name(), repository.name());
                self.save.queue();
            }
        }
        if added > 0 || archived > 0 {
            info!(
                "{}: Repositories for {}: {} new, {} archived removed, {} total",
                self.name,
                owner.name(),
                added,
                archived,
                owner.repositories().len()
            );
        }
        RefreshOutcome::Updated
    }

    /// Sync a repository's build definitions, picking up renames and dropping
    /// definitions the provider no longer reports.
    pub async fn refresh_build_definitions(&self, repository: &Arc<Repository>) -> RefreshOutcome {
        if !repository.is_enabled() {
            return RefreshOutcome::Skipped;
        }
        let Some(owner) = self.owners.get(&repository.key().owner) else {
            return RefreshOutcome::Skipped;
        };
        let Some(auth) = self.auth_for(owner.token()) else {
            return RefreshOutcome::Skipped;
        };

        let repo_ref = self.repository_ref(repository);
        let path = format!("{}/{}/{}", self.name, owner.name(), repository.name());
        let definitions = match self
            .request(path, || self.backend.list_build_definitions(&auth, &repo_ref))
            .await
        {
            Outcome::Done(definitions) => definitions,
            Outcome::NotFound => {
                info!("{}: Repository {}/{} no longer exists", self.name, owner.name(), repository.name());
                owner.repositories().remove(repository.id());
                self.save.queue();
                return RefreshOutcome::NotFound;
            }
            Outcome::Failed => return RefreshOutcome::Failed,
        };

        let reported: Vec<_> = definitions.iter().map(|d| d.id.clone()).collect();
        for definition in definitions {
            let (build, inserted) = repository.builds().get_or_insert_with(definition.id.clone(), || {
                repository.create_build(definition.name.clone(), definition.id.clone())
            });
            if inserted {
                info!(
                    "{}: Discovered build {}/{}/{}",
                    self.name,
                    owner.name(),
                    repository.name(),
                    definition.name
                );
                self.save.queue();
            } else if build.rename(definition.name.clone()) {
                info!("{}: Build {} renamed to {}", self.name, build.id(), definition.name);
                self.save.queue();
            }
        }

        let dropped = repository.builds().retain(|id, _| reported.contains(id));
        if dropped > 0 {
            info!(
                "{}: Dropped {} build(s) no longer reported for {}/{}",
                self.name,
                dropped,
                owner.name(),
                repository.name()
            );
            self.save.queue();
        }
        RefreshOutcome::Updated
    }

    /// Fetch the most recent runs of a build and fold them into the tree
    pub async fn refresh_build(&self, build: &Arc<Build>) -> RefreshOutcome {
        if !self.is_build_active(build.key()) {
            return RefreshOutcome::Skipped;
        }
        let Some(owner) = self.owners.get(&build.key().owner) else {
            return RefreshOutcome::Skipped;
        };
        let Some(auth) = self.auth_for(owner.token()) else {
            return RefreshOutcome::Skipped;
        };
        let Some(build_ref) = self.build_ref(build) else {
            return RefreshOutcome::Skipped;
        };

        let path = self.build_path(build);
        let snapshots = match self
            .request(path.clone(), || self.backend.list_recent_runs(&auth, &build_ref))
            .await
        {
            Outcome::Done(snapshots) => snapshots,
            Outcome::NotFound => {
                info!("{}: Build {} no longer exists", self.name, path);
                if let Some(repository) = self.find_repository(&build.key().repository_key()) {
                    repository.builds().remove(build.id());
                }
                self.save.queue();
                return RefreshOutcome::NotFound;
            }
            Outcome::Failed => return RefreshOutcome::Failed,
        };

        for snapshot in snapshots {
            let (run, _) = build
                .runs()
                .get_or_insert_with(snapshot.id.clone(), || build.create_run(snapshot.name.clone(), snapshot.id.clone()));
            self.apply_snapshot(build, &run, &snapshot, &build_ref, &auth, &path).await;
        }
        RefreshOutcome::Updated
    }

    /// Re-fetch one run
    pub async fn refresh_run(&self, run: &Arc<Run>) -> RefreshOutcome {
        let Some(build) = self.find_build(&run.key().build_key()) else {
            return RefreshOutcome::Skipped;
        };
        if !self.is_build_active(build.key()) {
            return RefreshOutcome::Skipped;
        }
        let Some(owner) = self.owners.get(&build.key().owner) else {
            return RefreshOutcome::Skipped;
        };
        let Some(auth) = self.auth_for(owner.token()) else {
            return RefreshOutcome::Skipped;
        };
        let Some(build_ref) = self.build_ref(&build) else {
            return RefreshOutcome::Skipped;
        };

        let run_ref = RunRef {
            build: build_ref.clone(),
            id: run.id().clone(),
        };
        let build_path = self.build_path(&build);
        let path = format!("{}/{}", build_path, run.name());
        let snapshot = match self.request(path, || self.backend.get_run(&auth, &run_ref)).await {
            Outcome::Done(snapshot) => snapshot,
            Outcome::NotFound => {
                debug!("{}: Run {} no longer exists", self.name, run.key());
                build.runs().remove(run.id());
                return RefreshOutcome::NotFound;
            }
            Outcome::Failed => return RefreshOutcome::Failed,
        };

        self.apply_snapshot(&build, run, &snapshot, &build_ref, &auth, &build_path)
            .await;
        RefreshOutcome::Updated
    }

    async fn apply_snapshot(
        &self,
        build: &Build,
        run: &Run,
        snapshot: &RunSnapshot,
        build_ref: &BuildRef,
        auth: &RequestAuth,
        build_path: &str,
    ) {
        let previous = run.apply(snapshot);
        let status = snapshot.status;

        if previous != status {
            let target = format!("{} on {}", build_path, snapshot.branch);
            match status {
                RunStatus::Failure => warn!("Build failed: {}", target),
                RunStatus::Success if previous == RunStatus::Running => info!("Build succeeded: {}", target),
                RunStatus::Running => info!("Build started: {}", target),
                _ => {}
            }
        }

        if status == RunStatus::Failure && (previous != RunStatus::Failure || run.errors().is_empty()) {
            let run_ref = RunRef {
                build: build_ref.clone(),
                id: run.id().clone(),
            };
            let path = format!("{}/{}/errors", build_path, snapshot.name);
            if let Outcome::Done(errors) = self
                .request(path, || self.backend.fetch_run_errors(auth, &run_ref))
                .await
            {
                run.set_errors(errors);
            }
        }

        build.update_from_run(run);
    }
}
