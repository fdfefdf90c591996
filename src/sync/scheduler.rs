//! Sync scheduler for every configured provider.
//!
//! Each sweep runs four phases:
//! 1. Discovery of repositories and build definitions, when the discovery timer is due
//! 2. Refresh of due builds, registering newly seen ongoing runs
//! 3. Refresh of due runs
//! 4. Pruning of orphaned sync wrappers
//!
//! `tick()` never waits for a sweep. It starts one on the runtime when the
//! previous sweep has finished and returns straight away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{BuildWatchError, Result};
use crate::estimate::EstimatorConfig;
use crate::id::{BuildKey, ProviderName, RunKey};
use crate::model::KeyedMap;
use crate::provider::{Provider, ProviderKind, RefreshOutcome};
use crate::settings::{ProviderSettings, SaveSignal, Settings, SettingsStore};
use crate::sync::build_sync::BuildSync;
use crate::sync::priority::SyncConfig;
use crate::sync::run_sync::RunSync;

pub const TICK_INTERVAL_SECS: u64 = 1;
pub const DISCOVERY_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often `run()` ticks
    pub tick_interval_secs: u64,
    /// How often repositories and build definitions are re-listed
    pub discovery_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: TICK_INTERVAL_SECS,
            discovery_interval_secs: DISCOVERY_INTERVAL_SECS,
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, secs: u64) -> Self {
        self.tick_interval_secs = secs;
        self
    }

    pub fn with_discovery_interval(mut self, secs: u64) -> Self {
        self.discovery_interval_secs = secs;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn discovery_interval(&self) -> TimeDelta {
        TimeDelta::seconds(self.discovery_interval_secs as i64)
    }
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub discovered: bool,
    pub registered_builds: usize,
    pub registered_runs: usize,
    pub refreshed_builds: usize,
    pub refreshed_runs: usize,
    pub pruned_builds: usize,
    pub pruned_runs: usize,
}

struct Shared {
    providers: RwLock<Vec<(ProviderKind, Arc<Provider>)>>,
    builds: KeyedMap<BuildKey, BuildSync>,
    runs: KeyedMap<RunKey, RunSync>,
    last_discovery: Mutex<Option<DateTime<Utc>>>,
    config: SchedulerConfig,
    sync: SyncConfig,
    estimator: EstimatorConfig,
}

impl Shared {
    fn providers(&self) -> Vec<(ProviderKind, Arc<Provider>)> {
        self.providers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn last_discovery(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.last_discovery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn discovery_due_at(&self, now: DateTime<Utc>) -> bool {
        match *self.last_discovery() {
            Some(last) => now - last >= self.config.discovery_interval(),
            None => true,
        }
    }

    async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let providers = self.providers();

        if self.discovery_due_at(Utc::now()) {
            *self.last_discovery() = Some(Utc::now());
            self.discover(&providers).await;
            report.discovered = true;
        }

        report.registered_builds = self.register_builds(&providers);

        let due: Vec<_> = self.builds.values().into_iter().filter(|s| s.should_update()).collect();
        if !due.is_empty() {
            tracing::debug!(builds = due.len(), "Refreshing due builds");
        }
        let outcomes = join_all(due.iter().map(|s| s.refresh())).await;
        report.refreshed_builds = outcomes.iter().filter(|o| **o == RefreshOutcome::Updated).count();

        report.registered_runs = self.register_runs();

        let due: Vec<_> = self.runs.values().into_iter().filter(|s| s.should_update()).collect();
        let outcomes = join_all(due.iter().map(|s| s.refresh())).await;
        report.refreshed_runs = outcomes.iter().filter(|o| **o == RefreshOutcome::Updated).count();

        report.pruned_builds = self.builds.retain(|_, s| !s.is_orphaned());
        report.pruned_runs = self.runs.retain(|_, s| !s.is_orphaned());
        if report.pruned_builds > 0 || report.pruned_runs > 0 {
            tracing::debug!(
                builds = report.pruned_builds,
                runs = report.pruned_runs,
                "Pruned orphaned syncs"
            );
        }
        report
    }

    /// Repositories for every enabled owner, then definitions for every enabled repository
    async fn discover(&self, providers: &[(ProviderKind, Arc<Provider>)]) {
        for (_, provider) in providers {
            let owners: Vec<_> = provider.owners().values().into_iter().filter(|o| o.is_enabled()).collect();
            join_all(owners.iter().map(|owner| provider.refresh_repositories(owner))).await;

            let repositories: Vec<_> = owners
                .iter()
                .flat_map(|owner| owner.repositories().values())
                .filter(|repo| repo.is_enabled())
                .collect();
            join_all(repositories.iter().map(|repo| provider.refresh_build_definitions(repo))).await;
        }
    }

    /// A sync for every build without a live one. A build that was removed and
    /// re-added gets a fresh sync.
    fn register_builds(&self, providers: &[(ProviderKind, Arc<Provider>)]) -> usize {
        let mut registered = 0;
        for (_, provider) in providers {
            for build in provider.builds() {
                let key = build.key().clone();
                if self.builds.get(&key).is_some_and(|s| !s.is_orphaned()) {
                    continue;
                }
                self.builds.remove(&key);
                if self
                    .builds
                    .insert_if_absent(key, BuildSync::new(provider.clone(), &build, self.sync.clone()))
                {
                    registered += 1;
                }
            }
        }
        registered
    }

    /// A sync for every ongoing run not yet tracked
    fn register_runs(&self) -> usize {
        let mut registered = 0;
        for build_sync in self.builds.values() {
            let Some(build) = build_sync.build() else {
                continue;
            };
            for run in build.runs().values() {
                if !run.is_ongoing() || self.runs.get(run.key()).is_some_and(|s| !s.is_orphaned()) {
                    continue;
                }
                self.runs.remove(run.key());
                let sync = RunSync::new(
                    build_sync.provider().clone(),
                    &run,
                    self.sync.clone(),
                    self.estimator.clone(),
                );
                if self.runs.insert_if_absent(run.key().clone(), sync) {
                    registered += 1;
                }
            }
        }
        registered
    }
}

/// Drives periodic sweeps over every provider's entity tree.
pub struct Scheduler {
    shared: Arc<Shared>,
    save: SaveSignal,
    sweep: Mutex<Option<JoinHandle<SweepReport>>>,
    last_report: Mutex<Option<SweepReport>>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, sync: SyncConfig, estimator: EstimatorConfig, save: SaveSignal) -> Self {
        Self {
            shared: Arc::new(Shared {
                providers: RwLock::new(Vec::new()),
                builds: KeyedMap::new(),
                runs: KeyedMap::new(),
                last_discovery: Mutex::new(None),
                config,
                sync,
                estimator,
            }),
            save,
            sweep: Mutex::new(None),
            last_report: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// The signal providers must share to have their changes saved
    pub fn save_signal(&self) -> &SaveSignal {
        &self.save
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn add_provider(&self, kind: ProviderKind, provider: Arc<Provider>) {
        info!("Scheduler: Added provider {} ({})", provider.name(), kind);
        self.shared
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, provider));
    }

    pub fn provider(&self, name: &ProviderName) -> Option<Arc<Provider>> {
        self.shared
            .providers()
            .into_iter()
            .find(|(_, p)| p.name() == name)
            .map(|(_, p)| p)
    }

    pub fn providers(&self) -> Vec<Arc<Provider>> {
        self.shared.providers().into_iter().map(|(_, p)| p).collect()
    }

    pub fn build_syncs(&self) -> Vec<Arc<BuildSync>> {
        self.shared.builds.values()
    }

    pub fn run_syncs(&self) -> Vec<Arc<RunSync>> {
        self.shared.runs.values()
    }

    pub fn last_report(&self) -> Option<SweepReport> {
        *self.last_report.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start a sweep unless one is still in flight. Returns whether a sweep
    /// was started; a panic in the previous sweep surfaces here.
    pub async fn tick(&self) -> Result<bool> {
        let finished = {
            let mut slot = self.sweep.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return Ok(false);
            }
            slot.take()
        };

        if let Some(handle) = finished {
            self.reap(handle).await?;
        }

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { shared.sweep().await });
        *self.sweep.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(true)
    }

    async fn reap(&self, handle: JoinHandle<SweepReport>) -> Result<SweepReport> {
        match handle.await {
            Ok(report) => {
                *self.last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
                Ok(report)
            }
            Err(e) => {
                tracing::error!(error = ?e, "Sweep task panicked");
                Err(BuildWatchError::Sweep(e.to_string()))
            }
        }
    }

    /// Wait for the sweep in flight, if any, and return its report
    pub async fn wait_idle(&self) -> Result<Option<SweepReport>> {
        let handle = self.sweep.lock().unwrap_or_else(PoisonError::into_inner).take();
        match handle {
            Some(handle) => self.reap(handle).await.map(Some),
            None => Ok(None),
        }
    }

    /// Tick on the configured interval until `stop()`, saving settings as they change
    pub async fn run(&self, store: &dyn SettingsStore) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("Scheduler: Started with {} provider(s)", self.shared.providers().len());

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.tick().await {
                error!("Scheduler: {}", e);
            }
            if let Err(e) = self.save_if_queued(store) {
                error!("Scheduler: Failed to save settings - {}", e);
            }
            tokio::time::sleep(self.shared.config.tick_interval()).await;
        }

        self.wait_idle().await?;
        self.save_if_queued(store)?;
        info!("Scheduler: Stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask every provider for the owners its account can see
    pub async fn discover_owners(&self) -> Vec<(ProviderName, RefreshOutcome)> {
        let providers = self.shared.providers();
        let outcomes = join_all(providers.iter().map(|(_, p)| p.discover_owners())).await;
        providers
            .iter()
            .map(|(_, p)| p.name().clone())
            .zip(outcomes)
            .collect()
    }

    /// Drop every sync wrapper and discovered repository; discovery runs on the next sweep
    pub fn clear_data(&self) {
        self.shared.builds.clear();
        self.shared.runs.clear();
        for (_, provider) in self.shared.providers() {
            provider.clear_data();
        }
        *self.shared.last_discovery() = None;
        self.save.queue();
        info!("Scheduler: Cleared all data");
    }

    /// Restore providers' trees from saved settings
    pub fn load(&self, settings: &Settings) {
        for (_, provider) in self.shared.providers() {
            if let Some(saved) = settings.provider(provider.name()) {
                saved.restore_into(&provider);
            }
        }
    }

    /// Current persisted state of every provider
    pub fn capture(&self) -> Settings {
        Settings {
            providers: self
                .shared
                .providers()
                .iter()
                .map(|(kind, provider)| ProviderSettings::capture(provider, *kind))
                .collect(),
        }
    }

    /// Flush settings when a change has been signalled. Returns whether a save happened.
    pub fn save_if_queued(&self, store: &dyn SettingsStore) -> Result<bool> {
        if !self.save.take() {
            return Ok(false);
        }
        if let Err(e) = store.save(&self.capture()) {
            self.save.queue();
            return Err(e);
        }
        tracing::debug!("Settings saved");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunSnapshot, RunStatus};
    use crate::pacing::PacingConfig;
    use crate::provider::{BuildDefinition, Credentials, MockBackend, ProviderOptions, RepositoryInfo};
    use crate::settings::MemorySettingsStore;

    fn running(id: &str) -> RunSnapshot {
        let now = Utc::now();
        RunSnapshot {
            id: id.into(),
            name: id.into(),
            status: RunStatus::Running,
            started: now,
            last_updated: now,
            branch: "main".into(),
        }
    }

    fn backend() -> Arc<MockBackend> {
        Arc::new(
            MockBackend::new()
                .with_owner("acme")
                .with_repository("acme", RepositoryInfo {
                    id: "1".into(),
                    name: "widgets".into(),
                    archived: false,
                })
                .with_definition("1", BuildDefinition {
                    id: "10".into(),
                    name: "CI".into(),
                })
                .with_run("10", running("100")),
        )
    }

    fn scheduler(backend: Arc<MockBackend>) -> Scheduler {
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            SyncConfig::default(),
            EstimatorConfig::default(),
            SaveSignal::new(),
        );
        let provider = Arc::new(Provider::new(
            "GitHub".into(),
            backend,
            ProviderOptions::default().with_pacing(PacingConfig::immediate()),
            scheduler.save_signal().clone(),
        ));
        provider.restore_credentials(Credentials::new("octocat", "token"));
        provider.add_owner("acme".into());
        scheduler.add_provider(ProviderKind::GitHub, provider);
        scheduler
    }

    #[test]
    fn test_scheduler_config_builder() {
        let config = SchedulerConfig::default()
            .with_tick_interval(5)
            .with_discovery_interval(60);
        assert_eq!(config.tick_interval(), Duration::from_secs(5));
        assert_eq!(config.discovery_interval(), TimeDelta::seconds(60));
    }

    #[tokio::test]
    async fn test_first_sweep_discovers_and_tracks() {
        let scheduler = scheduler(backend());

        assert!(scheduler.tick().await.unwrap());
        let report = scheduler.wait_idle().await.unwrap().unwrap();

        assert!(report.discovered);
        assert_eq!(report.registered_builds, 1);
        assert_eq!(report.refreshed_builds, 1);
        assert_eq!(report.registered_runs, 1);
        assert_eq!(scheduler.build_syncs().len(), 1);
        assert_eq!(scheduler.run_syncs().len(), 1);
    }

    #[tokio::test]
    async fn test_second_sweep_skips_fresh_entities() {
        let backend = backend();
        let scheduler = scheduler(backend.clone());
        scheduler.tick().await.unwrap();
        scheduler.wait_idle().await.unwrap();
        let calls = backend.call_count();

        scheduler.tick().await.unwrap();
        let report = scheduler.wait_idle().await.unwrap().unwrap();

        assert!(!report.discovered);
        assert_eq!(report.refreshed_builds, 0);
        assert_eq!(report.refreshed_runs, 0);
        assert_eq!(backend.call_count(), calls);
    }

    #[tokio::test]
    async fn test_tick_does_not_overlap_sweeps() {
        let backend = Arc::new(
            MockBackend::new()
                .with_delay(Duration::from_millis(200))
                .with_repository("acme", RepositoryInfo {
                    id: "1".into(),
                    name: "widgets".into(),
                    archived: false,
                }),
        );
        let scheduler = scheduler(backend);

        assert!(scheduler.tick().await.unwrap());
        assert!(scheduler.is_sweeping());
        assert!(!scheduler.tick().await.unwrap());
        scheduler.wait_idle().await.unwrap();
        assert!(!scheduler.is_sweeping());
    }

    #[tokio::test]
    async fn test_removed_build_is_pruned() {
        let backend = backend();
        let scheduler = scheduler(backend.clone());
        scheduler.tick().await.unwrap();
        scheduler.wait_idle().await.unwrap();

        let provider = scheduler.provider(&"GitHub".into()).unwrap();
        let repo = provider
            .find_repository(&scheduler.build_syncs()[0].key().repository_key())
            .unwrap();
        backend.set_definitions("1", Vec::new());
        provider.refresh_build_definitions(&repo).await;

        scheduler.tick().await.unwrap();
        let report = scheduler.wait_idle().await.unwrap().unwrap();
        assert_eq!(report.pruned_builds, 1);
        assert_eq!(report.pruned_runs, 1);
        assert!(scheduler.build_syncs().is_empty());
        assert!(scheduler.run_syncs().is_empty());
    }

    #[tokio::test]
    async fn test_discover_owners_reports_per_provider() {
        let scheduler = scheduler(backend());
        let outcomes = scheduler.discover_owners().await;
        assert_eq!(outcomes, vec![(ProviderName::new("GitHub"), RefreshOutcome::Updated)]);
    }

    #[tokio::test]
    async fn test_clear_data_drops_syncs_and_queues_save() {
        let scheduler = scheduler(backend());
        scheduler.tick().await.unwrap();
        scheduler.wait_idle().await.unwrap();
        scheduler.save_signal().take();

        scheduler.clear_data();
        assert!(scheduler.build_syncs().is_empty());
        assert!(scheduler.run_syncs().is_empty());
        assert!(scheduler.save_signal().is_queued());

        let provider = scheduler.provider(&"GitHub".into()).unwrap();
        assert_eq!(provider.owners().len(), 1);
        assert!(provider.builds().is_empty());
    }

    #[tokio::test]
    async fn test_save_if_queued_writes_once() {
        let scheduler = scheduler(backend());
        let store = MemorySettingsStore::default();
        scheduler.tick().await.unwrap();
        scheduler.wait_idle().await.unwrap();

        assert!(scheduler.save_if_queued(&store).unwrap());
        assert!(!scheduler.save_if_queued(&store).unwrap());
        assert_eq!(store.save_count(), 1);

        let saved = store.current();
        let github = saved.provider(&"GitHub".into()).unwrap();
        assert_eq!(github.owners[0].repositories[0].builds[0].name.as_str(), "CI");
    }

    #[tokio::test]
    async fn test_load_restores_tree() {
        let source = scheduler(backend());
        source.tick().await.unwrap();
        source.wait_idle().await.unwrap();
        let settings = source.capture();

        let target = Scheduler::new(
            SchedulerConfig::default(),
            SyncConfig::default(),
            EstimatorConfig::default(),
            SaveSignal::new(),
        );
        let provider = Arc::new(Provider::new(
            "GitHub".into(),
            Arc::new(MockBackend::new()),
            ProviderOptions::default(),
            target.save_signal().clone(),
        ));
        target.add_provider(ProviderKind::GitHub, provider.clone());
        target.load(&settings);

        assert_eq!(provider.builds().len(), 1);
        assert!(provider.has_credentials());
        assert!(!target.save_signal().is_queued());
    }
}
