//! Scheduling state for one ongoing run.
//!
//! The poll interval tunes itself: after each refresh it becomes the run's ETA,
//! clamped to the configured bounds, so runs close to finishing are polled
//! more often.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::estimate::EstimatorConfig;
use crate::id::RunKey;
use crate::model::Run;
use crate::provider::{Provider, RefreshOutcome};
use crate::sync::priority::SyncConfig;

#[derive(Debug, Clone, Copy)]
struct Timing {
    last_refresh: DateTime<Utc>,
    interval: Duration,
}

#[derive(Debug)]
pub struct RunSync {
    provider: Arc<Provider>,
    key: RunKey,
    run: Weak<Run>,
    config: SyncConfig,
    estimator: EstimatorConfig,
    timing: Mutex<Timing>,
}

impl RunSync {
    /// The countdown starts now; the run was just fetched with its build
    pub fn new(provider: Arc<Provider>, run: &Arc<Run>, config: SyncConfig, estimator: EstimatorConfig) -> Self {
        let interval = config.run_min_interval();
        Self {
            provider,
            key: run.key().clone(),
            run: Arc::downgrade(run),
            config,
            estimator,
            timing: Mutex::new(Timing {
                last_refresh: Utc::now(),
                interval,
            }),
        }
    }

    fn timing(&self) -> MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &RunKey {
        &self.key
    }

    pub fn run(&self) -> Option<Arc<Run>> {
        let run = self.run.upgrade()?;
        let current = self.provider.find_run(&self.key)?;
        Arc::ptr_eq(&run, &current).then_some(run)
    }

    /// Gone from its build, or finished
    pub fn is_orphaned(&self) -> bool {
        self.run().is_none_or(|run| !run.is_ongoing())
    }

    pub fn interval(&self) -> Duration {
        self.timing().interval
    }

    pub fn last_refresh(&self) -> DateTime<Utc> {
        self.timing().last_refresh
    }

    pub fn should_update_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_orphaned() {
            return false;
        }
        let timing = *self.timing();
        (now - timing.last_refresh).to_std().unwrap_or(Duration::ZERO) >= timing.interval
    }

    pub fn should_update(&self) -> bool {
        self.should_update_at(Utc::now())
    }

    pub fn time_remaining_at(&self, now: DateTime<Utc>) -> Duration {
        let timing = *self.timing();
        let elapsed = (now - timing.last_refresh).to_std().unwrap_or(Duration::ZERO);
        timing.interval.saturating_sub(elapsed)
    }

    /// Re-fetch the run; if it is still going, poll again after its ETA
    pub async fn refresh(&self) -> RefreshOutcome {
        let Some(run) = self.run() else {
            return RefreshOutcome::Skipped;
        };
        let outcome = self.provider.refresh_run(&run).await;

        let now = Utc::now();
        let mut interval = self.interval();
        if run.is_ongoing()
            && let Some(build) = self.provider.find_build(&self.key.build_key())
        {
            let estimate = build.calculate_estimated_duration_with(Some(&run.branch()), &self.estimator);
            let eta = run.calculate_eta_at(estimate, now);
            interval = self.config.run_interval_for(eta);
        }
        *self.timing() = Timing {
            last_refresh: now,
            interval,
        };
        tracing::debug!(run = %self.key, outcome = ?outcome, interval_secs = interval.as_secs(), "Run refreshed");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Build, RunSnapshot, RunStatus};
    use crate::pacing::PacingConfig;
    use crate::provider::{BuildDefinition, Credentials, MockBackend, ProviderOptions, RepositoryInfo};
    use crate::settings::SaveSignal;
    use chrono::TimeDelta;

    fn snapshot(id: &str, status: RunStatus, started: DateTime<Utc>, secs: i64) -> RunSnapshot {
        RunSnapshot {
            id: id.into(),
            name: id.into(),
            status,
            started,
            last_updated: started + TimeDelta::seconds(secs),
            branch: "main".into(),
        }
    }

    async fn setup(backend: MockBackend) -> (Arc<Provider>, Arc<MockBackend>, Arc<Build>) {
        let backend = Arc::new(
            backend
                .with_repository("acme", RepositoryInfo {
                    id: "1".into(),
                    name: "widgets".into(),
                    archived: false,
                })
                .with_definition("1", BuildDefinition {
                    id: "10".into(),
                    name: "CI".into(),
                }),
        );
        let provider = Arc::new(Provider::new(
            "GitHub".into(),
            backend.clone(),
            ProviderOptions::default().with_pacing(PacingConfig::immediate()),
            SaveSignal::new(),
        ));
        provider.restore_credentials(Credentials::new("octocat", "token"));
        let (owner, _) = provider.add_owner("acme".into());
        provider.refresh_repositories(&owner).await;
        let repo = owner.repositories().get(&"1".into()).unwrap();
        provider.refresh_build_definitions(&repo).await;
        let build = repo.builds().get(&"10".into()).unwrap();
        provider.refresh_build(&build).await;
        (provider, backend, build)
    }

    fn sync_for(provider: &Arc<Provider>, build: &Build, id: &str) -> RunSync {
        let run = build.runs().get(&id.into()).unwrap();
        RunSync::new(provider.clone(), &run, SyncConfig::default(), EstimatorConfig::default())
    }

    #[tokio::test]
    async fn test_new_run_sync_waits_minimum_interval() {
        let now = Utc::now();
        let (provider, _backend, build) =
            setup(MockBackend::new().with_run("10", snapshot("100", RunStatus::Running, now, 0))).await;
        let sync = sync_for(&provider, &build, "100");

        assert_eq!(sync.interval(), Duration::from_secs(10));
        assert!(!sync.should_update_at(sync.last_refresh() + TimeDelta::seconds(9)));
        assert!(sync.should_update_at(sync.last_refresh() + TimeDelta::seconds(10)));
    }

    #[tokio::test]
    async fn test_interval_follows_eta_within_bounds() {
        let now = Utc::now();
        let mut backend = MockBackend::new();
        // History says runs take 45s
        for i in 0..5 {
            let started = now - TimeDelta::hours(1) - TimeDelta::minutes(i);
            backend = backend.with_run("10", snapshot(&format!("h{}", i), RunStatus::Success, started, 45));
        }
        let backend = backend.with_run("10", snapshot("100", RunStatus::Running, now, 0));
        let (provider, _backend, build) = setup(backend).await;
        let sync = sync_for(&provider, &build, "100");

        assert_eq!(sync.refresh().await, RefreshOutcome::Updated);
        let interval = sync.interval();
        assert!(interval >= Duration::from_secs(10) && interval <= Duration::from_secs(60));
        assert!(interval <= Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_unknown_eta_uses_minimum() {
        let now = Utc::now();
        let (provider, _backend, build) =
            setup(MockBackend::new().with_run("10", snapshot("100", RunStatus::Running, now, 0))).await;
        let sync = sync_for(&provider, &build, "100");

        sync.refresh().await;
        assert_eq!(sync.interval(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_finished_run_is_orphaned() {
        let now = Utc::now();
        let (provider, backend, build) =
            setup(MockBackend::new().with_run("10", snapshot("100", RunStatus::Running, now, 0))).await;
        let sync = sync_for(&provider, &build, "100");
        assert!(!sync.is_orphaned());

        backend.upsert_run("10", snapshot("100", RunStatus::Success, now, 30));
        sync.refresh().await;
        assert!(sync.is_orphaned());
        assert!(!sync.should_update_at(Utc::now() + TimeDelta::hours(1)));
    }

    #[tokio::test]
    async fn test_vanished_run_is_orphaned() {
        let now = Utc::now();
        let (provider, backend, build) =
            setup(MockBackend::new().with_run("10", snapshot("100", RunStatus::Running, now, 0))).await;
        let sync = sync_for(&provider, &build, "100");

        backend.set_runs("10", Vec::new());
        assert_eq!(sync.refresh().await, RefreshOutcome::NotFound);
        assert!(sync.is_orphaned());
        assert!(build.runs().is_empty());
    }
}
