//! End-to-end sync integration tests
//!
//! Drives the scheduler against the scripted mock backend: discovery, refresh,
//! pruning, the per-provider gate, error handling and settings persistence.

use std::sync::Arc;
use std::time::Duration;

use buildwatch::estimate::EstimatorConfig;
use buildwatch::id::ProviderName;
use buildwatch::model::{RunSnapshot, RunStatus};
use buildwatch::pacing::{PacingConfig, ProviderStatus};
use buildwatch::provider::{
    BuildDefinition, Credentials, MockBackend, Provider, ProviderError, ProviderKind, ProviderOptions, RefreshOutcome,
    RepositoryInfo,
};
use buildwatch::settings::{SaveSignal, SettingsStore, YamlSettingsStore};
use buildwatch::sync::{Scheduler, SchedulerConfig, SyncConfig};
use chrono::{TimeDelta, Utc};
use futures::future::join_all;
use tempfile::TempDir;

fn snapshot(id: &str, status: RunStatus, secs: i64) -> RunSnapshot {
    let started = Utc::now() - TimeDelta::seconds(secs);
    RunSnapshot {
        id: id.into(),
        name: format!("#{}", id).into(),
        status,
        started,
        last_updated: Utc::now(),
        branch: "main".into(),
    }
}

fn repository() -> RepositoryInfo {
    RepositoryInfo {
        id: "1".into(),
        name: "widgets".into(),
        archived: false,
    }
}

fn definition(id: &str) -> BuildDefinition {
    BuildDefinition {
        id: id.into(),
        name: format!("pipeline-{}", id).into(),
    }
}

fn new_scheduler() -> Scheduler {
    Scheduler::new(
        SchedulerConfig::default(),
        SyncConfig::default(),
        EstimatorConfig::default(),
        SaveSignal::new(),
    )
}

fn attach(scheduler: &Scheduler, backend: Arc<MockBackend>, options: ProviderOptions) -> Arc<Provider> {
    let provider = Arc::new(Provider::new(
        "GitHub".into(),
        backend,
        options.with_pacing(PacingConfig::immediate()),
        scheduler.save_signal().clone(),
    ));
    provider.restore_credentials(Credentials::new("octocat", "token"));
    provider.add_owner("acme".into());
    scheduler.add_provider(ProviderKind::GitHub, provider.clone());
    provider
}

async fn sweep(scheduler: &Scheduler) {
    assert!(scheduler.tick().await.unwrap());
    scheduler.wait_idle().await.unwrap();
}

#[tokio::test]
async fn test_run_lifecycle_from_discovery_to_prune() {
    let backend = Arc::new(
        MockBackend::new()
            .with_repository("acme", repository())
            .with_definition("1", definition("10"))
            .with_run("10", snapshot("100", RunStatus::Running, 30)),
    );
    let scheduler = new_scheduler();
    let provider = attach(&scheduler, backend.clone(), ProviderOptions::default());

    sweep(&scheduler).await;
    let build = provider.builds().pop().unwrap();
    assert_eq!(build.last_status(), Some(RunStatus::Running));
    assert_eq!(provider.build_path(&build), "GitHub/acme/widgets/pipeline-10");
    assert_eq!(scheduler.run_syncs().len(), 1);

    backend.upsert_run("10", snapshot("100", RunStatus::Success, 90));
    let run_sync = scheduler.run_syncs().pop().unwrap();
    assert_eq!(run_sync.refresh().await, RefreshOutcome::Updated);
    assert_eq!(build.last_status(), Some(RunStatus::Success));
    assert!(!build.is_ongoing());

    sweep(&scheduler).await;
    let report = scheduler.last_report().unwrap();
    assert_eq!(report.pruned_runs, 1);
    assert!(scheduler.run_syncs().is_empty());
    assert_eq!(scheduler.build_syncs().len(), 1);
}

#[tokio::test]
async fn test_gate_bounds_concurrent_requests() {
    let mut backend = MockBackend::new()
        .with_delay(Duration::from_millis(20))
        .with_repository("acme", repository());
    for i in 0..20 {
        backend = backend.with_definition("1", definition(&format!("{}", 100 + i)));
    }
    let backend = Arc::new(backend);
    let scheduler = new_scheduler();
    let provider = attach(&scheduler, backend.clone(), ProviderOptions::default().with_concurrency(3));

    sweep(&scheduler).await;

    assert_eq!(provider.builds().len(), 20);
    assert_eq!(scheduler.last_report().unwrap().refreshed_builds, 20);
    assert!(backend.max_in_flight() <= 3);
    assert!(backend.max_in_flight() > 1);
    assert!(provider.active_requests().is_empty());
}

#[tokio::test]
async fn test_failing_build_does_not_abort_sweep() {
    let backend = Arc::new(
        MockBackend::new()
            .with_repository("acme", repository())
            .with_definition("1", definition("10"))
            .with_definition("1", definition("11"))
            .with_run("11", snapshot("200", RunStatus::Success, 60)),
    );
    backend.fail_build("10", ProviderError::transport("connection reset"));
    let scheduler = new_scheduler();
    let provider = attach(&scheduler, backend, ProviderOptions::default());

    sweep(&scheduler).await;

    assert_eq!(scheduler.last_report().unwrap().refreshed_builds, 1);
    assert_eq!(provider.builds().len(), 2);
    assert_eq!(scheduler.build_syncs().len(), 2);

    let key = scheduler
        .build_syncs()
        .into_iter()
        .find(|s| s.key().build.as_str() == "11")
        .unwrap()
        .key()
        .clone();
    assert_eq!(provider.find_build(&key).unwrap().last_status(), Some(RunStatus::Success));
}

#[tokio::test]
async fn test_auth_failure_clears_credentials_and_queues_save() {
    let backend = Arc::new(MockBackend::new().with_repository("acme", repository()));
    backend.fail_next(ProviderError::AuthFailed("bad credentials".into()));
    let scheduler = new_scheduler();
    let provider = attach(&scheduler, backend.clone(), ProviderOptions::default());
    scheduler.save_signal().take();

    sweep(&scheduler).await;

    assert_eq!(provider.status(), ProviderStatus::AuthFailed);
    assert!(!provider.has_credentials());
    assert!(scheduler.save_signal().is_queued());

    let calls = backend.call_count();
    assert_eq!(provider.discover_owners().await, RefreshOutcome::Skipped);
    assert_eq!(backend.call_count(), calls);

    provider.set_credentials(Credentials::new("octocat", "fresh"));
    assert_eq!(provider.status(), ProviderStatus::Ok);
}

#[tokio::test]
async fn test_queued_requests_stop_after_auth_failure() {
    let mut backend = MockBackend::new()
        .with_delay(Duration::from_millis(10))
        .with_repository("acme", repository());
    for i in 0..6 {
        backend = backend.with_definition("1", definition(&format!("{}", 10 + i)));
    }
    let backend = Arc::new(backend);
    let scheduler = new_scheduler();
    let provider = attach(&scheduler, backend.clone(), ProviderOptions::default().with_concurrency(1));
    sweep(&scheduler).await;
    assert_eq!(scheduler.build_syncs().len(), 6);

    backend.fail_next(ProviderError::AuthFailed("token revoked".into()));
    let calls = backend.call_count();
    let syncs = scheduler.build_syncs();
    let outcomes = join_all(syncs.iter().map(|sync| sync.refresh())).await;

    assert_eq!(backend.call_count(), calls + 1);
    assert!(!outcomes.contains(&RefreshOutcome::Updated));
    assert_eq!(provider.status(), ProviderStatus::AuthFailed);
    assert!(!provider.has_credentials());

    provider.set_credentials(Credentials::new("octocat", "fresh"));
    assert_eq!(syncs[0].refresh().await, RefreshOutcome::Updated);
    assert_eq!(backend.call_count(), calls + 2);
    assert_eq!(provider.status(), ProviderStatus::Ok);
}

#[tokio::test]
async fn test_rate_limit_keeps_tree_and_records_reset() {
    let backend = Arc::new(
        MockBackend::new()
            .with_repository("acme", repository())
            .with_definition("1", definition("10")),
    );
    let scheduler = new_scheduler();
    let provider = attach(&scheduler, backend.clone(), ProviderOptions::default());
    sweep(&scheduler).await;

    backend.fail_next(ProviderError::RateLimited {
        reset_at: Some(Utc::now() + TimeDelta::seconds(120)),
        budget: None,
    });
    let build_sync = scheduler.build_syncs().pop().unwrap();
    assert_eq!(build_sync.refresh().await, RefreshOutcome::Failed);

    assert_eq!(provider.status(), ProviderStatus::RateLimited);
    assert!(provider.pacing().wait_time() > Duration::from_secs(60));
    assert_eq!(provider.builds().len(), 1);
}

#[tokio::test]
async fn test_failed_run_errors_are_fetched() {
    let backend = Arc::new(
        MockBackend::new()
            .with_repository("acme", repository())
            .with_definition("1", definition("10"))
            .with_run("10", snapshot("300", RunStatus::Failure, 45))
            .with_run_errors("300", vec!["[test] Failed".to_string()]),
    );
    let scheduler = new_scheduler();
    let provider = attach(&scheduler, backend, ProviderOptions::default());

    sweep(&scheduler).await;

    let build = provider.builds().pop().unwrap();
    let run = build.runs().get(&"300".into()).unwrap();
    assert_eq!(run.errors(), vec!["[test] Failed".to_string()]);
    assert_eq!(build.last_status(), Some(RunStatus::Failure));
}

#[tokio::test]
async fn test_settings_survive_restart() {
    let dir = TempDir::new().unwrap();
    let store = YamlSettingsStore::new(dir.path().join("settings.yml"));

    let backend = Arc::new(
        MockBackend::new()
            .with_repository("acme", repository())
            .with_definition("1", definition("10")),
    );
    let scheduler = new_scheduler();
    let provider = attach(&scheduler, backend, ProviderOptions::default());
    sweep(&scheduler).await;
    provider.builds()[0].set_enabled(false);
    scheduler.save_signal().queue();
    assert!(scheduler.save_if_queued(&store).unwrap());

    let restarted = new_scheduler();
    let restored = Arc::new(Provider::new(
        "GitHub".into(),
        Arc::new(MockBackend::new()),
        ProviderOptions::default(),
        restarted.save_signal().clone(),
    ));
    restarted.add_provider(ProviderKind::GitHub, restored.clone());
    restarted.load(&store.load().unwrap());

    assert!(restored.has_credentials());
    let builds = restored.builds();
    assert_eq!(builds.len(), 1);
    assert!(!builds[0].is_enabled());
    assert_eq!(builds[0].name().as_str(), "pipeline-10");
    assert!(restarted.provider(&ProviderName::new("GitHub")).is_some());
}
