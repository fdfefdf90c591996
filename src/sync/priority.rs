//! Refresh priority for builds.
//!
//! - High: a run is pending or running
//! - Medium: the last run failed within the failure window
//! - Low: everything else

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Build, RunStatus};

pub const HIGH_INTERVAL_SECS: u64 = 30;
pub const MEDIUM_INTERVAL_SECS: u64 = 60;
pub const LOW_INTERVAL_SECS: u64 = 120;
/// A failure this recent keeps a build at medium priority.
pub const FAILURE_WINDOW_SECS: u64 = 3600;
pub const RUN_MIN_INTERVAL_SECS: u64 = 10;
pub const RUN_MAX_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        f.write_str(s)
    }
}

/// Intervals for build tiers and bounds for run polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub high_interval_secs: u64,
    pub medium_interval_secs: u64,
    pub low_interval_secs: u64,
    pub failure_window_secs: u64,
    pub run_min_interval_secs: u64,
    pub run_max_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            high_interval_secs: HIGH_INTERVAL_SECS,
            medium_interval_secs: MEDIUM_INTERVAL_SECS,
            low_interval_secs: LOW_INTERVAL_SECS,
            failure_window_secs: FAILURE_WINDOW_SECS,
            run_min_interval_secs: RUN_MIN_INTERVAL_SECS,
            run_max_interval_secs: RUN_MAX_INTERVAL_SECS,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self, priority: Priority) -> Duration {
        let secs = match priority {
            Priority::High => self.high_interval_secs,
            Priority::Medium => self.medium_interval_secs,
            Priority::Low => self.low_interval_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn failure_window(&self) -> TimeDelta {
        TimeDelta::seconds(self.failure_window_secs as i64)
    }

    pub fn run_min_interval(&self) -> Duration {
        Duration::from_secs(self.run_min_interval_secs)
    }

    pub fn run_max_interval(&self) -> Duration {
        Duration::from_secs(self.run_max_interval_secs)
    }

    /// Next run poll interval from an ETA, clamped to the run bounds
    pub fn run_interval_for(&self, eta: Duration) -> Duration {
        Duration::from_secs(eta.as_secs().clamp(self.run_min_interval_secs, self.run_max_interval_secs))
    }
}

/// Priority of `build` at `now`
pub fn build_priority_at(build: &Build, config: &SyncConfig, now: DateTime<Utc>) -> Priority {
    if build.is_ongoing() {
        return Priority::High;
    }

    let summary = build.summary();
    if summary.last_status == Some(RunStatus::Failure)
        && let Some(updated) = summary.last_updated
        && now - updated < config.failure_window()
    {
        return Priority::Medium;
    }

    Priority::Low
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::OwnerKey;
    use crate::model::RunSnapshot;
    use crate::model::repository::Repository;

    fn build() -> std::sync::Arc<Build> {
        let owner = OwnerKey::new("GitHub".into(), "acme".into());
        let repo = Repository::new(owner.repository("1".into()), "widgets".into());
        let build = repo.create_build("CI".into(), "10".into());
        std::sync::Arc::new(build)
    }

    fn record(build: &Build, id: &str, status: RunStatus, updated: DateTime<Utc>) {
        let (run, _) = build
            .runs()
            .get_or_insert_with(id.into(), || build.create_run(id.into(), id.into()));
        run.apply(&RunSnapshot {
            id: id.into(),
            name: id.into(),
            status,
            started: updated - TimeDelta::minutes(3),
            last_updated: updated,
            branch: "main".into(),
        });
        build.update_from_run(&run);
    }

    #[test]
    fn test_default_intervals() {
        let config = SyncConfig::default();
        assert_eq!(config.interval(Priority::High), Duration::from_secs(30));
        assert_eq!(config.interval(Priority::Medium), Duration::from_secs(60));
        assert_eq!(config.interval(Priority::Low), Duration::from_secs(120));
    }

    #[test]
    fn test_new_build_is_low() {
        let now = Utc::now();
        assert_eq!(build_priority_at(&build(), &SyncConfig::default(), now), Priority::Low);
    }

    #[test]
    fn test_ongoing_run_is_high() {
        let now = Utc::now();
        let build = build();
        record(&build, "1", RunStatus::Failure, now - TimeDelta::minutes(5));
        record(&build, "2", RunStatus::Running, now);
        assert_eq!(build_priority_at(&build, &SyncConfig::default(), now), Priority::High);
    }

    #[test]
    fn test_recent_failure_is_medium() {
        let now = Utc::now();
        let build = build();
        record(&build, "1", RunStatus::Failure, now - TimeDelta::minutes(59));
        assert_eq!(build_priority_at(&build, &SyncConfig::default(), now), Priority::Medium);
    }

    #[test]
    fn test_old_failure_is_low() {
        let now = Utc::now();
        let build = build();
        record(&build, "1", RunStatus::Failure, now - TimeDelta::minutes(61));
        assert_eq!(build_priority_at(&build, &SyncConfig::default(), now), Priority::Low);
    }

    #[test]
    fn test_success_is_low() {
        let now = Utc::now();
        let build = build();
        record(&build, "1", RunStatus::Success, now);
        assert_eq!(build_priority_at(&build, &SyncConfig::default(), now), Priority::Low);
    }

    #[test]
    fn test_run_interval_clamped() {
        let config = SyncConfig::default();
        assert_eq!(config.run_interval_for(Duration::ZERO), Duration::from_secs(10));
        assert_eq!(config.run_interval_for(Duration::from_secs(42)), Duration::from_secs(42));
        assert_eq!(config.run_interval_for(Duration::from_secs(900)), Duration::from_secs(60));
    }
}
