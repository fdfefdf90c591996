//! A tracked workflow or pipeline definition and its recent runs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::estimate::{self, EstimationStats, EstimatorConfig};
use crate::id::{BranchName, BuildId, BuildKey, BuildName, RunId, RunName};
use crate::model::keyed::KeyedMap;
use crate::model::run::{Run, RunStatus};

/// Cached copy of the most recently observed run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub last_started: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
}

impl BuildSummary {
    pub fn last_duration(&self) -> Duration {
        match (self.last_started, self.last_updated) {
            (Some(started), Some(updated)) => (updated - started).to_std().unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        }
    }
}

#[derive(Debug)]
pub struct Build {
    key: BuildKey,
    name: RwLock<BuildName>,
    enabled: AtomicBool,
    runs: KeyedMap<RunId, Run>,
    summary: Mutex<BuildSummary>,
}

impl Build {
    pub(crate) fn new(key: BuildKey, name: BuildName) -> Self {
        Self {
            key,
            name: RwLock::new(name),
            enabled: AtomicBool::new(true),
            runs: KeyedMap::new(),
            summary: Mutex::new(BuildSummary::default()),
        }
    }

    pub fn key(&self) -> &BuildKey {
        &self.key
    }

    pub fn id(&self) -> &BuildId {
        &self.key.build
    }

    pub fn name(&self) -> BuildName {
        self.name.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns true if the name changed
    pub fn rename(&self, name: BuildName) -> bool {
        let mut current = self.name.write().unwrap_or_else(PoisonError::into_inner);
        if *current == name {
            return false;
        }
        *current = name;
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn runs(&self) -> &KeyedMap<RunId, Run> {
        &self.runs
    }

    /// Build a run stamped with this build's key. Does not insert it.
    pub fn create_run(&self, name: RunName, id: RunId) -> Run {
        Run::new(self.key.run(id), name)
    }

    pub fn summary(&self) -> BuildSummary {
        *self.summary.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_status(&self) -> Option<RunStatus> {
        self.summary().last_status
    }

    /// Copy the run's timing and status into the summary if it is newer than
    /// what the build has already seen. Returns true when applied.
    pub fn update_from_run(&self, run: &Run) -> bool {
        let state = run.state();
        let mut summary = self.summary.lock().unwrap_or_else(PoisonError::into_inner);
        let newer = summary.last_updated.is_none_or(|current| state.last_updated > current);
        if newer {
            summary.last_updated = Some(state.last_updated);
            summary.last_started = Some(state.started);
            summary.last_status = Some(state.status);
        }
        newer
    }

    /// True when any tracked run is pending or running
    pub fn is_ongoing(&self) -> bool {
        self.runs.values().iter().any(|run| run.is_ongoing())
    }

    pub fn calculate_estimated_duration(&self, branch: Option<&BranchName>) -> Duration {
        self.calculate_estimated_duration_with(branch, &EstimatorConfig::default())
    }

    pub fn calculate_estimated_duration_with(&self, branch: Option<&BranchName>, config: &EstimatorConfig) -> Duration {
        estimate::estimate_duration(self, branch, config)
    }

    pub fn estimation_stats(&self, branch: Option<&BranchName>) -> EstimationStats {
        estimate::estimation_stats(self, branch, &EstimatorConfig::default())
    }

    /// Build-level ETA from the summary and the branch-agnostic estimate
    pub fn calculate_eta_at(&self, now: DateTime<Utc>) -> Duration {
        let estimate = self.calculate_estimated_duration(None);
        estimate.saturating_sub(self.elapsed_at(now))
    }

    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        let summary = self.summary();
        match summary.last_started {
            Some(started) if self.is_ongoing() => (now - started).to_std().unwrap_or(Duration::ZERO),
            _ => summary.last_duration(),
        }
    }

    /// ETA for one of this build's runs, estimated from runs on the same branch
    pub fn calculate_run_eta_at(&self, run: &Run, now: DateTime<Utc>) -> Duration {
        let branch = run.branch();
        let estimate = self.calculate_estimated_duration(Some(&branch));
        run.calculate_eta_at(estimate, now)
    }
}
