//! One execution of a build

use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{BranchName, RunId, RunKey, RunName};

/// Lifecycle status reported by a provider for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Canceled,
    Success,
    Failure,
}

impl RunStatus {
    pub fn is_ongoing(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Canceled => "canceled",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// What a provider reports about a run at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSnapshot {
    pub id: RunId,
    pub name: RunName,
    pub status: RunStatus,
    pub started: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub branch: BranchName,
}

/// Mutable fields of a run, returned by value from [`Run::state`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunState {
    pub name: RunName,
    pub status: RunStatus,
    pub started: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub branch: BranchName,
    pub errors: Vec<String>,
}

impl RunState {
    pub fn duration(&self) -> Duration {
        (self.last_updated - self.started).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_ongoing(&self) -> bool {
        self.status.is_ongoing()
    }
}

#[derive(Debug)]
pub struct Run {
    key: RunKey,
    state: RwLock<RunState>,
}

impl Run {
    pub(crate) fn new(key: RunKey, name: RunName) -> Self {
        Self {
            key,
            state: RwLock::new(RunState {
                name,
                ..RunState::default()
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RunState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RunState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &RunKey {
        &self.key
    }

    pub fn id(&self) -> &RunId {
        &self.key.run
    }

    /// Consistent copy of every mutable field
    pub fn state(&self) -> RunState {
        self.read().clone()
    }

    pub fn name(&self) -> RunName {
        self.read().name.clone()
    }

    pub fn status(&self) -> RunStatus {
        self.read().status
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.read().started
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.read().last_updated
    }

    pub fn branch(&self) -> BranchName {
        self.read().branch.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.read().errors.clone()
    }

    pub fn duration(&self) -> Duration {
        self.read().duration()
    }

    pub fn is_ongoing(&self) -> bool {
        self.read().is_ongoing()
    }

    /// Replace the provider-owned fields and return the previous status.
    /// Errors are dropped once the run is no longer a failure.
    pub fn apply(&self, snapshot: &RunSnapshot) -> RunStatus {
        let mut state = self.write();
        let previous = state.status;
        state.name = snapshot.name.clone();
        state.status = snapshot.status;
        state.started = snapshot.started;
        state.last_updated = snapshot.last_updated;
        state.branch = snapshot.branch.clone();
        if state.status != RunStatus::Failure {
            state.errors.clear();
        }
        previous
    }

    pub fn set_errors(&self, errors: Vec<String>) {
        self.write().errors = errors;
    }

    /// Time left against `estimate`. Zero estimate means unknown and yields zero.
    pub fn calculate_eta_at(&self, estimate: Duration, now: DateTime<Utc>) -> Duration {
        let elapsed = self.elapsed_at(now);
        estimate.saturating_sub(elapsed)
    }

    /// Wall time spent so far for an ongoing run, otherwise the final duration
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        let state = self.read();
        if state.is_ongoing() {
            (now - state.started).to_std().unwrap_or(Duration::ZERO)
        } else {
            state.duration()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::OwnerKey;
    use chrono::TimeDelta;

    fn run() -> Run {
        let key = OwnerKey::new("GitHub".into(), "acme".into())
            .repository("1".into())
            .build("2".into())
            .run("3".into());
        Run::new(key, "CI #3".into())
    }

    fn snapshot(status: RunStatus, started: DateTime<Utc>, secs: i64) -> RunSnapshot {
        RunSnapshot {
            id: "3".into(),
            name: "CI #3".into(),
            status,
            started,
            last_updated: started + TimeDelta::seconds(secs),
            branch: "main".into(),
        }
    }

    #[test]
    fn test_status_is_ongoing() {
        assert!(RunStatus::Pending.is_ongoing());
        assert!(RunStatus::Running.is_ongoing());
        assert!(!RunStatus::Success.is_ongoing());
        assert!(!RunStatus::Failure.is_ongoing());
        assert!(!RunStatus::Canceled.is_ongoing());
    }

    #[test]
    fn test_apply_returns_previous_status() {
        let run = run();
        let now = Utc::now();

        let previous = run.apply(&snapshot(RunStatus::Running, now, 10));
        assert_eq!(previous, RunStatus::Pending);

        let previous = run.apply(&snapshot(RunStatus::Success, now, 90));
        assert_eq!(previous, RunStatus::Running);
        assert_eq!(run.duration(), Duration::from_secs(90));
        assert_eq!(run.branch().as_str(), "main");
    }

    #[test]
    fn test_errors_cleared_when_not_failure() {
        let run = run();
        let now = Utc::now();
        run.apply(&snapshot(RunStatus::Failure, now, 30));
        run.set_errors(vec!["[build] boom".to_string()]);

        run.apply(&snapshot(RunStatus::Failure, now, 30));
        assert_eq!(run.errors().len(), 1);

        run.apply(&snapshot(RunStatus::Running, now, 40));
        assert!(run.errors().is_empty());
    }

    #[test]
    fn test_negative_duration_is_zero() {
        let run = run();
        let now = Utc::now();
        run.apply(&snapshot(RunStatus::Success, now, -5));
        assert_eq!(run.duration(), Duration::ZERO);
    }

    #[test]
    fn test_eta_for_ongoing_run_uses_wall_clock() {
        let run = run();
        let started = Utc::now();
        run.apply(&snapshot(RunStatus::Running, started, 1));

        let eta = run.calculate_eta_at(Duration::from_secs(100), started + TimeDelta::seconds(40));
        assert_eq!(eta, Duration::from_secs(60));

        let overdue = run.calculate_eta_at(Duration::from_secs(100), started + TimeDelta::seconds(400));
        assert_eq!(overdue, Duration::ZERO);
    }

    #[test]
    fn test_eta_for_finished_run_uses_duration() {
        let run = run();
        let started = Utc::now();
        run.apply(&snapshot(RunStatus::Success, started, 30));

        let eta = run.calculate_eta_at(Duration::from_secs(100), started + TimeDelta::hours(5));
        assert_eq!(eta, Duration::from_secs(70));
    }
}
