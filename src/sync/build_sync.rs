//! Scheduling state for one build

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::id::BuildKey;
use crate::model::Build;
use crate::provider::{Provider, RefreshOutcome};
use crate::sync::priority::{self, Priority, SyncConfig};

/// Tracks when a build was last refreshed and how urgently it needs another.
///
/// Holds the build weakly; the provider's tree is the owner. A new sync is due
/// immediately.
#[derive(Debug)]
pub struct BuildSync {
    provider: Arc<Provider>,
    key: BuildKey,
    build: Weak<Build>,
    config: SyncConfig,
    last_refresh: Mutex<Option<DateTime<Utc>>>,
}

impl BuildSync {
    pub fn new(provider: Arc<Provider>, build: &Arc<Build>, config: SyncConfig) -> Self {
        Self {
            provider,
            key: build.key().clone(),
            build: Arc::downgrade(build),
            config,
            last_refresh: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &BuildKey {
        &self.key
    }

    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    /// The tracked build, while it is still the one in the tree
    pub fn build(&self) -> Option<Arc<Build>> {
        let build = self.build.upgrade()?;
        let current = self.provider.find_build(&self.key)?;
        Arc::ptr_eq(&build, &current).then_some(build)
    }

    /// The build, its repository or its owner is gone
    pub fn is_orphaned(&self) -> bool {
        self.build().is_none()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn priority_at(&self, now: DateTime<Utc>) -> Priority {
        match self.build() {
            Some(build) => priority::build_priority_at(&build, &self.config, now),
            None => Priority::Low,
        }
    }

    pub fn interval_at(&self, now: DateTime<Utc>) -> Duration {
        self.config.interval(self.priority_at(now))
    }

    fn elapsed_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_refresh()
            .map(|last| (now - last).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn should_update_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_orphaned() || !self.provider.is_build_active(&self.key) {
            return false;
        }
        match self.elapsed_at(now) {
            Some(elapsed) => elapsed >= self.interval_at(now),
            None => true,
        }
    }

    pub fn should_update(&self) -> bool {
        self.should_update_at(Utc::now())
    }

    /// Countdown to the next refresh; zero when due
    pub fn time_remaining_at(&self, now: DateTime<Utc>) -> Duration {
        match self.elapsed_at(now) {
            Some(elapsed) => self.interval_at(now).saturating_sub(elapsed),
            None => Duration::ZERO,
        }
    }

    /// Fraction of the interval that has elapsed, in `[0, 1]`
    pub fn update_progress_at(&self, now: DateTime<Utc>) -> f64 {
        let Some(elapsed) = self.elapsed_at(now) else {
            return 1.0;
        };
        let interval = self.interval_at(now);
        if interval.is_zero() {
            return 1.0;
        }
        (elapsed.as_secs_f64() / interval.as_secs_f64()).clamp(0.0, 1.0)
    }

    /// Refresh the build through its provider and restart the countdown,
    /// whatever the outcome.
    pub async fn refresh(&self) -> RefreshOutcome {
        let Some(build) = self.build() else {
            return RefreshOutcome::Skipped;
        };
        let outcome = self.provider.refresh_build(&build).await;
        *self.last_refresh.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        tracing::debug!(build = %self.key, outcome = ?outcome, "Build refreshed");
        outcome
    }
}
