//! Refresh scheduling.
//!
//! - **Priority**: how urgently a build needs refreshing
//! - **BuildSync / RunSync**: per-entity countdowns, holding their entity weakly
//! - **Scheduler**: periodic sweeps over every provider

mod build_sync;
mod priority;
mod run_sync;
mod scheduler;

pub use build_sync::BuildSync;
pub use priority::{
    FAILURE_WINDOW_SECS, HIGH_INTERVAL_SECS, LOW_INTERVAL_SECS, MEDIUM_INTERVAL_SECS, Priority, RUN_MAX_INTERVAL_SECS,
    RUN_MIN_INTERVAL_SECS, SyncConfig, build_priority_at,
};
pub use run_sync::RunSync;
pub use scheduler::{DISCOVERY_INTERVAL_SECS, Scheduler, SchedulerConfig, SweepReport, TICK_INTERVAL_SECS};
