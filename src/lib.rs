//! Buildwatch - CI build status polling for GitHub Actions and Azure DevOps
//!
//! Keeps an in-memory tree of owners, repositories, builds and runs per
//! provider, refreshes it on priority-driven schedules, paces requests against
//! each provider's rate limit and estimates how long running builds have left.

pub mod error;
pub mod estimate;
pub mod id;
pub mod model;
pub mod pacing;
pub mod provider;
pub mod settings;
pub mod sync;

pub use error::{BuildWatchError, Result};
