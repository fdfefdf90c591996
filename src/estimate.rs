//! Duration estimation from a build's run history.
//!
//! Estimates are built from successful, completed runs:
//! - Most recent first, capped at a window
//! - Branch-specific history is tried before the whole build
//! - Tukey IQR fence drops anomalous runs
//! - Exponentially weighted average favours recent runs
//!
//! A zero estimate means "unknown", never "instant".

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::id::BranchName;
use crate::model::{Build, RunStatus};

/// Fewest samples that produce an estimate.
pub const MIN_SAMPLES: usize = 3;
/// Most recent successful runs considered.
pub const MAX_SAMPLES: usize = 20;
/// Per-step decay of the exponential weights.
pub const DECAY_FACTOR: f64 = 0.3;
/// Tukey fence multiplier.
pub const IQR_MULTIPLIER: f64 = 1.5;
/// Below this many values the IQR fence is not computed.
const MIN_VALUES_FOR_IQR: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub min_samples: usize,
    pub max_samples: usize,
    pub decay_factor: f64,
    pub iqr_multiplier: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            min_samples: MIN_SAMPLES,
            max_samples: MAX_SAMPLES,
            decay_factor: DECAY_FACTOR,
            iqr_multiplier: IQR_MULTIPLIER,
        }
    }
}

/// Diagnostic breakdown of an estimate
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EstimationStats {
    pub sample_count: usize,
    pub min: Duration,
    pub max: Duration,
    pub median: Duration,
    pub estimate: Duration,
    pub used_outlier_filtering: bool,
}

/// Elapsed time against an estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub elapsed: Duration,
    pub estimate: Duration,
    pub eta: Duration,
    /// None when the estimate is unknown
    pub ratio: Option<f64>,
}

impl Progress {
    pub fn new(elapsed: Duration, estimate: Duration) -> Self {
        let ratio = if estimate.is_zero() {
            None
        } else {
            Some(elapsed.as_secs_f64() / estimate.as_secs_f64())
        };
        Self {
            elapsed,
            estimate,
            eta: estimate.saturating_sub(elapsed),
            ratio,
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        self.ratio.is_none()
    }
}

struct Sample {
    branch: BranchName,
    seconds: f64,
}

/// Successful completed runs, most recent first, capped at the window
fn collect_samples(build: &Build, config: &EstimatorConfig) -> Vec<Sample> {
    let mut states: Vec<_> = build
        .runs()
        .values()
        .iter()
        .map(|run| run.state())
        .filter(|state| state.status == RunStatus::Success && !state.is_ongoing())
        .collect();
    states.sort_by(|a, b| b.started.cmp(&a.started));
    states
        .into_iter()
        .take(config.max_samples)
        .map(|state| Sample {
            seconds: state.duration().as_secs_f64(),
            branch: state.branch,
        })
        .collect()
}

fn branch_durations(samples: &[Sample], branch: &BranchName) -> Vec<f64> {
    samples.iter().filter(|s| &s.branch == branch).map(|s| s.seconds).collect()
}

/// Estimated duration of the next run of `build`, optionally for one branch.
pub fn estimate_duration(build: &Build, branch: Option<&BranchName>, config: &EstimatorConfig) -> Duration {
    let samples = collect_samples(build, config);
    if samples.is_empty() {
        return Duration::ZERO;
    }

    if let Some(branch) = branch {
        let estimate = estimate_from_durations(&branch_durations(&samples, branch), config);
        if !estimate.is_zero() {
            return estimate;
        }
    }

    let all: Vec<f64> = samples.iter().map(|s| s.seconds).collect();
    estimate_from_durations(&all, config)
}

/// Estimate from durations in seconds, most recent first.
pub fn estimate_from_durations(durations: &[f64], config: &EstimatorConfig) -> Duration {
    if durations.len() < config.min_samples {
        return Duration::ZERO;
    }

    let filtered = remove_outliers(durations, config.iqr_multiplier);
    if filtered.len() < config.min_samples {
        return seconds(median(durations));
    }

    seconds(exponentially_weighted_average(&filtered, config.decay_factor))
}

/// Breakdown of the estimate for display. Only branch history is used when a branch is given.
pub fn estimation_stats(build: &Build, branch: Option<&BranchName>, config: &EstimatorConfig) -> EstimationStats {
    let samples = collect_samples(build, config);
    let durations: Vec<f64> = match branch {
        Some(branch) => branch_durations(&samples, branch),
        None => samples.iter().map(|s| s.seconds).collect(),
    };
    if durations.is_empty() {
        return EstimationStats::default();
    }

    let filtered = remove_outliers(&durations, config.iqr_multiplier);
    let used_outlier_filtering = filtered.len() >= config.min_samples;
    let used = if used_outlier_filtering { &filtered } else { &durations };

    let min = used.iter().copied().fold(f64::INFINITY, f64::min);
    let max = used.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let estimate = if used_outlier_filtering {
        exponentially_weighted_average(&filtered, config.decay_factor)
    } else {
        median(&durations)
    };

    EstimationStats {
        sample_count: used.len(),
        min: seconds(min),
        max: seconds(max),
        median: seconds(median(used)),
        estimate: seconds(estimate),
        used_outlier_filtering,
    }
}

/// Drop values outside the Tukey fence, keeping the original order.
pub fn remove_outliers(values: &[f64], multiplier: f64) -> Vec<f64> {
    if values.len() < MIN_VALUES_FOR_IQR {
        return values.to_vec();
    }

    let sorted = sorted(values);
    let q1 = percentile(&sorted, 25.0);
    let q3 = percentile(&sorted, 75.0);
    let iqr = q3 - q1;
    let lower = q1 - multiplier * iqr;
    let upper = q3 + multiplier * iqr;

    values.iter().copied().filter(|v| *v >= lower && *v <= upper).collect()
}

/// Percentile of ascending values with linear interpolation between ranks.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let index = pct / 100.0 * (n - 1) as f64;
            let lower = index.floor() as usize;
            let upper = index.ceil() as usize;
            if lower == upper {
                sorted[lower]
            } else {
                let fraction = index - lower as f64;
                sorted[lower] + fraction * (sorted[upper] - sorted[lower])
            }
        }
    }
}

pub fn median(values: &[f64]) -> f64 {
    percentile(&sorted(values), 50.0)
}

/// Weighted mean where the i-th value (0 = most recent) has weight `(1 - decay)^i`.
pub fn exponentially_weighted_average(values: &[f64], decay: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let (weighted_sum, weight_sum) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(weighted, total), (i, value)| {
            let weight = (1.0 - decay).powi(i as i32);
            (weighted + value * weight, total + weight)
        });
    weighted_sum / weight_sum
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
