//! Per-provider request pacing and operational status.
//!
//! When a provider reports a hard rate limit with a reset time we wait for the
//! reset. Otherwise requests are spread across the remaining budget window, and
//! an incremental backoff covers rate limits that arrive without a reset time.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Operational status shown for a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    #[default]
    Ok,
    RateLimited,
    AuthFailed,
    Error,
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderStatus::Ok => "ok",
            ProviderStatus::RateLimited => "rate limited",
            ProviderStatus::AuthFailed => "auth failed",
            ProviderStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Remaining/limit/reset triple reported by a provider response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitBudget {
    pub remaining: i64,
    pub limit: i64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Delay between requests when nothing better is known (milliseconds).
    pub base_delay_ms: u64,
    /// Backoff growth per rate limit without a reset time (milliseconds).
    pub backoff_step_ms: u64,
    /// Adaptive pacing floor (milliseconds).
    pub min_delay_ms: u64,
    /// Adaptive pacing ceiling (milliseconds).
    pub max_adaptive_delay_ms: u64,
    /// Longest wait for a known reset (seconds).
    pub max_reset_wait_secs: u64,
    /// Added to reset times to absorb clock skew (seconds).
    pub clock_skew_secs: u64,
    /// Requests always held back from the budget.
    pub min_reserve: i64,
    /// Share of the limit held back when larger than `min_reserve`.
    pub reserve_fraction: f64,
    /// Multiplier applied to the even spread.
    pub conservatism: f64,
    /// Limit assumed when a budget omits it.
    pub default_limit: i64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            backoff_step_ms: 500,
            min_delay_ms: 100,
            max_adaptive_delay_ms: 30_000,
            max_reset_wait_secs: 600,
            clock_skew_secs: 5,
            min_reserve: 50,
            reserve_fraction: 0.1,
            conservatism: 1.1,
            default_limit: 5000,
        }
    }
}

impl PacingConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_adaptive_delay(&self) -> Duration {
        Duration::from_millis(self.max_adaptive_delay_ms)
    }

    /// Zero delays everywhere; used by tests and dry runs
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            backoff_step_ms: 0,
            min_delay_ms: 0,
            ..Self::default()
        }
    }
}

/// Pacing state owned by one provider.
#[derive(Debug, Clone)]
pub struct Pacer {
    config: PacingConfig,
    status: ProviderStatus,
    message: String,
    status_at: DateTime<Utc>,
    backoff: Duration,
    reset_at: Option<DateTime<Utc>>,
    budget: Option<RateLimitBudget>,
}

impl Pacer {
    pub fn new(config: PacingConfig) -> Self {
        let backoff = config.base_delay();
        Self {
            config,
            status: ProviderStatus::Ok,
            message: String::new(),
            status_at: Utc::now(),
            backoff,
            reset_at: None,
            budget: None,
        }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    pub fn status(&self) -> ProviderStatus {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_at(&self) -> DateTime<Utc> {
        self.status_at
    }

    pub fn budget(&self) -> Option<RateLimitBudget> {
        self.budget
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        self.reset_at
    }

    /// Only fresh credentials lift an auth failure, see `clear_auth_failure`.
    fn set_status(&mut self, status: ProviderStatus, message: impl Into<String>) {
        if self.status == ProviderStatus::AuthFailed && status != ProviderStatus::AuthFailed {
            return;
        }
        self.status = status;
        self.message = message.into();
        self.status_at = Utc::now();
    }

    /// Delay before the next request may be sent.
    pub fn wait_time_at(&self, now: DateTime<Utc>) -> Duration {
        if self.status == ProviderStatus::RateLimited
            && let Some(reset_at) = self.reset_at
        {
            let until = reset_at - now + TimeDelta::seconds(self.config.clock_skew_secs as i64);
            if until > TimeDelta::zero() {
                let max_wait = Duration::from_secs(self.config.max_reset_wait_secs);
                return until.to_std().unwrap_or(max_wait).min(max_wait);
            }
        }

        self.adaptive_delay_at(now).max(self.backoff)
    }

    pub fn wait_time(&self) -> Duration {
        self.wait_time_at(Utc::now())
    }

    /// Spread the usable budget evenly over the time left until reset.
    pub fn adaptive_delay_at(&self, now: DateTime<Utc>) -> Duration {
        let Some(budget) = self.budget else {
            return self.config.base_delay();
        };

        let until_reset = budget.reset_at - now;
        if until_reset <= TimeDelta::zero() {
            return self.config.min_delay();
        }
        let until_reset = until_reset.to_std().unwrap_or(Duration::ZERO);

        if budget.remaining <= 0 {
            return until_reset;
        }

        let limit = if budget.limit > 0 { budget.limit } else { self.config.default_limit };
        let reserve = self
            .config
            .min_reserve
            .max((limit as f64 * self.config.reserve_fraction) as i64);
        let usable = (budget.remaining - reserve).max(1);

        let delay_ms = until_reset.as_millis() as f64 / usable as f64 * self.config.conservatism;
        let delay_ms = delay_ms.clamp(self.config.min_delay_ms as f64, self.config.max_adaptive_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// A request succeeded. Recovering from a rate limit resets the backoff.
    pub fn record_success(&mut self, budget: Option<RateLimitBudget>) {
        if let Some(budget) = budget {
            self.budget = Some(budget);
        }
        if matches!(self.status, ProviderStatus::Ok | ProviderStatus::AuthFailed) {
            return;
        }
        if self.status == ProviderStatus::RateLimited {
            self.backoff = self.config.base_delay();
        }
        self.reset_at = None;
        self.set_status(ProviderStatus::Ok, "");
    }

    pub fn record_rate_limit(&mut self, reset_at: Option<DateTime<Utc>>, budget: Option<RateLimitBudget>) {
        if let Some(budget) = budget {
            self.budget = Some(budget);
        }
        self.reset_at = reset_at;

        let message = match reset_at {
            Some(reset_at) => {
                let until = reset_at - Utc::now() + TimeDelta::seconds(self.config.clock_skew_secs as i64);
                match until.to_std() {
                    Ok(wait) if !wait.is_zero() => format!(
                        "Rate limited. Resets at {} (waiting {})",
                        reset_at.format("%H:%M:%S"),
                        format_duration(wait)
                    ),
                    _ => format!("Rate limited. Resets at {} (imminent)", reset_at.format("%H:%M:%S")),
                }
            }
            None => {
                self.backoff += Duration::from_millis(self.config.backoff_step_ms);
                format!("Rate limited. Delay: {}ms", self.backoff.as_millis())
            }
        };

        tracing::warn!(
            reset_at = ?reset_at,
            backoff_ms = self.backoff.as_millis() as u64,
            "Rate limited, pacing requests"
        );
        self.set_status(ProviderStatus::RateLimited, message);
    }

    pub fn record_auth_failure(&mut self) {
        self.set_status(ProviderStatus::AuthFailed, "Authentication failed. Re-enter credentials.");
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.set_status(ProviderStatus::Error, message);
    }

    /// Fresh credentials were supplied; lift an auth failure
    pub fn clear_auth_failure(&mut self) {
        if self.status == ProviderStatus::AuthFailed {
            self.status = ProviderStatus::Ok;
            self.message.clear();
            self.status_at = Utc::now();
        }
    }

    /// `remaining/limit`, when a budget is known
    pub fn rate_limit_display(&self) -> Option<String> {
        self.budget.map(|b| format!("{}/{}", b.remaining, b.limit))
    }

    pub fn detailed_status_at(&self, now: DateTime<Utc>) -> Option<String> {
        let budget = self.budget?;
        let mut status = format!("Rate limit: {}/{}", budget.remaining, budget.limit);
        if let Ok(until) = (budget.reset_at - now).to_std()
            && !until.is_zero()
        {
            status.push_str(&format!(" (resets in {})", format_duration(until)));
        }
        Some(status)
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new(PacingConfig::default())
    }
}

/// `1h 2m`, `3m 4s` or `5s`
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
