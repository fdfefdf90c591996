use buildwatch::estimate::EstimatorConfig;
use buildwatch::pacing::PacingConfig;
use buildwatch::provider::ProviderOptions;
use buildwatch::sync::{SchedulerConfig, SyncConfig};
use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub sync: SyncConfig,
    pub pacing: PacingConfig,
    pub estimator: EstimatorConfig,
    pub providers: ProvidersConfig,
    /// Where credentials and tracked owners are kept; defaults under the data dir
    pub settings_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Concurrent requests per provider
    pub concurrency: usize,
    pub request_timeout_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            request_timeout_secs: 30,
        }
    }
}

impl ProvidersConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn options(&self, pacing: &PacingConfig) -> ProviderOptions {
        ProviderOptions::default()
            .with_concurrency(self.concurrency)
            .with_request_timeout(self.request_timeout())
            .with_pacing(pacing.clone())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            sync: SyncConfig::default(),
            pacing: PacingConfig::default(),
            estimator: EstimatorConfig::default(),
            providers: ProvidersConfig::default(),
            settings_path: None,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.providers.concurrency == 0 {
            bail!("providers.concurrency must be at least 1");
        }
        if self.providers.request_timeout_secs == 0 {
            bail!("providers.request_timeout_secs must be at least 1");
        }
        if self.scheduler.tick_interval_secs == 0 {
            bail!("scheduler.tick_interval_secs must be at least 1");
        }
        if self.sync.run_min_interval_secs > self.sync.run_max_interval_secs {
            bail!(
                "sync.run_min_interval_secs ({}) exceeds sync.run_max_interval_secs ({})",
                self.sync.run_min_interval_secs,
                self.sync.run_max_interval_secs
            );
        }
        if self.pacing.min_delay_ms > self.pacing.max_adaptive_delay_ms {
            bail!(
                "pacing.min_delay_ms ({}) exceeds pacing.max_adaptive_delay_ms ({})",
                self.pacing.min_delay_ms,
                self.pacing.max_adaptive_delay_ms
            );
        }
        if self.estimator.min_samples > self.estimator.max_samples {
            bail!(
                "estimator.min_samples ({}) exceeds estimator.max_samples ({})",
                self.estimator.min_samples,
                self.estimator.max_samples
            );
        }
        Ok(())
    }

    pub fn settings_path(&self) -> PathBuf {
        self.settings_path
            .clone()
            .unwrap_or_else(buildwatch::settings::YamlSettingsStore::default_path)
    }
}
