//! Durable settings: credentials and the tracked owner/repository/build tree.
//!
//! The scheduler never touches files directly. It raises a [`SaveSignal`]
//! whenever discovery or a credential change alters what would be saved, and
//! flushes through a [`SettingsStore`] when asked.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{BuildWatchError, Result};
use crate::id::{BuildId, BuildName, OwnerName, ProviderName, RepositoryId, RepositoryName};
use crate::provider::{Credentials, Provider, ProviderKind};

/// Shared "settings changed, save when convenient" flag
#[derive(Debug, Clone, Default)]
pub struct SaveSignal {
    queued: Arc<AtomicBool>,
}

impl SaveSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self) {
        self.queued.store(true, Ordering::Release);
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// Clears the flag and reports whether it was set
    pub fn take(&self) -> bool {
        self.queued.swap(false, Ordering::AcqRel)
    }
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub providers: Vec<ProviderSettings>,
}

impl Settings {
    pub fn provider(&self, name: &ProviderName) -> Option<&ProviderSettings> {
        self.providers.iter().find(|p| &p.name == name)
    }

    /// Provider entry for `kind`, created with default name and no owners when missing
    pub fn provider_mut(&mut self, kind: ProviderKind) -> &mut ProviderSettings {
        let name = ProviderName::new(kind.to_string());
        if let Some(index) = self.providers.iter().position(|p| p.name == name) {
            return &mut self.providers[index];
        }
        self.providers.push(ProviderSettings::new(name, kind));
        let last = self.providers.len() - 1;
        &mut self.providers[last]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub name: ProviderName,
    pub kind: ProviderKind,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub owners: Vec<OwnerSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerSettings {
    pub name: OwnerName,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub repositories: Vec<RepositorySettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySettings {
    pub id: RepositoryId,
    pub name: RepositoryName,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub builds: Vec<BuildSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSettings {
    pub id: BuildId,
    pub name: BuildName,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

impl OwnerSettings {
    pub fn new(name: OwnerName) -> Self {
        Self {
            name,
            enabled: true,
            token: None,
            repositories: Vec::new(),
        }
    }
}

impl ProviderSettings {
    pub fn new(name: ProviderName, kind: ProviderKind) -> Self {
        Self {
            name,
            kind,
            credentials: Credentials::default(),
            owners: Vec::new(),
        }
    }

    /// Snapshot of a live provider's persisted state, sorted for stable output
    pub fn capture(provider: &Provider, kind: ProviderKind) -> Self {
        let mut owners: Vec<OwnerSettings> = provider
            .owners()
            .values()
            .iter()
            .map(|owner| {
                let mut repositories: Vec<RepositorySettings> = owner
                    .repositories()
                    .values()
                    .iter()
                    .map(|repo| {
                        let mut builds: Vec<BuildSettings> = repo
                            .builds()
                            .values()
                            .iter()
                            .map(|build| BuildSettings {
                                id: build.id().clone(),
                                name: build.name(),
                                enabled: build.is_enabled(),
                            })
                            .collect();
                        builds.sort_by(|a, b| a.id.cmp(&b.id));
                        RepositorySettings {
                            id: repo.id().clone(),
                            name: repo.name().clone(),
                            enabled: repo.is_enabled(),
                            builds,
                        }
                    })
                    .collect();
                repositories.sort_by(|a, b| a.id.cmp(&b.id));
                OwnerSettings {
                    name: owner.name().clone(),
                    enabled: owner.is_enabled(),
                    token: owner.token(),
                    repositories,
                }
            })
            .collect();
        owners.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            name: provider.name().clone(),
            kind,
            credentials: provider.credentials(),
            owners,
        }
    }

    /// Rebuild the tree inside `provider` without raising the save signal
    pub fn restore_into(&self, provider: &Provider) {
        provider.restore_credentials(self.credentials.clone());
        for owner_settings in &self.owners {
            let (owner, _) = provider
                .owners()
                .get_or_insert_with(owner_settings.name.clone(), || provider.create_owner(owner_settings.name.clone()));
            owner.set_enabled(owner_settings.enabled);
            owner.set_token(owner_settings.token.clone());

            for repo_settings in &owner_settings.repositories {
                let (repo, _) = owner.repositories().get_or_insert_with(repo_settings.id.clone(), || {
                    owner.create_repository(repo_settings.name.clone(), repo_settings.id.clone())
                });
                repo.set_enabled(repo_settings.enabled);

                for build_settings in &repo_settings.builds {
                    let (build, _) = repo.builds().get_or_insert_with(build_settings.id.clone(), || {
                        repo.create_build(build_settings.name.clone(), build_settings.id.clone())
                    });
                    build.set_enabled(build_settings.enabled);
                }
            }
        }
    }
}

/// Load on startup, save on request
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings>;
    fn save(&self, settings: &Settings) -> Result<()>;
}

/// Settings kept in a YAML file
#[derive(Debug, Clone)]
pub struct YamlSettingsStore {
    path: PathBuf,
}

impl YamlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `{data_local_dir}/buildwatch/settings.yml`
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(env!("CARGO_PKG_NAME"))
            .join("settings.yml")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for YamlSettingsStore {
    fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            log::info!("No settings at {}, starting empty", self.path.display());
            return Ok(Settings::default());
        }
        let content = fs::read_to_string(&self.path)?;
        let settings: Settings = serde_yaml::from_str(&content)?;
        log::info!("Loaded settings from: {}", self.path.display());
        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(settings)?;
        let tmp = self.path.with_extension("yml.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            BuildWatchError::Settings(format!("failed to replace {}: {}", self.path.display(), e))
        })?;
        log::debug!("Saved settings to: {}", self.path.display());
        Ok(())
    }
}

/// In-memory store that counts saves
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<Settings>,
    saves: AtomicUsize,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(settings),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Settings {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Settings> {
        Ok(self.current())
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
