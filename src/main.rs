use buildwatch::id::{OwnerName, ProviderName};
use buildwatch::model::RunStatus;
use buildwatch::pacing::{ProviderStatus, format_duration};
use buildwatch::provider::{Credentials, Provider, ProviderKind, RefreshOutcome};
use buildwatch::settings::{SettingsStore, YamlSettingsStore};
use buildwatch::sync::Scheduler;
use clap::Parser;
use colored::*;
use eyre::{Context, OptionExt, Result};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use config::Config;

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("buildwatch")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("buildwatch.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Scheduler with one provider per supported kind, restored from saved settings
fn build_scheduler(config: &Config, store: &dyn SettingsStore) -> Result<Scheduler> {
    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        config.sync.clone(),
        config.estimator.clone(),
        Default::default(),
    );
    for kind in ProviderKind::all() {
        let backend = kind
            .backend(config.providers.request_timeout())
            .context(format!("Failed to create {} client", kind))?;
        let provider = Provider::new(
            ProviderName::new(kind.to_string()),
            backend,
            config.providers.options(&config.pacing),
            scheduler.save_signal().clone(),
        );
        scheduler.add_provider(kind, Arc::new(provider));
    }

    let settings = store.load().context("Failed to load settings")?;
    scheduler.load(&settings);
    Ok(scheduler)
}

fn provider(scheduler: &Scheduler, kind: ProviderKind) -> Result<Arc<Provider>> {
    scheduler
        .provider(&ProviderName::new(kind.to_string()))
        .ok_or_eyre(format!("Provider {} is not configured", kind))
}

fn colored_status(status: Option<RunStatus>) -> ColoredString {
    match status {
        Some(RunStatus::Success) => "success".green(),
        Some(RunStatus::Failure) => "failure".red(),
        Some(RunStatus::Running) => "running".cyan(),
        Some(RunStatus::Pending) => "pending".yellow(),
        Some(RunStatus::Canceled) => "canceled".dimmed(),
        None => "unknown".dimmed(),
    }
}

fn print_status(scheduler: &Scheduler) {
    let now = chrono::Utc::now();
    for provider in scheduler.providers() {
        let status = match provider.status() {
            ProviderStatus::Ok => "ok".green(),
            ProviderStatus::RateLimited => "rate limited".yellow(),
            ProviderStatus::AuthFailed => "auth failed".red(),
            ProviderStatus::Error => "error".red(),
        };
        println!("{} [{}]", provider.name().as_str().bold(), status);
        let message = provider.status_message();
        if !message.is_empty() {
            println!("  {}", message);
        }
        if let Some(rate_limit) = provider.rate_limit_detailed_status() {
            println!("  {}", rate_limit.as_str().dimmed());
        }
        if !provider.has_credentials() {
            println!("  {}", "No credentials".yellow());
        }

        let mut builds = provider.builds();
        builds.sort_by_key(|b| provider.build_path(b));
        for build in builds {
            let mut line = format!("  {} {}", colored_status(build.last_status()), provider.build_path(&build));
            if !build.is_enabled() {
                line.push_str(&format!(" {}", "(disabled)".dimmed()));
            }
            if build.is_ongoing() {
                let eta = build.calculate_eta_at(now);
                if !eta.is_zero() {
                    line.push_str(&format!(" ETA {}", format_duration(eta)));
                }
            }
            println!("{}", line);
            for run in build.runs().values() {
                for error in run.errors() {
                    println!("      {} {}", format!("#{}", run.name()).as_str().red(), error);
                }
            }
        }
    }
}

async fn handle_watch_command(scheduler: &Scheduler, store: &dyn SettingsStore, ticks: Option<u32>) -> Result<()> {
    let Some(ticks) = ticks else {
        println!("{}", "Watching builds, press Ctrl-C to stop...".cyan());
        let run = scheduler.run(store);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping scheduler");
                scheduler.stop();
                run.await?;
            }
        }
        print_status(scheduler);
        return Ok(());
    };

    for tick in 0..ticks {
        if tick > 0 {
            tokio::time::sleep(scheduler.config().tick_interval()).await;
        }
        scheduler.tick().await?;
        if let Some(report) = scheduler.wait_idle().await? {
            info!("Sweep {}: {:?}", tick + 1, report);
        }
        scheduler.save_if_queued(store)?;
    }
    print_status(scheduler);
    Ok(())
}

async fn handle_discover_command(scheduler: &Scheduler, kind: ProviderKind) -> Result<()> {
    let provider = provider(scheduler, kind)?;
    match provider.discover_owners().await {
        RefreshOutcome::Updated => {
            let mut owners = provider.owners().keys();
            owners.sort();
            println!("{} {} owner(s)", "Discovered:".green(), owners.len());
            for owner in owners {
                println!("  {}", owner);
            }
        }
        RefreshOutcome::Skipped => println!("{}", "No credentials set for this provider".yellow()),
        _ => println!("{} {}", "Discovery failed:".red(), provider.status_message()),
    }
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let store = YamlSettingsStore::new(config.settings_path());
    let scheduler = build_scheduler(config, &store)?;

    match &cli.command {
        None => handle_watch_command(&scheduler, &store, None).await?,
        Some(Commands::Watch { ticks }) => handle_watch_command(&scheduler, &store, *ticks).await?,
        Some(Commands::Status) => print_status(&scheduler),
        Some(Commands::AddOwner { provider: kind, owner, token }) => {
            let (owner, added) = provider(&scheduler, *kind)?.add_owner(OwnerName::new(owner.as_str()));
            if token.is_some() {
                owner.set_token(token.clone());
                scheduler.save_signal().queue();
            }
            let verb = if added { "Added:" } else { "Updated:" };
            println!("{} {}/{}", verb.green(), kind, owner.name());
        }
        Some(Commands::RemoveOwner { provider: kind, owner }) => {
            if provider(&scheduler, *kind)?.remove_owner(&OwnerName::new(owner.as_str())) {
                println!("{} {}/{}", "Removed:".green(), kind, owner);
            } else {
                println!("{} {}/{} is not tracked", "Skipped:".yellow(), kind, owner);
            }
        }
        Some(Commands::SetCredentials {
            provider: kind,
            account,
            token,
        }) => {
            provider(&scheduler, *kind)?.set_credentials(Credentials::new(account.as_str(), token.as_str()));
            println!("{} credentials for {}", "Updated:".green(), kind);
        }
        Some(Commands::DiscoverOwners { provider: kind }) => handle_discover_command(&scheduler, *kind).await?,
        Some(Commands::ClearData) => {
            scheduler.clear_data();
            println!("{}", "Cleared discovered repositories and builds".green());
        }
    }

    scheduler.save_if_queued(&store).context("Failed to save settings")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
