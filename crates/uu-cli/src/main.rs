mod cli;
mod config;
mod storage;
mod timers;

use std::time::Duration;

use crate::cli::{ConfigCommand, PrefsCommand};
use clap::Parser;
use color_eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uu_core::prefs::KeyValueStore;
use uu_storage::{key_provider::SecretKeyProvider, secure_prefs::SecurePrefs};

/// Entry point wiring the CLI to the preference and timer subsystems.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command.unwrap_or(cli::Command::Health) {
        cli::Command::Version => print_version(),
        cli::Command::Health => run_health_check(&config).await?,
        cli::Command::Config(ConfigCommand::Init) => init_config(&config)?,
        cli::Command::Prefs(cmd) => run_prefs(cmd, storage::prefs(&config)?).await?,
        cli::Command::Timer {
            id,
            interval_ms,
            fires,
        } => {
            let fired = timers::run(
                timers::timers()?,
                &id,
                Duration::from_millis(interval_ms),
                fires,
            )
            .await?;
            println!("Timer {id} fired {fired} times");
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("uu {}", env!("CARGO_PKG_VERSION"));
}

/// Runs a quick health check of the encrypted storage path.
async fn run_health_check(config: &config::Config) -> Result<()> {
    run_prefs_health(storage::prefs(config)?).await?;
    println!("Storage: ok");
    Ok(())
}

async fn run_prefs_health<S, P>(prefs: &SecurePrefs<S, P>) -> Result<()>
where
    S: KeyValueStore,
    P: SecretKeyProvider,
{
    let probe_key = "health/probe";
    let payload = "ok";
    prefs
        .put_string(probe_key, Some(payload))
        .await
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    let round_trip = prefs.get_string(probe_key, "").await;
    prefs
        .remove(probe_key)
        .await
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;

    if round_trip != payload {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

async fn run_prefs<S, P>(cmd: PrefsCommand, prefs: &SecurePrefs<S, P>) -> Result<()>
where
    S: KeyValueStore,
    P: SecretKeyProvider,
{
    match cmd {
        PrefsCommand::Get { key, default } => {
            println!("{}", prefs.get_string(&key, &default).await);
        }
        PrefsCommand::Set { key, value } => prefs
            .put_string(&key, Some(&value))
            .await
            .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?,
        PrefsCommand::Remove { key } => prefs
            .remove(&key)
            .await
            .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?,
        PrefsCommand::Clear => prefs
            .clear()
            .await
            .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?,
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
