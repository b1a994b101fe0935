//! Referee process entry point
//!
//! Runs the referee and the broker for one session. Exit codes: 0 clean
//! shutdown, 1 configuration error at start, 2 unrecoverable runtime
//! error.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use onitu_core::config::{SessionPaths, Setup};
use onitu_referee::{Broker, Referee};
use onitu_store::{keys, Store};

#[derive(Debug, Parser)]
#[command(name = "onitu-referee", version, about = "Onitu transfer arbiter")]
struct Cli {
    /// Session identifier shared by every process of this deployment
    #[arg(long, default_value = "default")]
    session: String,

    /// Path to the setup file
    #[arg(long)]
    config: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Cannot start async runtime");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = match err.downcast_ref::<onitu_core::Error>() {
                // Configuration faults surface before anything runs.
                Some(onitu_core::Error::Driver(_)) => 1,
                _ => 2,
            };
            error!(error = %err, code, "Referee exiting on error");
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let setup = Setup::load(&cli.config)?;
    let rules = setup.rule_set()?;

    let paths = SessionPaths::for_session(&cli.session);
    let store = Store::open(&paths.store)
        .await
        .context("cannot open metadata store")?;

    // Publish the setup snapshot for out-of-band consumers.
    let service_names: Vec<&String> = setup.services.keys().collect();
    store.put(keys::SERVICES, &service_names).await?;
    store.put(keys::RULES, &setup.rules).await?;

    info!(
        session = %cli.session,
        services = setup.services.len(),
        rules = setup.rules.len(),
        "Referee starting"
    );

    let referee = Referee::new(store.clone(), rules);
    let broker = Broker::new(store.clone());

    let referee_cancel = referee.cancel_token();
    let broker_ref = broker.clone();
    let referee_task = tokio::spawn(referee.clone().listen());
    let broker_task = tokio::spawn(broker.listen());

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("Shutdown signal received");

    referee_cancel.cancel();
    broker_ref.shutdown();
    let _ = referee_task.await;
    let _ = broker_task.await;
    store.close().await;

    Ok(())
}
