//! Driver process entry point
//!
//! Runs one configured service against its backend adapter. Exit codes:
//! 0 clean shutdown, 1 configuration/driver error at start, 2
//! unrecoverable runtime error.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use onitu_core::config::{SessionPaths, Setup};
use onitu_core::DriverName;
use onitu_plug::Plug;
use onitu_store::Store;

#[derive(Debug, Parser)]
#[command(name = "onitu-driver", version, about = "Onitu backend driver")]
struct Cli {
    /// Session identifier shared by every process of this deployment
    #[arg(long, default_value = "default")]
    session: String,

    /// Path to the setup file
    #[arg(long)]
    config: PathBuf,

    /// Name of the service (from the setup file) this process runs
    #[arg(long)]
    service: String,
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
                Some(onitu_core::Error::Driver(_)) => 1,
                _ => 2,
            };
            error!(error = %err, code, "Driver exiting on error");
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let setup = Setup::load(&cli.config)?;
    let service = setup.service(&cli.service)?.clone();
    let rules = setup.rule_set()?;
    let name = DriverName::new(cli.service.clone())?;

    let paths = SessionPaths::for_session(&cli.session);
    let store = Store::open(&paths.store)
        .await
        .context("cannot open metadata store")?;

    info!(
        service = %name,
        driver = %service.driver,
        session = %cli.session,
        "Driver starting"
    );

    let plug = Plug::new(store.clone(), name, rules, service.folders.clone());

    let shutdown_plug = plug.clone();
    let shutdown_store = store.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown_plug.shutdown();
            shutdown_store.close().await;
        }
    });

    let result = match service.driver.as_str() {
        "local" => onitu_drivers::local::start(plug, &service).await,
        "playground" => onitu_drivers::playground::start(plug, &service).await,
        other => Err(onitu_core::Error::driver(format!(
            "unknown driver type '{other}'"
        ))),
    };

    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_shutdown() => Ok(()),
        Err(err) => Err(err.into()),
    }
}
