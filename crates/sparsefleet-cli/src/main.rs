//! sparsefleet - distributed asynchronous SGD for sparse linear and
//! factorization-machine models.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sparsefleet_cli::{roles, Cli, Role};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("sparsefleet=info".parse()?))
        .init();

    let cli = Cli::parse();
    let cfg = cli.trainer_config()?;

    info!(role = ?cli.role, "sparsefleet starting");
    match cli.role {
        Role::Scheduler => roles::run_scheduler(&cli, cfg).await?,
        Role::Server => roles::run_server(&cli, cfg).await?,
        Role::Worker => roles::run_worker(&cli, cfg).await?,
    }
    info!("sparsefleet exiting cleanly");
    Ok(())
}
