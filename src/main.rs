//! proverb-server: a TCP service that pushes proverbs
//!
//! Every connected client receives one randomly chosen proverb per
//! interval until it sends `finished` or disconnects.
//!
//! Features:
//! - Any number of simultaneous clients, each on its own cadence
//! - Configurable catalog, interval and listen address
//! - Configuration via CLI arguments or TOML file

mod catalog;
mod config;
mod server;
mod session;

use catalog::Catalog;
use config::Config;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let catalog = match config.messages.clone() {
        Some(messages) => {
            Catalog::new(messages).inspect_err(|e| error!(error = %e, "Invalid catalog"))?
        }
        None => Catalog::default(),
    };

    info!(
        listen = %config.listen,
        interval_ms = config.interval.as_millis() as u64,
        workers = ?config.workers,
        messages = catalog.len(),
        "Starting proverb-server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config, catalog))
}

/// Serve until the listener fails or the process is interrupted.
async fn run(config: Config, catalog: Catalog) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new(config, catalog);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "Server stopped");
                return Err(e.into());
            }
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted, shutting down");
        }
    }

    Ok(())
}
