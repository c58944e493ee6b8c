//! VM inventory data layer binary.
//!
//! Sets up the inventory buckets, runs data migrations, and serves until
//! interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! vm-inventory
//!
//! # Start from a config file, overriding one value from the environment
//! VM_INVENTORY__MIGRATIONS__CHUNK_SIZE=500 vm-inventory --config inventory.toml
//!
//! # Print the config schema
//! vm-inventory config schema
//! ```

use std::io::IsTerminal;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use vm_inventory_server::{
    Result, Service,
    config::{self, Cli, CliCommand, ConfigAction},
    shutdown,
};
use vm_inventory_types::config::{LogFormat, LoggingConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(CliCommand::Config { action }) = cli.command {
        let rendered = match action {
            ConfigAction::Schema => config::schema_json()?,
            ConfigAction::Defaults => config::defaults_json()?,
        };
        println!("{rendered}");
        return Ok(());
    }

    let mut service_config = config::load(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        service_config.logging.format = format.into();
    }
    init_logging(&service_config.logging);

    tracing::info!(
        config_file = ?cli.config,
        version = env!("CARGO_PKG_VERSION"),
        "Starting VM inventory"
    );
    tracing::warn!("Running with the in-memory store. All data will be lost on shutdown.");

    let service = Service::ephemeral(&service_config);
    let shutdown = shutdown::cancel_on_signal(CancellationToken::new());

    tokio::select! {
        result = service.start() => result?,
        () = shutdown.cancelled() => {
            tracing::info!("Shutdown requested during startup");
            return Ok(());
        }
    }

    tracing::info!("Service ready");
    service.run(shutdown).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins over the configured filter, which defaults to `info`.
/// `Auto` picks JSON when stdout is not a terminal.
fn init_logging(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.filter.as_deref().unwrap_or("info"))
    });

    let use_json = match config.format {
        LogFormat::Json => true,
        LogFormat::Text => false,
        LogFormat::Auto => !std::io::stdout().is_terminal(),
    };

    if use_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .init();
    } else {
        tracing_subscriber::registry().with(env_filter).with(fmt::layer()).init();
    }
}
