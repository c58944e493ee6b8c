//! Command line and configuration loading.
//!
//! Configuration comes from an optional TOML file overlaid with
//! `VM_INVENTORY__` prefixed environment variables. Nested keys use `__`
//! (e.g. `VM_INVENTORY__JOBS__POLL_INTERVAL=2s`); single underscores in
//! field names are preserved.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use snafu::ResultExt;
use vm_inventory_types::config::{LogFormat, ServiceConfig};

use crate::error::{LoadConfigSnafu, Result, SchemaSnafu, ValidateConfigSnafu};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "VM_INVENTORY";

/// VM inventory data layer.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long, short, env = "VM_INVENTORY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format, overriding `logging.format`.
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormatArg>,

    /// Utility subcommand. The service starts when none is given.
    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

/// Utility subcommands.
#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Inspect the configuration format.
    Config {
        /// What to print.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// `config` subcommand actions.
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum ConfigAction {
    /// Print the JSON schema of the configuration.
    Schema,
    /// Print the default configuration as JSON.
    Defaults,
}

/// Log format accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable text.
    Text,
    /// JSON lines.
    Json,
    /// JSON unless stdout is a terminal.
    Auto,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Auto => LogFormat::Auto,
        }
    }
}

/// Loads and validates the service configuration.
///
/// Without `path` every section takes its defaults, still overridable from
/// the environment.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if a value
/// fails validation.
pub fn load(path: Option<&Path>) -> Result<ServiceConfig> {
    let mut builder = ::config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(::config::File::from(path.to_path_buf()).required(true));
    }
    let builder = builder.add_source(
        ::config::Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true),
    );

    let config: ServiceConfig = builder
        .build()
        .and_then(|config| config.try_deserialize())
        .context(LoadConfigSnafu { path: path.map(Path::to_path_buf) })?;
    config.validate().context(ValidateConfigSnafu)?;
    Ok(config)
}

/// JSON schema of [`ServiceConfig`].
///
/// # Errors
///
/// Returns an error if the schema cannot be serialized.
pub fn schema_json() -> Result<String> {
    serde_json::to_string_pretty(&schemars::schema_for!(ServiceConfig)).context(SchemaSnafu)
}

/// Default [`ServiceConfig`] as JSON.
///
/// # Errors
///
/// Returns an error if the defaults cannot be serialized.
pub fn defaults_json() -> Result<String> {
    serde_json::to_string_pretty(&ServiceConfig::default()).context(SchemaSnafu)
}
