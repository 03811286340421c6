use crate::config::{Config, ListenConfig, LogLevel};
use crate::error::Error;
use clap::Parser;
use log::info;

#[derive(Parser)]
#[command(name = "ipmi-power")]
#[command(version)]
#[command(about = "HTTP API for IPMI chassis power control")]
pub struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        value_name = "FILE",
        default_value = "ipmi-power.toml"
    )]
    pub config: String,

    /// Generate a default configuration file
    #[arg(long = "generate-config")]
    pub generate_config: bool,

    /// Listen address (overrides config file)
    #[arg(short = 'l', long = "listen", value_name = "ADDRESS", env = "IPMI_POWER_LISTEN")]
    pub listen: Option<String>,

    /// Log level (overrides config file)
    #[arg(
        long = "log-level",
        value_name = "LEVEL",
        help = "Set log level (error, warn, info, debug, trace)"
    )]
    pub log_level: Option<String>,

    /// Allow cross-origin requests from any origin
    #[arg(long = "cors-allow-all")]
    pub cors_allow_all: bool,
}

pub fn handle_cli_args() -> Result<Option<Config>, Error> {
    let cli = Cli::parse();

    if cli.generate_config {
        Config::default().save_to_file(&cli.config)?;
        info!("Generated default configuration file: {}", cli.config);
        return Ok(None);
    }

    let mut config = Config::from_file(&cli.config).map_err(|e| {
        Error::Config(format!("Failed to load '{}': {}", cli.config, e))
    })?;

    if let Some(listen) = cli.listen {
        config.listen = ListenConfig::String(listen);
    }

    if let Some(log_level_str) = cli.log_level {
        config.log_level = log_level_str.parse::<LogLevel>()?;
    }

    if cli.cors_allow_all {
        config.cors_allow_all = true;
    }

    config.validate()?;

    Ok(Some(config))
}
