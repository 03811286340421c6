mod cli;
mod config;
pub mod error;
mod ipmi;
mod server;
mod target;

use log::{debug, error, info, LevelFilter};

fn log_level_to_filter(level: &config::LogLevel) -> LevelFilter {
    match level {
        config::LogLevel::Error => LevelFilter::Error,
        config::LogLevel::Warn => LevelFilter::Warn,
        config::LogLevel::Info => LevelFilter::Info,
        config::LogLevel::Debug => LevelFilter::Debug,
        config::LogLevel::Trace => LevelFilter::Trace,
    }
}

#[tokio::main]
async fn main() {
    let config = match cli::handle_cli_args() {
        Ok(Some(config)) => config,
        Ok(None) => {
            // e.g. --generate-config
            return;
        }
        Err(e) => {
            env_logger::init();
            error!("{}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level_to_filter(&config.log_level))
        .init();

    info!("Starting ipmi-power");
    debug!("Config: {}", config);

    let server = match server::PowerServer::with_config(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Server error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
