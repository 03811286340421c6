use super::connection_pool::SessionRegistry;
use super::{router, AppState};
use crate::config::Config;
use crate::error::Error;
use crate::ipmi::IpmiConnector;
use log::{error, info};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct PowerServer {
    config: Config,
    registry: Arc<SessionRegistry<IpmiConnector>>,
}

impl PowerServer {
    pub fn with_config(config: Config) -> Result<Self, Error> {
        let targets = config.targets()?;
        if targets.is_empty() {
            return Err(Error::Server("No hosts configured".to_string()));
        }
        let host_count = targets.len();
        let connector = IpmiConnector::new(config.ipmi.timeout, config.ipmi.rmcp_plus);
        let registry = Arc::new(SessionRegistry::new(
            connector,
            targets,
            config.pool.clone(),
        ));
        info!(
            "Managing {} host(s), session pool: {}",
            host_count,
            registry.config()
        );

        Ok(Self { config, registry })
    }

    pub async fn run(&self) -> Result<(), Error> {
        let listen_addr = self.config.parse_listen_addr()?;
        let sweeper = self.registry.start_idle_sweeper();
        let shutdown = CancellationToken::new();
        let app = router(
            AppState::new(self.registry.clone(), shutdown.clone()),
            self.config.cors_allow_all,
        );

        let listener = tokio::net::TcpListener::bind(listen_addr).await?;
        info!("Starting ipmi-power server on {}", listener.local_addr()?);

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown))
            .await;

        info!("Shutting down, closing IPMI sessions");
        self.registry.shutdown().await;
        sweeper.abort();

        served.map_err(Error::from)
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    shutdown.cancel();
}
