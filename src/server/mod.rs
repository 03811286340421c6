mod api_error;
pub(crate) mod connection_pool;
mod handlers;
pub mod power_server;

pub use power_server::PowerServer;

use crate::ipmi::ChassisSession;
use axum::routing::get;
use axum::Router;
use connection_pool::{Connector, SessionRegistry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{self, CorsLayer};

/// Hosts queried at once by `GET /hosts`.
const HOST_QUERY_CONCURRENCY: usize = 4;

pub(crate) struct AppState<C: Connector> {
    registry: Arc<SessionRegistry<C>>,
    // Cancelled when the server starts shutting down; wakes queued acquires.
    shutdown: CancellationToken,
}

impl<C: Connector> AppState<C> {
    pub(crate) fn new(registry: Arc<SessionRegistry<C>>, shutdown: CancellationToken) -> Self {
        Self { registry, shutdown }
    }
}

// A derive would require `C: Clone`.
impl<C: Connector> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

pub(crate) fn router<C>(state: AppState<C>, cors_allow_all: bool) -> Router
where
    C: Connector,
    C::Session: ChassisSession,
{
    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/hosts", get(handlers::list_hosts::<C>))
        .route(
            "/host/{hostname}",
            get(handlers::get_host::<C>).put(handlers::put_host::<C>),
        )
        .with_state(state);

    if cors_allow_all {
        app.layer(
            CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods(cors::Any)
                .allow_headers(cors::Any),
        )
    } else {
        app
    }
}
