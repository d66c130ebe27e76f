//! HTTP surface of the relay: the WebSocket endpoint behind the origin
//! check, static files for every other path, and the listener lifecycle.

use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::Response,
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    connection,
    hub::{Hub, HubConfig},
    origin::{self, OriginPolicy},
};

pub const WEBSOCKET_PATH: &str = "/ws";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub hub: HubConfig,
    pub origin_policy: OriginPolicy,
    pub static_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hub: HubConfig::default(),
            origin_policy: OriginPolicy::default(),
            static_dir: PathBuf::from("public"),
        }
    }
}

pub struct Relay {
    listener: TcpListener,
    hub: Hub,
    router: Router,
}

impl Relay {
    /// Starts the hub and prepares the HTTP surface around it. Must be
    /// called from within a Tokio runtime.
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        if config.origin_policy == OriginPolicy::Any {
            warn!("cross-origin checks disabled, any site may open a websocket");
        }

        let hub = Hub::spawn(config.hub);
        let router = router(hub.clone(), config.origin_policy, config.static_dir);
        Self {
            listener,
            hub,
            router,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Serves until `shutdown` resolves. Established WebSocket sessions are
    /// not drained; they end with the runtime.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Relay { listener, router, .. } = self;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("http server failed")?;

        info!("relay stopped accepting connections");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// `/ws` upgrades to a relayed WebSocket behind the origin check; every
/// other path is served from `static_dir`.
pub fn router(hub: Hub, origin_policy: OriginPolicy, static_dir: PathBuf) -> Router {
    let websocket = Router::new()
        .route(WEBSOCKET_PATH, get(upgrade))
        .route_layer(middleware::from_fn_with_state(
            Arc::new(origin_policy),
            origin::enforce,
        ))
        .with_state(hub);

    Router::new()
        .merge(websocket)
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
}

async fn upgrade(ws: WebSocketUpgrade, State(hub): State<Hub>) -> Response {
    ws.on_failed_upgrade(|err: axum::Error| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| connection::serve_socket(socket, hub))
}
