//! Gateway server: binds the client address and runs both multiplexer branches.

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::gateway::mux::{BranchListener, Multiplexer};
use crate::gateway::proxy::{tunnel_handler, TunnelProxy};
use crate::gateway::router::{http_router, HttpState};
use crate::metrics::{MetricsSink, PrometheusMetrics};
use crate::net;
use crate::quake::OobClient;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bind `config.client_addr` and serve until `cancel` fires.
pub async fn run_gateway(
    config: GatewayConfig,
    metrics: Arc<PrometheusMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(&config.client_addr)
        .await
        .map_err(|e| Error::io(format!("binding to {}", config.client_addr), e))?;
    log::info!("gateway listening on {}", config.client_addr);
    serve_gateway(listener, &config.server_addr, metrics, cancel).await?;
    log::info!("gateway stopped");
    Ok(())
}

/// Serve an already-bound listener: upgrade requests are tunnelled to
/// `server_addr`, everything else goes to the HTTP router.
pub async fn serve_gateway(
    listener: TcpListener,
    server_addr: &str,
    metrics: Arc<PrometheusMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    let backend = net::resolve(server_addr).await?;
    let (mux, websocket_listener, http_listener) = Multiplexer::new(listener)?;

    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let proxy = Arc::new(TunnelProxy::new(backend, cancel.clone(), sink));
    let tunnel_app = Router::new().fallback(tunnel_handler).with_state(proxy);
    let http_app = http_router(HttpState {
        server_addr: server_addr.to_string(),
        client: OobClient::new(),
        metrics,
    });

    let websocket_task = spawn_branch("websocket", websocket_listener, tunnel_app, cancel.clone());
    let http_task = spawn_branch("http", http_listener, http_app, cancel.clone());

    mux.serve(cancel.clone()).await?;

    let mut first_err = None;
    for task in [websocket_task, http_task] {
        let result = match task.await {
            Ok(r) => r,
            Err(e) => Err(Error::io("gateway branch task", std::io::Error::other(e))),
        };
        if let Err(e) = result {
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Run one branch's request-serving loop. A failing branch cancels the whole
/// gateway so the other branch does not keep running on its own.
fn spawn_branch(
    name: &'static str,
    listener: BranchListener,
    app: Router,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let shutdown = cancel.clone();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            log::error!("{} branch failed: {}", name, e);
            cancel.cancel();
            return Err(Error::io(format!("{} branch", name), e));
        }
        log::debug!("{} branch stopped", name);
        Ok(())
    })
}
