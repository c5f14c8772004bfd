mod metrics;
mod probes;

use std::sync::Arc;

use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;

/// Serves `/metrics` on `addr` until `cancel` fires. With no address the
/// endpoint is disabled and the task only waits for shutdown.
pub async fn serve_metrics(
    addr: Option<String>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(addr) = addr else {
        info!("metrics endpoint disabled");
        shutdown(cancel).await;
        return Ok(());
    };
    let state = Arc::new(metrics::State::new(registry));
    serve("metrics", &addr, metrics::router(state), cancel).await
}

/// Serves `/healthz` and `/readyz` on `addr` until `cancel` fires. The
/// process reports ready once `ready` is cancelled.
pub async fn serve_probes(
    addr: Option<String>,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(addr) = addr else {
        info!("probe endpoint disabled");
        shutdown(cancel).await;
        return Ok(());
    };
    let state = Arc::new(probes::State::new(ready));
    serve("probes", &addr, probes::router(state), cancel).await
}

/// Binds `addr`, resolving host names, and serves `app` on it.
async fn serve(
    name: &str,
    addr: &str,
    app: axum::Router,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("{} listening on {}", name, listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub(crate) async fn shutdown(cancel: CancellationToken) {
    select! {
        _ = cancel.cancelled() => {}
    }
}
