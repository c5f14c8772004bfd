use std::path::Path;

use kube::config::{KubeConfigOptions, Kubeconfig};
use rudder_pod_controller::start_pod_controller;
use rudder_reconciler::ReconciliationMetrics;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Result, config::Config};

/// Connects to the cluster and runs the controllers until `cancel` fires.
/// `ready` is cancelled once the controllers are about to start.
pub async fn start(
    config: &Config,
    metrics: ReconciliationMetrics,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let client = client(config.kubeconfig.as_deref()).await?;

    if config.leader_election {
        warn!("leader election is not supported, running as the only replica");
    }
    if config.enable_webhooks {
        info!(port = config.port, "webhooks enabled but no webhooks are registered");
    }

    let pod_controller = tokio::spawn(start_pod_controller(client, metrics, cancel.clone()));

    ready.cancel();
    supervise(pod_controller, cancel).await
}

/// Waits for `cancel` or for the controller to end. A controller that fails
/// or panics is an error.
async fn supervise(
    controller: JoinHandle<rudder_reconciler::Result<()>>,
    cancel: CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        res = controller => Ok(res??),
    }
}

async fn client(kubeconfig: Option<&Path>) -> Result<kube::Client> {
    let client = match kubeconfig {
        Some(path) => {
            info!("loading kubeconfig from {}", path.display());
            let kubeconfig = Kubeconfig::read_from(path)?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?;
            kube::Client::try_from(config)?
        }
        None => kube::Client::try_default().await?,
    };
    Ok(client)
}
