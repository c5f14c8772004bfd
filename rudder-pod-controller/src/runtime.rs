use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client,
    runtime::{Controller, watcher::Config},
};
use rudder_reconciler::{Executor, KubeClient, Reconciler, ReconciliationMetrics, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span};

use crate::{
    PodHandler,
    context::Context,
    controller::{error_policy, reconcile},
};

const RECONCILE_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn start_pod_controller(
    client: Client,
    metrics: ReconciliationMetrics,
    cancel: CancellationToken,
) -> Result<()> {
    let api: Api<Pod> = Api::all(client.clone());
    let support = Reconciler::new(
        KubeClient::new(client),
        metrics,
        info_span!("controller", kind = "Pod"),
    );
    let context = Arc::new(Context {
        executor: Executor::new(support, PodHandler).with_timeout(RECONCILE_TIMEOUT),
        cancel: cancel.clone(),
    });

    info!("starting Pod controller");
    Controller::new(api, Config::default().any_semantic())
        .graceful_shutdown_on(shutdown(cancel))
        .run(reconcile::<KubeClient>, error_policy::<KubeClient>, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
    info!("Pod controller stopped");
    Ok(())
}

async fn shutdown(cancel: CancellationToken) {
    cancel.cancelled().await;
}
