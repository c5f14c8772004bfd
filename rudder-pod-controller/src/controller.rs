use std::{sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::Pod;
use kube::{ResourceExt, runtime::controller::Action};
use rudder_reconciler::{Error, RequestIdentity, ResourceClient, Result};
use tracing::{debug, warn};

use crate::context::Context;

const ERROR_REQUEUE_DURATION: Duration = Duration::from_secs(5);

/// Reconciles the Pod identified by the event. The object delivered by the
/// watcher is only used for its identity, the executor fetches the current
/// state itself.
#[tracing::instrument(skip(pod, ctx))]
pub(crate) async fn reconcile<C>(pod: Arc<Pod>, ctx: Arc<Context<C>>) -> Result<Action>
where
    C: ResourceClient<Pod> + Clone + 'static,
{
    let name = pod.name_any();
    let Some(ns) = pod.namespace() else {
        warn!("failed to find namespace on Pod {}", name);
        return Ok(Action::await_change());
    };

    let outcome = ctx
        .executor
        .reconcile::<Pod>(&ctx.cancel, RequestIdentity::new(ns, name))
        .await?;
    debug!(?outcome, "reconcile finished");
    Ok(Action::await_change())
}

pub(crate) fn error_policy<C>(_pod: Arc<Pod>, error: &Error, _ctx: Arc<Context<C>>) -> Action {
    if error.is_cancelled() {
        debug!("not requeuing Pod {} during shutdown", error.identity());
        return Action::await_change();
    }
    debug!(
        "requeuing Pod {} in {:?}",
        error.identity(),
        ERROR_REQUEUE_DURATION
    );
    Action::requeue(ERROR_REQUEUE_DURATION)
}
