use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use rudder_reconciler::{ApplyError, RequestContext, ResourceHandler};
use tracing::debug;

/// Pod specific reconciliation. Only observes the pod for now.
#[derive(Clone, Copy, Debug, Default)]
pub struct PodHandler;

impl<C> ResourceHandler<Pod, C> for PodHandler
where
    C: Send + Sync,
{
    async fn apply(&self, ctx: &RequestContext<C, Arc<Pod>>) -> Result<(), ApplyError> {
        let pod = ctx.resource();
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        debug!(phase, "observed Pod");
        Ok(())
    }
}
