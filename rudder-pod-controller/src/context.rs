use tokio_util::sync::CancellationToken;

use rudder_reconciler::{Executor, KubeClient};

use crate::PodHandler;

pub(crate) struct Context<C = KubeClient> {
    pub executor: Executor<C, PodHandler>,
    /// Parent of every invocation's cancellation token, cancelled on shutdown.
    pub cancel: CancellationToken,
}
