mod client;
mod context;
mod error;
mod metrics;
mod reconciler;

pub use client::{ClientError, KubeClient, ResourceClient};
pub use context::{Interrupted, RequestContext, RequestIdentity};
pub use error::{ApplyError, Error, Result};
pub use metrics::{IdentityLabels, ReconciliationMetrics};
pub use reconciler::{Executor, Outcome, Reconciler, ResourceHandler};
