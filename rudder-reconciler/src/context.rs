use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Span, info_span};

/// Namespace and name of the object a reconcile invocation targets.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestIdentity {
    namespace: String,
    name: String,
}

impl RequestIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reason a guarded call stopped before its future completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    Cancelled,
    DeadlineExceeded,
}

/// Collaborators of a single reconcile invocation.
///
/// `R` is `()` until the target resource has been fetched and attached with
/// [`RequestContext::with_resource`]; only a `RequestContext<C, Arc<K>>`
/// exposes [`RequestContext::resource`], so reading the resource early does
/// not compile.
///
/// Every `with_*` method borrows the context and returns a derived one, the
/// original stays usable and unchanged. Derived contexts share the
/// cancellation token of the context they were derived from.
pub struct RequestContext<C, R = ()> {
    client: C,
    identity: RequestIdentity,
    logger: Span,
    span: Span,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    resource: R,
}

impl<C> RequestContext<C> {
    /// Builds the context of a new invocation. The token is a child of
    /// `base`, so cancelling the base aborts the invocation but not the
    /// other way around. The span is a child of `logger` with the identity
    /// bound as fields.
    pub fn compose(
        base: &CancellationToken,
        client: C,
        logger: &Span,
        identity: RequestIdentity,
    ) -> Self {
        Self {
            span: identity_span(logger, &identity),
            logger: logger.clone(),
            client,
            identity,
            cancel: base.child_token(),
            deadline: None,
            resource: (),
        }
    }

    pub fn with_resource<K>(&self, resource: Arc<K>) -> RequestContext<C, Arc<K>>
    where
        C: Clone,
    {
        RequestContext {
            client: self.client.clone(),
            identity: self.identity.clone(),
            logger: self.logger.clone(),
            span: self.span.clone(),
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            resource,
        }
    }
}

impl<C, R> RequestContext<C, R>
where
    C: Clone,
    R: Clone,
{
    pub fn with_client<D>(&self, client: D) -> RequestContext<D, R> {
        RequestContext {
            client,
            identity: self.identity.clone(),
            logger: self.logger.clone(),
            span: self.span.clone(),
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            resource: self.resource.clone(),
        }
    }

    pub fn with_identity(&self, identity: RequestIdentity) -> Self {
        Self {
            span: identity_span(&self.logger, &identity),
            identity,
            ..self.clone()
        }
    }

    pub fn with_logger(&self, logger: &Span) -> Self {
        Self {
            span: identity_span(logger, &self.identity),
            logger: logger.clone(),
            ..self.clone()
        }
    }

    /// Bounds the invocation by `deadline`. An existing earlier deadline is
    /// kept.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }
}

impl<C, R> Clone for RequestContext<C, R>
where
    C: Clone,
    R: Clone,
{
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            identity: self.identity.clone(),
            logger: self.logger.clone(),
            span: self.span.clone(),
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            resource: self.resource.clone(),
        }
    }
}

impl<C, R> RequestContext<C, R> {
    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn identity(&self) -> &RequestIdentity {
        &self.identity
    }

    /// Span carrying the `namespace` and `name` of this invocation. Events
    /// recorded inside it are attributable without repeating the identity.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drives `fut` until it completes, the context is cancelled or the
    /// deadline passes, whichever comes first. Cancellation is checked
    /// before the future is polled.
    pub async fn guard<F>(&self, fut: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            _ = deadline => Err(Interrupted::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

impl<C, K> RequestContext<C, Arc<K>> {
    pub fn resource(&self) -> &K {
        &self.resource
    }
}

fn identity_span(logger: &Span, identity: &RequestIdentity) -> Span {
    info_span!(
        parent: logger,
        "request",
        namespace = %identity.namespace(),
        name = %identity.name(),
    )
}
