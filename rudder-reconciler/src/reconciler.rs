use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kube::Resource;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info};

use crate::{
    ApplyError, Error, ReconciliationMetrics, RequestContext, RequestIdentity, ResourceClient,
    Result,
};

/// Shared reconciliation support: the resource client, the metric families
/// and the root span every invocation logs under.
///
/// Resource specific handlers do not embed this type, they are paired with
/// it in an [`Executor`].
#[derive(Clone)]
pub struct Reconciler<C> {
    client: C,
    metrics: ReconciliationMetrics,
    logger: Span,
}

impl<C> Reconciler<C> {
    pub fn new(client: C, metrics: ReconciliationMetrics, logger: Span) -> Self {
        Self {
            client,
            metrics,
            logger,
        }
    }

    /// Builds the context of one invocation from the base token supplied by
    /// the dispatch runtime.
    pub fn compose(&self, base: &CancellationToken, identity: RequestIdentity) -> RequestContext<C>
    where
        C: Clone,
    {
        RequestContext::compose(base, self.client.clone(), &self.logger, identity)
    }

    pub fn record_success(&self, identity: &RequestIdentity, start: Option<Instant>) {
        self.metrics.record_success(identity, start);
    }

    pub fn record_error(&self, identity: &RequestIdentity) {
        self.metrics.record_error(identity);
    }

    pub fn metrics(&self) -> &ReconciliationMetrics {
        &self.metrics
    }
}

/// Resource specific logic run once the target object has been fetched.
pub trait ResourceHandler<K, C>: Send + Sync {
    fn apply(
        &self,
        ctx: &RequestContext<C, Arc<K>>,
    ) -> impl Future<Output = Result<(), ApplyError>> + Send;
}

/// Successful end of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The resource was fetched and the handler completed.
    Applied,
    /// The resource was deleted before the invocation ran.
    Absent,
}

/// Runs reconcile invocations for one resource kind.
pub struct Executor<C, H> {
    support: Reconciler<C>,
    handler: H,
    timeout: Option<Duration>,
}

impl<C, H> Executor<C, H> {
    pub fn new(support: Reconciler<C>, handler: H) -> Self {
        Self {
            support,
            handler,
            timeout: None,
        }
    }

    /// Bounds every invocation to `timeout` from its start.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn support(&self) -> &Reconciler<C> {
        &self.support
    }

    /// Reconciles the object named by `identity`.
    ///
    /// A deleted object ends in [`Outcome::Absent`] without touching any
    /// metric. Every error is logged and counted once for the identity before
    /// it is returned; retrying is left to the caller.
    pub async fn reconcile<K>(
        &self,
        base: &CancellationToken,
        identity: RequestIdentity,
    ) -> Result<Outcome>
    where
        K: Resource<DynamicType = ()> + Send + Sync + 'static,
        C: ResourceClient<K> + Clone,
        H: ResourceHandler<K, C>,
    {
        let start = Instant::now();
        let mut ctx = self.support.compose(base, identity);
        if let Some(timeout) = self.timeout {
            ctx = ctx.with_deadline(start + timeout);
        }
        let span = ctx.span().clone();

        let result = self.run::<K>(&ctx).instrument(span.clone()).await;
        match &result {
            Ok(Outcome::Applied) => self.support.record_success(ctx.identity(), Some(start)),
            Ok(Outcome::Absent) => {}
            Err(e) => {
                span.in_scope(|| error!(error = %e, "reconciliation failed"));
                self.support.record_error(ctx.identity());
            }
        }
        result
    }

    async fn run<K>(&self, ctx: &RequestContext<C>) -> Result<Outcome>
    where
        K: Resource<DynamicType = ()> + Send + Sync + 'static,
        C: ResourceClient<K> + Clone,
        H: ResourceHandler<K, C>,
    {
        let kind = K::kind(&()).into_owned();
        let identity = ctx.identity();

        let fetched = ctx
            .guard(ResourceClient::<K>::get(ctx.client(), identity))
            .await
            .map_err(|reason| Error::interrupted(reason, &kind, identity))?;
        let resource = match fetched {
            Ok(resource) => Arc::new(resource),
            Err(e) if e.is_not_found() => {
                info!("{} does not exist anymore, nothing to reconcile", kind);
                return Ok(Outcome::Absent);
            }
            Err(source) => {
                return Err(Error::Fetch {
                    kind,
                    identity: identity.clone(),
                    source,
                });
            }
        };
        debug!("fetched {}", kind);

        let ctx = ctx.with_resource(resource);
        ctx.guard(ResourceHandler::<K, C>::apply(&self.handler, &ctx))
            .await
            .map_err(|reason| Error::interrupted(reason, &kind, identity))?
            .map_err(|source| Error::Apply {
                kind,
                identity: identity.clone(),
                source,
            })?;
        Ok(Outcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;
    use tokio::task::JoinSet;

    use super::*;
    use crate::{ClientError, IdentityLabels};

    #[derive(Clone, Copy)]
    enum Fetch {
        Found,
        NotFound,
        Fail(&'static str),
        Hang,
    }

    #[derive(Clone)]
    struct FakeClient {
        fetch: Fetch,
        calls: Arc<AtomicUsize>,
    }

    impl FakeClient {
        fn new(fetch: Fetch) -> Self {
            Self {
                fetch,
                calls: Arc::default(),
            }
        }
    }

    impl ResourceClient<Pod> for FakeClient {
        async fn get(&self, identity: &RequestIdentity) -> Result<Pod, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fetch {
                Fetch::Found => Ok(make_pod(identity)),
                Fetch::NotFound => Err(ClientError::NotFound),
                Fetch::Fail(message) => Err(ClientError::Other(message.into())),
                Fetch::Hang => std::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        fail: bool,
        seen: Mutex<Vec<String>>,
    }

    impl ResourceHandler<Pod, FakeClient> for RecordingHandler {
        async fn apply(&self, ctx: &RequestContext<FakeClient, Arc<Pod>>) -> Result<(), ApplyError> {
            let name = ctx.resource().metadata.name.clone().unwrap_or_default();
            self.seen.lock().expect("seen lock").push(name);
            if self.fail {
                return Err(ApplyError::Other("handler failed".into()));
            }
            Ok(())
        }
    }

    fn make_pod(identity: &RequestIdentity) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(identity.name().into()),
                namespace: Some(identity.namespace().into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn make_executor(fetch: Fetch, handler: RecordingHandler) -> Executor<FakeClient, RecordingHandler> {
        let support = Reconciler::new(
            FakeClient::new(fetch),
            ReconciliationMetrics::default(),
            Span::none(),
        );
        Executor::new(support, handler)
    }

    fn labels(namespace: &str, name: &str) -> IdentityLabels {
        IdentityLabels {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn counts(executor: &Executor<FakeClient, RecordingHandler>, namespace: &str, name: &str) -> (u64, u64) {
        let metrics = executor.support().metrics();
        let labels = labels(namespace, name);
        (
            metrics.success.get_or_create(&labels).get(),
            metrics.errors.get_or_create(&labels).get(),
        )
    }

    #[tokio::test]
    async fn test_reconcile_applies_fetched_resource() {
        let executor = make_executor(Fetch::Found, RecordingHandler::default());
        let base = CancellationToken::new();

        let outcome = executor
            .reconcile::<Pod>(&base, RequestIdentity::new("x", "y"))
            .await
            .expect("reconcile");

        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(counts(&executor, "x", "y"), (1, 0));
        assert_eq!(*executor.handler.seen.lock().expect("seen lock"), vec!["y".to_string()]);
        let duration = executor
            .support()
            .metrics()
            .duration
            .get_or_create(&labels("x", "y"))
            .get();
        assert!(duration < 60_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_measures_duration() {
        struct SlowHandler;
        impl ResourceHandler<Pod, FakeClient> for SlowHandler {
            async fn apply(&self, _ctx: &RequestContext<FakeClient, Arc<Pod>>) -> Result<(), ApplyError> {
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(())
            }
        }
        let support = Reconciler::new(
            FakeClient::new(Fetch::Found),
            ReconciliationMetrics::default(),
            Span::none(),
        );
        let executor = Executor::new(support, SlowHandler);

        executor
            .reconcile::<Pod>(&CancellationToken::new(), RequestIdentity::new("x", "y"))
            .await
            .expect("reconcile");

        let metrics = executor.support().metrics();
        assert_eq!(metrics.duration.get_or_create(&labels("x", "y")).get(), 40);
        assert_eq!(metrics.success.get_or_create(&labels("x", "y")).get(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_not_found_is_success_without_metrics() {
        let executor = make_executor(Fetch::NotFound, RecordingHandler::default());

        let outcome = executor
            .reconcile::<Pod>(&CancellationToken::new(), RequestIdentity::new("x", "y"))
            .await
            .expect("not found is not an error");

        assert_eq!(outcome, Outcome::Absent);
        assert_eq!(counts(&executor, "x", "y"), (0, 0));
        assert!(executor.handler.seen.lock().expect("seen lock").is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_fetch_error_counts_once() {
        let executor = make_executor(Fetch::Fail("connection refused"), RecordingHandler::default());

        let err = executor
            .reconcile::<Pod>(&CancellationToken::new(), RequestIdentity::new("x", "y"))
            .await
            .expect_err("fetch failure");

        assert!(matches!(
            err,
            Error::Fetch {
                source: ClientError::Other(_),
                ..
            }
        ));
        assert_eq!(err.to_string(), "failed to get Pod x/y: connection refused");
        assert_eq!(counts(&executor, "x", "y"), (0, 1));
        assert!(executor.handler.seen.lock().expect("seen lock").is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_handler_error_counts_once() {
        let handler = RecordingHandler {
            fail: true,
            ..Default::default()
        };
        let executor = make_executor(Fetch::Found, handler);

        let err = executor
            .reconcile::<Pod>(&CancellationToken::new(), RequestIdentity::new("x", "y"))
            .await
            .expect_err("handler failure");

        assert!(matches!(err, Error::Apply { .. }));
        assert_eq!(err.to_string(), "failed to reconcile Pod x/y: handler failed");
        assert_eq!(counts(&executor, "x", "y"), (0, 1));
    }

    #[tokio::test]
    async fn test_reconcile_cancelled_base_aborts() {
        let executor = make_executor(Fetch::Hang, RecordingHandler::default());
        let base = CancellationToken::new();
        base.cancel();

        let err = executor
            .reconcile::<Pod>(&base, RequestIdentity::new("x", "y"))
            .await
            .expect_err("cancelled");

        assert!(err.is_cancelled());
        assert_eq!(counts(&executor, "x", "y"), (0, 1));
    }

    #[tokio::test]
    async fn test_reconcile_cancelled_mid_fetch() {
        let executor = Arc::new(make_executor(Fetch::Hang, RecordingHandler::default()));
        let base = CancellationToken::new();

        let task = {
            let executor = executor.clone();
            let base = base.clone();
            tokio::spawn(async move {
                executor
                    .reconcile::<Pod>(&base, RequestIdentity::new("x", "y"))
                    .await
            })
        };
        while executor.support().client.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        base.cancel();

        let err = task.await.expect("join").expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(counts(&executor, "x", "y"), (0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_deadline_exceeded() {
        let executor = make_executor(Fetch::Hang, RecordingHandler::default())
            .with_timeout(Duration::from_secs(30));

        let err = executor
            .reconcile::<Pod>(&CancellationToken::new(), RequestIdentity::new("x", "y"))
            .await
            .expect_err("deadline");

        assert!(matches!(err, Error::DeadlineExceeded { .. }));
        assert_eq!(counts(&executor, "x", "y"), (0, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_identities_keep_exact_counts() {
        let ok = Arc::new(make_executor(Fetch::Found, RecordingHandler::default()));
        let failing = Arc::new(Executor::new(
            Reconciler::new(
                FakeClient::new(Fetch::Fail("boom")),
                ok.support().metrics().clone(),
                Span::none(),
            ),
            RecordingHandler::default(),
        ));
        let base = CancellationToken::new();

        let mut tasks = JoinSet::new();
        for _ in 0..50 {
            let ok = ok.clone();
            let failing = failing.clone();
            let base = base.clone();
            tasks.spawn(async move {
                let a = ok.reconcile::<Pod>(&base, RequestIdentity::new("ns", "a")).await;
                let b = failing
                    .reconcile::<Pod>(&base, RequestIdentity::new("ns", "b"))
                    .await;
                (a.is_ok(), b.is_err())
            });
        }
        while let Some(res) = tasks.join_next().await {
            assert_eq!(res.expect("join"), (true, true));
        }

        assert_eq!(counts(&ok, "ns", "a"), (50, 0));
        assert_eq!(counts(&ok, "ns", "b"), (0, 50));
    }
}
