use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::{Registry, Unit},
};
use tokio::time::Instant;

use crate::RequestIdentity;

/// Reconciliation counters keyed by namespace and name.
///
/// Cloning shares the underlying families, so every clone records into the
/// same series. Counters only ever increase.
#[derive(Clone, Default)]
pub struct ReconciliationMetrics {
    pub success: Family<IdentityLabels, Counter>,
    pub errors: Family<IdentityLabels, Counter>,
    pub duration: Family<IdentityLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct IdentityLabels {
    pub namespace: String,
    pub name: String,
}

impl From<&RequestIdentity> for IdentityLabels {
    fn from(identity: &RequestIdentity) -> Self {
        Self {
            namespace: identity.namespace().to_owned(),
            name: identity.name().to_owned(),
        }
    }
}

impl ReconciliationMetrics {
    /// Register reconciliation metrics to start exporting them.
    pub fn register(self, r: &mut Registry) -> Self {
        let r = r.sub_registry_with_prefix("reconciliation");
        r.register(
            "success",
            "Number of successful reconciliations",
            self.success.clone(),
        );
        r.register(
            "errors",
            "Number of failed reconciliations",
            self.errors.clone(),
        );
        r.register_with_unit(
            "duration",
            "Cumulative duration of successful reconciliations",
            Unit::Other("milliseconds".into()),
            self.duration.clone(),
        );
        self
    }

    /// Counts a successful reconciliation. When `start` is given, the
    /// elapsed whole milliseconds are added to the duration counter.
    pub fn record_success(&self, identity: &RequestIdentity, start: Option<Instant>) {
        let labels = IdentityLabels::from(identity);
        self.success.get_or_create(&labels).inc();
        if let Some(start) = start {
            let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.duration.get_or_create(&labels).inc_by(elapsed);
        }
    }

    pub fn record_error(&self, identity: &RequestIdentity) {
        self.errors
            .get_or_create(&IdentityLabels::from(identity))
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use prometheus_client::encoding::text::encode;

    use super::*;

    fn labels(namespace: &str, name: &str) -> IdentityLabels {
        IdentityLabels {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_success_adds_elapsed_millis() {
        let metrics = ReconciliationMetrics::default();
        let identity = RequestIdentity::new("x", "y");
        let start = Instant::now();
        tokio::time::advance(Duration::from_millis(250)).await;

        metrics.record_success(&identity, Some(start));
        metrics.record_success(&identity, None);

        assert_eq!(metrics.success.get_or_create(&labels("x", "y")).get(), 2);
        assert_eq!(metrics.duration.get_or_create(&labels("x", "y")).get(), 250);
        assert_eq!(metrics.errors.get_or_create(&labels("x", "y")).get(), 0);
    }

    #[test]
    fn test_record_error_leaves_duration() {
        let metrics = ReconciliationMetrics::default();
        let identity = RequestIdentity::new("x", "y");

        metrics.record_error(&identity);

        assert_eq!(metrics.errors.get_or_create(&labels("x", "y")).get(), 1);
        assert_eq!(metrics.success.get_or_create(&labels("x", "y")).get(), 0);
        assert_eq!(metrics.duration.get_or_create(&labels("x", "y")).get(), 0);
    }

    #[test]
    fn test_clones_share_series() {
        let metrics = ReconciliationMetrics::default();
        let clone = metrics.clone();
        clone.record_error(&RequestIdentity::new("x", "y"));
        assert_eq!(metrics.errors.get_or_create(&labels("x", "y")).get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_series_names() {
        let mut registry = Registry::with_prefix("rudder");
        let metrics = ReconciliationMetrics::default().register(&mut registry);
        let identity = RequestIdentity::new("x", "y");
        metrics.record_success(&identity, Some(Instant::now()));
        metrics.record_error(&identity);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).expect("encode registry");

        assert!(buffer.contains(r#"rudder_reconciliation_success_total{namespace="x",name="y"} 1"#));
        assert!(buffer.contains(r#"rudder_reconciliation_errors_total{namespace="x",name="y"} 1"#));
        assert!(buffer.contains(
            r#"rudder_reconciliation_duration_milliseconds_total{namespace="x",name="y"} 0"#
        ));
    }
}
