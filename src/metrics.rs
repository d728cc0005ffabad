use crate::Error;
use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub subject_cache_rebuilds: IntCounter,
    pub cert_rotations: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "foundation_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )?;
        let failures = IntCounterVec::new(
            opts!(
                "foundation_operator_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["kind", "instance", "error"],
        )?;
        let reconciliations =
            IntCounter::new("foundation_operator_reconciliations_total", "reconciliations")?;
        let subject_cache_rebuilds = IntCounter::new(
            "foundation_operator_subject_cache_rebuilds_total",
            "cluster-set subject index rebuilds that changed the index",
        )?;
        let cert_rotations = IntCounterVec::new(
            opts!(
                "foundation_operator_cert_rotations_total",
                "rotated or created TLS secrets",
            ),
            &["reason"],
        )?;
        Ok(Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            subject_cache_rebuilds,
            cert_rotations,
        })
    }

    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.subject_cache_rebuilds.clone()))?;
        registry.register(Box::new(self.cert_rotations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<T: kube::Resource<DynamicType = ()>>(&self, obj: &T, e: &Error) {
        self.failures
            .with_label_values(&[
                T::kind(&()).as_ref(),
                obj.name_any().as_ref(),
                e.metric_label(),
            ])
            .inc()
    }

    pub fn count_and_measure<T: kube::Resource<DynamicType = ()>>(&self) -> ReconcileMeasurer<T> {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            _resource_type: std::marker::PhantomData,
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer<T: kube::Resource<DynamicType = ()>> {
    start: Instant,
    metric: HistogramVec,
    _resource_type: std::marker::PhantomData<T>,
}

impl<T: kube::Resource<DynamicType = ()>> Drop for ReconcileMeasurer<T> {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[T::kind(&()).as_ref()])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    #[test]
    fn failures_are_labelled_by_kind_and_error() {
        let registry = Registry::new();
        let metrics = Metrics::new().unwrap().register(&registry).unwrap();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("tls".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        metrics.reconcile_failure(&secret, &Error::NoClusterDeployment);
        let count = metrics
            .failures
            .with_label_values(&["Secret", "tls", "NoClusterDeployment"])
            .get();
        assert_eq!(count, 1);
    }

    #[test]
    fn measurer_observes_on_drop() {
        let metrics = Metrics::new().unwrap();
        {
            let _timer = metrics.count_and_measure::<Secret>();
        }
        assert_eq!(metrics.reconciliations.get(), 1);
        assert_eq!(
            metrics
                .reconcile_duration
                .with_label_values(&["Secret"])
                .get_sample_count(),
            1
        );
    }
}
