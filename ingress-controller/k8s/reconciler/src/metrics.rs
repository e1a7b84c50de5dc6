use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    results: Family<ResultLabels, Counter>,
    duration: Family<KindLabels, Histogram>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ResultLabels {
    kind: &'static str,
    result: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct KindLabels {
    kind: &'static str,
}

/// The outcome of a single reconcile pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ready,
    NotReady,
    NotOwned,
    Error,
}

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let results = Family::<ResultLabels, Counter>::default();
        reg.register(
            "results",
            "Count of Ingress reconcile passes by outcome",
            results.clone(),
        );

        let duration = Family::<KindLabels, Histogram>::new_with_constructor(|| {
            // Passes that probe gateways are bounded by the probe timeout.
            Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0])
        });
        reg.register_with_unit(
            "duration",
            "Histogram of Ingress reconcile pass durations",
            Unit::Seconds,
            duration.clone(),
        );

        Self { results, duration }
    }

    pub fn reconciled(&self, outcome: Outcome, elapsed: Duration) {
        self.observe("reconcile", outcome, elapsed);
    }

    pub fn finalized(&self, outcome: Outcome, elapsed: Duration) {
        self.observe("finalize", outcome, elapsed);
    }

    fn observe(&self, kind: &'static str, outcome: Outcome, elapsed: Duration) {
        self.results
            .get_or_create(&ResultLabels {
                kind,
                result: outcome.as_str(),
            })
            .inc();
        self.duration
            .get_or_create(&KindLabels { kind })
            .observe(elapsed.as_secs_f64());
    }
}

// === impl Outcome ===

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::NotReady => "not_ready",
            Self::NotOwned => "not_owned",
            Self::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_outcomes() {
        let mut reg = Registry::default();
        let metrics = ReconcileMetrics::register(reg.sub_registry_with_prefix("ingress"));
        metrics.reconciled(Outcome::Ready, Duration::from_millis(20));
        metrics.reconciled(Outcome::Ready, Duration::from_millis(30));
        metrics.finalized(Outcome::Error, Duration::from_millis(5));

        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &reg).unwrap();
        assert!(
            text.contains(r#"ingress_results_total{kind="reconcile",result="ready"} 2"#),
            "{text}"
        );
        assert!(
            text.contains(r#"ingress_results_total{kind="finalize",result="error"} 1"#),
            "{text}"
        );
        assert!(text.contains("ingress_duration_seconds_count"), "{text}");
    }
}
