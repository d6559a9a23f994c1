use kube::core::admission::AdmissionResponse;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    handled: Family<OutcomeLabels, Counter>,
    duration: Histogram,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: &'static str,
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let handled = Family::<OutcomeLabels, Counter>::default();
        reg.register(
            "handled",
            "Total number of pod admission requests handled, by outcome",
            handled.clone(),
        );

        // The API server gives up on the webhook after at most 30s.
        let duration = Histogram::new([0.005, 0.05, 0.5, 1.0, 5.0, 10.0, 30.0]);
        reg.register_with_unit(
            "duration",
            "Time taken to handle a pod admission request",
            Unit::Seconds,
            duration.clone(),
        );

        Self { handled, duration }
    }

    pub(crate) fn observe(&self, start: time::Instant, rsp: &AdmissionResponse) {
        self.duration.observe(start.elapsed().as_secs_f64());
        self.handled
            .get_or_create(&OutcomeLabels {
                outcome: outcome(rsp),
            })
            .inc();
    }
}

fn outcome(rsp: &AdmissionResponse) -> &'static str {
    match (rsp.allowed, rsp.patch.is_some()) {
        (false, _) => "denied",
        (true, true) => "injected",
        (true, false) => "skipped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn counts_outcomes() {
        let mut reg = Registry::default();
        let metrics = AdmissionMetrics::register(reg.sub_registry_with_prefix("admission"));

        let start = time::Instant::now();
        let mut rsp = AdmissionResponse::invalid("unsupported resource type");
        metrics.observe(start, &rsp);
        rsp.allowed = true;
        metrics.observe(start, &rsp);

        let mut out = String::new();
        encode(&mut out, &reg).expect("metrics must encode");
        assert!(
            out.contains(r#"admission_handled_total{outcome="denied"} 1"#),
            "{out}"
        );
        assert!(
            out.contains(r#"admission_handled_total{outcome="skipped"} 1"#),
            "{out}"
        );
        assert!(out.contains("admission_duration_seconds_count 2"), "{out}");
    }
}
