use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::time::Duration;

/// Counts and times reconciles per controller.
#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    total: Family<ResultLabels, Counter>,
    duration: Family<ControllerLabels, Histogram>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ReconcileResult {
    Ok,
    Terminal,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    controller: &'static str,
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ControllerLabels {
    controller: &'static str,
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let total = Family::<ResultLabels, Counter>::default();
        reg.register(
            "reconcile",
            "Total number of reconciles by controller and result",
            total.clone(),
        );

        let duration = Family::<ControllerLabels, Histogram>::new_with_constructor(|| {
            // Reconciles that wait on OCI work requests take tens of seconds.
            Histogram::new([0.01, 0.1, 1.0, 10.0, 60.0, 300.0, 1200.0].into_iter())
        });
        reg.register_with_unit(
            "reconcile_duration",
            "Histogram of reconcile latency (seconds)",
            Unit::Seconds,
            duration.clone(),
        );

        Self { total, duration }
    }

    pub(crate) fn observe(
        &self,
        controller: &'static str,
        result: ReconcileResult,
        elapsed: Duration,
    ) {
        self.total
            .get_or_create(&ResultLabels {
                controller,
                result: result.as_str(),
            })
            .inc();
        self.duration
            .get_or_create(&ControllerLabels { controller })
            .observe(elapsed.as_secs_f64());
    }
}

impl ReconcileResult {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Terminal => "terminal",
            Self::Error => "error",
        }
    }
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
