use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    fleet_active_queries: Gauge,
    fleet_submissions: CounterVec,
    fleet_reattempts: CounterVec,
    fleet_cancellations: CounterVec,
    fleet_profile_send_failures: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn set_active_queries(&self, active: u64) {
        self.inner.fleet_active_queries.set(active as f64);
    }

    pub fn inc_submissions(&self, outcome: &str) {
        self.inner
            .fleet_submissions
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_reattempts(&self, reason: &str) {
        self.inner
            .fleet_reattempts
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_cancellations(&self, origin: &str) {
        self.inner
            .fleet_cancellations
            .with_label_values(&[origin])
            .inc();
    }

    pub fn inc_profile_send_failures(&self, external_id: &str) {
        self.inner
            .fleet_profile_send_failures
            .with_label_values(&[external_id])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let fleet_active_queries = gauge(
            &registry,
            "qf_fleet_active_queries",
            "Queries currently registered on this coordinator",
        );
        let fleet_submissions = counter_vec(
            &registry,
            "qf_fleet_submissions_total",
            "Query submissions by outcome",
            &["outcome"],
        );
        let fleet_reattempts = counter_vec(
            &registry,
            "qf_fleet_reattempts_total",
            "Silent re-attempts by reason",
            &["reason"],
        );
        let fleet_cancellations = counter_vec(
            &registry,
            "qf_fleet_cancellations_total",
            "Query cancellations by origin",
            &["origin"],
        );
        let fleet_profile_send_failures = counter_vec(
            &registry,
            "qf_fleet_profile_send_failures_total",
            "Best-effort profile broadcasts that failed",
            &["external_id"],
        );

        Self {
            registry,
            fleet_active_queries,
            fleet_submissions,
            fleet_reattempts,
            fleet_cancellations,
            fleet_profile_send_failures,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Gauge {
    let g = Gauge::with_opts(Opts::new(name, help)).expect("gauge");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
