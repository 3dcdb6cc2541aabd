use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub assign_total: IntCounterVec,
    pub assign_latency_seconds: HistogramVec,
    pub offers_resolved_total: IntCounterVec,
    pub claim_conflicts_total: IntCounter,
    pub orders_in_active_queue: IntGauge,
    pub sweeps_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let assign_total = IntCounterVec::new(
            Opts::new("assign_total", "Total matching passes by outcome"),
            &["outcome"],
        )
        .expect("valid assign_total metric");

        let assign_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "assign_latency_seconds",
                "Latency of a matching pass in seconds",
            ),
            &["outcome"],
        )
        .expect("valid assign_latency_seconds metric");

        let offers_resolved_total = IntCounterVec::new(
            Opts::new("offers_resolved_total", "Resolved offers by terminal status"),
            &["outcome"],
        )
        .expect("valid offers_resolved_total metric");

        let claim_conflicts_total = IntCounter::new(
            "claim_conflicts_total",
            "Driver claims lost to a concurrent match",
        )
        .expect("valid claim_conflicts_total metric");

        let orders_in_active_queue = IntGauge::new(
            "orders_in_active_queue",
            "Orders waiting in ACTIVE_QUEUE as of the last sweep",
        )
        .expect("valid orders_in_active_queue metric");

        let sweeps_total = IntCounterVec::new(
            Opts::new("sweeps_total", "Sweep invocations by outcome"),
            &["outcome"],
        )
        .expect("valid sweeps_total metric");

        registry
            .register(Box::new(assign_total.clone()))
            .expect("register assign_total");
        registry
            .register(Box::new(assign_latency_seconds.clone()))
            .expect("register assign_latency_seconds");
        registry
            .register(Box::new(offers_resolved_total.clone()))
            .expect("register offers_resolved_total");
        registry
            .register(Box::new(claim_conflicts_total.clone()))
            .expect("register claim_conflicts_total");
        registry
            .register(Box::new(orders_in_active_queue.clone()))
            .expect("register orders_in_active_queue");
        registry
            .register(Box::new(sweeps_total.clone()))
            .expect("register sweeps_total");

        Self {
            registry,
            assign_total,
            assign_latency_seconds,
            offers_resolved_total,
            claim_conflicts_total,
            orders_in_active_queue,
            sweeps_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
