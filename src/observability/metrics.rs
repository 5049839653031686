use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub offers_total: IntCounterVec,
    pub outcomes_total: IntCounterVec,
    pub sessions_active: IntGauge,
    pub discovery_latency_seconds: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let offers_total = IntCounterVec::new(
            Opts::new("dispatch_offers_total", "Offer responses by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_offers_total metric");

        let outcomes_total = IntCounterVec::new(
            Opts::new("dispatch_outcomes_total", "Terminal dispatch outcomes"),
            &["outcome"],
        )
        .expect("valid dispatch_outcomes_total metric");

        let sessions_active = IntGauge::new(
            "dispatch_sessions_active",
            "Dispatch sessions still searching for a driver",
        )
        .expect("valid dispatch_sessions_active metric");

        let discovery_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "discovery_latency_seconds",
            "Latency of candidate discovery in seconds",
        ))
        .expect("valid discovery_latency_seconds metric");

        registry
            .register(Box::new(offers_total.clone()))
            .expect("register dispatch_offers_total");
        registry
            .register(Box::new(outcomes_total.clone()))
            .expect("register dispatch_outcomes_total");
        registry
            .register(Box::new(sessions_active.clone()))
            .expect("register dispatch_sessions_active");
        registry
            .register(Box::new(discovery_latency_seconds.clone()))
            .expect("register discovery_latency_seconds");

        Self {
            registry,
            offers_total,
            outcomes_total,
            sessions_active,
            discovery_latency_seconds,
        }
    }

    pub fn record_offer(&self, outcome: &str) {
        self.offers_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_outcome(&self, outcome: &str) {
        self.outcomes_total.with_label_values(&[outcome]).inc();
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
