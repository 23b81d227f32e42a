use std::time::Duration;

use prometheus::{
    opts, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

use crate::task::DropReason;

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    tasks_total: IntCounterVec,
    drops_total: IntCounterVec,
    batch_size: Histogram,
    forward_duration_seconds: Histogram,
    open_requests: IntGauge,
    dispatch_replies_total: IntCounterVec,
    udp_queue_dropped_total: IntCounter,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let tasks_total = IntCounterVec::new(
            opts!(
                "serve_tasks_total",
                "Tasks seen at admission, by accepted/rejected outcome"
            ),
            &["outcome"],
        )
        .expect("valid tasks_total metric");

        let drops_total = IntCounterVec::new(
            opts!("serve_drops_total", "Dropped tasks by reason"),
            &["reason"],
        )
        .expect("valid drops_total metric");

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("serve_batch_size", "Tasks per executed batch")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
        )
        .expect("valid batch_size metric");

        let forward_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "serve_forward_duration_seconds",
            "Wall-clock duration of model forward calls",
        ))
        .expect("valid forward_duration_seconds metric");

        let open_requests = IntGauge::new(
            "serve_open_requests",
            "Tasks currently admitted and not yet terminal",
        )
        .expect("valid open_requests metric");

        let dispatch_replies_total = IntCounterVec::new(
            opts!(
                "dispatch_replies_total",
                "Dispatcher replies by wire status"
            ),
            &["status"],
        )
        .expect("valid dispatch_replies_total metric");

        let udp_queue_dropped_total = IntCounter::new(
            "dispatch_udp_queue_dropped_total",
            "Datagrams discarded because the request queue was full",
        )
        .expect("valid udp_queue_dropped_total metric");

        registry
            .register(Box::new(tasks_total.clone()))
            .expect("register tasks_total");
        registry
            .register(Box::new(drops_total.clone()))
            .expect("register drops_total");
        registry
            .register(Box::new(batch_size.clone()))
            .expect("register batch_size");
        registry
            .register(Box::new(forward_duration_seconds.clone()))
            .expect("register forward_duration_seconds");
        registry
            .register(Box::new(open_requests.clone()))
            .expect("register open_requests");
        registry
            .register(Box::new(dispatch_replies_total.clone()))
            .expect("register dispatch_replies_total");
        registry
            .register(Box::new(udp_queue_dropped_total.clone()))
            .expect("register udp_queue_dropped_total");

        Self {
            registry,
            tasks_total,
            drops_total,
            batch_size,
            forward_duration_seconds,
            open_requests,
            dispatch_replies_total,
            udp_queue_dropped_total,
        }
    }

    pub fn observe_admission(&self, accepted: bool) {
        let outcome = if accepted { "accepted" } else { "rejected" };
        self.tasks_total.with_label_values(&[outcome]).inc();
    }

    pub fn observe_drop(&self, reason: DropReason) {
        self.drops_total.with_label_values(&[reason.as_str()]).inc();
    }

    pub fn observe_batch(&self, batch_size: usize, forward_duration: Duration) {
        self.batch_size.observe(batch_size as f64);
        self.forward_duration_seconds
            .observe(forward_duration.as_secs_f64());
    }

    pub fn set_open_requests(&self, open: i64) {
        self.open_requests.set(open);
    }

    pub fn observe_dispatch_reply(&self, status: &str) {
        self.dispatch_replies_total
            .with_label_values(&[status])
            .inc();
    }

    pub fn observe_udp_queue_drop(&self) {
        self.udp_queue_dropped_total.inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}
