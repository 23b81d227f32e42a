use std::{env, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPolicy {
    Earliest,
    SlidingWindow,
}

/// Per-executor settings. Everything is environment-driven with silent
/// defaults; unset or unparsable values fall back.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub gpu_id: u32,
    /// Optional ceiling applied over the model's declared maximum batch.
    pub max_batch: Option<u32>,
    /// Admission cap is `max_batch * admission_multiplier`; must be >= 1.
    pub admission_multiplier: u32,
    pub num_preprocess_workers: usize,
    pub queue_capacity: usize,
    pub batch_policy: BatchPolicy,
    /// Maximum deadline spread inside one batch under the sliding-window
    /// policy.
    pub sliding_window: Duration,
    pub ewma_alpha: f64,
    pub rate_interval: Duration,
    /// Whether this executor serves as a backup replica.
    pub backup: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            gpu_id: 0,
            max_batch: None,
            admission_multiplier: 2,
            num_preprocess_workers: (num_cpus::get() / 2).max(1),
            queue_capacity: 1_024,
            batch_policy: BatchPolicy::Earliest,
            sliding_window: Duration::from_millis(100),
            ewma_alpha: 0.5,
            rate_interval: Duration::from_secs(1),
            backup: false,
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let batch_policy = match env::var("MODELSERVE_BATCH_POLICY").ok().as_deref() {
            Some("sliding_window") => BatchPolicy::SlidingWindow,
            _ => BatchPolicy::Earliest,
        };

        Self {
            gpu_id: read_u32("MODELSERVE_GPU_ID", defaults.gpu_id),
            max_batch: env::var("MODELSERVE_MAX_BATCH")
                .ok()
                .and_then(|value| value.parse::<u32>().ok())
                .filter(|value| *value > 0),
            admission_multiplier: read_u32(
                "MODELSERVE_ADMISSION_MULTIPLIER",
                defaults.admission_multiplier,
            )
            .max(1),
            num_preprocess_workers: read_usize(
                "MODELSERVE_PREPROCESS_WORKERS",
                defaults.num_preprocess_workers,
            )
            .max(1),
            queue_capacity: read_usize("MODELSERVE_QUEUE_CAPACITY", defaults.queue_capacity).max(1),
            batch_policy,
            sliding_window: Duration::from_millis(read_u64(
                "MODELSERVE_SLIDING_WINDOW_MS",
                defaults.sliding_window.as_millis() as u64,
            )),
            ewma_alpha: read_f64("MODELSERVE_EWMA_ALPHA", defaults.ewma_alpha),
            rate_interval: Duration::from_millis(read_u64(
                "MODELSERVE_RATE_INTERVAL_MS",
                defaults.rate_interval.as_millis() as u64,
            )),
            backup: env::var("MODELSERVE_BACKUP")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.backup),
        }
    }
}

/// Dispatcher-side settings: the UDP request server and the beacon cadence.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub node_id: u32,
    pub udp_port: u16,
    pub num_udp_threads: usize,
    /// Core for the RX thread; `None` leaves it unpinned.
    pub rx_cpu: Option<usize>,
    /// Cores applied in order to UDP worker threads; empty leaves them
    /// unpinned.
    pub pin_cpus: Vec<usize>,
    pub queue_capacity: usize,
    pub beacon_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            udp_port: 7_001,
            num_udp_threads: 4,
            rx_cpu: None,
            pin_cpus: Vec::new(),
            queue_capacity: 1_024,
            beacon_interval: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            node_id: read_u32("MODELSERVE_NODE_ID", defaults.node_id),
            udp_port: env::var("MODELSERVE_UDP_PORT")
                .ok()
                .and_then(|value| value.parse::<u16>().ok())
                .unwrap_or(defaults.udp_port),
            num_udp_threads: read_usize("MODELSERVE_UDP_THREADS", defaults.num_udp_threads).max(1),
            rx_cpu: env::var("MODELSERVE_RX_CPU")
                .ok()
                .and_then(|value| value.parse::<usize>().ok()),
            pin_cpus: env::var("MODELSERVE_PIN_CPUS")
                .map(|value| {
                    value
                        .split(',')
                        .filter_map(|core| core.trim().parse::<usize>().ok())
                        .collect()
                })
                .unwrap_or(defaults.pin_cpus),
            queue_capacity: read_usize("MODELSERVE_UDP_QUEUE_CAPACITY", defaults.queue_capacity)
                .max(1),
            beacon_interval: Duration::from_secs(read_u64(
                "MODELSERVE_BEACON_INTERVAL_SEC",
                defaults.beacon_interval.as_secs(),
            )),
        }
    }
}

fn read_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn read_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn read_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| *value > 0.0 && *value <= 1.0)
        .unwrap_or(default)
}
