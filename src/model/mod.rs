pub mod mock;

use std::time::Duration;

use thiserror::Error;

use crate::task::{BatchTask, Task};

/// One loaded model on a GPU. Model kinds differ in preprocess/postprocess
/// semantics and in whether batches may share prefix tensors; the executor is
/// polymorphic over any implementation.
pub trait ModelInstance: Send + Sync {
    fn name(&self) -> &str;

    /// Declared maximum batch size for one forward call.
    fn max_batch(&self) -> u32;

    fn profile(&self) -> &ModelProfile;

    /// Share-prefix model kinds run preprocess upstream and feed the
    /// executor through `add_preprocessed` directly.
    fn shares_prefix(&self) -> bool {
        false
    }

    /// Cheap admission-time input check; full validation happens in
    /// preprocess.
    fn validate(&self, _task: &Task) -> Result<(), ModelError> {
        Ok(())
    }

    fn preprocess(&self, task: &mut Task) -> Result<(), ModelError>;

    fn forward(&self, batch: &mut BatchTask) -> Result<(), ModelError>;

    fn postprocess(&self, task: &mut Task) -> Result<(), ModelError>;
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),
    #[error("preprocess failed: {0}")]
    Preprocess(String),
    #[error("forward failed: {message}")]
    Forward { message: String, permanent: bool },
    #[error("postprocess failed: {0}")]
    Postprocess(String),
}

impl ModelError {
    /// Permanent failures abort the executor; everything else terminates at
    /// most the current task or batch.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ModelError::Forward { permanent: true, .. })
    }
}

/// Read-only latency profile: expected forward latency per batch size plus a
/// fixed per-task preprocess latency.
#[derive(Debug, Clone)]
pub struct ModelProfile {
    forward_latencies: Vec<Duration>,
    preprocess_latency: Duration,
}

impl ModelProfile {
    pub fn new(forward_latencies: Vec<Duration>, preprocess_latency: Duration) -> Self {
        Self {
            forward_latencies,
            preprocess_latency,
        }
    }

    /// Profile with `forward_latency(n) = base + per_item * n`, tabulated up
    /// to `max_batch`.
    pub fn linear(base: Duration, per_item: Duration, max_batch: u32) -> Self {
        let forward_latencies = (1..=max_batch.max(1))
            .map(|size| base + per_item * size)
            .collect();
        Self {
            forward_latencies,
            preprocess_latency: Duration::ZERO,
        }
    }

    pub fn with_preprocess_latency(mut self, latency: Duration) -> Self {
        self.preprocess_latency = latency;
        self
    }

    /// Expected forward latency for a batch of `batch_size`, clamped to the
    /// largest profiled size.
    pub fn forward_latency(&self, batch_size: u32) -> Duration {
        if self.forward_latencies.is_empty() {
            return Duration::ZERO;
        }
        let index = (batch_size.max(1) as usize - 1).min(self.forward_latencies.len() - 1);
        self.forward_latencies[index]
    }

    pub fn preprocess_latency(&self) -> Duration {
        self.preprocess_latency
    }
}
