use std::{thread, time::Duration};

use tracing::debug;

use crate::{
    model::{ModelError, ModelInstance, ModelProfile},
    task::{BatchTask, Task},
};

/// Pass-through model for wiring and tests: preprocess widens the payload
/// bytes into the tensor slot, forward is a timed no-op over the batch
/// array, postprocess narrows the tensor back into the output slot. A full
/// preprocess/postprocess cycle returns the payload unchanged.
#[derive(Debug, Clone)]
pub struct IdentityModel {
    name: String,
    max_batch: u32,
    max_input_len: usize,
    forward_delay: Duration,
    profile: ModelProfile,
}

impl Default for IdentityModel {
    fn default() -> Self {
        Self {
            name: "identity".to_owned(),
            max_batch: 8,
            max_input_len: 4_096,
            forward_delay: Duration::ZERO,
            profile: ModelProfile::linear(Duration::from_millis(2), Duration::from_millis(1), 8),
        }
    }
}

impl IdentityModel {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_max_batch(mut self, max_batch: u32) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_profile(mut self, profile: ModelProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_forward_delay(mut self, delay: Duration) -> Self {
        self.forward_delay = delay;
        self
    }

    pub fn with_max_input_len(mut self, max_input_len: usize) -> Self {
        self.max_input_len = max_input_len;
        self
    }
}

impl ModelInstance for IdentityModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_batch(&self) -> u32 {
        self.max_batch
    }

    fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    fn validate(&self, task: &Task) -> Result<(), ModelError> {
        if task.payload.len() > self.max_input_len {
            return Err(ModelError::UnsupportedInput(format!(
                "payload of {} bytes exceeds model input limit {}",
                task.payload.len(),
                self.max_input_len
            )));
        }
        Ok(())
    }

    fn preprocess(&self, task: &mut Task) -> Result<(), ModelError> {
        self.validate(task)?;
        let tensor = task.payload.iter().map(|byte| f32::from(*byte)).collect();
        task.tensor = Some(tensor);
        Ok(())
    }

    fn forward(&self, batch: &mut BatchTask) -> Result<(), ModelError> {
        if !self.forward_delay.is_zero() {
            thread::sleep(self.forward_delay);
        }
        debug!(
            model = %self.name,
            batch_id = batch.batch_id,
            batch_size = batch.len(),
            inputs = batch.input_array.len(),
            "identity forward"
        );
        Ok(())
    }

    fn postprocess(&self, task: &mut Task) -> Result<(), ModelError> {
        let tensor = task
            .tensor
            .take()
            .ok_or_else(|| ModelError::Postprocess("tensor slot is empty".to_owned()))?;
        task.output = Some(tensor.into_iter().map(|value| value as u8).collect());
        Ok(())
    }
}
