use std::{cmp::Ordering, time::Instant};

/// Lifecycle tag for a task. Terminal states are `Done` and `Dropped`; both
/// release the admission slot exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Queued,
    Preprocessing,
    Ready,
    Batched,
    Done,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    DeadlineMiss,
    AdmissionReject,
    ModelFailure,
    Shutdown,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::DeadlineMiss => "deadline_miss",
            DropReason::AdmissionReject => "admission_reject",
            DropReason::ModelFailure => "model_failure",
            DropReason::Shutdown => "shutdown",
        }
    }
}

/// The unit of work. Owned exclusively by the executor from admission until a
/// terminal state; ownership moves through the worker pool and back rather
/// than being shared.
#[derive(Debug)]
pub struct Task {
    pub task_id: u64,
    pub model_session_id: String,
    /// Absolute monotonic time point by which a reply must be emitted.
    pub deadline: Instant,
    pub payload: Vec<u8>,
    /// Filled in by preprocess.
    pub tensor: Option<Vec<f32>>,
    /// Filled in by postprocess.
    pub output: Option<Vec<u8>>,
    pub state: TaskState,
}

impl Task {
    pub fn new(
        task_id: u64,
        model_session_id: impl Into<String>,
        deadline: Instant,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            task_id,
            model_session_id: model_session_id.into(),
            deadline,
            payload,
            tensor: None,
            output: None,
            state: TaskState::Created,
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

/// Min-heap adapter: `BinaryHeap<ReadyEntry>` pops the earliest deadline
/// first, ties broken by the smaller task id.
#[derive(Debug)]
pub struct ReadyEntry(pub Task);

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.task_id == other.0.task_id
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .deadline
            .cmp(&self.0.deadline)
            .then_with(|| other.0.task_id.cmp(&self.0.task_id))
    }
}

/// A set of tasks submitted together to a single model forward.
#[derive(Debug)]
pub struct BatchTask {
    pub batch_id: u64,
    /// Contiguous inputs in batch order. Stands in for the device-resident
    /// input array; populated only by the batch-driver thread.
    pub input_array: Vec<f32>,
    pub tasks: Vec<Task>,
    /// Set on return from the forward call.
    pub completed_at: Option<Instant>,
}

impl BatchTask {
    pub fn new(batch_id: u64, tasks: Vec<Task>) -> Self {
        let total = tasks
            .iter()
            .map(|task| task.tensor.as_ref().map_or(0, Vec::len))
            .sum();
        let mut input_array = Vec::with_capacity(total);
        for task in &tasks {
            if let Some(tensor) = &task.tensor {
                input_array.extend_from_slice(tensor);
            }
        }

        Self {
            batch_id,
            input_array,
            tasks,
            completed_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Emitted on the executor's reply channel once a task reaches a terminal
/// state. Tasks never hold a handle back to the executor; the reply channel
/// is the only path out.
#[derive(Debug)]
pub struct TaskReply {
    pub task_id: u64,
    pub model_session_id: String,
    pub status: TaskStatus,
    pub output: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Done,
    Dropped(DropReason),
}
