use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    model::{ModelError, ModelInstance},
    task::{Task, TaskState},
};

/// Workers observe the running flag at least this often.
pub const POP_TIMEOUT: Duration = Duration::from_millis(50);
/// Startup settle before the first pop, so model initialization finishes.
const STARTUP_SETTLE: Duration = Duration::from_millis(20);

pub struct PreprocessOutcome {
    pub task: Task,
    pub result: Result<(), ModelError>,
}

/// Fixed pool of threads draining the pre-batch queue, running model
/// preprocess, and forwarding outcomes toward the ready queue. The in-queue
/// is bounded; a full queue is backpressure and the producer treats the
/// failed push as an admission rejection. The out-queue is unbounded but its
/// depth is capped in practice by the admission limit upstream.
pub struct PreprocessPool {
    in_tx: Sender<Task>,
    in_rx: Receiver<Task>,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PreprocessPool {
    pub fn start(
        model: Arc<dyn ModelInstance>,
        num_workers: usize,
        queue_capacity: usize,
    ) -> (Self, Receiver<PreprocessOutcome>) {
        let (in_tx, in_rx) = bounded(queue_capacity.max(1));
        let (out_tx, out_rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let handles = (0..num_workers.max(1))
            .map(|worker_id| {
                let model = model.clone();
                let in_rx = in_rx.clone();
                let out_tx = out_tx.clone();
                let running = running.clone();
                thread::Builder::new()
                    .name(format!("preprocess-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, model, in_rx, out_tx, running))
                    .expect("spawn preprocess worker")
            })
            .collect();

        (
            Self {
                in_tx,
                in_rx,
                running,
                handles: Mutex::new(handles),
            },
            out_rx,
        )
    }

    /// Non-blocking push into the pre-batch queue. A full queue hands the
    /// task back to the caller.
    pub fn submit(&self, mut task: Task) -> Result<(), Task> {
        task.state = TaskState::Queued;
        self.in_tx.try_send(task).map_err(|error| error.into_inner())
    }

    /// Cooperative shutdown: clear the running flag, join every worker, then
    /// drain tasks still sitting in the pre-batch queue so the caller can
    /// terminally drop them.
    pub fn stop(&self) -> Vec<Task> {
        self.running.store(false, Ordering::Relaxed);
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
        self.in_rx.try_iter().collect()
    }
}

fn worker_loop(
    worker_id: usize,
    model: Arc<dyn ModelInstance>,
    in_rx: Receiver<Task>,
    out_tx: Sender<PreprocessOutcome>,
    running: Arc<AtomicBool>,
) {
    thread::sleep(STARTUP_SETTLE);
    debug!(worker_id, model = model.name(), "preprocess worker up");

    while running.load(Ordering::Relaxed) {
        let mut task = match in_rx.recv_timeout(POP_TIMEOUT) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        task.state = TaskState::Preprocessing;
        let result = model.preprocess(&mut task);
        if out_tx.send(PreprocessOutcome { task, result }).is_err() {
            break;
        }
    }

    debug!(worker_id, "preprocess worker down");
}
