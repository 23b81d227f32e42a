use std::{
    collections::{BinaryHeap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    config::{BatchPolicy, NodeConfig},
    metrics::AppMetrics,
    model::ModelInstance,
    pool::{PreprocessOutcome, PreprocessPool},
    rates::RateMeter,
    task::{BatchTask, DropReason, ReadyEntry, Task, TaskReply, TaskState, TaskStatus},
};

/// Idle pause for the batch-driver thread when the ready queue is empty.
const DRIVER_IDLE: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessingPhase {
    /// Queued for, or inside, the preprocess pool.
    Preprocessing,
    /// Member of the batch currently being executed.
    Batched,
}

/// Ready queue and processing map, guarded together by `task_mu`. A task is
/// in exactly one container: the heap while `Ready`, the map while queued,
/// preprocessing or batched, neither once terminal.
struct TaskQueues {
    ready: BinaryHeap<ReadyEntry>,
    processing: HashMap<u64, ProcessingPhase>,
}

/// Owns one model instance: admits, batches and executes tasks under
/// deadline constraints, and emits every terminal transition on the reply
/// channel.
pub struct ModelExecutor {
    model: Arc<dyn ModelInstance>,
    gpu_id: u32,
    max_batch: u32,
    admission_limit: i64,
    batch_policy: BatchPolicy,
    sliding_window: Duration,
    backup: bool,

    /// `task_mu`; ordered before `time_mu` when both are needed.
    queues: Mutex<TaskQueues>,
    /// `time_mu`.
    last_exec_finish: Mutex<Instant>,
    /// `backup_mu`; leaf lock.
    backup_backends: Mutex<Vec<u32>>,

    batch_id: AtomicU64,
    open_requests: AtomicI64,
    running: AtomicBool,

    req_meter: RateMeter,
    drop_meter: RateMeter,

    pool: PreprocessPool,
    preprocessed_rx: Receiver<PreprocessOutcome>,
    reply_tx: Sender<TaskReply>,
    metrics: Arc<AppMetrics>,
}

impl ModelExecutor {
    pub fn new(
        model: Arc<dyn ModelInstance>,
        config: &NodeConfig,
        reply_tx: Sender<TaskReply>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        let max_batch = config
            .max_batch
            .map_or(model.max_batch(), |ceiling| ceiling.min(model.max_batch()));
        let admission_limit = i64::from(max_batch) * i64::from(config.admission_multiplier.max(1));
        let (pool, preprocessed_rx) = PreprocessPool::start(
            model.clone(),
            config.num_preprocess_workers,
            config.queue_capacity,
        );

        info!(
            model = model.name(),
            gpu_id = config.gpu_id,
            max_batch,
            admission_limit,
            policy = ?config.batch_policy,
            "model executor up"
        );

        Self {
            model,
            gpu_id: config.gpu_id,
            max_batch,
            admission_limit,
            batch_policy: config.batch_policy,
            sliding_window: config.sliding_window,
            backup: config.backup,
            queues: Mutex::new(TaskQueues {
                ready: BinaryHeap::new(),
                processing: HashMap::new(),
            }),
            last_exec_finish: Mutex::new(Instant::now()),
            backup_backends: Mutex::new(Vec::new()),
            batch_id: AtomicU64::new(0),
            open_requests: AtomicI64::new(0),
            running: AtomicBool::new(true),
            req_meter: RateMeter::new(config.rate_interval, config.ewma_alpha),
            drop_meter: RateMeter::new(config.rate_interval, config.ewma_alpha),
            pool,
            preprocessed_rx,
            reply_tx,
            metrics,
        }
    }

    pub fn model(&self) -> &Arc<dyn ModelInstance> {
        &self.model
    }

    pub fn gpu_id(&self) -> u32 {
        self.gpu_id
    }

    pub fn max_batch(&self) -> u32 {
        self.max_batch
    }

    pub fn is_backup(&self) -> bool {
        self.backup
    }

    pub fn shares_prefix(&self) -> bool {
        self.model.shares_prefix()
    }

    pub fn has_backup(&self) -> bool {
        !self.backup_backends.lock().is_empty()
    }

    pub fn backup_backends(&self) -> Vec<u32> {
        self.backup_backends.lock().clone()
    }

    pub fn update_backup_backends(&self, backends: Vec<u32>) {
        *self.backup_backends.lock() = backends;
    }

    /// Non-blocking admission. Rejects when the deadline is already past,
    /// the model refuses the input, the admission cap is reached, or the
    /// pre-batch queue is full; accepted tasks head to the preprocess pool.
    pub fn enqueue(&self, task: Task) -> Result<(), DropReason> {
        self.req_meter.increment();

        if task.expired(Instant::now()) {
            self.metrics.observe_admission(false);
            return Err(self.finish_dropped(task, DropReason::DeadlineMiss));
        }

        if let Err(error) = self.model.validate(&task) {
            debug!(task_id = task.task_id, error = %error, "input rejected by model");
            self.metrics.observe_admission(false);
            return Err(self.finish_dropped(task, DropReason::ModelFailure));
        }

        if !self.increase_open_requests(1, true) {
            self.metrics.observe_admission(false);
            return Err(self.finish_dropped(task, DropReason::AdmissionReject));
        }

        let task_id = task.task_id;
        self.queues
            .lock()
            .processing
            .insert(task_id, ProcessingPhase::Preprocessing);

        match self.pool.submit(task) {
            Ok(()) => {
                self.metrics.observe_admission(true);
                Ok(())
            }
            Err(task) => {
                self.queues.lock().processing.remove(&task_id);
                self.decrease_open_requests(1);
                self.metrics.observe_admission(false);
                Err(self.finish_dropped(task, DropReason::AdmissionReject))
            }
        }
    }

    /// Synchronous shortcut: runs preprocess in the caller's context and
    /// inserts the result into the ready queue, bypassing the pool. `force`
    /// bypasses the admission cap.
    pub fn preprocess(&self, mut task: Task, force: bool) -> Result<(), DropReason> {
        self.req_meter.increment();

        if task.expired(Instant::now()) {
            self.metrics.observe_admission(false);
            return Err(self.finish_dropped(task, DropReason::DeadlineMiss));
        }

        if !self.increase_open_requests(1, !force) {
            self.metrics.observe_admission(false);
            return Err(self.finish_dropped(task, DropReason::AdmissionReject));
        }

        task.state = TaskState::Preprocessing;
        match self.model.preprocess(&mut task) {
            Ok(()) => {
                self.metrics.observe_admission(true);
                self.insert_ready(task);
                Ok(())
            }
            Err(error) => {
                warn!(task_id = task.task_id, error = %error, "preprocess failed");
                self.metrics.observe_admission(false);
                Err(self.drop_admitted(task, DropReason::ModelFailure))
            }
        }
    }

    /// Inserts an already-preprocessed task directly into the ready queue;
    /// used by share-prefix models whose upstream ran preprocess. `force`
    /// bypasses the admission cap.
    pub fn add_preprocessed(&self, task: Task, force: bool) -> Result<(), DropReason> {
        self.req_meter.increment();

        if task.tensor.is_none() {
            warn!(task_id = task.task_id, "task arrived without a tensor");
            self.metrics.observe_admission(false);
            return Err(self.finish_dropped(task, DropReason::ModelFailure));
        }

        if task.expired(Instant::now()) {
            self.metrics.observe_admission(false);
            return Err(self.finish_dropped(task, DropReason::DeadlineMiss));
        }

        if !self.increase_open_requests(1, !force) {
            self.metrics.observe_admission(false);
            return Err(self.finish_dropped(task, DropReason::AdmissionReject));
        }

        self.metrics.observe_admission(true);
        self.insert_ready(task);
        Ok(())
    }

    /// Pulls up to `batch_hint` ready tasks (the model maximum when zero),
    /// runs one forward, and hands the batch to postprocess. Returns the
    /// wall-clock forward duration, zero when no viable task exists.
    pub fn execute(&self, batch_hint: u32) -> Duration {
        self.drain_preprocessed();

        let batch_size = if batch_hint == 0 {
            self.max_batch
        } else {
            batch_hint.min(self.max_batch)
        };

        let (tasks, popped) = self.assemble_batch(batch_size);
        if tasks.is_empty() {
            return Duration::ZERO;
        }

        let batch_id = self.batch_id.fetch_add(1, Ordering::Relaxed);
        let mut batch = BatchTask::new(batch_id, tasks);
        debug!(batch_id, batch_size = batch.len(), popped, "executing batch");

        let started = Instant::now();
        let result = self.model.forward(&mut batch);
        let elapsed = started.elapsed();

        let finished = Instant::now();
        batch.completed_at = Some(finished);
        *self.last_exec_finish.lock() = finished;

        match result {
            Ok(()) => {
                self.metrics.observe_batch(batch.len(), elapsed);
                for task in batch.tasks {
                    self.postprocess(task);
                }
            }
            Err(error) if error.is_permanent() => {
                error!(batch_id, error = %error, "permanent model failure");
                std::process::abort();
            }
            Err(error) => {
                warn!(batch_id, error = %error, "forward failed, dropping batch");
                for task in batch.tasks {
                    self.drop_admitted(task, DropReason::ModelFailure);
                }
            }
        }

        elapsed
    }

    /// Runs model postprocess and retires the task. Consumes the admission
    /// slot exactly once, whether the task completes or drops.
    pub fn postprocess(&self, mut task: Task) {
        match self.model.postprocess(&mut task) {
            Ok(()) => {
                task.state = TaskState::Done;
                self.queues.lock().processing.remove(&task.task_id);
                self.decrease_open_requests(1);
                let _ = self.reply_tx.send(TaskReply {
                    task_id: task.task_id,
                    model_session_id: task.model_session_id,
                    status: TaskStatus::Done,
                    output: task.output.take(),
                });
            }
            Err(error) => {
                warn!(task_id = task.task_id, error = %error, "postprocess failed");
                self.drop_admitted(task, DropReason::ModelFailure);
            }
        }
    }

    pub fn number_of_open_requests(&self) -> i64 {
        self.open_requests.load(Ordering::SeqCst)
    }

    /// Smoothed admissions per rate interval.
    pub fn request_rate(&self) -> f64 {
        self.req_meter.rate()
    }

    /// Smoothed drops per rate interval.
    pub fn drop_rate(&self) -> f64 {
        self.drop_meter.rate()
    }

    pub fn last_execute_finish_time(&self) -> Instant {
        *self.last_exec_finish.lock()
    }

    /// Spawns the batch-driver thread: `execute` in a loop until shutdown.
    pub fn start_driver(self: &Arc<Self>) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        thread::Builder::new()
            .name("batch-driver".to_owned())
            .spawn(move || {
                while executor.running.load(Ordering::Relaxed) {
                    let duration = executor.execute(0);
                    if duration.is_zero() {
                        thread::sleep(DRIVER_IDLE);
                    }
                }
            })
            .expect("spawn batch driver")
    }

    /// Cooperative shutdown: stop the pool, then terminally drop everything
    /// still queued, preprocessed or ready so no task is left in a
    /// non-terminal state.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for task in self.pool.stop() {
            self.drop_admitted(task, DropReason::Shutdown);
        }
        let outcomes: Vec<PreprocessOutcome> = self.preprocessed_rx.try_iter().collect();
        for outcome in outcomes {
            self.drop_admitted(outcome.task, DropReason::Shutdown);
        }

        let ready: Vec<Task> = {
            let mut queues = self.queues.lock();
            queues.ready.drain().map(|entry| entry.0).collect()
        };
        for task in ready {
            self.drop_admitted(task, DropReason::Shutdown);
        }

        info!(model = self.model.name(), "model executor down");
    }

    /// Moves pool outcomes into the ready queue; preprocess failures drop
    /// here.
    fn drain_preprocessed(&self) {
        while let Ok(outcome) = self.preprocessed_rx.try_recv() {
            match outcome.result {
                Ok(()) => self.insert_ready(outcome.task),
                Err(error) => {
                    warn!(task_id = outcome.task.task_id, error = %error, "preprocess failed");
                    self.drop_admitted(outcome.task, DropReason::ModelFailure);
                }
            }
        }
    }

    fn insert_ready(&self, mut task: Task) {
        task.state = TaskState::Ready;
        let mut queues = self.queues.lock();
        queues.processing.remove(&task.task_id);
        queues.ready.push(ReadyEntry(task));
    }

    /// Batch assembly under `task_mu`. Pops in deadline order; drops tasks
    /// that are expired or cannot survive the predicted latency of a batch
    /// one larger than the current one; the sliding-window policy defers
    /// (never drops) candidates outside the deadline spread. Returns the
    /// batch and the number of entries dequeued.
    fn assemble_batch(&self, batch_size: u32) -> (Vec<Task>, usize) {
        let now = Instant::now();
        let profile = self.model.profile();
        let mut expired = Vec::new();
        let mut popped = 0usize;

        let mut batch: Vec<Task> = Vec::new();
        {
            let mut queues = self.queues.lock();
            while batch.len() < batch_size as usize {
                let Some(ReadyEntry(task)) = queues.ready.pop() else {
                    break;
                };
                popped += 1;

                if task.expired(now) {
                    expired.push(task);
                    continue;
                }

                if self.batch_policy == BatchPolicy::SlidingWindow {
                    if let Some(first) = batch.first() {
                        if task.deadline.duration_since(first.deadline) > self.sliding_window {
                            // Deadline-ordered heap: nothing later fits this
                            // window either.
                            popped -= 1;
                            queues.ready.push(ReadyEntry(task));
                            break;
                        }
                    }
                }

                let predicted = profile.forward_latency(batch.len() as u32 + 1);
                if now + predicted > task.deadline {
                    expired.push(task);
                    continue;
                }

                batch.push(task);
            }

            for task in &mut batch {
                task.state = TaskState::Batched;
                queues
                    .processing
                    .insert(task.task_id, ProcessingPhase::Batched);
            }
        }

        for task in expired {
            self.drop_admitted(task, DropReason::DeadlineMiss);
        }

        (batch, popped)
    }

    /// Retires an admitted task as dropped, releasing its slot.
    fn drop_admitted(&self, task: Task, reason: DropReason) -> DropReason {
        self.queues.lock().processing.remove(&task.task_id);
        self.decrease_open_requests(1);
        self.finish_dropped(task, reason)
    }

    /// Terminal drop bookkeeping; does not touch the admission counter.
    fn finish_dropped(&self, mut task: Task, reason: DropReason) -> DropReason {
        task.state = TaskState::Dropped;
        self.drop_meter.increment();
        self.metrics.observe_drop(reason);
        let _ = self.reply_tx.send(TaskReply {
            task_id: task.task_id,
            model_session_id: task.model_session_id,
            status: TaskStatus::Dropped(reason),
            output: None,
        });
        reason
    }

    /// Attempts to add `count` to the open-request counter; with
    /// `limit_max_batch` the increase fails atomically once the cap would be
    /// exceeded.
    fn increase_open_requests(&self, count: i64, limit_max_batch: bool) -> bool {
        let accepted = self
            .open_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                let next = open + count;
                if limit_max_batch && next > self.admission_limit {
                    None
                } else {
                    Some(next)
                }
            })
            .is_ok();
        if accepted {
            self.metrics
                .set_open_requests(self.open_requests.load(Ordering::SeqCst));
        }
        accepted
    }

    fn decrease_open_requests(&self, count: i64) {
        let previous = self.open_requests.fetch_sub(count, Ordering::SeqCst);
        if previous < count {
            error!(previous, count, "open request counter underflow");
            std::process::abort();
        }
        self.metrics
            .set_open_requests(self.open_requests.load(Ordering::SeqCst));
    }
}
