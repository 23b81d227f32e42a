use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver};
use modelserve::{
    config::NodeConfig,
    executor::ModelExecutor,
    metrics::AppMetrics,
    model::{mock::IdentityModel, ModelInstance},
    task::{Task, TaskReply, TaskStatus},
};

fn pipeline(model: Arc<dyn ModelInstance>) -> (Arc<ModelExecutor>, Receiver<TaskReply>) {
    let config = NodeConfig {
        num_preprocess_workers: 2,
        admission_multiplier: 16,
        ..NodeConfig::default()
    };
    let (reply_tx, replies) = unbounded();
    let executor = Arc::new(ModelExecutor::new(
        model,
        &config,
        reply_tx,
        Arc::new(AppMetrics::new()),
    ));
    (executor, replies)
}

#[test]
fn driver_completes_enqueued_tasks_with_payloads_intact() {
    let model: Arc<dyn ModelInstance> = Arc::new(IdentityModel::default().with_max_batch(4));
    let (executor, replies) = pipeline(model);
    let driver = executor.start_driver();

    for task_id in 0..32u64 {
        executor
            .enqueue(Task::new(
                task_id,
                "identity:1",
                Instant::now() + Duration::from_secs(5),
                vec![task_id as u8, 0xAB],
            ))
            .expect("admission should pass");
    }

    let mut done = 0;
    for _ in 0..32 {
        let reply = replies
            .recv_timeout(Duration::from_secs(5))
            .expect("reply should arrive");
        assert_eq!(reply.status, TaskStatus::Done);
        assert_eq!(
            reply.output.as_deref(),
            Some(&[reply.task_id as u8, 0xAB][..])
        );
        done += 1;
    }
    assert_eq!(done, 32);
    assert_eq!(executor.number_of_open_requests(), 0);

    executor.shutdown();
    driver.join().expect("driver should exit cleanly");
}

#[test]
fn every_admitted_task_reaches_exactly_one_terminal_state() {
    let model: Arc<dyn ModelInstance> = Arc::new(IdentityModel::default().with_max_batch(8));
    let (executor, replies) = pipeline(model);
    let driver = executor.start_driver();

    // A mix of hopeless and comfortable deadlines under load.
    let mut admitted = 0;
    for task_id in 0..64u64 {
        let due = if task_id % 4 == 0 {
            Duration::from_micros(50)
        } else {
            Duration::from_secs(5)
        };
        if executor
            .enqueue(Task::new(
                task_id,
                "identity:1",
                Instant::now() + due,
                vec![task_id as u8],
            ))
            .is_ok()
        {
            admitted += 1;
        }
    }

    let mut terminal = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while terminal < 64 && Instant::now() < deadline {
        if replies.recv_timeout(Duration::from_millis(200)).is_ok() {
            terminal += 1;
        }
    }

    // Rejected tasks reply immediately; admitted ones drain through the
    // driver. Either way there is exactly one reply per task.
    assert_eq!(terminal, 64);
    assert!(admitted > 0);
    assert_eq!(executor.number_of_open_requests(), 0);

    executor.shutdown();
    driver.join().expect("driver should exit cleanly");
}

#[test]
fn shutdown_leaves_no_task_in_flight() {
    let model: Arc<dyn ModelInstance> = Arc::new(IdentityModel::default().with_max_batch(64));
    let (executor, replies) = pipeline(model);

    for task_id in 0..500u64 {
        let _ = executor.enqueue(Task::new(
            task_id,
            "identity:1",
            Instant::now() + Duration::from_secs(30),
            vec![1],
        ));
    }

    executor.shutdown();

    let mut replies_seen = 0;
    while replies.try_recv().is_ok() {
        replies_seen += 1;
    }
    assert_eq!(replies_seen, 500, "each task ends Done or Dropped exactly once");
    assert_eq!(executor.number_of_open_requests(), 0);
}
