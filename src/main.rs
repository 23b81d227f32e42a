use std::{sync::Arc, thread};

use modelserve::{
    build_node,
    config::{DispatcherConfig, NodeConfig},
    model::{mock::IdentityModel, ModelInstance},
    task::TaskStatus,
};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,modelserve=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let node_config = NodeConfig::from_env();
    let dispatcher_config = DispatcherConfig::from_env();

    // Model loading is handled elsewhere; the pass-through model keeps the
    // node exercisable end to end.
    let model: Arc<dyn ModelInstance> = Arc::new(IdentityModel::default());
    let node = build_node(model, &node_config, &dispatcher_config)?;
    let _driver = node.executor.start_driver();

    // Replies travel back to frontends over their own transport; here they
    // only feed the log.
    let replies = node.replies.clone();
    thread::Builder::new()
        .name("reply-drain".to_owned())
        .spawn(move || {
            for reply in replies.iter() {
                match reply.status {
                    TaskStatus::Done => debug!(task_id = reply.task_id, "task done"),
                    TaskStatus::Dropped(reason) => {
                        debug!(task_id = reply.task_id, reason = reason.as_str(), "task dropped")
                    }
                }
            }
        })?;

    info!(
        udp = %node.server.local_addr(),
        beacon_secs = dispatcher_config.beacon_interval.as_secs(),
        "node up"
    );

    loop {
        thread::sleep(dispatcher_config.beacon_interval);
        let evicted = node.dispatcher.sweep_dead_frontends();
        info!(
            open_requests = node.executor.number_of_open_requests(),
            request_rate = node.executor.request_rate(),
            drop_rate = node.executor.drop_rate(),
            sessions = node.dispatcher.route_sessions().len(),
            evicted_frontends = evicted.len(),
            "beacon"
        );
    }
}
