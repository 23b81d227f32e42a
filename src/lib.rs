pub mod config;
pub mod delegate;
pub mod dispatcher;
pub mod errors;
pub mod executor;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod rates;
pub mod route;
pub mod server;
pub mod task;
pub mod wire;

use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::info;

use crate::{
    config::{DispatcherConfig, NodeConfig},
    dispatcher::Dispatcher,
    errors::ServeError,
    executor::ModelExecutor,
    metrics::AppMetrics,
    model::ModelInstance,
    server::UdpRpcServer,
    task::TaskReply,
};

/// One fully wired backend node: the executor serving its model, the
/// dispatcher routing core, and the UDP front door.
pub struct ServingNode {
    pub executor: Arc<ModelExecutor>,
    pub dispatcher: Arc<Dispatcher>,
    pub server: UdpRpcServer,
    pub replies: Receiver<TaskReply>,
    pub metrics: Arc<AppMetrics>,
}

impl ServingNode {
    pub fn shutdown(&self) {
        self.server.stop();
        self.executor.shutdown();
    }
}

pub fn build_node(
    model: Arc<dyn ModelInstance>,
    node_config: &NodeConfig,
    dispatcher_config: &DispatcherConfig,
) -> Result<ServingNode, ServeError> {
    let metrics = Arc::new(AppMetrics::new());
    let (reply_tx, replies) = crossbeam_channel::unbounded();
    let executor = Arc::new(ModelExecutor::new(
        model,
        node_config,
        reply_tx,
        metrics.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(dispatcher_config.node_id, metrics.clone()));
    let server = UdpRpcServer::start(dispatcher_config, dispatcher.clone(), metrics.clone())?;

    info!(
        node_id = dispatcher_config.node_id,
        udp = %server.local_addr(),
        "serving node wired"
    );

    Ok(ServingNode {
        executor,
        dispatcher,
        server,
        replies,
        metrics,
    })
}
