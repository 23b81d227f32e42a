use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    delegate::FrontendDelegate,
    metrics::AppMetrics,
    route::{ModelRoute, ModelRouteUpdate},
    wire::{BackendEndpoint, DispatchReply},
};

/// Routing core: maps model sessions to their backend routes and tracks the
/// frontends registered with this node. The route table is updated
/// infrequently and selection is cheap, so a single coarse lock covers the
/// whole map; selection is linearizable with respect to updates.
pub struct Dispatcher {
    node_id: u32,
    routes: Mutex<HashMap<String, ModelRoute>>,
    frontends: Mutex<HashMap<u32, Arc<FrontendDelegate>>>,
    metrics: Arc<AppMetrics>,
}

impl Dispatcher {
    pub fn new(node_id: u32, metrics: Arc<AppMetrics>) -> Self {
        Self {
            node_id,
            routes: Mutex::new(HashMap::new()),
            frontends: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Applies a batch of route replacements under the table lock. Unknown
    /// session ids create new entries.
    pub fn update_model_routes(&self, updates: Vec<ModelRouteUpdate>) {
        let mut routes = self.routes.lock();
        for update in updates {
            let route = routes
                .entry(update.model_session_id.clone())
                .or_insert_with(|| ModelRoute::new(update.model_session_id.clone()));
            route.update(update.backends);
        }
        info!(sessions = routes.len(), "model routes updated");
    }

    /// Resolves one request to a backend endpoint. Missing sessions and
    /// empty backend lists both produce a not-found reply; neither is fatal.
    pub fn get_backend(&self, model_session_id: &str, request_id: u64) -> DispatchReply {
        let reply = {
            let mut routes = self.routes.lock();
            match routes.get_mut(model_session_id) {
                Some(route) => match route.select_backend() {
                    Some(backend) => {
                        debug!(
                            session = model_session_id,
                            backend_id = backend.backend_id,
                            "backend selected"
                        );
                        DispatchReply::found(
                            request_id,
                            BackendEndpoint {
                                backend_id: backend.backend_id,
                                address: backend.address,
                            },
                        )
                    }
                    None => DispatchReply::not_found(request_id),
                },
                None => DispatchReply::not_found(request_id),
            }
        };

        self.metrics.observe_dispatch_reply(reply.status.as_str());
        reply
    }

    pub fn route_sessions(&self) -> Vec<String> {
        self.routes
            .lock()
            .keys()
            .cloned()
            .collect()
    }

    pub fn register_frontend(&self, delegate: FrontendDelegate) -> Arc<FrontendDelegate> {
        let delegate = Arc::new(delegate);
        self.frontends
            .lock()
            .insert(delegate.node_id(), delegate.clone());
        info!(node_id = delegate.node_id(), address = delegate.address(), "frontend registered");
        delegate
    }

    pub fn unregister_frontend(&self, node_id: u32) {
        if self.frontends.lock().remove(&node_id).is_some() {
            info!(node_id, "frontend unregistered");
        }
    }

    pub fn frontend(&self, node_id: u32) -> Option<Arc<FrontendDelegate>> {
        self.frontends.lock().get(&node_id).cloned()
    }

    /// Evicts frontends whose beacons stopped; returns the evicted ids.
    pub fn sweep_dead_frontends(&self) -> Vec<u32> {
        let mut frontends = self.frontends.lock();
        let dead: Vec<u32> = frontends
            .iter()
            .filter(|(_, delegate)| !delegate.is_alive())
            .map(|(node_id, _)| *node_id)
            .collect();
        for node_id in &dead {
            frontends.remove(node_id);
            info!(node_id, "frontend presumed dead, evicted");
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{route::BackendRate, wire::DispatchStatus};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(1, Arc::new(AppMetrics::new()))
    }

    fn update(session: &str, backends: Vec<BackendRate>) -> ModelRouteUpdate {
        ModelRouteUpdate {
            model_session_id: session.to_owned(),
            backends,
        }
    }

    fn backend(backend_id: u32, throughput: f64) -> BackendRate {
        BackendRate {
            backend_id,
            address: format!("10.0.0.{backend_id}:8001"),
            throughput,
        }
    }

    #[test]
    fn unknown_session_replies_not_found() {
        let dispatcher = dispatcher();
        let reply = dispatcher.get_backend("resnet:1", 5);

        assert_eq!(reply.status, DispatchStatus::ModelNotFound);
        assert_eq!(reply.request_id, 5);
        assert!(reply.backend.is_none());
    }

    #[test]
    fn updates_create_sessions_and_selection_works() {
        let dispatcher = dispatcher();
        dispatcher.update_model_routes(vec![
            update("resnet:1", vec![backend(1, 100.0)]),
            update("bert:2", vec![backend(2, 50.0)]),
        ]);

        let reply = dispatcher.get_backend("resnet:1", 1);
        assert_eq!(reply.status, DispatchStatus::Ok);
        assert_eq!(reply.backend.expect("endpoint present").backend_id, 1);

        let mut sessions = dispatcher.route_sessions();
        sessions.sort();
        assert_eq!(sessions, vec!["bert:2".to_owned(), "resnet:1".to_owned()]);
    }

    #[test]
    fn emptied_route_replies_not_found() {
        let dispatcher = dispatcher();
        dispatcher.update_model_routes(vec![update("resnet:1", vec![backend(1, 100.0)])]);
        dispatcher.update_model_routes(vec![update("resnet:1", vec![])]);

        let reply = dispatcher.get_backend("resnet:1", 2);
        assert_eq!(reply.status, DispatchStatus::ModelNotFound);
    }

    #[test]
    fn dead_frontends_are_swept() {
        let dispatcher = dispatcher();
        dispatcher.register_frontend(FrontendDelegate::new(
            10,
            "10.0.0.10:9200",
            Duration::from_millis(5),
            false,
        ));
        dispatcher.register_frontend(FrontendDelegate::new(
            11,
            "10.0.0.11:9200",
            Duration::from_secs(60),
            false,
        ));

        std::thread::sleep(Duration::from_millis(30));
        let evicted = dispatcher.sweep_dead_frontends();

        assert_eq!(evicted, vec![10]);
        assert!(dispatcher.frontend(10).is_none());
        assert!(dispatcher.frontend(11).is_some());
    }
}
