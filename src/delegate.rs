use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Liveness window as a multiple of the peer's beacon interval.
const ALIVE_BEACON_MULTIPLE: u32 = 3;

/// Handle to a frontend or dispatcher peer. Each beacon received from the
/// peer ticks the handle; a peer that misses several beacons in a row is
/// considered dead and gets swept.
pub struct FrontendDelegate {
    node_id: u32,
    address: String,
    beacon_interval: Duration,
    is_dispatcher: bool,
    last_alive: Mutex<Instant>,
    subscribed: Mutex<HashSet<String>>,
}

impl FrontendDelegate {
    pub fn new(
        node_id: u32,
        address: impl Into<String>,
        beacon_interval: Duration,
        is_dispatcher: bool,
    ) -> Self {
        Self {
            node_id,
            address: address.into(),
            beacon_interval,
            is_dispatcher,
            last_alive: Mutex::new(Instant::now()),
            subscribed: Mutex::new(HashSet::new()),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_dispatcher(&self) -> bool {
        self.is_dispatcher
    }

    pub fn last_alive_time(&self) -> Instant {
        *self.last_alive.lock()
    }

    /// Records a beacon from the peer.
    pub fn tick(&self) {
        *self.last_alive.lock() = Instant::now();
    }

    pub fn is_alive(&self) -> bool {
        self.last_alive.lock().elapsed() < self.beacon_interval * ALIVE_BEACON_MULTIPLE
    }

    pub fn subscribe_model(&self, model_session_id: impl Into<String>) {
        self.subscribed.lock().insert(model_session_id.into());
    }

    pub fn subscribes_to(&self, model_session_id: &str) -> bool {
        self.subscribed.lock().contains(model_session_id)
    }

    pub fn subscribed_models(&self) -> Vec<String> {
        self.subscribed.lock().iter().cloned().collect()
    }
}
