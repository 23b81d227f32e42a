use std::collections::HashMap;

use tracing::{debug, warn};

/// One backend advertising a model session, with its sustained throughput in
/// requests per second.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRate {
    pub backend_id: u32,
    pub address: String,
    pub throughput: f64,
}

/// A full replacement of one session's backend list, as delivered by the
/// control plane.
#[derive(Debug, Clone)]
pub struct ModelRouteUpdate {
    pub model_session_id: String,
    pub backends: Vec<BackendRate>,
}

/// Route table entry for one model session. Selection is deficit round
/// robin weighted by per-backend rate: each backend accrues credit
/// proportional to `throughput / min_rate` and is served while its credit
/// covers a whole request, which makes long-run selection frequency
/// proportional to its share of the total throughput.
#[derive(Debug)]
pub struct ModelRoute {
    model_session_id: String,
    backends: Vec<BackendRate>,
    total_throughput: f64,
    deficits: HashMap<u32, f64>,
    min_rate: f64,
    current_drr_index: usize,
}

impl ModelRoute {
    pub fn new(model_session_id: impl Into<String>) -> Self {
        Self {
            model_session_id: model_session_id.into(),
            backends: Vec::new(),
            total_throughput: 0.0,
            deficits: HashMap::new(),
            min_rate: 0.0,
            current_drr_index: 0,
        }
    }

    pub fn model_session_id(&self) -> &str {
        &self.model_session_id
    }

    pub fn total_throughput(&self) -> f64 {
        self.total_throughput
    }

    pub fn min_rate(&self) -> f64 {
        self.min_rate
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Replaces the backend list. Deficits carry over for backends present
    /// in both lists; new backends start at zero, removed ones are
    /// discarded.
    pub fn update(&mut self, backends: Vec<BackendRate>) {
        let backends: Vec<BackendRate> = backends
            .into_iter()
            .filter(|backend| {
                if backend.throughput > 0.0 {
                    true
                } else {
                    warn!(
                        session = %self.model_session_id,
                        backend_id = backend.backend_id,
                        throughput = backend.throughput,
                        "ignoring backend with non-positive throughput"
                    );
                    false
                }
            })
            .collect();

        self.deficits = backends
            .iter()
            .map(|backend| {
                let carried = self
                    .deficits
                    .get(&backend.backend_id)
                    .copied()
                    .unwrap_or(0.0);
                (backend.backend_id, carried)
            })
            .collect();
        self.total_throughput = backends.iter().map(|backend| backend.throughput).sum();
        self.min_rate = backends
            .iter()
            .map(|backend| backend.throughput)
            .fold(f64::INFINITY, f64::min);
        self.backends = backends;
        if self.current_drr_index >= self.backends.len() {
            self.current_drr_index = 0;
        }

        debug!(
            session = %self.model_session_id,
            backends = self.backends.len(),
            total_throughput = self.total_throughput,
            "route updated"
        );
    }

    /// Weighted fair selection. Walks at most two full passes; a backend
    /// with a whole request of credit is served in place (credit piles up
    /// across passes, so a fast backend is served several times in a row),
    /// otherwise it accrues its quantum and the walk advances. If two
    /// passes credit nobody the largest deficit wins without being charged,
    /// so selection never stalls.
    pub fn select_backend(&mut self) -> Option<BackendRate> {
        let backend_count = self.backends.len();
        if backend_count == 0 {
            return None;
        }

        for _ in 0..=(2 * backend_count) {
            let (backend_id, quantum) = {
                let backend = &self.backends[self.current_drr_index];
                (backend.backend_id, backend.throughput / self.min_rate)
            };
            let deficit = self.deficits.entry(backend_id).or_insert(0.0);
            if *deficit >= 1.0 {
                *deficit -= 1.0;
                return Some(self.backends[self.current_drr_index].clone());
            }
            *deficit += quantum;
            self.current_drr_index = (self.current_drr_index + 1) % backend_count;
        }

        let mut best = 0;
        let mut best_deficit = f64::NEG_INFINITY;
        for (index, backend) in self.backends.iter().enumerate() {
            let deficit = self.deficits.get(&backend.backend_id).copied().unwrap_or(0.0);
            if deficit > best_deficit {
                best = index;
                best_deficit = deficit;
            }
        }
        Some(self.backends[best].clone())
    }

    #[cfg(test)]
    pub(crate) fn deficit(&self, backend_id: u32) -> f64 {
        self.deficits.get(&backend_id).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(backend_id: u32, throughput: f64) -> BackendRate {
        BackendRate {
            backend_id,
            address: format!("10.0.0.{backend_id}:8001"),
            throughput,
        }
    }

    #[test]
    fn empty_route_selects_nothing() {
        let mut route = ModelRoute::new("resnet:1");
        assert!(route.select_backend().is_none());
    }

    #[test]
    fn single_backend_is_always_selected() {
        let mut route = ModelRoute::new("resnet:1");
        route.update(vec![backend(7, 50.0)]);

        for _ in 0..100 {
            let selected = route.select_backend().expect("backend available");
            assert_eq!(selected.backend_id, 7);
        }
    }

    #[test]
    fn update_recomputes_totals() {
        let mut route = ModelRoute::new("resnet:1");
        route.update(vec![backend(1, 100.0), backend(2, 200.0), backend(3, 50.0)]);

        assert_eq!(route.total_throughput(), 350.0);
        assert_eq!(route.min_rate(), 50.0);

        route.update(vec![backend(1, 100.0)]);
        assert_eq!(route.total_throughput(), 100.0);
        assert_eq!(route.min_rate(), 100.0);
    }

    #[test]
    fn selection_frequency_tracks_throughput_shares() {
        let mut route = ModelRoute::new("resnet:1");
        route.update(vec![
            backend(1, 100.0),
            backend(2, 200.0),
            backend(3, 100.0),
        ]);

        let mut counts: HashMap<u32, u32> = HashMap::new();
        for _ in 0..400 {
            let selected = route.select_backend().expect("backend available");
            *counts.entry(selected.backend_id).or_default() += 1;
        }

        let share = |backend_id| *counts.get(&backend_id).unwrap_or(&0) as i64;
        assert!((share(1) - 100).abs() <= 10, "backend 1 got {}", share(1));
        assert!((share(2) - 200).abs() <= 10, "backend 2 got {}", share(2));
        assert!((share(3) - 100).abs() <= 10, "backend 3 got {}", share(3));
    }

    #[test]
    fn update_preserves_deficits_of_surviving_backends() {
        let mut route = ModelRoute::new("resnet:1");
        route.update(vec![backend(1, 100.0), backend(2, 140.0)]);

        // Run selections until backend 2 holds a fractional credit.
        let mut primed = None;
        for _ in 0..32 {
            route.select_backend().expect("backend available");
            let deficit = route.deficit(2);
            if deficit > 0.0 && deficit < 1.0 {
                primed = Some(deficit);
                break;
            }
        }
        let primed = primed.expect("weighted quanta must leave a fractional deficit");

        route.update(vec![backend(1, 100.0), backend(2, 140.0), backend(3, 100.0)]);

        assert!((route.deficit(2) - primed).abs() < 1e-9, "credit carried over");
        assert_eq!(route.deficit(3), 0.0, "new backend starts from zero");
        assert_eq!(route.total_throughput(), 340.0);
    }

    #[test]
    fn zero_throughput_backends_are_ignored() {
        let mut route = ModelRoute::new("resnet:1");
        route.update(vec![backend(1, 0.0), backend(2, -5.0)]);
        assert!(route.is_empty());
        assert!(route.select_backend().is_none());
    }
}
