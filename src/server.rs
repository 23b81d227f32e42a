use std::{
    collections::VecDeque,
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::{
    config::DispatcherConfig,
    dispatcher::Dispatcher,
    errors::ServeError,
    metrics::AppMetrics,
    wire::{DispatchReply, DispatchRequest, MAX_DATAGRAM},
};

/// RX reads and worker pops time out at this cadence so the running flag is
/// observed during shutdown.
const SOCKET_TIMEOUT: Duration = Duration::from_millis(50);

/// One received datagram, copied off the reusable RX buffer.
struct RequestContext {
    data: Vec<u8>,
    /// The datagram exceeded `MAX_DATAGRAM`; reject at parse time.
    oversize: bool,
    peer: SocketAddr,
}

/// Bounded deque handing contexts from the RX thread to the workers.
struct RequestQueue {
    capacity: usize,
    inner: Mutex<VecDeque<RequestContext>>,
    available: Condvar,
}

impl RequestQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    fn push(&self, context: RequestContext) -> bool {
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                return false;
            }
            queue.push_back(context);
        }
        self.available.notify_one();
        true
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<RequestContext> {
        let mut queue = self.inner.lock();
        if let Some(context) = queue.pop_front() {
            return Some(context);
        }
        self.available.wait_for(&mut queue, timeout);
        queue.pop_front()
    }

    fn notify_all(&self) {
        self.available.notify_all();
    }
}

/// UDP request server: one RX thread feeding a bounded context queue, worker
/// threads resolving requests through the dispatcher and replying on a
/// shared TX socket.
pub struct UdpRpcServer {
    running: Arc<AtomicBool>,
    queue: Arc<RequestQueue>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

impl UdpRpcServer {
    /// Binds the sockets and spawns the RX and worker threads.
    pub fn start(
        config: &DispatcherConfig,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<AppMetrics>,
    ) -> Result<Self, ServeError> {
        let rx_socket = UdpSocket::bind(("0.0.0.0", config.udp_port))?;
        rx_socket.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        let local_addr = rx_socket.local_addr()?;
        let tx_socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0))?);

        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(RequestQueue::new(config.queue_capacity));
        let mut handles = Vec::with_capacity(config.num_udp_threads + 1);

        {
            let running = running.clone();
            let queue = queue.clone();
            let metrics = metrics.clone();
            let rx_cpu = config.rx_cpu;
            handles.push(
                thread::Builder::new()
                    .name("udp-rx".to_owned())
                    .spawn(move || rx_loop(rx_socket, queue, running, metrics, rx_cpu))
                    .expect("spawn udp rx thread"),
            );
        }

        for worker_id in 0..config.num_udp_threads {
            let running = running.clone();
            let queue = queue.clone();
            let dispatcher = dispatcher.clone();
            let metrics = metrics.clone();
            let tx_socket = tx_socket.clone();
            let pinned_cpu = config
                .pin_cpus
                .get(worker_id % config.pin_cpus.len().max(1))
                .copied();
            handles.push(
                thread::Builder::new()
                    .name(format!("udp-worker-{worker_id}"))
                    .spawn(move || {
                        worker_loop(dispatcher, tx_socket, queue, running, metrics, pinned_cpu)
                    })
                    .expect("spawn udp worker thread"),
            );
        }

        info!(
            addr = %local_addr,
            workers = config.num_udp_threads,
            "udp request server up"
        );

        Ok(Self {
            running,
            queue,
            handles: Mutex::new(handles),
            local_addr,
        })
    }

    /// The bound RX address; useful when the configured port is 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cooperative shutdown: clear the flag, wake every waiter, join.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.queue.notify_all();
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
        info!("udp request server down");
    }
}

fn rx_loop(
    socket: UdpSocket,
    queue: Arc<RequestQueue>,
    running: Arc<AtomicBool>,
    metrics: Arc<AppMetrics>,
    rx_cpu: Option<usize>,
) {
    if let Some(core) = rx_cpu {
        pin_to_core(core);
    }

    // One spare byte past the cap so truncation is detectable.
    let mut scratch = [0u8; MAX_DATAGRAM + 1];
    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut scratch) {
            Ok((len, peer)) => {
                let oversize = len > MAX_DATAGRAM;
                let context = RequestContext {
                    data: scratch[..len.min(MAX_DATAGRAM)].to_vec(),
                    oversize,
                    peer,
                };
                if !queue.push(context) {
                    metrics.observe_udp_queue_drop();
                    warn!(%peer, "request queue full, datagram discarded");
                }
            }
            Err(error)
                if error.kind() == ErrorKind::WouldBlock
                    || error.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(error) => warn!(error = %error, "udp receive failed"),
        }
    }
}

fn worker_loop(
    dispatcher: Arc<Dispatcher>,
    tx_socket: Arc<UdpSocket>,
    queue: Arc<RequestQueue>,
    running: Arc<AtomicBool>,
    metrics: Arc<AppMetrics>,
    pinned_cpu: Option<usize>,
) {
    if let Some(core) = pinned_cpu {
        pin_to_core(core);
    }

    while running.load(Ordering::Relaxed) {
        let Some(context) = queue.pop_timeout(SOCKET_TIMEOUT) else {
            continue;
        };

        let reply = handle_request(&dispatcher, &metrics, &context);
        let encoded = match serde_json::to_vec(&reply) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(error = %error, "reply encoding failed");
                continue;
            }
        };
        if let Err(error) = tx_socket.send_to(&encoded, context.peer) {
            // Unreliable transport; the caller retries.
            warn!(peer = %context.peer, error = %error, "udp send failed");
        }
    }
}

fn handle_request(
    dispatcher: &Dispatcher,
    metrics: &AppMetrics,
    context: &RequestContext,
) -> DispatchReply {
    if context.oversize {
        debug!(peer = %context.peer, "datagram over the 1400-byte cap");
        let reply = DispatchReply::invalid(0);
        metrics.observe_dispatch_reply(reply.status.as_str());
        return reply;
    }

    match serde_json::from_slice::<DispatchRequest>(&context.data) {
        Ok(request) => dispatcher.get_backend(&request.model_session_id, request.request_id),
        Err(error) => {
            debug!(peer = %context.peer, error = %error, "unparsable request");
            let reply = DispatchReply::invalid(0);
            metrics.observe_dispatch_reply(reply.status.as_str());
            reply
        }
    }
}

fn pin_to_core(core: usize) {
    if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
        warn!(core, "failed to pin thread to core");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_rejects_pushes_over_capacity() {
        let queue = RequestQueue::new(2);
        let context = |id: u8| RequestContext {
            data: vec![id],
            oversize: false,
            peer: "127.0.0.1:9".parse().expect("valid addr"),
        };

        assert!(queue.push(context(1)));
        assert!(queue.push(context(2)));
        assert!(!queue.push(context(3)));

        assert!(queue.pop_timeout(Duration::from_millis(1)).is_some());
        assert!(queue.push(context(4)));
    }

    #[test]
    fn pop_times_out_on_an_empty_queue() {
        let queue = RequestQueue::new(2);
        let started = std::time::Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(15));
    }
}
