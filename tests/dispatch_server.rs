use std::{
    collections::HashMap,
    net::UdpSocket,
    sync::Arc,
    time::Duration,
};

use modelserve::{
    config::DispatcherConfig,
    dispatcher::Dispatcher,
    metrics::AppMetrics,
    route::{BackendRate, ModelRouteUpdate},
    server::UdpRpcServer,
    wire::{DispatchReply, DispatchRequest, DispatchStatus},
};

fn server_with_routes(routes: Vec<ModelRouteUpdate>) -> (UdpRpcServer, Arc<Dispatcher>) {
    let metrics = Arc::new(AppMetrics::new());
    let dispatcher = Arc::new(Dispatcher::new(1, metrics.clone()));
    dispatcher.update_model_routes(routes);

    let config = DispatcherConfig {
        udp_port: 0,
        num_udp_threads: 2,
        ..DispatcherConfig::default()
    };
    let server = UdpRpcServer::start(&config, dispatcher.clone(), metrics)
        .expect("server should bind an ephemeral port");
    (server, dispatcher)
}

fn backend(backend_id: u32, throughput: f64) -> BackendRate {
    BackendRate {
        backend_id,
        address: format!("10.0.0.{backend_id}:8001"),
        throughput,
    }
}

fn route(session: &str, backends: Vec<BackendRate>) -> ModelRouteUpdate {
    ModelRouteUpdate {
        model_session_id: session.to_owned(),
        backends,
    }
}

fn client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("client socket should bind");
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout should apply");
    socket
}

fn exchange(socket: &UdpSocket, server: &UdpRpcServer, payload: &[u8]) -> DispatchReply {
    let target = format!("127.0.0.1:{}", server.local_addr().port());
    socket
        .send_to(payload, &target)
        .expect("request should send");

    let mut buf = [0u8; 2_048];
    let (len, _) = socket.recv_from(&mut buf).expect("reply should arrive");
    serde_json::from_slice(&buf[..len]).expect("reply should parse")
}

fn request(session: &str, request_id: u64) -> Vec<u8> {
    serde_json::to_vec(&DispatchRequest {
        model_session_id: session.to_owned(),
        request_id,
    })
    .expect("request should encode")
}

#[test]
fn known_session_resolves_to_a_backend() {
    let (server, _dispatcher) = server_with_routes(vec![route("resnet:1", vec![backend(3, 80.0)])]);
    let socket = client();

    let reply = exchange(&socket, &server, &request("resnet:1", 11));

    assert_eq!(reply.request_id, 11);
    assert_eq!(reply.status, DispatchStatus::Ok);
    let endpoint = reply.backend.expect("endpoint expected");
    assert_eq!(endpoint.backend_id, 3);
    assert_eq!(endpoint.address, "10.0.0.3:8001");

    server.stop();
}

#[test]
fn unknown_session_replies_not_found() {
    let (server, _dispatcher) = server_with_routes(vec![]);
    let socket = client();

    let reply = exchange(&socket, &server, &request("vgg:9", 21));

    assert_eq!(reply.status, DispatchStatus::ModelNotFound);
    assert!(reply.backend.is_none());

    server.stop();
}

#[test]
fn oversize_datagram_is_rejected_and_the_server_survives() {
    let (server, _dispatcher) = server_with_routes(vec![route("resnet:1", vec![backend(1, 50.0)])]);
    let socket = client();

    let oversized = vec![b'x'; 1_500];
    let reply = exchange(&socket, &server, &oversized);
    assert_eq!(reply.status, DispatchStatus::InvalidRequest);

    // Still serving after the rejection.
    let reply = exchange(&socket, &server, &request("resnet:1", 31));
    assert_eq!(reply.status, DispatchStatus::Ok);

    server.stop();
}

#[test]
fn garbage_payload_replies_invalid_request() {
    let (server, _dispatcher) = server_with_routes(vec![]);
    let socket = client();

    let reply = exchange(&socket, &server, b"{not json");
    assert_eq!(reply.status, DispatchStatus::InvalidRequest);

    server.stop();
}

#[test]
fn selections_over_the_wire_follow_throughput_shares() {
    let (server, _dispatcher) = server_with_routes(vec![route(
        "resnet:1",
        vec![backend(1, 100.0), backend(2, 200.0)],
    )]);
    let socket = client();

    let mut counts: HashMap<u32, u32> = HashMap::new();
    for request_id in 0..30 {
        let reply = exchange(&socket, &server, &request("resnet:1", request_id));
        assert_eq!(reply.status, DispatchStatus::Ok);
        let endpoint = reply.backend.expect("endpoint expected");
        *counts.entry(endpoint.backend_id).or_default() += 1;
    }

    assert_eq!(counts.get(&1), Some(&10));
    assert_eq!(counts.get(&2), Some(&20));

    server.stop();
}

#[test]
fn route_updates_are_visible_to_in_flight_traffic() {
    let (server, dispatcher) =
        server_with_routes(vec![route("resnet:1", vec![backend(1, 100.0)])]);
    let socket = client();

    let reply = exchange(&socket, &server, &request("resnet:1", 1));
    assert_eq!(reply.backend.expect("endpoint expected").backend_id, 1);

    dispatcher.update_model_routes(vec![route("resnet:1", vec![backend(9, 100.0)])]);

    let reply = exchange(&socket, &server, &request("resnet:1", 2));
    assert_eq!(reply.backend.expect("endpoint expected").backend_id, 9);

    server.stop();
}
