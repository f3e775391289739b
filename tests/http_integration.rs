//! HTTP/1.1 end-to-end tests
//!
//! A client and a server reactor talk over loopback. Every test starts its
//! own pair on an ephemeral port.

use hxcore::http::client::{ClientEndpoint, HttpClient};
use hxcore::http::h1::H1Config;
use hxcore::http::negotiator::{ProtocolConfig, VersionPolicy};
use hxcore::http::server::HttpServer;
use hxcore::http::support::{BasicClientExchange, BasicResponse, RequestHandlerFactory};
use hxcore::http::{Method, RequestHead, ResponseHead, Status, Version};
use hxcore::reactor::{Completion, IoReactorConfig, TracingListener};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn reactor_config() -> IoReactorConfig {
    IoReactorConfig::builder()
        .workers(2)
        .select_interval(Duration::from_millis(50))
        .listener(Arc::new(TracingListener))
        .build()
}

fn h1_config() -> ProtocolConfig {
    ProtocolConfig::builder().policy(VersionPolicy::ForceHttp1).build()
}

fn start_server(config: ProtocolConfig) -> (HttpServer, SocketAddr) {
    let handlers = RequestHandlerFactory::new(|request, body| {
        let reply = format!("{} {} {}", request.method, request.path, body.len());
        (ResponseHead::new(Status::OK), reply.into_bytes())
    });
    let server = HttpServer::start_with(reactor_config(), config, Arc::new(handlers)).unwrap();
    let listener = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.address();
    (server, addr)
}

fn connect(config: ProtocolConfig, addr: SocketAddr) -> (HttpClient, ClientEndpoint) {
    let client = HttpClient::start_with(reactor_config(), config).unwrap();
    let endpoint = client.connect(addr, TIMEOUT).wait(TIMEOUT).unwrap();
    (client, endpoint)
}

fn submit(endpoint: &ClientEndpoint, request: RequestHead, body: Option<Vec<u8>>) -> Completion<BasicResponse> {
    let (exchange, response) = BasicClientExchange::new(request, body);
    assert!(endpoint.execute(Box::new(exchange)));
    response
}

fn get(path: &str) -> RequestHead {
    RequestHead::new(Method::Get, path).header("Host", "localhost")
}

#[test]
fn test_keep_alive_get_sequence() {
    init_tracing();
    let (server, addr) = start_server(h1_config());
    let (client, endpoint) = connect(h1_config(), addr);
    assert_eq!(endpoint.protocol(), Version::Http11);

    let first = submit(&endpoint, get("/"), None).wait(TIMEOUT).unwrap();
    assert_eq!(first.head.status, Status::OK);
    assert_eq!(first.head.headers.get("Content-Length"), Some("7"));
    assert_eq!(first.body, b"GET / 0");

    let second = submit(&endpoint, get("/next"), None).wait(TIMEOUT).unwrap();
    assert_eq!(second.body, b"GET /next 0");
    assert!(endpoint.is_open());

    client.shutdown(Duration::from_secs(1));
    server.shutdown(Duration::from_secs(1));
}

#[test]
fn test_queued_requests_complete_in_order() {
    init_tracing();
    let (server, addr) = start_server(h1_config());
    let (client, endpoint) = connect(h1_config(), addr);

    let responses: Vec<_> = (0..5)
        .map(|i| submit(&endpoint, get(&format!("/item/{}", i)), None))
        .collect();
    for (i, response) in responses.into_iter().enumerate() {
        let response = response.wait(TIMEOUT).unwrap();
        assert_eq!(response.body, format!("GET /item/{} 0", i).into_bytes());
    }

    client.shutdown(Duration::from_secs(1));
    server.shutdown(Duration::from_secs(1));
}

#[test]
fn test_pipelined_requests() {
    init_tracing();
    let pipelined = ProtocolConfig::builder()
        .policy(VersionPolicy::ForceHttp1)
        .h1(H1Config::builder().pipelining(true).build())
        .build();
    let (server, addr) = start_server(h1_config());
    let (client, endpoint) = connect(pipelined, addr);

    let a = submit(&endpoint, get("/a"), None);
    let b = submit(&endpoint, RequestHead::new(Method::Post, "/b"), Some(b"payload".to_vec()));
    let c = submit(&endpoint, get("/c"), None);
    assert_eq!(a.wait(TIMEOUT).unwrap().body, b"GET /a 0");
    assert_eq!(b.wait(TIMEOUT).unwrap().body, b"POST /b 7");
    assert_eq!(c.wait(TIMEOUT).unwrap().body, b"GET /c 0");

    client.shutdown(Duration::from_secs(1));
    server.shutdown(Duration::from_secs(1));
}

#[test]
fn test_large_request_body() {
    init_tracing();
    let (server, addr) = start_server(h1_config());
    let (client, endpoint) = connect(h1_config(), addr);

    let body: Vec<u8> = (0..2_000_000u32).map(|i| (i % 251) as u8).collect();
    let response = submit(&endpoint, RequestHead::new(Method::Put, "/upload"), Some(body))
        .wait(TIMEOUT)
        .unwrap();
    assert_eq!(response.body, b"PUT /upload 2000000");

    client.shutdown(Duration::from_secs(1));
    server.shutdown(Duration::from_secs(1));
}

#[test]
fn test_connect_to_closed_port_fails() {
    init_tracing();
    let addr = {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    };
    let client = HttpClient::start_with(reactor_config(), h1_config()).unwrap();
    assert!(client.connect(addr, TIMEOUT).wait(TIMEOUT).is_err());
    client.shutdown(Duration::from_secs(1));
}

#[test]
fn test_graceful_shutdown_with_silent_connection() {
    init_tracing();
    let (server, addr) = start_server(ProtocolConfig::default());

    // Never sends a byte, so the server is still waiting to tell the protocol
    let _idle = std::net::TcpStream::connect(addr).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    server.initiate_shutdown();
    assert!(server.await_shutdown(Duration::from_secs(3)));
    server.shutdown(Duration::from_secs(1));
}
