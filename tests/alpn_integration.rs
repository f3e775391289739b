//! Protocol negotiation end-to-end tests
//!
//! Covers ALPN over TLS, plaintext preface sniffing and post-handshake
//! session verification.

use hxcore::http::client::{ClientEndpoint, HttpClient};
use hxcore::http::negotiator::{ProtocolConfig, VersionPolicy};
use hxcore::http::server::HttpServer;
use hxcore::http::support::{BasicClientExchange, RequestHandlerFactory};
use hxcore::http::tls::config::self_signed_identity;
use hxcore::http::tls::{TlsConfig, TlsDetails, TlsError};
use hxcore::http::{Error, Method, RequestHead, ResponseHead, Status, Version};
use hxcore::reactor::IoReactorConfig;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn reactor_config() -> IoReactorConfig {
    IoReactorConfig::builder()
        .workers(1)
        .select_interval(Duration::from_millis(50))
        .build()
}

fn start_server(config: ProtocolConfig) -> (HttpServer, SocketAddr) {
    let handlers = RequestHandlerFactory::new(|request, _| {
        let reply = format!("{} over {}", request.path, request.version);
        (ResponseHead::new(Status::OK), reply.into_bytes())
    });
    let server = HttpServer::start_with(reactor_config(), config, Arc::new(handlers)).unwrap();
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap().address();
    (server, addr)
}

fn start_client(config: ProtocolConfig) -> HttpClient {
    HttpClient::start_with(reactor_config(), config).unwrap()
}

fn fetch(endpoint: &ClientEndpoint, path: &str) -> String {
    let request = RequestHead::new(Method::Get, path)
        .header("Host", "localhost")
        .authority("localhost");
    let (exchange, response) = BasicClientExchange::new(request, None);
    assert!(endpoint.execute(Box::new(exchange)));
    let response = response.wait(TIMEOUT).unwrap();
    assert_eq!(response.head.status, Status::OK);
    String::from_utf8(response.body).unwrap()
}

fn tls_server(policy: VersionPolicy) -> ProtocolConfig {
    let tls = TlsConfig::server().build().unwrap();
    ProtocolConfig::builder().policy(policy).tls(tls).build()
}

fn tls_client(policy: VersionPolicy) -> ProtocolConfig {
    let tls = TlsConfig::client().servername("localhost").build().unwrap();
    ProtocolConfig::builder().policy(policy).tls(tls).build()
}

#[test]
fn test_tls_negotiates_h2() {
    init_tracing();
    let (server, addr) = start_server(tls_server(VersionPolicy::Negotiate));
    let client = start_client(tls_client(VersionPolicy::Negotiate));

    let endpoint = client.connect(addr, TIMEOUT).wait(TIMEOUT).unwrap();
    assert_eq!(endpoint.protocol(), Version::Http2);
    assert_eq!(fetch(&endpoint, "/alpn"), "/alpn over HTTP/2");

    client.shutdown(Duration::from_secs(1));
    server.shutdown(Duration::from_secs(1));
}

#[test]
fn test_tls_client_forcing_http1() {
    init_tracing();
    let (server, addr) = start_server(tls_server(VersionPolicy::Negotiate));
    let client = start_client(tls_client(VersionPolicy::ForceHttp1));

    let endpoint = client.connect(addr, TIMEOUT).wait(TIMEOUT).unwrap();
    assert_eq!(endpoint.protocol(), Version::Http11);
    assert_eq!(fetch(&endpoint, "/one"), "/one over HTTP/1.1");

    client.shutdown(Duration::from_secs(1));
    server.shutdown(Duration::from_secs(1));
}

#[test]
fn test_plaintext_server_serves_both_protocols() {
    init_tracing();
    let plain = || ProtocolConfig::builder().policy(VersionPolicy::Negotiate).build();
    let (server, addr) = start_server(plain());

    let h2_client = start_client(ProtocolConfig::builder().policy(VersionPolicy::ForceHttp2).build());
    let h2 = h2_client.connect(addr, TIMEOUT).wait(TIMEOUT).unwrap();
    assert_eq!(h2.protocol(), Version::Http2);
    assert_eq!(fetch(&h2, "/sniffed"), "/sniffed over HTTP/2");

    let h1_client = start_client(plain());
    let h1 = h1_client.connect(addr, TIMEOUT).wait(TIMEOUT).unwrap();
    assert_eq!(h1.protocol(), Version::Http11);
    assert_eq!(fetch(&h1, "/sniffed"), "/sniffed over HTTP/1.1");

    h2_client.shutdown(Duration::from_secs(1));
    h1_client.shutdown(Duration::from_secs(1));
    server.shutdown(Duration::from_secs(1));
}

/// Write the generated identity to PEM files: (certificate, key)
fn write_identity(dir: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
    let (cert, key) = self_signed_identity().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
    fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    (cert_path, key_path)
}

#[test]
fn test_verified_peer_certificate() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (cert, key) = write_identity(&dir);

    let server_tls = TlsConfig::server().cert_file(&cert).key_file(&key).build().unwrap();
    let (server, addr) = start_server(ProtocolConfig::builder().tls(server_tls).build());

    let client_tls = TlsConfig::client()
        .servername("localhost")
        .ca_file(&cert)
        .verify_peer(true)
        .build()
        .unwrap();
    let verifier = |_: Option<SocketAddr>, details: &TlsDetails| -> hxcore::http::tls::Result<()> {
        match details.peer_subject() {
            Some("localhost") => Ok(()),
            other => Err(TlsError::Rejected(format!("unexpected peer {:?}", other))),
        }
    };
    let client = start_client(
        ProtocolConfig::builder()
            .tls(client_tls)
            .verifier(Arc::new(verifier))
            .build(),
    );

    let endpoint = client.connect(addr, TIMEOUT).wait(TIMEOUT).unwrap();
    assert_eq!(fetch(&endpoint, "/verified"), format!("/verified over {}", endpoint.protocol()));

    client.shutdown(Duration::from_secs(1));
    server.shutdown(Duration::from_secs(1));
}

#[test]
fn test_verifier_rejection_fails_connect() {
    init_tracing();
    let (server, addr) = start_server(tls_server(VersionPolicy::Negotiate));

    let tls = TlsConfig::client().servername("localhost").build().unwrap();
    let verifier = |_: Option<SocketAddr>, _: &TlsDetails| -> hxcore::http::tls::Result<()> {
        Err(TlsError::Rejected("not trusted".to_string()))
    };
    let client = start_client(ProtocolConfig::builder().tls(tls).verifier(Arc::new(verifier)).build());

    let result = client.connect(addr, TIMEOUT).wait(TIMEOUT);
    assert!(matches!(result, Err(Error::Tls(TlsError::Rejected(_)))), "{:?}", result.map(|_| ()));

    client.shutdown(Duration::from_secs(1));
    server.shutdown(Duration::from_secs(1));
}
