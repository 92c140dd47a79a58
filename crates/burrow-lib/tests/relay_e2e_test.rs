//! End-to-end tests: public caller → relay → tunnel client → local upstream

use axum::{
    body::Bytes,
    extract::Query,
    routing::{get, post},
    Router,
};
use burrow_lib::{
    Assignment, Relay, RelayAddrs, RelayBuilder, RelayClientConfig, RelayClientError,
    TunnelClient,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DOMAIN: &str = "example.com";

async fn start_upstream() -> SocketAddr {
    let app = Router::new()
        .route(
            "/greet",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                format!(
                    "Hello, {}!",
                    params.get("name").map(String::as_str).unwrap_or("stranger")
                )
            }),
        )
        .route("/echo", post(|body: Bytes| async move { body }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn relay_builder() -> RelayBuilder {
    RelayBuilder::new()
        .http_addr("127.0.0.1:0")
        .unwrap()
        .control_addr("127.0.0.1:0")
        .unwrap()
        .domain(DOMAIN)
        .request_timeout(Duration::from_secs(5))
        .drain_timeout(Duration::from_secs(2))
}

struct RunningRelay {
    addrs: RelayAddrs,
    registry: Arc<burrow_lib::SessionRegistry>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), burrow_lib::RelayError>>,
}

async fn start_relay(builder: RelayBuilder) -> RunningRelay {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut relay: Relay = builder.build().unwrap();
    let addrs = relay.start().await.unwrap();
    let registry = relay.registry();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(relay.run_until_stopped(shutdown.clone()));

    RunningRelay {
        addrs,
        registry,
        shutdown,
        task,
    }
}

fn tunnel_client(relay: &RunningRelay, upstream: SocketAddr, subdomain: Option<&str>) -> TunnelClient {
    let config = RelayClientConfig::builder()
        .server_url(format!("ws://{}", relay.addrs.control))
        .local_url(format!("http://{}", upstream))
        .subdomain(subdomain.map(str::to_string))
        .reconnect_delay(Duration::from_millis(200))
        .build()
        .unwrap();
    TunnelClient::new(config)
}

/// Run the client in the background and wait for its first assignment
async fn connect(client: TunnelClient) -> (Assignment, CancellationToken, JoinHandle<()>) {
    let mut assignment = client.subscribe();
    let token = CancellationToken::new();
    let stop = token.clone();
    let task = tokio::spawn(async move { client.run_forever(stop).await });

    let assigned = tokio::time::timeout(Duration::from_secs(5), assignment.wait_for(|a| a.is_some()))
        .await
        .expect("tunnel was not established in time")
        .unwrap()
        .clone()
        .unwrap();
    (assigned, token, task)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn public_get(relay: &RunningRelay, subdomain: &str, path: &str) -> reqwest::RequestBuilder {
    reqwest::Client::new()
        .get(format!("http://{}{}", relay.addrs.http, path))
        .header("Host", format!("{}.{}", subdomain, DOMAIN))
}

#[tokio::test]
async fn test_request_flows_through_tunnel() {
    let upstream = start_upstream().await;
    let relay = start_relay(relay_builder()).await;

    let (assigned, client_stop, client_task) = connect(tunnel_client(&relay, upstream, None)).await;
    assert_eq!(assigned.subdomain.len(), 8);
    assert_eq!(
        assigned.public_url,
        Some(format!(
            "http://{}.{}:{}",
            assigned.subdomain,
            DOMAIN,
            relay.addrs.http.port()
        ))
    );

    let response = public_get(&relay, &assigned.subdomain, "/greet?name=burrow")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "Hello, burrow!");

    let response = reqwest::Client::new()
        .post(format!("http://{}/echo", relay.addrs.http))
        .header("Host", format!("{}.{}", assigned.subdomain, DOMAIN))
        .body(vec![0u8, 159, 146, 150])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), &[0u8, 159, 146, 150]);

    client_stop.cancel();
    client_task.await.unwrap();
    relay.shutdown.cancel();
    relay.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_subdomain_is_404() {
    let relay = start_relay(relay_builder()).await;

    let response = public_get(&relay, "zzzz0000", "/").send().await.unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.unwrap(), "Tunnel zzzz0000 not found");

    relay.shutdown.cancel();
    relay.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_health_counts_sessions() {
    let upstream = start_upstream().await;
    let relay = start_relay(relay_builder()).await;
    let (_, client_stop, client_task) =
        connect(tunnel_client(&relay, upstream, Some("health-check"))).await;

    let body = reqwest::get(format!("http://{}/health", relay.addrs.http))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("\"active_sessions\":1"), "unexpected body {}", body);

    client_stop.cancel();
    client_task.await.unwrap();
    relay.shutdown.cancel();
    relay.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_requested_subdomain_is_exclusive() {
    let upstream = start_upstream().await;
    let relay = start_relay(relay_builder()).await;

    let (assigned, client_stop, client_task) =
        connect(tunnel_client(&relay, upstream, Some("my-app"))).await;
    assert_eq!(assigned.subdomain, "my-app");

    let second = tunnel_client(&relay, upstream, Some("my-app"));
    match second.run_once(CancellationToken::new()).await {
        Err(RelayClientError::Rejected(reason)) => assert!(reason.contains("my-app"), "{}", reason),
        other => panic!("Expected rejection, got {:?}", other),
    }

    // The first tunnel is unaffected
    let response = public_get(&relay, "my-app", "/greet").send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "Hello, stranger!");

    client_stop.cancel();
    client_task.await.unwrap();
    relay.shutdown.cancel();
    relay.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_client_shutdown_frees_subdomain() {
    let upstream = start_upstream().await;
    let relay = start_relay(relay_builder()).await;

    let (_, client_stop, client_task) =
        connect(tunnel_client(&relay, upstream, Some("short-lived"))).await;
    assert!(relay.registry.lookup("short-lived").is_some());

    client_stop.cancel();
    client_task.await.unwrap();
    let registry = relay.registry.clone();
    wait_until(|| registry.lookup("short-lived").is_none()).await;

    let response = public_get(&relay, "short-lived", "/greet").send().await.unwrap();
    assert_eq!(response.status(), 404);

    // And the name can be claimed again
    let (assigned, client_stop, client_task) =
        connect(tunnel_client(&relay, upstream, Some("short-lived"))).await;
    assert_eq!(assigned.subdomain, "short-lived");

    client_stop.cancel();
    client_task.await.unwrap();
    relay.shutdown.cancel();
    relay.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_relay_shutdown_disconnects_clients() {
    let upstream = start_upstream().await;
    let relay = start_relay(relay_builder()).await;

    let client = tunnel_client(&relay, upstream, Some("drained"));
    let mut assignment = client.subscribe();
    let (_, client_stop, client_task) = connect(client).await;

    relay.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), relay.task)
        .await
        .expect("relay did not stop in time")
        .unwrap()
        .unwrap();
    assert_eq!(relay.registry.active_count(), 0);

    // The client notices and goes back to reconnecting
    tokio::time::timeout(Duration::from_secs(5), assignment.wait_for(|a| a.is_none()))
        .await
        .expect("client did not notice the relay going away")
        .unwrap();

    client_stop.cancel();
    client_task.await.unwrap();
}

#[tokio::test]
async fn test_session_cap_rejects_extra_tunnels() {
    let upstream = start_upstream().await;
    let relay = start_relay(relay_builder().max_sessions(1)).await;

    let (_, client_stop, client_task) = connect(tunnel_client(&relay, upstream, None)).await;

    let extra = tunnel_client(&relay, upstream, None);
    assert!(matches!(
        extra.run_once(CancellationToken::new()).await,
        Err(RelayClientError::Rejected(_))
    ));

    client_stop.cancel();
    client_task.await.unwrap();
    relay.shutdown.cancel();
    relay.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_ingress_over_tls() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key)
        .unwrap();

    let relay = start_relay(relay_builder().http_tls(Arc::new(tls))).await;

    let client = reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_der(cert_der.as_ref()).unwrap())
        .resolve("localhost", relay.addrs.http)
        .build()
        .unwrap();

    let response = client
        .get(format!("https://localhost:{}/health", relay.addrs.http.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    relay.shutdown.cancel();
    relay.task.await.unwrap().unwrap();
}
