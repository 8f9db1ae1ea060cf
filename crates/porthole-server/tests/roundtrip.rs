//! End-to-end coverage over loopback sockets: a local origin, the tunnel
//! server, and a client pool, exercised through the public ingress.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use porthole_client::{Client, ClientConfig};
use porthole_server::{ServerConfig, TunnelServer};

async fn start_origin() -> u16 {
    let app = Router::new().route("/hi", get(|| async { "hi" }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

async fn start_server() -> (u16, u16) {
    let server = TunnelServer::bind(ServerConfig {
        tunnel_addr: "127.0.0.1:0".parse().unwrap(),
        http_addr: "127.0.0.1:0".parse().unwrap(),
        cert_file: None,
        key_file: None,
    })
    .await
    .unwrap();

    let tunnel_port = server.tunnel_addr().unwrap().port();
    let http_port = server.http_addr().unwrap().port();
    tokio::spawn(async move {
        server.serve().await.unwrap();
    });
    (tunnel_port, http_port)
}

async fn start_client(domain: &str, tunnel_port: u16, origin_port: u16) {
    let client = Client::dial(ClientConfig {
        server: "127.0.0.1".into(),
        server_port: tunnel_port,
        domain: domain.into(),
        cert_file: None,
        insecure: true,
    })
    .await
    .unwrap();

    let target = format!("http://127.0.0.1:{origin_port}");
    tokio::spawn(async move {
        let _ = client.serve_proxy(&target).await;
    });
}

fn ingress_caller(domain: &str, http_port: u16) -> reqwest::Client {
    let addr: SocketAddr = format!("127.0.0.1:{http_port}").parse().unwrap();
    reqwest::Client::builder()
        .resolve(domain, addr)
        .build()
        .unwrap()
}

async fn register(tunnel_port: u16, domain: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{tunnel_port}/register"))
        .json(&serde_json::json!({ "domain": domain }))
        .send()
        .await
        .unwrap()
}

fn tunnel_request(tunnel_port: u16, host: &str, token: &str) -> tungstenite::handshake::client::Request {
    let mut request = format!("ws://127.0.0.1:{tunnel_port}/tunnel")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("x-porthole-host", host.parse().unwrap());
    request
        .headers_mut()
        .insert("x-porthole-token", token.parse().unwrap());
    request
}

#[tokio::test(flavor = "multi_thread")]
async fn proxies_requests_through_a_registered_tunnel() {
    let origin_port = start_origin().await;
    let (tunnel_port, http_port) = start_server().await;
    start_client("a.example", tunnel_port, origin_port).await;

    let caller = ingress_caller("a.example", http_port);
    let url = format!("http://a.example:{http_port}/hi");

    // the worker pool fills asynchronously; poll until the first tunnel
    // is dispatchable
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let resp = caller.get(&url).send().await.unwrap();
        if resp.status() == 200 {
            assert_eq!(resp.text().await.unwrap(), "hi");
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "tunnel never became dispatchable (last status {})",
            resp.status()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // keep-alive or a fresh tunnel, either way the next request works too
    let resp = caller.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "hi");
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_host_gets_a_bad_gateway() {
    let (_tunnel_port, http_port) = start_server().await;

    let caller = ingress_caller("b.example", http_port);
    let resp = caller
        .get(format!("http://b.example:{http_port}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
}

#[tokio::test(flavor = "multi_thread")]
async fn stolen_or_missing_credentials_cannot_open_tunnels() {
    let (tunnel_port, _http_port) = start_server().await;

    let resp = register(tunnel_port, "c.example").await;
    assert_eq!(resp.status(), 200);

    // wrong token
    let err = tokio_tungstenite::connect_async(tunnel_request(tunnel_port, "c.example", "wrong"))
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("expected an http rejection, got {other}"),
    }

    // no credentials at all
    let bare = format!("ws://127.0.0.1:{tunnel_port}/tunnel")
        .into_client_request()
        .unwrap();
    let err = tokio_tungstenite::connect_async(bare).await.unwrap_err();
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("expected an http rejection, got {other}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn the_sixteenth_tunnel_is_refused() {
    let (tunnel_port, _http_port) = start_server().await;

    let reg: serde_json::Value = register(tunnel_port, "d.example").await.json().await.unwrap();
    let token = reg["token"].as_str().unwrap().to_string();

    let mut held = Vec::new();
    for _ in 0..15 {
        let (socket, _) =
            tokio_tungstenite::connect_async(tunnel_request(tunnel_port, "d.example", &token))
                .await
                .unwrap();
        held.push(socket);
    }

    let err =
        tokio_tungstenite::connect_async(tunnel_request(tunnel_port, "d.example", &token))
            .await
            .unwrap_err();
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 429),
        other => panic!("expected an http rejection, got {other}"),
    }

    // once one tunnel completes, a new open succeeds
    drop(held.pop());
    tokio::time::sleep(Duration::from_millis(200)).await;
    let (socket, _) =
        tokio_tungstenite::connect_async(tunnel_request(tunnel_port, "d.example", &token))
            .await
            .unwrap();
    held.push(socket);
}

#[tokio::test(flavor = "multi_thread")]
async fn an_idle_registration_is_recycled() {
    let (tunnel_port, _http_port) = start_server().await;

    let first: serde_json::Value = register(tunnel_port, "e.example").await.json().await.unwrap();

    // no tunnel ever opens; the grace period expires
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let resp = register(tunnel_port, "e.example").await;
    assert_eq!(resp.status(), 200);
    let second: serde_json::Value = resp.json().await.unwrap();
    assert_ne!(first["token"], second["token"]);
}
