//! End-to-end: a stub upstream behind the gateway, driven over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::Request, routing::get};
use reqwest::StatusCode;
use tokio::net::TcpListener;

use quotes_gateway::ban_store::{BanStore, MemoryBanStore};
use quotes_gateway::clock::SystemClock;
use quotes_gateway::config::MonitorConfig;
use quotes_gateway::models::{MonitorDump, ThrottleMessage};
use quotes_gateway::monitor::RateMonitor;
use quotes_gateway::rate_limit::THROTTLE_MESSAGE;
use quotes_gateway::server;
use quotes_gateway::state::AppState;

/// Upstream that echoes method, path and body back.
async fn start_upstream() -> SocketAddr {
    async fn echo(request: Request) -> String {
        let method = request.method().clone();
        let uri = request.uri().clone();
        let body = axum::body::to_bytes(request.into_body(), usize::MAX)
            .await
            .unwrap();
        format!("{method} {uri} {}", String::from_utf8_lossy(&body))
    }

    let app = Router::new()
        .route("/api/quotes/", get(|| async { "[\"quote\"]" }))
        .fallback(echo);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Gateway with a tight limit: more than 3 requests per minute bans, maintenance every request.
async fn start_gateway(upstream: String) -> (String, Arc<MemoryBanStore>) {
    let store = Arc::new(MemoryBanStore::new());
    let config = MonitorConfig {
        monitor_limit_seconds: 60,
        monitor_limit_count: 3,
        commit_after_number: 1,
        ..MonitorConfig::default()
    };
    let monitor = RateMonitor::new(config, store.clone(), Arc::new(SystemClock));
    let state = Arc::new(AppState {
        client: reqwest::Client::new(),
        monitor: Arc::new(monitor),
        upstream,
        trust_forwarded_for: true,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, state, std::future::pending()));
    (format!("http://{addr}"), store)
}

async fn get_as(client: &reqwest::Client, url: &str, ip: &str) -> reqwest::Response {
    client
        .get(url)
        .header("x-forwarded-for", ip)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn admitted_requests_reach_upstream() {
    let upstream = start_upstream().await;
    let (gateway, _) = start_gateway(format!("http://{upstream}")).await;
    let client = reqwest::Client::new();

    let response = get_as(&client, &format!("{gateway}/api/quotes/"), "198.51.100.1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "[\"quote\"]");

    let response = client
        .post(format!("{gateway}/api/votes/?quote=7"))
        .header("x-forwarded-for", "198.51.100.1")
        .body("up")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "POST /api/votes/?quote=7 up");
}

#[tokio::test]
async fn flooding_ip_gets_forbidden() {
    let upstream = start_upstream().await;
    let (gateway, store) = start_gateway(format!("http://{upstream}")).await;
    let client = reqwest::Client::new();
    let url = format!("{gateway}/api/quotes/");

    for _ in 0..4 {
        let response = get_as(&client, &url, "203.0.113.50").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = get_as(&client, &url, "203.0.113.50").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let message: ThrottleMessage = response.json().await.unwrap();
    assert_eq!(message.message, THROTTLE_MESSAGE);
    assert_eq!(store.count_prior_bans("203.0.113.50").unwrap(), 1);

    // a different client is unaffected
    let response = get_as(&client, &url, "203.0.113.51").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn operational_endpoints_bypass_admission() {
    let upstream = start_upstream().await;
    let (gateway, _) = start_gateway(format!("http://{upstream}")).await;
    let client = reqwest::Client::new();

    for _ in 0..10 {
        let response = get_as(&client, &format!("{gateway}/health"), "192.0.2.200").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = get_as(&client, &format!("{gateway}/metrics"), "192.0.2.200").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.text().await.unwrap().contains("gateway_"));

    get_as(&client, &format!("{gateway}/api/quotes/"), "192.0.2.201").await;
    let dump: MonitorDump = get_as(&client, &format!("{gateway}/monitor/dump"), "192.0.2.200")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(dump.count, 1);
    assert_eq!(dump.requests.len(), 1);
    assert!(dump.requests[0].starts_with("IP: (192.0.2.201) @ "));
    assert!(dump.blocked_ips.is_empty());
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    // bind then drop to get a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let (gateway, _) = start_gateway(format!("http://{dead}")).await;
    let client = reqwest::Client::new();
    let response = get_as(&client, &format!("{gateway}/api/quotes/"), "198.51.100.9").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}
