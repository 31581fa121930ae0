//! HTTP side of the IP monitor: turning an axum request into `(ip, timestamp)` and the
//! middleware that refuses banned clients.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};

use crate::models::ThrottleMessage;
use crate::state::AppState;

pub const THROTTLE_MESSAGE: &str = "This IP address has been temporarily banned to protect our servers.\n\nIf you are a legitimate website user, please try using the website at a slower pace.";

// Operational endpoints never count against a client
pub const EXEMPT_PATHS: [&str; 3] = ["/health", "/metrics", "/monitor/dump"];

fn header_ip(request: &Request, name: &str) -> Option<IpAddr> {
    let value = request.headers().get(name)?.to_str().ok()?;
    // X-Forwarded-For is "client, proxy1, proxy2"
    value.split(',').next()?.trim().parse().ok()
}

/// Client IP for `request`. Forwarding headers are only honoured when the gateway runs
/// behind a proxy that sets them; otherwise the socket peer is used.
pub fn client_ip(request: &Request, trust_forwarded_for: bool) -> Option<IpAddr> {
    if trust_forwarded_for {
        if let Some(ip) = header_ip(request, "x-forwarded-for") {
            return Some(ip);
        }
        if let Some(ip) = header_ip(request, "x-real-ip") {
            return Some(ip);
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Adapter from an HTTP request to what the monitor counts.
pub fn to_request_record(
    request: &Request,
    trust_forwarded_for: bool,
    now: DateTime<Utc>,
) -> Option<(String, DateTime<Utc>)> {
    client_ip(request, trust_forwarded_for).map(|ip| (ip.to_string(), now))
}

pub fn throttle_response() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(ThrottleMessage {
            message: THROTTLE_MESSAGE.to_string(),
        }),
    )
        .into_response()
}

// Admission middleware - runs before anything else touches the request
pub async fn admission(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if EXEMPT_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let now = state.monitor.now();
    match to_request_record(&request, state.trust_forwarded_for, now) {
        Some((ip, at)) => {
            if !state.monitor.admit(&ip, at) {
                tracing::debug!(ip = %ip, path = request.uri().path(), "request refused, IP banned");
                return throttle_response();
            }
        }
        None => tracing::debug!("no client IP on request, admitted uncounted"),
    }

    next.run(request).await
}
