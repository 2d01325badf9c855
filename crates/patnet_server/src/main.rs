/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::{
    body::Bytes,
    extract::{ConnectInfo, OriginalUri, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{from_fn, from_fn_with_state, Next},
    response::{IntoResponse, Response},
    Router,
};
use patnet_protocol::{ForumRequest, ForumResponse};
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span};

use patnet_server::abuse::AbuseFilters;
use patnet_server::admission::AdmissionGate;
use patnet_server::config::{self, ServerConfig};
use patnet_server::db::PgPool;
use patnet_server::dispatch::Dispatcher;
use patnet_server::handlers;

static REQ_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> String {
    let id = REQ_ID.fetch_add(1, Ordering::Relaxed);
    format!("req-{id}")
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<ServerConfig>,
    dispatcher: Arc<Dispatcher>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load_config()?;
    let pool = PgPool::new(&cfg)?;
    pool.wait_ready(cfg.pg_init_retries, cfg.pg_init_backoff_ms).await?;

    let addr = cfg.bind;
    let max_body = cfg.max_body_bytes;
    let gate = AdmissionGate::new(Arc::new(pool), cfg.lease_max_hold());
    let routes = handlers::routes();
    info!(routes = routes.len(), "routes registered");
    let state = AppState {
        cfg: Arc::new(cfg.clone()),
        dispatcher: Arc::new(Dispatcher::with_state(gate, AbuseFilters::new(), cfg, routes)),
    };

    let app = Router::new()
        .fallback(forum_entry)
        .layer(axum::extract::DefaultBodyLimit::max(max_body))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let request_id = req
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("req");
                info_span!(
                    "http",
                    method = %req.method(),
                    uri = %req.uri(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(from_fn_with_state(state.clone(), add_security_headers))
        .layer(from_fn(ensure_request_ids))
        .with_state(state);

    info!("patnet listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("patnet stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

async fn forum_entry(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(next_request_id);
    let req = ForumRequest {
        id,
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().unwrap_or("").to_string(),
        remote_addr: client_address(&state.cfg, &peer, &headers),
        headers: headers_to_vec(&headers),
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    build_response(state.dispatcher.dispatch(req).await)
}

/// Rate-limit key for this request. Behind a proxy that is the first X-Forwarded-For entry,
/// taken verbatim.
fn client_address(cfg: &ServerConfig, peer: &SocketAddr, headers: &HeaderMap) -> String {
    if cfg.trust_proxy_headers {
        if let Some(v) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
            if let Some(first) = v.split(',').map(str::trim).find(|s| !s.is_empty()) {
                return first.to_string();
            }
        }
    }
    peer.ip().to_string()
}

fn headers_to_vec(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|vs| (k.to_string(), vs.to_string())))
        .collect()
}

fn build_response(resp: ForumResponse) -> Response {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    for (k, v) in resp.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(k.as_bytes()),
            HeaderValue::from_str(&v),
        ) {
            headers.append(name, value);
        }
    }
    (status, headers, resp.body).into_response()
}

async fn add_security_headers(
    State(state): State<AppState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(next_request_id);
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(
        "X-Request-Id",
        HeaderValue::from_str(&request_id).unwrap_or_else(|_| HeaderValue::from_static("req")),
    );
    headers.entry("X-Content-Type-Options").or_insert(HeaderValue::from_static("nosniff"));
    headers.entry("X-Frame-Options").or_insert(HeaderValue::from_static("SAMEORIGIN"));
    headers.entry("Referrer-Policy").or_insert(HeaderValue::from_static("same-origin"));
    if state.cfg.hsts_max_age_secs > 0 {
        let value = format!("max-age={}; includeSubDomains", state.cfg.hsts_max_age_secs);
        headers.insert(
            "Strict-Transport-Security",
            HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("max-age=0")),
        );
    }
    resp
}

async fn ensure_request_ids(mut req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let headers = req.headers_mut();
    if headers.get("x-request-id").is_none() {
        let request_id = next_request_id();
        headers.insert(
            "x-request-id",
            HeaderValue::from_str(&request_id).unwrap_or_else(|_| HeaderValue::from_static("req")),
        );
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 9], 40_000))
    }

    #[test]
    fn forwarded_for_first_entry_is_the_key() {
        let cfg = ServerConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" 1.2.3.4 , 10.0.0.1"));
        assert_eq!(client_address(&cfg, &peer(), &headers), "1.2.3.4");

        assert_eq!(client_address(&cfg, &peer(), &HeaderMap::new()), "10.0.0.9");
    }

    #[test]
    fn untrusted_proxies_fall_back_to_the_peer() {
        let cfg = ServerConfig {
            trust_proxy_headers: false,
            ..ServerConfig::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        assert_eq!(client_address(&cfg, &peer(), &headers), "10.0.0.9");
    }

    #[test]
    fn forum_responses_keep_repeated_headers() {
        let resp = ForumResponse::new(303, "")
            .with_header("Location", "/")
            .with_header("Set-Cookie", "a=; Path=/")
            .with_header("Set-Cookie", "b=; Path=/")
            .with_header("Bad Header", "x");
        let out = build_response(resp);
        assert_eq!(out.status(), StatusCode::SEE_OTHER);
        assert_eq!(out.headers().get_all("set-cookie").iter().count(), 2);
        assert_eq!(out.headers().get("location").unwrap(), "/");
    }

    #[test]
    fn request_ids_increase() {
        let a = next_request_id();
        let b = next_request_id();
        assert_ne!(a, b);
        assert!(a.starts_with("req-"));
    }
}
