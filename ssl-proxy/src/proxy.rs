//! HTTPS front: control API, health endpoint and host-based forwarding.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use http_body_util::LengthLimitError;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{ProxyError, Result};
use crate::health::HealthChecker;
use crate::model::{validate_domain, ServerRegistryEntry, Settings};
use crate::registry::Registry;
use crate::router::Router as HostRouter;
use crate::store::Store;
use crate::tls;

pub const SERVERS_PATH: &str = "/__internal/servers";
pub const HEALTH_PATH: &str = "/__internal/health_check";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that describe a single connection and are not forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Shared proxy state
pub struct ProxyState {
    pub store: Store,
    pub settings: Arc<Settings>,
    pub registry: Arc<Registry>,
    pub router: HostRouter,
    pub health: HealthChecker,
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl ProxyState {
    pub fn new(
        store: Store,
        settings: Settings,
        registry: Arc<Registry>,
        config: &ServerConfig,
    ) -> Result<Self> {
        let destination = HostRouter::destination_url(&config.upstream_scheme, &settings.destination_domain)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            health: HealthChecker::new(store.clone(), registry.clone()),
            router: HostRouter::new(registry.clone(), destination),
            store,
            settings: Arc::new(settings),
            registry,
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Read the registry back after a store write. On failure the previous
    /// entries keep serving and the registry is flagged stale.
    async fn refresh_registry(&self) {
        match self.registry.reload_from(&self.store).await {
            Ok(count) => debug!(count, "Reloaded registry"),
            Err(e) => {
                error!("Failed to reload registry: {}", e);
                self.registry.mark_stale();
            }
        }
    }
}

/// Build the axum app
pub fn app(state: Arc<ProxyState>) -> Router {
    let internal = Router::new()
        .route(SERVERS_PATH, post(insert_server).put(update_server))
        .route(HEALTH_PATH, get(health_check))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .merge(internal)
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Proxy server
pub struct ProxyServer {
    state: Arc<ProxyState>,
    acceptor: TlsAcceptor,
}

impl ProxyServer {
    pub fn new(state: Arc<ProxyState>) -> Self {
        let acceptor = tls::build_acceptor(state.registry.clone());
        Self { state, acceptor }
    }

    pub fn router(&self) -> Router {
        app(self.state.clone())
    }

    /// Bind `listen_addr` and serve until cancelled
    pub async fn run(&self, listen_addr: &str, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Starting proxy server on {}", listen_addr);
        info!(
            domains = ?self.state.registry.snapshot().domains(),
            destination = %self.state.router.destination(),
            "Serving registered domains"
        );
        self.serve(listener, cancel).await
    }

    /// TLS accept loop
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        use hyper::service::service_fn;
        use tower::ServiceExt;

        let router = self.router();

        loop {
            let (stream, addr) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Proxy server stopping");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let acceptor = self.acceptor.clone();
            let router = router.clone();

            tokio::spawn(async move {
                let tls_stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => tls_stream,
                    Ok(Err(e)) => {
                        debug!("TLS handshake failed from {}: {}", addr, e);
                        return;
                    }
                    Err(_) => {
                        debug!("TLS handshake timed out from {}", addr);
                        return;
                    }
                };

                let io = hyper_util::rt::TokioIo::new(tls_stream);
                let service = service_fn(move |mut req: hyper::Request<hyper::body::Incoming>| {
                    req.extensions_mut().insert(ConnectInfo(addr));
                    router.clone().oneshot(req)
                });

                if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    debug!("Error serving connection from {}: {}", addr, e);
                }
            });
        }
    }
}

/// Bearer token check for the internal routes
async fn require_token(State(state): State<Arc<ProxyState>>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map_or(false, |token| token_matches(token, &state.settings.token));

    if !authorized {
        warn!(path = %request.uri().path(), "Rejected control request with bad token");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    next.run(request).await
}

fn token_matches(given: &str, expected: &str) -> bool {
    let (given, expected) = (given.as_bytes(), expected.as_bytes());
    if given.len() != expected.len() {
        return false;
    }
    given.iter().zip(expected).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

fn parse_entry(body: &[u8]) -> std::result::Result<ServerRegistryEntry, Response> {
    let entry: ServerRegistryEntry = serde_json::from_slice(body)
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid JSON").into_response())?;

    if !entry.is_complete() {
        return Err((StatusCode::BAD_REQUEST, "Missing required fields").into_response());
    }
    if validate_domain(&entry.domain).is_err() {
        return Err((StatusCode::BAD_REQUEST, "Invalid domain").into_response());
    }
    Ok(entry)
}

fn store_error_response(err: ProxyError) -> Response {
    match err {
        ProxyError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
        ProxyError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
        other => {
            error!("Store write failed: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}

/// POST /__internal/servers
async fn insert_server(State(state): State<Arc<ProxyState>>, body: Bytes) -> Response {
    let entry = match parse_entry(&body) {
        Ok(entry) => entry,
        Err(response) => return response,
    };

    let _guard = state.registry.lock_writes().await;
    if let Err(e) = state.store.insert_server(&entry).await {
        return store_error_response(e);
    }
    state.refresh_registry().await;

    info!(domain = %entry.domain, "Server created");
    (StatusCode::CREATED, "Server created").into_response()
}

/// PUT /__internal/servers
async fn update_server(State(state): State<Arc<ProxyState>>, body: Bytes) -> Response {
    let entry = match parse_entry(&body) {
        Ok(entry) => entry,
        Err(response) => return response,
    };

    let _guard = state.registry.lock_writes().await;
    if let Err(e) = state.store.update_server(&entry).await {
        return store_error_response(e);
    }
    state.refresh_registry().await;

    info!(domain = %entry.domain, "Server stored");
    (StatusCode::CREATED, "Server stored").into_response()
}

/// GET /__internal/health_check
async fn health_check(State(state): State<Arc<ProxyState>>) -> Response {
    let status = state.health.check().await;
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, status.message()).into_response()
}

fn request_host(req: &Request) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

/// Whether a body read stopped at the size limit rather than failing
fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Forwards requests for registered hosts to the destination
async fn proxy_handler(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let Some(host) = request_host(&req) else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let matched = match state.router.match_route(&host, &path_and_query) {
        Ok(m) => m,
        Err(e) => {
            debug!("No route for {}{}: {}", host, path_and_query, e);
            return (StatusCode::NOT_FOUND, "Not Found").into_response();
        }
    };
    debug!("Forwarding {} {} to {}", req.method(), host, matched.forward_url);

    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(e) if exceeds_limit(&e) => {
            warn!(domain = %matched.domain, limit = state.max_body_bytes, "Request body too large");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response();
        }
        Err(e) => {
            warn!(domain = %matched.domain, "Failed to read request body: {}", e);
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
    };

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    if !headers.contains_key(header::HOST) {
        if let Ok(value) = HeaderValue::from_str(&host) {
            headers.insert(header::HOST, value);
        }
    }
    if let Some(ip) = client_addr {
        if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
            headers.append(HeaderName::from_static("x-forwarded-for"), value);
        }
    }

    let upstream = state
        .client
        .request(parts.method, &matched.forward_url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    match upstream {
        Ok(response) => {
            let status = response.status();
            let mut headers = response.headers().clone();
            strip_hop_by_hop(&mut headers);

            let mut relayed = Response::new(Body::from_stream(response.bytes_stream()));
            *relayed.status_mut() = status;
            *relayed.headers_mut() = headers;
            relayed
        }
        Err(e) if e.is_timeout() => {
            warn!(domain = %matched.domain, "Destination timed out: {}", e);
            (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response()
        }
        Err(e) => {
            error!(domain = %matched.domain, "Destination error: {}", e);
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}
