use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use ssl_proxy::config::ServerConfig;
use ssl_proxy::proxy::{app, HEALTH_PATH, SERVERS_PATH};
use ssl_proxy::{ProxyState, Registry, Store};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup() -> (Arc<ProxyState>, String) {
    let store = Store::in_memory().await.unwrap();
    store.init().await.unwrap();
    let settings = store
        .insert_settings("proxy.example.com", "app.example.com", "ops@example.com")
        .await
        .unwrap();
    let token = settings.token.clone();

    let registry = Arc::new(Registry::load(&store).await.unwrap());
    let state = ProxyState::new(store, settings, registry, &ServerConfig::default()).unwrap();
    (Arc::new(state), token)
}

fn request(method: Method, path: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::HOST, "proxy.example.com")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(state: &Arc<ProxyState>, req: Request<Body>) -> (StatusCode, String) {
    let response: Response = app(state.clone()).oneshot(req).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

const ENTRY: &str = r#"{"Domain":"x.com","SSLKey":"k","SSLCert":"c"}"#;

#[tokio::test]
async fn test_insert_server() {
    let (state, token) = setup().await;

    let (status, body) = send(&state, request(Method::POST, SERVERS_PATH, Some(&token), ENTRY)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, "Server created");

    let stored = state.store.select_servers().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].domain, "x.com");
    assert!(state.registry.contains_host("x.com"));
}

#[tokio::test]
async fn test_insert_makes_certificate_available_to_tls() {
    let (state, token) = setup().await;
    let cert = rcgen::generate_simple_self_signed(vec!["y.com".to_string()]).unwrap();
    let body = serde_json::json!({
        "Domain": "y.com",
        "SSLKey": cert.key_pair.serialize_pem(),
        "SSLCert": cert.cert.pem(),
    })
    .to_string();

    assert!(state.registry.certified_key_for("y.com").is_none());
    let (status, _) = send(&state, request(Method::POST, SERVERS_PATH, Some(&token), &body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(state.registry.certified_key_for("y.com").is_some());
}

#[tokio::test]
async fn test_bad_or_missing_token_is_unauthorized() {
    let (state, _) = setup().await;

    let (status, body) = send(&state, request(Method::POST, SERVERS_PATH, Some("wrong"), ENTRY)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, "Unauthorized");

    let (status, _) = send(&state, request(Method::POST, SERVERS_PATH, None, ENTRY)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&state, request(Method::GET, HEALTH_PATH, None, "")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert!(state.store.select_servers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_bodies_are_rejected() {
    let (state, token) = setup().await;

    let (status, body) = send(
        &state,
        request(Method::POST, SERVERS_PATH, Some(&token), r#"{"Domain":"x.com","SSLCert":"c"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Missing required fields");

    let (status, body) = send(&state, request(Method::POST, SERVERS_PATH, Some(&token), "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Invalid JSON");

    assert!(state.store.select_servers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_insert_conflicts() {
    let (state, token) = setup().await;

    let (status, _) = send(&state, request(Method::POST, SERVERS_PATH, Some(&token), ENTRY)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(&state, request(Method::POST, SERVERS_PATH, Some(&token), ENTRY)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(state.store.select_servers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_update_server() {
    let (state, token) = setup().await;

    let (status, _) = send(&state, request(Method::PUT, SERVERS_PATH, Some(&token), ENTRY)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(&state, request(Method::POST, SERVERS_PATH, Some(&token), ENTRY)).await;
    let (status, body) = send(
        &state,
        request(
            Method::PUT,
            SERVERS_PATH,
            Some(&token),
            r#"{"Domain":"x.com","SSLKey":"k2","SSLCert":"c2"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, "Server stored");
    assert_eq!(state.store.select_servers().await.unwrap()[0].ssl_key, "k2");
}

#[tokio::test]
async fn test_health_check() {
    let (state, token) = setup().await;

    let (status, body) = send(&state, request(Method::GET, HEALTH_PATH, Some(&token), "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_health_check_with_closed_store() {
    let (state, token) = setup().await;
    state.store.close().await;

    let (status, _) = send(&state, request(Method::GET, HEALTH_PATH, Some(&token), "")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_write_with_closed_store_is_server_error() {
    let (state, token) = setup().await;
    state.store.close().await;

    let (status, _) = send(&state, request(Method::POST, SERVERS_PATH, Some(&token), ENTRY)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}
