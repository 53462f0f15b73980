use axum::http::{HeaderMap, StatusCode};
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use rand::Rng;
use serde_json::{json, Value};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

async fn shell() -> Html<&'static str> {
    Html("<!doctype html><title>demo</title><div id=\"root\">app shell</div>")
}

async fn login() -> Html<&'static str> {
    Html("<!doctype html><title>login</title><form>login</form>")
}

async fn manifest() -> Json<Value> {
    Json(json!({
        "name": "offgate demo",
        "short_name": "demo",
        "start_url": "/",
        "display": "standalone",
    }))
}

async fn app_js() -> &'static str {
    "console.log('demo app loaded');"
}

/// API endpoints demand a bearer token. If the gateway ever intercepted or
/// replayed these, the 401s would show up immediately when driving it by hand.
fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("Bearer "))
}

async fn list_posts(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    // Simulate upstream latency (5-20ms)
    let delay = rand::thread_rng().gen_range(5..=20);
    tokio::time::sleep(Duration::from_millis(delay)).await;

    Ok(Json(json!({
        "posts": [
            {"id": 1, "author": "dana", "body": "hello from the feed"},
            {"id": 2, "author": "rami", "body": "second post"},
        ],
        "latency_ms": delay,
    })))
}

async fn profile(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(Json(json!({
        "id": 7,
        "name": "Dana",
        "groups": ["class-of-2019", "chess"],
    })))
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app = Router::new()
        .route("/", get(shell))
        .route("/login", get(login))
        .route("/index.html", get(shell))
        .route("/manifest.json", get(manifest))
        .route("/assets/app.js", get(app_js))
        .route("/api/posts", get(list_posts))
        .route("/api/profile", get(profile))
        .route("/health", get(health));

    let addr = "0.0.0.0:3000";
    tracing::info!(addr, "demo origin starting");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
