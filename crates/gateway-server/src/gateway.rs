use crate::upstream::{HttpClient, UpstreamFetcher};
use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, Response, StatusCode};
use offgate_cache::{
    classify, Classification, CredentialsMode, FetchRequest, Gatekeeper, MemoryStore, Method,
    PolicyConfig, RequestDescriptor, Served,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

pub type Engine = Gatekeeper<MemoryStore, UpstreamFetcher>;

/// Shared application state passed to all handlers.
///
/// The live engine sits behind an `ArcSwap` so a newly activated generation
/// takes over every open connection immediately — requests already in flight
/// finish against the engine they loaded, everything after sees the new one.
pub struct AppState {
    pub engine: ArcSwap<Engine>,
    /// A generation that finished installing but is waiting for the
    /// skip-waiting control signal before it activates.
    pub pending: Mutex<Option<Arc<Engine>>>,
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<UpstreamFetcher>,
    pub client: HttpClient,
    pub upstream_origin: String,
    pub started_at: Instant,
}

impl AppState {
    pub fn build_engine(
        &self,
        policy: PolicyConfig,
        generation: &str,
        bootstrap: Vec<String>,
    ) -> Engine {
        Gatekeeper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.fetcher),
            policy,
            generation,
            bootstrap,
        )
    }
}

/// Main gateway handler: classify, then either serve cache-first through the
/// engine or forward the request to the upstream untouched.
pub async fn gateway_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let engine = state.engine.load_full();

    let descriptor = match describe(&req, engine.policy()) {
        Some(descriptor) => descriptor,
        None => {
            // Request target we cannot even parse: hand it to the upstream as-is.
            return forward(&state, req).await;
        }
    };

    match classify(&descriptor, engine.policy()) {
        Classification::Bypass(reason) => {
            tracing::debug!(url = %descriptor.url, reason = reason.as_str(), "bypassing cache");
            metrics::counter!("gateway_requests_total", "decision" => reason.as_str()).increment(1);
            forward(&state, req).await
        }
        Classification::Ignore => {
            metrics::counter!("gateway_requests_total", "decision" => "ignore").increment(1);
            forward(&state, req).await
        }
        Classification::Cacheable => {
            metrics::counter!("gateway_requests_total", "decision" => "cacheable").increment(1);
            let fetch_request = FetchRequest {
                url: descriptor.url.clone(),
                headers: descriptor.headers,
            };
            match engine.handle_fetch(&fetch_request).await {
                Ok(served) => {
                    if served.is_hit() {
                        metrics::counter!("gateway_cache_hits_total").increment(1);
                    }
                    build_response(&served, engine.generation())
                }
                Err(error) => {
                    tracing::error!(url = %descriptor.url, %error, "upstream unavailable");
                    bad_gateway()
                }
            }
        }
    }
}

/// Map an incoming request to the classifier's value object.
///
/// The absolute URL is reconstructed from the request target's authority (or
/// the Host header) against the public origin's scheme. A request carrying a
/// Cookie is the server-side rendition of a credentialed fetch.
fn describe(req: &Request<Body>, policy: &PolicyConfig) -> Option<RequestDescriptor> {
    let method = match req.method().as_str() {
        "GET" => Method::Get,
        "HEAD" => Method::Head,
        "POST" => Method::Post,
        "PUT" => Method::Put,
        "DELETE" => Method::Delete,
        "PATCH" => Method::Patch,
        "OPTIONS" => Method::Options,
        _ => Method::Other,
    };

    let host = req
        .uri()
        .authority()
        .map(|authority| authority.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(axum::http::header::HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .or_else(|| {
            policy
                .origin
                .host_str()
                .map(|host| match policy.origin.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                })
        })?;

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let url = Url::parse(&format!(
        "{}://{}{}",
        policy.origin.scheme(),
        host,
        path_and_query
    ))
    .ok()?;

    let credentials = if req.headers().contains_key(axum::http::header::COOKIE) {
        CredentialsMode::Include
    } else {
        CredentialsMode::Omit
    };

    let headers = req
        .headers()
        .iter()
        .map(|(key, value)| {
            (
                key.as_str().to_string(),
                value.to_str().unwrap_or("").to_string(),
            )
        })
        .collect();

    Some(RequestDescriptor {
        method,
        url,
        credentials,
        headers,
    })
}

/// Forward a request to the upstream verbatim: same method, same headers,
/// same body, response streamed back unmodified. No cache read, no cache
/// write, no gateway headers.
async fn forward(state: &Arc<AppState>, req: Request<Body>) -> Response<Body> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let upstream_uri = format!(
        "{}{}",
        state.upstream_origin.trim_end_matches('/'),
        path_and_query
    );

    let mut builder = Request::builder().method(req.method()).uri(&upstream_uri);
    for (key, value) in req.headers() {
        // Hop-by-hop headers; the client fills in Host from the URI.
        let name = key.as_str();
        if name == "host" || name == "connection" || name == "transfer-encoding" {
            continue;
        }
        builder = builder.header(key, value);
    }

    let upstream_req = match builder.body(req.into_body()) {
        Ok(request) => request,
        Err(error) => {
            tracing::error!(%error, "failed to build upstream request");
            return bad_gateway();
        }
    };

    match state.client.request(upstream_req).await {
        Ok(response) => response.map(Body::new),
        Err(error) => {
            tracing::error!(%error, upstream = %upstream_uri, "upstream request failed");
            bad_gateway()
        }
    }
}

/// Build an HTTP response from a served snapshot.
fn build_response(served: &Served, generation: &str) -> Response<Body> {
    let mut builder = Response::builder().status(served.response.status);

    for (key, value) in &served.response.headers {
        if let Ok(value) = HeaderValue::from_str(value) {
            builder = builder.header(key.as_str(), value);
        }
    }

    builder = builder.header("X-Cache", if served.is_hit() { "HIT" } else { "MISS" });
    if let Ok(value) = HeaderValue::from_str(generation) {
        builder = builder.header("X-Generation", value);
    }

    builder
        .body(Body::from(served.response.body.clone()))
        .unwrap_or_else(|_| bad_gateway())
}

fn bad_gateway() -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Body::from("Bad Gateway"))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use offgate_cache::BypassReason;

    fn policy() -> PolicyConfig {
        PolicyConfig {
            origin: Url::parse("http://app.example.com").unwrap(),
            bypass_hosts: vec![],
        }
    }

    fn request(method: &str, target: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(target)
            .header("host", "app.example.com")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn descriptor_reconstructs_absolute_url() {
        let descriptor = describe(&request("GET", "/assets/app.js?v=2"), &policy()).unwrap();
        assert_eq!(
            descriptor.url.as_str(),
            "http://app.example.com/assets/app.js?v=2"
        );
        assert_eq!(descriptor.method, Method::Get);
        assert_eq!(descriptor.credentials, CredentialsMode::Omit);
    }

    #[test]
    fn cookie_marks_request_credentialed() {
        let mut req = request("GET", "/feed");
        req.headers_mut()
            .insert("cookie", HeaderValue::from_static("session=abc"));
        let descriptor = describe(&req, &policy()).unwrap();
        assert_eq!(descriptor.credentials, CredentialsMode::Include);
        assert_eq!(
            classify(&descriptor, &policy()),
            Classification::Bypass(BypassReason::Credentials)
        );
    }

    #[test]
    fn foreign_host_is_ignored_not_cached() {
        let mut req = request("GET", "/widget.js");
        req.headers_mut()
            .insert("host", HeaderValue::from_static("partner.example.com"));
        let descriptor = describe(&req, &policy()).unwrap();
        assert_eq!(classify(&descriptor, &policy()), Classification::Ignore);
    }

    #[test]
    fn unknown_verbs_bypass() {
        let descriptor = describe(&request("TRACE", "/"), &policy()).unwrap();
        assert_eq!(
            classify(&descriptor, &policy()),
            Classification::Bypass(BypassReason::Method)
        );
    }

    #[test]
    fn api_request_with_bearer_token_bypasses() {
        let mut req = request("POST", "/api/posts");
        req.headers_mut()
            .insert("authorization", HeaderValue::from_static("Bearer xyz"));
        let descriptor = describe(&req, &policy()).unwrap();
        assert!(matches!(
            classify(&descriptor, &policy()),
            Classification::Bypass(_)
        ));
    }
}
