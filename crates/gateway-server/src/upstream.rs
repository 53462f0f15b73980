use axum::body::Body;
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use offgate_cache::{FetchError, FetchRequest, Fetcher, ResponseKind, StoredResponse};
use std::future::Future;
use std::time::Duration;

pub type HttpClient = Client<HttpConnector, Body>;

pub fn build_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// GET fetcher resolving requests against the configured upstream origin.
///
/// The gateway's public origin can differ from the upstream address, so the
/// request URL's path and query are re-rooted onto the upstream before the
/// fetch. Responses are buffered into immutable snapshots the engine can
/// store or pass through.
pub struct UpstreamFetcher {
    client: HttpClient,
    upstream: String,
    timeout: Duration,
}

impl UpstreamFetcher {
    pub fn new(client: HttpClient, upstream: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            upstream: upstream.into(),
            timeout,
        }
    }

    async fn fetch_once(&self, request: &FetchRequest) -> Result<StoredResponse, FetchError> {
        let path_and_query = match request.url.query() {
            Some(query) => format!("{}?{}", request.url.path(), query),
            None => request.url.path().to_string(),
        };
        let uri = format!("{}{}", self.upstream.trim_end_matches('/'), path_and_query);

        let mut builder = axum::http::Request::builder()
            .method(axum::http::Method::GET)
            .uri(&uri);
        for (key, value) in &request.headers {
            if key.eq_ignore_ascii_case("host") || key.eq_ignore_ascii_case("connection") {
                continue;
            }
            builder = builder.header(key.as_str(), value.as_str());
        }
        let upstream_req = builder
            .body(Body::empty())
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let response = self
            .client
            .request(upstream_req)
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(key, _)| {
                // Hop-by-hop headers make no sense in a stored snapshot.
                let key = key.as_str();
                key != "transfer-encoding" && key != "connection"
            })
            .map(|(key, value)| (key.to_string(), value.to_str().unwrap_or("").to_string()))
            .collect();

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?
            .to_bytes();

        // A direct fetch from our own upstream with no redirect following:
        // every response here is a basic one. The 200-status write gate
        // still decides what actually lands in the cache.
        Ok(StoredResponse {
            status,
            headers,
            body,
            kind: ResponseKind::Basic,
        })
    }
}

impl Fetcher for UpstreamFetcher {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<StoredResponse, FetchError>> + Send {
        async move {
            match tokio::time::timeout(self.timeout, self.fetch_once(request)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout),
            }
        }
    }
}
