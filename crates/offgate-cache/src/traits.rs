use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// How the network layer obtained a response.
///
/// Mirrors the response taxonomy that matters for caching: only `Basic`
/// (direct, same-origin, non-redirected) responses carry an inspectable
/// status and body that are safe to snapshot. Everything else is passed
/// through to the caller uncached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Basic,
    Cors,
    Opaque,
    Redirected,
}

/// Immutable response snapshot: the value stored per cache entry, and the
/// result type of every network fetch.
#[derive(Clone, Debug)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub kind: ResponseKind,
}

impl StoredResponse {
    /// Whether this response may be written to a generation: HTTP 200 and a
    /// direct same-origin result.
    pub fn is_storable(&self) -> bool {
        self.status == 200 && self.kind == ResponseKind::Basic
    }
}

/// A request the engine may serve from cache or forward to the network.
/// Only GETs ever reach the engine, so no method field is carried here.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
        }
    }

    /// Cache entry key: the normalized request identity. GET is the only
    /// method that gets this far, so the absolute URL is the whole identity.
    pub fn cache_key(&self) -> String {
        format!("GET:{}", self.url)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("generation {0:?} is not open")]
    UnknownGeneration(String),
    #[error("store backend unavailable: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network unreachable: {0}")]
    Network(String),
    #[error("upstream timed out")]
    Timeout,
}

/// Keyed store of cache generations.
///
/// A generation is a named, versioned bag of (request identity → response
/// snapshot) pairs. Exactly one generation is current at any time; the only
/// eviction mechanism is deleting a whole generation. Callers must treat
/// every operation as best-effort: a failing `lookup` degrades to a miss, a
/// failing `put` skips the write, and neither may abort the request being
/// served.
pub trait CacheStore: Send + Sync {
    /// Create the generation if it does not exist. Idempotent: reopening an
    /// existing generation keeps its entries.
    fn open(&self, generation: &str) -> Result<(), StoreError>;

    /// Look up a key. A missing generation is an ordinary miss, not an error.
    fn lookup(
        &self,
        generation: &str,
        key: &str,
    ) -> Result<Option<Arc<StoredResponse>>, StoreError>;

    /// Insert a snapshot, overwriting any previous entry for the key.
    /// Entries are immutable snapshots of idempotent GET responses, so
    /// concurrent writers for the same key simply last-write-win.
    fn put(
        &self,
        generation: &str,
        key: String,
        value: Arc<StoredResponse>,
    ) -> Result<(), StoreError>;

    /// Delete a whole generation. Returns whether it existed.
    fn delete(&self, generation: &str) -> Result<bool, StoreError>;

    /// Names of all generations currently in the store.
    fn list(&self) -> Result<Vec<String>, StoreError>;

    /// Number of entries in a generation (0 if it does not exist).
    fn len(&self, generation: &str) -> Result<usize, StoreError>;
}

/// The injected network seam. The engine only ever issues GETs through it;
/// anything that is not a plain same-origin GET never reaches the engine.
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<StoredResponse, FetchError>> + Send;
}
