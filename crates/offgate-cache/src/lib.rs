//! Offline cache gatekeeper.
//!
//! A policy engine that sits in front of a network seam and decides, per
//! request, whether to intercept: same-origin uncredentialed GETs are served
//! cache-first out of a versioned *generation* store, while API and
//! auth-bearing traffic is guaranteed to pass through untouched. Generations
//! are superseded wholesale on version bumps; there is no per-entry eviction.

pub mod classify;
pub mod engine;
pub mod memory;
pub mod traits;

pub use classify::{
    classify, BypassReason, Classification, CredentialsMode, Method, PolicyConfig,
    RequestDescriptor,
};
pub use engine::{Gatekeeper, GatekeeperStats, Phase, Served, ServedFrom, SKIP_WAITING_TYPE};
pub use memory::MemoryStore;
pub use traits::{
    CacheStore, FetchError, FetchRequest, Fetcher, ResponseKind, StoreError, StoredResponse,
};
