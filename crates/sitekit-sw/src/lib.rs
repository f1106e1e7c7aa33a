//! # SiteKit Service Worker
//!
//! Versioned offline cache for a statically generated site.
//!
//! ## Features
//!
//! - **Install**: precache every build, static and prerendered path for the
//!   current version into `cache<version>`, all or nothing
//! - **Activate**: delete every bucket from other versions, claim open clients
//! - **Fetch**: serve manifest assets from cache, everything else from the
//!   network with a runtime copy in `offline<version>` used when offline
//! - **Host**: registration slots, worker states, skip-waiting and clients
//!
//! ## Architecture
//!
//! ```text
//! BuildManifest ──► WorkerContext (version, manifest set, bucket names)
//!                        │
//!                        ▼
//! ServiceWorkerHost ─► OfflineCacheManager<S: CacheStorage, F: Fetcher>
//!     ├── installing         ├── install()      cache<version> ◄── network
//!     ├── waiting            ├── activate()     delete other buckets, claim
//!     ├── active             └── handle_fetch() cache hit | network + offline copy
//!     └── Clients
//! ```

use sitekit_common::SiteKitError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod context;
pub mod disk;
pub mod event;
pub mod host;
pub mod manager;
pub mod manifest;

pub use cache::{Cache, CacheEntry, CacheStorage, CachedHeader, MemoryCacheStorage};
pub use clients::{Client, ClientControl, ClientType, Clients};
pub use config::HostConfig;
pub use context::WorkerContext;
pub use disk::DiskCacheStorage;
pub use event::ExtendableEvent;
pub use host::{ServiceWorker, ServiceWorkerEvent, ServiceWorkerHost, ServiceWorkerId, ServiceWorkerState};
pub use manager::OfflineCacheManager;
pub use manifest::BuildManifest;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Manifest error: {0}")]
    ManifestError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sitekit_net::NetError> for ServiceWorkerError {
    fn from(err: sitekit_net::NetError) -> Self {
        Self::NetworkError(err.to_string())
    }
}

impl From<ServiceWorkerError> for SiteKitError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::NetworkError(msg) => SiteKitError::network(msg),
            ServiceWorkerError::CacheError(msg) => SiteKitError::cache(msg),
            ServiceWorkerError::ManifestError(msg) => SiteKitError::manifest(msg),
            ServiceWorkerError::ConfigError(msg) => SiteKitError::config(msg),
            ServiceWorkerError::NotFound(what) => SiteKitError::NotFound(what),
            other @ (ServiceWorkerError::InstallFailed(_) | ServiceWorkerError::StateError(_)) => {
                SiteKitError::worker(other.to_string())
            }
        }
    }
}

/// Result alias for service worker operations.
pub type SwResult<T> = Result<T, ServiceWorkerError>;
