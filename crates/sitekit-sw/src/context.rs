//! Immutable per-version worker state.

use hashbrown::HashSet;
use sitekit_net::{Request, RequestCache};
use url::Url;

use crate::manifest::BuildManifest;
use crate::{ServiceWorkerError, SwResult};

/// Prefix of the bucket holding precached manifest assets.
pub const ASSET_CACHE_PREFIX: &str = "cache";

/// Prefix of the bucket holding runtime responses.
pub const OFFLINE_CACHE_PREFIX: &str = "offline";

/// Everything a worker version knows, fixed when the worker starts.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    version: String,
    origin: Url,
    manifest_paths: Vec<String>,
    manifest_set: HashSet<String>,
    asset_cache: String,
    offline_cache: String,
}

impl WorkerContext {
    /// Build the context for `manifest`, served from `origin`.
    ///
    /// Duplicate manifest paths are collapsed, keeping the first occurrence.
    pub fn new(manifest: &BuildManifest, origin: Url) -> SwResult<Self> {
        manifest.validate()?;
        if !matches!(origin.scheme(), "http" | "https") || origin.host_str().is_none() {
            return Err(ServiceWorkerError::ConfigError(format!(
                "origin '{origin}' is not an http(s) origin"
            )));
        }

        let mut manifest_set = HashSet::with_capacity(manifest.len());
        let manifest_paths: Vec<String> = manifest
            .paths()
            .filter(|p| manifest_set.insert(p.to_string()))
            .map(str::to_string)
            .collect();

        Ok(Self {
            asset_cache: asset_cache_name(&manifest.version),
            offline_cache: offline_cache_name(&manifest.version),
            version: manifest.version.clone(),
            origin,
            manifest_paths,
            manifest_set,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Name of this version's asset bucket.
    pub fn asset_cache(&self) -> &str {
        &self.asset_cache
    }

    /// Name of this version's runtime bucket.
    pub fn offline_cache(&self) -> &str {
        &self.offline_cache
    }

    /// Manifest paths in install order.
    pub fn manifest_paths(&self) -> &[String] {
        &self.manifest_paths
    }

    /// GET requests for every manifest path, resolved against the origin.
    pub fn manifest_requests(&self) -> SwResult<Vec<Request>> {
        self.manifest_paths
            .iter()
            .map(|path| {
                self.origin
                    .join(path)
                    .map(Request::get)
                    .map_err(|e| ServiceWorkerError::ManifestError(format!("{path}: {e}")))
            })
            .collect()
    }

    /// Same hostname and port as the worker's origin.
    pub fn is_local(&self, url: &Url) -> bool {
        url.host_str() == self.origin.host_str() && url.port() == self.origin.port()
    }

    /// Local URL whose path is in the manifest set.
    pub fn is_static_asset(&self, url: &Url) -> bool {
        self.is_local(url) && self.manifest_set.contains(url.path())
    }

    /// Whether the fetch handler takes over this request.
    ///
    /// GET only, no byte ranges, http(s) only, same origin, and not an
    /// `only-if-cached` request for something that is not precached.
    pub fn should_intercept(&self, request: &Request) -> bool {
        if request.method != http::Method::GET || request.has_range() {
            return false;
        }
        if !request.is_http() || !self.is_local(&request.url) {
            return false;
        }
        let uncached =
            request.cache == RequestCache::OnlyIfCached && !self.is_static_asset(&request.url);
        !uncached
    }
}

/// Asset bucket name for a version.
pub fn asset_cache_name(version: &str) -> String {
    format!("{ASSET_CACHE_PREFIX}{version}")
}

/// Runtime bucket name for a version.
pub fn offline_cache_name(version: &str) -> String {
    format!("{OFFLINE_CACHE_PREFIX}{version}")
}
