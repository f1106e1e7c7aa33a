//! The offline cache manager: install, activate and fetch handlers.

use std::sync::Arc;

use futures::future::try_join_all;
use http::StatusCode;
use sitekit_net::{Fetcher, Request, Response};
use tracing::{debug, info, trace, warn};

use crate::cache::CacheStorage;
use crate::clients::ClientControl;
use crate::context::WorkerContext;
use crate::event::ExtendableEvent;
use crate::{ServiceWorkerError, SwResult};

/// Event handlers for one worker version.
///
/// Holds no mutable state of its own: everything it remembers lives in the
/// shared cache storage.
pub struct OfflineCacheManager<S, F> {
    context: Arc<WorkerContext>,
    caches: Arc<S>,
    network: Arc<F>,
}

impl<S, F> OfflineCacheManager<S, F>
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
{
    pub fn new(context: WorkerContext, caches: Arc<S>, network: Arc<F>) -> Self {
        Self {
            context: Arc::new(context),
            caches,
            network,
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    pub fn caches(&self) -> &Arc<S> {
        &self.caches
    }

    /// Install handler.
    ///
    /// Fetches every manifest path and stores them in the asset bucket. Any
    /// transport error or non-2xx response fails the install and nothing is
    /// stored. On success, asks the host to skip waiting.
    pub async fn install(&self, clients: &dyn ClientControl) -> SwResult<()> {
        let cache = self.context.asset_cache();
        self.caches.open(cache).await?;

        let requests = self.context.manifest_requests()?;
        info!(
            version = %self.context.version(),
            cache,
            assets = requests.len(),
            "Precaching build assets"
        );

        let network = &self.network;
        let exchanges = try_join_all(requests.into_iter().map(|request| async move {
            let response = network.fetch(&request).await.map_err(|e| {
                ServiceWorkerError::InstallFailed(format!("{}: {}", request.url, e))
            })?;
            if !response.ok() {
                return Err(ServiceWorkerError::InstallFailed(format!(
                    "{}: status {}",
                    request.url, response.status
                )));
            }
            trace!(url = %request.url, bytes = response.body().len(), "Precached");
            Ok((request, response))
        }))
        .await
        .inspect_err(|e| warn!(version = %self.context.version(), error = %e, "Install failed"))?;

        self.caches.put_all(cache, &exchanges).await?;
        clients.skip_waiting().await?;

        info!(version = %self.context.version(), cache, "Install complete");
        Ok(())
    }

    /// Activate handler.
    ///
    /// Deletes every bucket whose name is not this version's asset bucket,
    /// runtime buckets included, then claims all open clients.
    pub async fn activate(&self, clients: &dyn ClientControl) -> SwResult<()> {
        let current = self.context.asset_cache();
        let stale: Vec<String> = self
            .caches
            .keys()
            .await?
            .into_iter()
            .filter(|name| name != current)
            .collect();

        try_join_all(stale.iter().map(|name| self.caches.delete(name))).await?;
        for name in &stale {
            info!(cache = %name, "Deleted stale cache");
        }

        clients.claim().await?;
        info!(version = %self.context.version(), "Activated");
        Ok(())
    }

    /// Fetch handler.
    ///
    /// Returns `None` when the request is left to default network handling.
    /// Cache writes are registered on `event`, after the response is ready.
    pub async fn handle_fetch(
        &self,
        request: &Request,
        event: &ExtendableEvent,
    ) -> Option<SwResult<Response>> {
        if !self.context.should_intercept(request) {
            trace!(url = %request.url, method = %request.method, "Not intercepted");
            return None;
        }
        Some(self.respond(request, event).await)
    }

    /// Manifest paths are answered from the asset bucket. On a miss they are
    /// fetched and written back into the asset bucket rather than the runtime
    /// bucket, so the runtime bucket never holds manifest paths. The offline
    /// fallback for that branch looks in the asset bucket too, and only hits
    /// if another fetch refreshed the same path in the meantime.
    ///
    /// Every other path goes through the runtime bucket.
    async fn respond(&self, request: &Request, event: &ExtendableEvent) -> SwResult<Response> {
        if !self.context.is_static_asset(&request.url) {
            return self
                .fetch_and_cache(self.context.offline_cache(), request, event)
                .await;
        }

        let cache = self.context.asset_cache();
        match self.caches.match_request(cache, request).await {
            Ok(Some(hit)) => {
                debug!(url = %request.url, cache, "Served from asset cache");
                return Ok(hit);
            }
            Ok(None) => debug!(url = %request.url, cache, "Manifest asset not cached"),
            Err(e) => warn!(url = %request.url, cache, error = %e, "Asset cache lookup failed"),
        }

        self.fetch_and_cache(cache, request, event).await
    }

    async fn fetch_and_cache(
        &self,
        cache: &str,
        request: &Request,
        event: &ExtendableEvent,
    ) -> SwResult<Response> {
        self.caches.open(cache).await?;

        match self.network.fetch(request).await {
            Ok(response) => {
                if response.status == StatusCode::PARTIAL_CONTENT {
                    debug!(url = %request.url, "Not caching partial response");
                } else {
                    self.store_later(cache, request, &response, event);
                }
                Ok(response)
            }
            Err(err) => match self.caches.match_request(cache, request).await {
                Ok(Some(fallback)) => {
                    info!(url = %request.url, cache, error = %err, "Network failed, served cached copy");
                    Ok(fallback)
                }
                Ok(None) => {
                    debug!(url = %request.url, error = %err, "Network failed, nothing cached");
                    Err(err.into())
                }
                Err(lookup) => {
                    warn!(url = %request.url, cache, error = %lookup, "Fallback lookup failed");
                    Err(err.into())
                }
            },
        }
    }

    fn store_later(
        &self,
        cache: &str,
        request: &Request,
        response: &Response,
        event: &ExtendableEvent,
    ) {
        let caches = Arc::clone(&self.caches);
        let cache = cache.to_string();
        let request = request.clone();
        let response = response.clone();

        // A newer version's activation may have deleted the bucket while the
        // network was busy; the write must not bring it back.
        event.wait_until(async move {
            match caches.put_if_open(&cache, &request, &response).await {
                Ok(true) => trace!(url = %request.url, cache = %cache, "Stored runtime copy"),
                Ok(false) => debug!(url = %request.url, cache = %cache, "Bucket gone, copy dropped"),
                Err(e) => warn!(url = %request.url, cache = %cache, error = %e, "Cache put failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::manifest::BuildManifest;
    use async_trait::async_trait;
    use http::HeaderMap;
    use sitekit_net::NetError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    /// Answers every request with its own path as the body.
    #[derive(Default)]
    struct EchoNetwork {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for EchoNetwork {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Response::new(
                request.url.clone(),
                StatusCode::OK,
                HeaderMap::new(),
                request.url.path().to_string(),
            ))
        }
    }

    #[derive(Default)]
    struct RecordingClients {
        skipped: AtomicUsize,
        claimed: AtomicUsize,
    }

    #[async_trait]
    impl ClientControl for RecordingClients {
        async fn skip_waiting(&self) -> SwResult<()> {
            self.skipped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn claim(&self) -> SwResult<()> {
            self.claimed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager() -> OfflineCacheManager<MemoryCacheStorage, EchoNetwork> {
        let manifest = BuildManifest::new("v1", vec!["/a.js".to_string()]);
        let context =
            WorkerContext::new(&manifest, Url::parse("https://learn.example.com").unwrap()).unwrap();
        OfflineCacheManager::new(
            context,
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(EchoNetwork::default()),
        )
    }

    #[tokio::test]
    async fn test_install_requests_skip_waiting() {
        let manager = manager();
        let clients = RecordingClients::default();

        manager.install(&clients).await.unwrap();

        assert_eq!(clients.skipped.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.caches().entries("cachev1").await.unwrap(),
            vec!["GET https://learn.example.com/a.js"]
        );
    }

    #[tokio::test]
    async fn test_activate_claims_clients() {
        let manager = manager();
        let clients = RecordingClients::default();
        manager.caches().open("cachev0").await.unwrap();

        manager.install(&clients).await.unwrap();
        manager.activate(&clients).await.unwrap();

        assert_eq!(clients.claimed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.caches().keys().await.unwrap(), vec!["cachev1"]);
    }

    #[tokio::test]
    async fn test_partial_content_is_not_stored() {
        struct PartialNetwork;

        #[async_trait]
        impl Fetcher for PartialNetwork {
            async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
                Ok(Response::new(
                    request.url.clone(),
                    StatusCode::PARTIAL_CONTENT,
                    HeaderMap::new(),
                    "part",
                ))
            }
        }

        let manifest = BuildManifest::new("v1", vec![]);
        let context =
            WorkerContext::new(&manifest, Url::parse("https://learn.example.com").unwrap()).unwrap();
        let manager = OfflineCacheManager::new(
            context,
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(PartialNetwork),
        );

        let request = Request::parse_get("https://learn.example.com/video").unwrap();
        let event = ExtendableEvent::new();
        let response = manager.handle_fetch(&request, &event).await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(event.pending(), 0);
        event.settled().await;

        assert!(manager.caches().entries("offlinev1").await.unwrap().is_empty());
    }
}
