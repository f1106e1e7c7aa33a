//! Shared fakes for the service worker integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use sitekit_net::{Fetcher, NetError, Request, Response};
use sitekit_sw::{
    BuildManifest, CacheStorage, MemoryCacheStorage, OfflineCacheManager, ServiceWorkerEvent,
    ServiceWorkerHost, WorkerContext,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Notify, Semaphore};
use url::Url;

pub const ORIGIN: &str = "https://learn.example.com";

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn get(path: &str) -> Request {
    Request::get(url(path))
}

/// Scripted network. Unknown URLs answer 404.
#[derive(Default)]
pub struct MockNetwork {
    routes: Mutex<HashMap<String, (StatusCode, String)>>,
    offline: AtomicBool,
    fail_next: AtomicUsize,
    calls: Mutex<Vec<String>>,
    held: Mutex<HashMap<String, Arc<Semaphore>>>,
    entered: Notify,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, path: &str, body: &str) {
        self.route_status(path, StatusCode::OK, body);
    }

    pub fn route_status(&self, path: &str, status: StatusCode, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(url(path).to_string(), (status, body.to_string()));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` fetches with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Park fetches of `path` at the network until [`release`](Self::release).
    pub fn hold(&self, path: &str) {
        self.held
            .lock()
            .unwrap()
            .insert(url(path).to_string(), Arc::new(Semaphore::new(0)));
    }

    /// Wait until a held fetch has reached the network.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self, path: &str) {
        if let Some(gate) = self.held.lock().unwrap().remove(url(path).as_str()) {
            gate.add_permits(1);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Fetcher for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.lock().unwrap().push(request.url.to_string());

        let gate = self.held.lock().unwrap().get(request.url.as_str()).cloned();
        if let Some(gate) = gate {
            self.entered.notify_one();
            let _ = gate.acquire().await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline);
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(NetError::RequestFailed(format!("{}: connection reset", request.url)));
        }

        let (status, body) = self
            .routes
            .lock()
            .unwrap()
            .get(request.url.as_str())
            .cloned()
            .unwrap_or((StatusCode::NOT_FOUND, "not found".to_string()));
        Ok(Response::new(request.url.clone(), status, HeaderMap::new(), body))
    }
}

pub type TestManager<S = MemoryCacheStorage> = OfflineCacheManager<S, MockNetwork>;
pub type TestHost<S = MemoryCacheStorage> = ServiceWorkerHost<S, MockNetwork>;

pub fn manifest(version: &str, build: &[&str]) -> BuildManifest {
    BuildManifest::new(version, build.iter().map(|p| p.to_string()).collect())
}

pub fn manager<S: CacheStorage + 'static>(
    manifest: &BuildManifest,
    caches: &Arc<S>,
    network: &Arc<MockNetwork>,
) -> Arc<TestManager<S>> {
    let context = WorkerContext::new(manifest, Url::parse(ORIGIN).unwrap()).unwrap();
    Arc::new(OfflineCacheManager::new(
        context,
        Arc::clone(caches),
        Arc::clone(network),
    ))
}

pub fn host<S: CacheStorage + 'static>() -> (TestHost<S>, UnboundedReceiver<ServiceWorkerEvent>) {
    ServiceWorkerHost::new(url("/"))
}

pub fn drain(rx: &mut UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sitekit_sw=debug")
        .with_test_writer()
        .try_init();
}
