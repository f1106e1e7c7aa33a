//! Worker host: registration slots, lifecycle states and client control.
//!
//! Plays the hosting runtime's part. Each lifecycle event runs as its own
//! tokio task; the host only moves a worker to its next state after that
//! task has finished.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sitekit_common::{retry_with_backoff, RetryConfig};
use sitekit_net::{Fetcher, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{Client, ClientControl, Clients};
use crate::event::ExtendableEvent;
use crate::manager::OfflineCacheManager;
use crate::{ServiceWorkerError, SwResult};

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, no event dispatched yet.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and intercepting fetches.
    Activated,
    /// Install failed or replaced by a newer worker.
    Redundant,
}

/// One worker version.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Build version this worker serves.
    pub version: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    fn new(version: String) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            version,
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

/// Notifications sent to whoever holds the host's event receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new version started installing.
    UpdateFound { version: String },
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        version: String,
        new_state: ServiceWorkerState,
    },
    /// A client got a new controller.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

// ==================== Registration ====================

struct WorkerSlot<S, F> {
    worker: ServiceWorker,
    manager: Arc<OfflineCacheManager<S, F>>,
    skip_waiting: bool,
}

struct Registration<S, F> {
    installing: Option<WorkerSlot<S, F>>,
    waiting: Option<WorkerSlot<S, F>>,
    active: Option<WorkerSlot<S, F>>,
}

impl<S, F> Default for Registration<S, F> {
    fn default() -> Self {
        Self {
            installing: None,
            waiting: None,
            active: None,
        }
    }
}

struct HostState<S, F> {
    scope: Url,
    registration: RwLock<Registration<S, F>>,
    clients: RwLock<Clients>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
    /// Background work extended from fetch events.
    lifetimes: StdMutex<JoinSet<()>>,
}

impl<S, F> HostState<S, F> {
    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn transition(&self, slot: &mut WorkerSlot<S, F>, state: ServiceWorkerState) {
        slot.worker.set_state(state);
        debug!(worker = slot.worker.id.raw(), version = %slot.worker.version, ?state, "Worker state changed");
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: slot.worker.id,
            version: slot.worker.version.clone(),
            new_state: state,
        });
    }

    fn retire(&self, slot: Option<WorkerSlot<S, F>>) {
        if let Some(mut slot) = slot {
            self.transition(&mut slot, ServiceWorkerState::Redundant);
        }
    }

    fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }
}

#[async_trait]
impl<S, F> ClientControl for HostState<S, F>
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
{
    async fn skip_waiting(&self) -> SwResult<()> {
        let mut registration = self.registration.write().await;
        match registration.installing.as_mut() {
            Some(slot) => {
                debug!(worker = slot.worker.id.raw(), "Skip waiting requested");
                slot.skip_waiting = true;
            }
            None => debug!("Skip waiting outside install, ignored"),
        }
        Ok(())
    }

    async fn claim(&self) -> SwResult<()> {
        let controller = self
            .registration
            .read()
            .await
            .active
            .as_ref()
            .map(|slot| slot.worker.id)
            .ok_or_else(|| ServiceWorkerError::StateError("no active worker to claim with".into()))?;

        let changed = self.clients.write().await.claim(controller);
        info!(worker = controller.raw(), clients = changed.len(), "Claimed clients");
        for client_id in changed {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id: controller,
            });
        }
        Ok(())
    }
}

// ==================== Host ====================

/// Hosts successive worker versions for one scope.
pub struct ServiceWorkerHost<S, F> {
    state: Arc<HostState<S, F>>,
}

impl<S, F> Clone for ServiceWorkerHost<S, F> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<S, F> ServiceWorkerHost<S, F>
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
{
    /// Create a host for `scope` and the receiver for its events.
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = HostState {
            scope,
            registration: RwLock::new(Registration::default()),
            clients: RwLock::new(Clients::new()),
            event_tx,
            lifetimes: StdMutex::new(JoinSet::new()),
        };
        (
            Self {
                state: Arc::new(state),
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.state.scope
    }

    /// Install a worker version.
    ///
    /// The install event runs as its own task. On failure the worker becomes
    /// redundant and the error is returned. On success the worker waits,
    /// or activates straight away if it asked to skip waiting. The previous
    /// active worker keeps serving fetches throughout.
    pub async fn install(
        &self,
        manager: Arc<OfflineCacheManager<S, F>>,
    ) -> SwResult<ServiceWorkerId> {
        let version = manager.context().version().to_string();
        let id = {
            let mut registration = self.state.registration.write().await;
            self.state.retire(registration.installing.take());

            let mut slot = WorkerSlot {
                worker: ServiceWorker::new(version.clone()),
                manager: Arc::clone(&manager),
                skip_waiting: false,
            };
            self.state.emit(ServiceWorkerEvent::UpdateFound {
                version: version.clone(),
            });
            self.state.transition(&mut slot, ServiceWorkerState::Installing);
            let id = slot.worker.id;
            registration.installing = Some(slot);
            id
        };

        let clients = Arc::clone(&self.state);
        let outcome = tokio::spawn(async move { manager.install(clients.as_ref()).await })
            .await
            .unwrap_or_else(|e| Err(ServiceWorkerError::StateError(format!("install task: {e}"))));

        let skip_waiting = {
            let mut registration = self.state.registration.write().await;
            let Some(mut slot) = registration
                .installing
                .take_if(|slot| slot.worker.id == id)
            else {
                return Err(ServiceWorkerError::StateError(format!(
                    "worker for {version} was superseded during install"
                )));
            };

            if let Err(e) = outcome {
                self.state.transition(&mut slot, ServiceWorkerState::Redundant);
                return Err(e);
            }

            self.state.transition(&mut slot, ServiceWorkerState::Installed);
            let skip_waiting = slot.skip_waiting;
            self.state.retire(registration.waiting.replace(slot));
            skip_waiting
        };

        if skip_waiting {
            self.activate_waiting().await?;
        } else {
            info!(version = %version, "Installed, waiting for activation");
        }
        Ok(id)
    }

    /// [`install`](Self::install), retried with backoff on failure.
    ///
    /// Every attempt installs a fresh worker.
    pub async fn install_with_retry(
        &self,
        manager: Arc<OfflineCacheManager<S, F>>,
        retry: &RetryConfig,
    ) -> SwResult<ServiceWorkerId> {
        retry_with_backoff(retry, || self.install(Arc::clone(&manager))).await
    }

    /// Promote the waiting worker and run its activate event.
    ///
    /// A failing activate handler still leaves the worker activated; the
    /// error is returned for the caller to report.
    pub async fn activate_waiting(&self) -> SwResult<ServiceWorkerId> {
        let (id, manager) = {
            let mut registration = self.state.registration.write().await;
            let mut slot = registration
                .waiting
                .take()
                .ok_or_else(|| ServiceWorkerError::NotFound("no waiting worker".into()))?;

            self.state.retire(registration.active.take());
            self.state.transition(&mut slot, ServiceWorkerState::Activating);
            let handles = (slot.worker.id, Arc::clone(&slot.manager));
            registration.active = Some(slot);
            handles
        };

        let clients = Arc::clone(&self.state);
        let outcome = tokio::spawn(async move { manager.activate(clients.as_ref()).await })
            .await
            .unwrap_or_else(|e| Err(ServiceWorkerError::StateError(format!("activate task: {e}"))));

        {
            let mut registration = self.state.registration.write().await;
            if let Some(slot) = registration
                .active
                .as_mut()
                .filter(|slot| slot.worker.id == id)
            {
                self.state.transition(slot, ServiceWorkerState::Activated);
            }
        }

        if let Err(ref e) = outcome {
            warn!(worker = id.raw(), error = %e, "Activate handler failed");
        }
        outcome.map(|()| id)
    }

    /// Route a request through the active worker.
    ///
    /// `None` means the request was not intercepted (or no worker is active)
    /// and should go to the network as usual.
    pub async fn fetch(&self, request: Request) -> Option<SwResult<Response>> {
        let manager = {
            let registration = self.state.registration.read().await;
            registration
                .active
                .as_ref()
                .filter(|slot| slot.worker.is_active())
                .map(|slot| Arc::clone(&slot.manager))
        }?;

        let task = tokio::spawn(async move {
            let event = ExtendableEvent::new();
            let response = manager.handle_fetch(&request, &event).await;
            (response, event)
        });

        match task.await {
            Ok((response, event)) => {
                let mut lifetimes = self
                    .state
                    .lifetimes
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                while lifetimes.try_join_next().is_some() {}
                lifetimes.spawn(event.settled());
                response
            }
            Err(e) => Some(Err(ServiceWorkerError::StateError(format!("fetch task: {e}")))),
        }
    }

    /// Wait for all background work extended from fetch events.
    pub async fn settle(&self) {
        let mut lifetimes = {
            let mut guard = self
                .state
                .lifetimes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        while let Some(result) = lifetimes.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Fetch event lifetime task failed");
            }
        }
    }

    /// Open a window client. It is controlled by the active worker if the
    /// URL is in scope.
    pub async fn open_client(&self, url: Url) -> Client {
        let controller = if self.state.in_scope(&url) {
            self.active().await.map(|worker| worker.id)
        } else {
            None
        };
        self.state.clients.write().await.open_window(url, controller)
    }

    /// Close a client.
    pub async fn close_client(&self, id: &str) -> Option<Client> {
        self.state.clients.write().await.remove(id)
    }

    /// Snapshot of every open client.
    pub async fn clients(&self) -> Vec<Client> {
        self.state.clients.read().await.all()
    }

    /// The active worker, if any.
    pub async fn active(&self) -> Option<ServiceWorker> {
        let registration = self.state.registration.read().await;
        registration.active.as_ref().map(|slot| slot.worker.clone())
    }

    /// The waiting worker, if any.
    pub async fn waiting(&self) -> Option<ServiceWorker> {
        let registration = self.state.registration.read().await;
        registration.waiting.as_ref().map(|slot| slot.worker.clone())
    }

    /// The installing worker, if any.
    pub async fn installing(&self) -> Option<ServiceWorker> {
        let registration = self.state.registration.read().await;
        registration.installing.as_ref().map(|slot| slot.worker.clone())
    }
}
