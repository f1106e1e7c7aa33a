//! Pages controlled by the worker.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use url::Url;

use crate::host::ServiceWorkerId;
use crate::SwResult;

/// Client control primitives the hosting runtime offers to a worker.
#[async_trait]
pub trait ClientControl: Send + Sync {
    /// Activate the installing worker as soon as its install finishes,
    /// without waiting for existing clients to close.
    async fn skip_waiting(&self) -> SwResult<()>;

    /// Make the active worker the controller of every open client.
    async fn claim(&self) -> SwResult<()>;
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
}

/// An open page or worker.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Worker currently controlling this client.
    pub controller: Option<ServiceWorkerId>,
}

/// Open clients, by id.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Every client, sorted by id.
    pub fn all(&self) -> Vec<Client> {
        let mut all: Vec<Client> = self.clients.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Register a window client.
    pub fn open_window(&mut self, url: Url, controller: Option<ServiceWorkerId>) -> Client {
        let client = Client {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            controller,
        };
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Set `controller` on every client. Returns the ids that changed.
    pub fn claim(&mut self, controller: ServiceWorkerId) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.controller != Some(controller))
            .map(|c| {
                c.controller = Some(controller);
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:08}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://learn.example.com/").unwrap()
    }

    #[test]
    fn test_open_window() {
        let mut clients = Clients::new();
        let client = clients.open_window(url(), None);

        assert_eq!(client.client_type, ClientType::Window);
        assert!(client.controller.is_none());
        assert!(clients.get(&client.id).is_some());
    }

    #[test]
    fn test_claim_reports_changed_clients() {
        let mut clients = Clients::new();
        let worker = ServiceWorkerId::from_raw(7);
        let a = clients.open_window(url(), None);
        let b = clients.open_window(url(), Some(worker));

        let changed = clients.claim(worker);
        assert_eq!(changed, vec![a.id.clone()]);
        assert!(clients.all().iter().all(|c| c.controller == Some(worker)));
        assert!(clients.get(&b.id).is_some());

        assert!(clients.claim(worker).is_empty());
    }

    #[test]
    fn test_remove() {
        let mut clients = Clients::new();
        let client = clients.open_window(url(), None);
        assert!(clients.remove(&client.id).is_some());
        assert!(clients.is_empty());
    }
}
