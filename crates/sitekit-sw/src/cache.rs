//! Cache buckets and the storage they live in.

use async_trait::async_trait;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use sitekit_net::{Request, Response};
use tokio::sync::RwLock;
use url::Url;

use crate::{ServiceWorkerError, SwResult};

// ==================== Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response URL (after redirects).
    pub response_url: String,

    /// Response headers, in order, repeated names kept.
    pub headers: Vec<CachedHeader>,

    /// Response body.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage under `request`.
    pub fn from_exchange(request: &Request, response: &Response) -> Self {
        let mut url = request.url.clone();
        url.set_fragment(None);
        Self {
            url: url.to_string(),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            response_url: response.url.to_string(),
            headers: response
                .headers
                .iter()
                .map(|(name, value)| CachedHeader {
                    name: name.as_str().to_string(),
                    value: value.as_bytes().to_vec(),
                })
                .collect(),
            body: response.body().to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Key this entry is stored under.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    /// Rebuild the response.
    pub fn to_response(&self) -> SwResult<Response> {
        let url = Url::parse(&self.response_url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("{}: {}", self.response_url, e)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for header in &self.headers {
            let name = HeaderName::try_from(header.name.as_str())
                .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
            let value = HeaderValue::from_bytes(&header.value)
                .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Response::new(url, status, headers, self.body.clone()))
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One response header. Values are raw bytes; they need not be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedHeader {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Cache ====================

/// A named bucket of entries keyed by method + URL.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create an empty bucket.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.entries.get(&request.cache_key())
    }

    /// Store a response, replacing any previous one for the same request.
    pub fn put(&mut self, request: &Request, response: &Response) {
        let entry = CacheEntry::from_exchange(request, response);
        self.entries.insert(entry.key(), entry);
    }

    /// Delete an entry.
    pub fn delete(&mut self, request: &Request) -> bool {
        self.entries.remove(&request.cache_key()).is_some()
    }

    /// Sorted entry keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Storage ====================

/// Named, persistent cache buckets shared by every event handler.
///
/// `put` and `match_request` are atomic per key.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the bucket if it does not exist.
    async fn open(&self, name: &str) -> SwResult<()>;

    /// Whether the bucket exists.
    async fn has(&self, name: &str) -> SwResult<bool>;

    /// Every bucket name, sorted.
    async fn keys(&self) -> SwResult<Vec<String>>;

    /// Delete a bucket. Returns whether it existed.
    async fn delete(&self, name: &str) -> SwResult<bool>;

    /// Store `response` under `request`, creating the bucket if needed.
    async fn put(&self, cache: &str, request: &Request, response: &Response) -> SwResult<()>;

    /// Store `response` under `request` only if the bucket still exists.
    ///
    /// Returns whether the entry was written. Never recreates a deleted
    /// bucket.
    async fn put_if_open(&self, cache: &str, request: &Request, response: &Response)
        -> SwResult<bool>;

    /// Store several responses as one write.
    async fn put_all(&self, cache: &str, exchanges: &[(Request, Response)]) -> SwResult<()> {
        for (request, response) in exchanges {
            self.put(cache, request, response).await?;
        }
        Ok(())
    }

    /// Look up `request` in one bucket.
    async fn match_request(&self, cache: &str, request: &Request) -> SwResult<Option<Response>>;

    /// Entry keys of one bucket, sorted. Empty if the bucket does not exist.
    async fn entries(&self, cache: &str) -> SwResult<Vec<String>>;
}

/// In-process cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> SwResult<()> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        Ok(())
    }

    async fn has(&self, name: &str) -> SwResult<bool> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn keys(&self) -> SwResult<Vec<String>> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> SwResult<bool> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn put(&self, cache: &str, request: &Request, response: &Response) -> SwResult<()> {
        self.caches
            .write()
            .await
            .entry(cache.to_string())
            .or_insert_with(|| Cache::new(cache))
            .put(request, response);
        Ok(())
    }

    async fn put_if_open(
        &self,
        cache: &str,
        request: &Request,
        response: &Response,
    ) -> SwResult<bool> {
        let mut caches = self.caches.write().await;
        match caches.get_mut(cache) {
            Some(bucket) => {
                bucket.put(request, response);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn put_all(&self, cache: &str, exchanges: &[(Request, Response)]) -> SwResult<()> {
        let mut caches = self.caches.write().await;
        let bucket = caches
            .entry(cache.to_string())
            .or_insert_with(|| Cache::new(cache));
        for (request, response) in exchanges {
            bucket.put(request, response);
        }
        Ok(())
    }

    async fn match_request(&self, cache: &str, request: &Request) -> SwResult<Option<Response>> {
        let caches = self.caches.read().await;
        caches
            .get(cache)
            .and_then(|bucket| bucket.match_request(request))
            .map(CacheEntry::to_response)
            .transpose()
    }

    async fn entries(&self, cache: &str) -> SwResult<Vec<String>> {
        Ok(self
            .caches
            .read()
            .await
            .get(cache)
            .map(Cache::keys)
            .unwrap_or_default())
    }
}
