//! Cache storage persisted as one JSON file per bucket.
//!
//! ```text
//! <dir>/
//!   cache1700000000.json      bucket "cache1700000000"
//!   offline1700000000.json    bucket "offline1700000000"
//! ```
//!
//! Bucket names are percent-encoded into file names. Each write replaces the
//! whole file through a temporary file and a rename, so readers never see a
//! half-written bucket.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use hashbrown::HashMap;
use sitekit_net::{Request, Response};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::cache::{Cache, CacheEntry, CacheStorage};
use crate::{ServiceWorkerError, SwResult};

const BUCKET_EXTENSION: &str = "json";

/// Cache buckets stored under a directory.
#[derive(Debug)]
pub struct DiskCacheStorage {
    dir: PathBuf,
    /// One write lock per bucket name.
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DiskCacheStorage {
    /// Use `dir` as the storage root, creating it if needed.
    pub async fn open_dir(dir: impl Into<PathBuf>) -> SwResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        debug!(dir = %dir.display(), "Opened disk cache storage");
        Ok(Self {
            dir,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    /// Storage root.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn bucket_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{BUCKET_EXTENSION}", urlencoding::encode(name)))
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_bucket(&self, name: &str) -> SwResult<Option<Cache>> {
        let path = self.bucket_path(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ServiceWorkerError::CacheError(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn write_bucket(&self, cache: &Cache) -> SwResult<()> {
        let path = self.bucket_path(&cache.name);
        let tmp = path.with_extension(format!("{BUCKET_EXTENSION}.tmp"));
        let json = serde_json::to_vec(cache)
            .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;

        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;

        trace!(bucket = %cache.name, entries = cache.len(), "Wrote bucket");
        Ok(())
    }

    /// Read-modify-write one bucket under its lock.
    async fn update_bucket<F>(&self, name: &str, update: F) -> SwResult<()>
    where
        F: FnOnce(&mut Cache) + Send,
    {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let mut cache = self.read_bucket(name).await?.unwrap_or_else(|| Cache::new(name));
        update(&mut cache);
        self.write_bucket(&cache).await
    }
}

fn io_error(path: &Path, err: std::io::Error) -> ServiceWorkerError {
    ServiceWorkerError::CacheError(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> SwResult<()> {
        if self.has(name).await? {
            return Ok(());
        }
        self.update_bucket(name, |_| {}).await
    }

    async fn has(&self, name: &str) -> SwResult<bool> {
        tokio::fs::try_exists(self.bucket_path(name))
            .await
            .map_err(|e| io_error(&self.dir, e))
    }

    async fn keys(&self) -> SwResult<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(&self.dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BUCKET_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match urlencoding::decode(stem) {
                Ok(name) => names.push(name.into_owned()),
                Err(e) => debug!(file = %path.display(), error = %e, "Skipping foreign file"),
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> SwResult<bool> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let path = self.bucket_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn put(&self, cache: &str, request: &Request, response: &Response) -> SwResult<()> {
        self.update_bucket(cache, |bucket| bucket.put(request, response))
            .await
    }

    async fn put_if_open(
        &self,
        cache: &str,
        request: &Request,
        response: &Response,
    ) -> SwResult<bool> {
        let lock = self.lock_for(cache);
        let _guard = lock.lock().await;

        let Some(mut bucket) = self.read_bucket(cache).await? else {
            return Ok(false);
        };
        bucket.put(request, response);
        self.write_bucket(&bucket).await?;
        Ok(true)
    }

    async fn put_all(&self, cache: &str, exchanges: &[(Request, Response)]) -> SwResult<()> {
        self.update_bucket(cache, |bucket| {
            for (request, response) in exchanges {
                bucket.put(request, response);
            }
        })
        .await
    }

    async fn match_request(&self, cache: &str, request: &Request) -> SwResult<Option<Response>> {
        let Some(bucket) = self.read_bucket(cache).await? else {
            return Ok(None);
        };
        bucket
            .match_request(request)
            .map(CacheEntry::to_response)
            .transpose()
    }

    async fn entries(&self, cache: &str) -> SwResult<Vec<String>> {
        Ok(self
            .read_bucket(cache)
            .await?
            .map(|bucket| bucket.keys())
            .unwrap_or_default())
    }
}
