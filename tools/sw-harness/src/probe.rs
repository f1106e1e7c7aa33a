//! Single-request probe: runs one request through the worker's fetch handler
//! and reports where the response came from.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use sitekit_net::{Fetcher, NetError, Request, Response};

/// Fetcher wrapper that counts network attempts and failures.
pub struct RecordingFetcher {
    inner: Box<dyn Fetcher>,
    calls: AtomicUsize,
    failures: AtomicUsize,
}

impl RecordingFetcher {
    pub fn new(inner: Box<dyn Fetcher>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for RecordingFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.fetch(request).await;
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

/// Where a probed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    /// Not intercepted; default network handling.
    Passthrough,
    /// Cache hit, no network attempt.
    Cache,
    /// Network response.
    Network,
    /// Network failed, cached copy served.
    CacheFallback,
}

impl Source {
    pub fn classify(intercepted: bool, calls: usize, failures: usize) -> Self {
        match (intercepted, calls, failures) {
            (false, _, _) => Self::Passthrough,
            (true, 0, _) => Self::Cache,
            (true, _, 0) => Self::Network,
            (true, _, _) => Self::CacheFallback,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Cache => "cache",
            Self::Network => "network",
            Self::CacheFallback => "cache-fallback",
        }
    }
}

/// Outcome of one probe.
#[derive(Debug, Serialize)]
pub struct FetchReport {
    pub url: String,
    pub source: Source,
    /// Bucket the handler used, when intercepted.
    pub bucket: Option<String>,
    pub status: Option<u16>,
    pub bytes: usize,
    pub error: Option<String>,
}

impl FetchReport {
    pub fn print(&self) {
        println!("{}", self.url);
        println!("  Source: {}", self.source.label());
        if let Some(ref bucket) = self.bucket {
            println!("  Bucket: {bucket}");
        }
        match (self.status, &self.error) {
            (Some(status), _) => println!("  Status: {status} ({} bytes)", self.bytes),
            (None, Some(error)) => println!("  Error:  {error}"),
            (None, None) => {}
        }
    }
}

/// One bucket and its entry keys.
#[derive(Debug, Serialize)]
pub struct BucketReport {
    pub name: String,
    pub entries: Vec<String>,
}

impl BucketReport {
    pub fn print(&self) {
        println!("{} ({} entries)", self.name, self.entries.len());
        for key in &self.entries {
            println!("  {key}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(Source::classify(false, 1, 0), Source::Passthrough);
        assert_eq!(Source::classify(true, 0, 0), Source::Cache);
        assert_eq!(Source::classify(true, 1, 0), Source::Network);
        assert_eq!(Source::classify(true, 1, 1), Source::CacheFallback);
    }

    #[test]
    fn test_report_serializes_source_in_kebab_case() {
        let report = FetchReport {
            url: "https://learn.example.com/posts/hello".to_string(),
            source: Source::CacheFallback,
            bucket: Some("offline1700000000".to_string()),
            status: Some(200),
            bytes: 14,
            error: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["source"], "cache-fallback");
        assert_eq!(json["bucket"], "offline1700000000");
    }

    #[tokio::test]
    async fn test_recording_fetcher_counts_failures() {
        let fetcher = RecordingFetcher::new(Box::new(sitekit_net::Offline));
        let request = Request::parse_get("https://learn.example.com/").unwrap();

        assert!(fetcher.fetch(&request).await.is_err());
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(fetcher.failures(), 1);
    }
}
