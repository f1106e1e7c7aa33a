//! Build manifest: the version token and the paths a build wants precached.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ServiceWorkerError, SwResult};

/// What the site build hands to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    /// Opaque token, different for every build.
    pub version: String,

    /// Build output files (bundles, chunks, styles).
    #[serde(default)]
    pub build: Vec<String>,

    /// Files copied verbatim from the static directory.
    #[serde(default)]
    pub files: Vec<String>,

    /// Prerendered route paths.
    #[serde(default)]
    pub prerendered: Vec<String>,
}

impl BuildManifest {
    /// Create a manifest with only build files.
    pub fn new(version: impl Into<String>, build: Vec<String>) -> Self {
        Self {
            version: version.into(),
            build,
            files: Vec::new(),
            prerendered: Vec::new(),
        }
    }

    /// Parse and validate a JSON manifest.
    pub fn from_json(json: &str) -> SwResult<Self> {
        let manifest: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::ManifestError(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read, parse and validate a JSON manifest file.
    pub async fn load(path: impl AsRef<Path>) -> SwResult<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            ServiceWorkerError::ManifestError(format!("{}: {}", path.display(), e))
        })?;
        let manifest = Self::from_json(&json)?;
        debug!(
            path = %path.display(),
            version = %manifest.version,
            paths = manifest.len(),
            "Loaded build manifest"
        );
        Ok(manifest)
    }

    /// Check the version token and path shapes.
    pub fn validate(&self) -> SwResult<()> {
        if self.version.trim().is_empty() {
            return Err(ServiceWorkerError::ManifestError(
                "version token is empty".to_string(),
            ));
        }
        if let Some(bad) = self.paths().find(|p| !p.starts_with('/')) {
            return Err(ServiceWorkerError::ManifestError(format!(
                "path '{bad}' is not absolute"
            )));
        }
        Ok(())
    }

    /// Every listed path: build files, then static files, then prerendered.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.build
            .iter()
            .chain(&self.files)
            .chain(&self.prerendered)
            .map(String::as_str)
    }

    /// Number of listed paths, duplicates included.
    pub fn len(&self) -> usize {
        self.build.len() + self.files.len() + self.prerendered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "version": "1700000000000",
        "build": ["/_app/immutable/start.js", "/_app/immutable/app.css"],
        "files": ["/favicon.png", "/banner-1440x720.jpg"],
        "prerendered": ["/"]
    }"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = BuildManifest::from_json(MANIFEST).unwrap();
        assert_eq!(manifest.version, "1700000000000");
        assert_eq!(manifest.len(), 5);
        assert_eq!(
            manifest.paths().collect::<Vec<_>>(),
            vec![
                "/_app/immutable/start.js",
                "/_app/immutable/app.css",
                "/favicon.png",
                "/banner-1440x720.jpg",
                "/",
            ]
        );
    }

    #[test]
    fn test_missing_lists_default_to_empty() {
        let manifest = BuildManifest::from_json(r#"{"version":"v1"}"#).unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_rejects_empty_version() {
        let err = BuildManifest::from_json(r#"{"version":"  ","build":["/a.js"]}"#).unwrap_err();
        assert!(matches!(err, ServiceWorkerError::ManifestError(_)));
    }

    #[test]
    fn test_rejects_relative_path() {
        let err = BuildManifest::from_json(r#"{"version":"v1","files":["robots.txt"]}"#).unwrap_err();
        assert!(err.to_string().contains("robots.txt"));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(BuildManifest::from_json("{").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, MANIFEST).unwrap();

        let manifest = BuildManifest::load(&path).await.unwrap();
        assert_eq!(manifest.prerendered, vec!["/".to_string()]);

        let missing = BuildManifest::load(dir.path().join("nope.json")).await;
        assert!(matches!(missing, Err(ServiceWorkerError::ManifestError(_))));
    }
}
