//! Command-line host for the SiteKit offline cache worker.
//!
//! Provides commands for:
//! - Installing and activating a build's version into a cache directory
//! - Probing how the worker answers a single request
//! - Listing and purging cache buckets
//!
//! ## Usage
//!
//! ```bash
//! # Precache a build
//! sw-harness install --manifest build/manifest.json --origin https://learn.example.com
//!
//! # See where a request would be answered from, with the network down
//! sw-harness fetch https://learn.example.com/posts/hello \
//!     --manifest build/manifest.json --origin https://learn.example.com --offline
//!
//! # Inspect and clear the buckets
//! sw-harness caches --json
//! sw-harness purge
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sitekit_common::{init_logging, LogConfig, LogFormat, Result, SiteKitError};
use sitekit_net::{Fetcher, Offline, Request, RequestCache, ResourceLoader};
use sitekit_sw::{
    BuildManifest, CacheStorage, DiskCacheStorage, ExtendableEvent, HostConfig,
    OfflineCacheManager, ServiceWorkerEvent, ServiceWorkerHost, WorkerContext,
};
use tracing::{debug, info};
use url::Url;

mod probe;

use probe::{BucketReport, FetchReport, RecordingFetcher, Source};

#[derive(Parser)]
#[command(name = "sw-harness")]
#[command(about = "Command-line host for the SiteKit offline cache worker")]
struct Cli {
    /// Config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Cache directory, overrides the config file
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Log format: pretty, compact or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

/// Which build to run, overriding the config file.
#[derive(Args)]
struct Target {
    /// Build manifest (JSON)
    #[arg(short, long)]
    manifest: Option<PathBuf>,
    /// Site origin
    #[arg(short, long)]
    origin: Option<Url>,
}

impl Target {
    fn apply(&self, config: &mut HostConfig) {
        if let Some(ref manifest) = self.manifest {
            config.manifest = Some(manifest.clone());
        }
        if let Some(ref origin) = self.origin {
            config.origin = Some(origin.clone());
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate the manifest's version
    Install {
        #[command(flatten)]
        target: Target,
    },

    /// Run one request through the fetch handler
    Fetch {
        /// Request URL
        url: Url,
        #[command(flatten)]
        target: Target,
        /// Fail every network request
        #[arg(long)]
        offline: bool,
        /// Send the request in only-if-cached mode
        #[arg(long)]
        only_if_cached: bool,
    },

    /// List cache buckets and their entries
    Caches,

    /// Delete every cache bucket
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => HostConfig::load(path).await?,
        None => HostConfig::default(),
    };
    if let Some(ref dir) = cli.cache_dir {
        config.cache_dir = dir.clone();
    }

    let format = match cli.log_format {
        Some(format) => format,
        None => config.log_format()?,
    };
    let log = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log.with_format(format))?;
    debug!(cache_dir = %config.cache_dir.display(), "Loaded configuration");

    match cli.command {
        Commands::Install { ref target } => {
            target.apply(&mut config);
            install(&config).await?;
            list_caches(&config, cli.json).await
        }

        Commands::Fetch {
            ref url,
            ref target,
            offline,
            only_if_cached,
        } => {
            target.apply(&mut config);
            let mut request = Request::get(url.clone());
            if only_if_cached {
                request = request.cache_mode(RequestCache::OnlyIfCached);
            }

            let report = fetch(&config, request, offline).await?;
            emit(cli.json, &report, FetchReport::print)?;
            if report.error.is_some() {
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::Caches => list_caches(&config, cli.json).await,

        Commands::Purge => purge(&config).await,
    }
}

async fn worker_context(config: &HostConfig) -> Result<WorkerContext> {
    let manifest = BuildManifest::load(config.require_manifest()?).await?;
    let context = WorkerContext::new(&manifest, config.require_origin()?.clone())?;
    Ok(context)
}

async fn install(config: &HostConfig) -> Result<()> {
    let context = worker_context(config).await?;
    let version = context.version().to_string();
    let caches = Arc::new(DiskCacheStorage::open_dir(&config.cache_dir).await?);
    let network = Arc::new(ResourceLoader::new(config.loader_config())?);
    let manager = Arc::new(OfflineCacheManager::new(context, caches, network));

    let (host, mut events) = ServiceWorkerHost::new(config.require_origin()?.clone());
    let reporter = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let result = host
        .install_with_retry(manager, &config.retry_config())
        .await;
    drop(host);
    let _ = reporter.await;

    let id = result?;
    info!(worker = id.raw(), version = %version, "Worker active");
    Ok(())
}

fn log_event(event: &ServiceWorkerEvent) {
    match event {
        ServiceWorkerEvent::UpdateFound { version } => info!(%version, "Update found"),
        ServiceWorkerEvent::StateChange {
            worker_id,
            version,
            new_state,
        } => info!(worker = worker_id.raw(), %version, state = ?new_state, "State change"),
        ServiceWorkerEvent::ControllerChange {
            client_id,
            worker_id,
        } => info!(client = %client_id, worker = worker_id.raw(), "Controller change"),
    }
}

async fn fetch(config: &HostConfig, request: Request, offline: bool) -> Result<FetchReport> {
    let context = worker_context(config).await?;
    let bucket = if context.is_static_asset(&request.url) {
        context.asset_cache().to_string()
    } else {
        context.offline_cache().to_string()
    };

    let inner: Box<dyn Fetcher> = if offline {
        Box::new(Offline)
    } else {
        Box::new(ResourceLoader::new(config.loader_config())?)
    };
    let network = Arc::new(RecordingFetcher::new(inner));
    let caches = Arc::new(DiskCacheStorage::open_dir(&config.cache_dir).await?);
    let manager = OfflineCacheManager::new(context, caches, Arc::clone(&network));

    let event = ExtendableEvent::new();
    let handled = manager.handle_fetch(&request, &event).await;
    event.settled().await;

    let intercepted = handled.is_some();
    let result = match handled {
        Some(result) => result.map_err(SiteKitError::from),
        None => network.fetch(&request).await.map_err(SiteKitError::from),
    };

    let mut report = FetchReport {
        url: request.url.to_string(),
        source: Source::classify(intercepted, network.calls(), network.failures()),
        bucket: intercepted.then_some(bucket),
        status: None,
        bytes: 0,
        error: None,
    };
    match result {
        Ok(response) => {
            report.status = Some(response.status.as_u16());
            report.bytes = response.body().len();
        }
        Err(e) => {
            if intercepted {
                report.source = Source::Network;
            }
            report.error = Some(e.to_string());
        }
    }
    Ok(report)
}

async fn list_caches(config: &HostConfig, json: bool) -> Result<()> {
    let storage = DiskCacheStorage::open_dir(&config.cache_dir).await?;

    let mut buckets = Vec::new();
    for name in storage.keys().await? {
        let entries = storage.entries(&name).await?;
        buckets.push(BucketReport { name, entries });
    }

    if buckets.is_empty() && !json {
        println!("No caches in {}", storage.dir().display());
        return Ok(());
    }
    emit(json, &buckets, |buckets: &Vec<BucketReport>| {
        buckets.iter().for_each(BucketReport::print)
    })
}

async fn purge(config: &HostConfig) -> Result<()> {
    let storage = DiskCacheStorage::open_dir(&config.cache_dir).await?;

    let mut deleted = 0;
    for name in storage.keys().await? {
        if storage.delete(&name).await? {
            info!(cache = %name, "Deleted cache");
            deleted += 1;
        }
    }

    println!("Deleted {} caches from {}", deleted, storage.dir().display());
    Ok(())
}

fn emit<T: Serialize>(json: bool, value: &T, print: impl Fn(&T)) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| SiteKitError::internal(e.to_string()))?;
        println!("{text}");
    } else {
        print(value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fetch_args() {
        let cli = Cli::parse_from([
            "sw-harness",
            "fetch",
            "https://learn.example.com/posts/hello",
            "--origin",
            "https://learn.example.com",
            "--offline",
            "--json",
        ]);
        assert!(cli.json);
        match cli.command {
            Commands::Fetch {
                url,
                target,
                offline,
                only_if_cached,
            } => {
                assert_eq!(url.path(), "/posts/hello");
                assert!(offline);
                assert!(!only_if_cached);
                assert!(target.manifest.is_none());
                assert_eq!(target.origin.unwrap().host_str(), Some("learn.example.com"));
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_target_overrides_config() {
        let mut config = HostConfig::default();
        let target = Target {
            manifest: Some(PathBuf::from("build/manifest.json")),
            origin: None,
        };
        target.apply(&mut config);
        assert_eq!(config.manifest, Some(PathBuf::from("build/manifest.json")));
        assert!(config.origin.is_none());
    }

    #[test]
    fn test_log_format_flag() {
        let cli = Cli::parse_from(["sw-harness", "--log-format", "json", "caches"]);
        assert_eq!(cli.log_format, Some(LogFormat::Json));
    }
}
