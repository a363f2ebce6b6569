//! Per-request workflow: normalize, look up the catalog, probe the cache,
//! resolve through the downstream executor, gate on size, deliver, and
//! record the outcome in the ledger.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, FileReaper, ResultCache};
use crate::catalog::CatalogProvider;
use crate::config::BotConfig;
use crate::executor::{DownstreamExecutor, ExecutorError};
use crate::fetch::{FetchError, FetchResponse, FetchService};
use crate::http_client;
use crate::ledger::{RequestLedger, RequestRecord};
use crate::messages::Messages;
use crate::normalize::normalize_query;
use crate::retry::RetryPolicy;
use crate::singleflight::Singleflight;
use crate::transport::{ChatTransport, InboundMessage, OutboundMessage, TransportError, APK_MIME};
use crate::util::{file_exists, now_millis};

static VERSION_IN_FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_([\d.]+)_").expect("version regex"));

/// Classified workflow failure.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("fetch service unreachable: {0}")]
    Unreachable(String),
    #[error("{0}")]
    NotFound(String),
    #[error("unusable fetch service response: {0}")]
    InvalidResponse(String),
    #[error("artifact read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl ResolveError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ResolveError::Unreachable(_))
    }
}

impl From<FetchError> for ResolveError {
    fn from(err: FetchError) -> Self {
        if err.is_connectivity() {
            ResolveError::Unreachable(err.to_string())
        } else {
            ResolveError::InvalidResponse(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Delivered { cache_hit: bool },
    LinkSent,
    /// Nothing left to look up after normalization.
    Ignored,
    /// The chat session was down when the request ran.
    Abandoned,
    TooLarge { size_bytes: u64 },
    NotFound(String),
    FileMissing,
    Unreachable,
    Failed(String),
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Delivered { .. } => "delivered",
            RequestOutcome::LinkSent => "link_sent",
            RequestOutcome::Ignored => "ignored",
            RequestOutcome::Abandoned => "abandoned",
            RequestOutcome::TooLarge { .. } => "too_large",
            RequestOutcome::NotFound(_) => "not_found",
            RequestOutcome::FileMissing => "file_missing",
            RequestOutcome::Unreachable => "unreachable",
            RequestOutcome::Failed(_) => "failed",
        }
    }

    fn failure(&self) -> Option<String> {
        match self {
            RequestOutcome::Delivered { .. } | RequestOutcome::LinkSent => None,
            RequestOutcome::NotFound(reason) | RequestOutcome::Failed(reason) => Some(reason.clone()),
            RequestOutcome::TooLarge { size_bytes } => Some(format!("artifact too large ({size_bytes} bytes)")),
            other => Some(other.as_str().to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub id: String,
    pub message: InboundMessage,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_file_size_mb: u64,
    pub max_file_bytes: u64,
    /// Cache TTL applied after a successful delivery.
    pub retention_ttl: Duration,
    pub ledger_retention: Duration,
    pub downloads_dir: PathBuf,
    pub icon_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &BotConfig) -> Self {
        Self {
            max_file_size_mb: cfg.max_file_size_mb,
            max_file_bytes: cfg.max_file_bytes(),
            retention_ttl: cfg.cache.retention,
            ledger_retention: cfg.ledger.retention,
            downloads_dir: cfg.downloads_dir.clone(),
            icon_timeout: Duration::from_secs(5),
        }
    }
}

/// Collaborators the orchestrator drives; all process-scoped.
pub struct Components {
    pub cache: Arc<ResultCache>,
    pub ledger: Arc<RequestLedger>,
    pub downstream: DownstreamExecutor,
    pub fetch: Arc<dyn FetchService>,
    pub catalog: Arc<dyn CatalogProvider>,
    pub transport: Arc<dyn ChatTransport>,
    pub reaper: FileReaper,
    pub messages: Messages,
}

#[derive(Debug, Clone, Default)]
struct CatalogMatch {
    package_id: String,
    title: Option<String>,
    icon_url: Option<String>,
    rating: Option<String>,
}

struct Resolved {
    entry: Arc<CacheEntry>,
    cache_hit: bool,
}

pub struct Orchestrator {
    cache: Arc<ResultCache>,
    ledger: Arc<RequestLedger>,
    downstream: DownstreamExecutor,
    fetch: Arc<dyn FetchService>,
    catalog: Arc<dyn CatalogProvider>,
    transport: Arc<dyn ChatTransport>,
    reaper: FileReaper,
    messages: Messages,
    settings: PipelineSettings,
    flights: Singleflight,
    resolve_retry: RetryPolicy,
    icons: reqwest::Client,
}

impl Orchestrator {
    /// Fails only if the HTTP client for app icons cannot be built.
    pub fn new(components: Components, settings: PipelineSettings) -> Result<Self, reqwest::Error> {
        let Components {
            cache,
            ledger,
            downstream,
            fetch,
            catalog,
            transport,
            reaper,
            messages,
        } = components;
        let icons = http_client::browser_builder().build()?;
        Ok(Self {
            cache,
            ledger,
            downstream,
            fetch,
            catalog,
            transport,
            reaper,
            messages,
            settings,
            flights: Singleflight::default(),
            resolve_retry: RetryPolicy::once(),
            icons,
        })
    }

    pub fn messages(&self) -> &Messages {
        &self.messages
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runs one request to a terminal state. Never panics on workflow errors;
    /// every exit path updates the ledger.
    pub async fn handle(&self, request: ChatRequest) -> RequestOutcome {
        let started = Instant::now();
        self.ledger
            .upsert(RequestRecord::processing(&request.id, now_millis()));

        let outcome = match self.run(&request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(target: "pkgbot::requests", request = %request.id, error = %err, "request failed");
                self.reply(&request.message.sender, self.messages.generic_failure())
                    .await;
                RequestOutcome::Failed(err.to_string())
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome.failure() {
            None => self.ledger.mark_completed(&request.id, elapsed_ms),
            Some(reason) => self.ledger.mark_failed(&request.id, reason, elapsed_ms),
        }
        self.ledger
            .schedule_removal(&request.id, self.settings.ledger_retention);
        info!(
            target: "pkgbot::requests",
            request = %request.id,
            outcome = outcome.as_str(),
            elapsed_ms,
            "request finished"
        );
        outcome
    }

    async fn run(&self, request: &ChatRequest) -> Result<RequestOutcome, ResolveError> {
        let message = &request.message;
        let query = normalize_query(&message.text);
        if query.translated {
            info!(original = %message.text, normalized = %query.text, "translated query alias");
        }
        if query.text.is_empty() {
            return Ok(RequestOutcome::Ignored);
        }
        if !self.transport.is_live() {
            warn!(request = %request.id, "chat session offline; abandoning request");
            return Ok(RequestOutcome::Abandoned);
        }
        info!(target: "pkgbot::requests", request = %request.id, query = %query.text, "resolving");
        self.react(message, "🔍").await;

        let catalog = self.lookup_catalog(&query.text).await;
        let Resolved { entry, cache_hit } = match self.resolve(&query.text, &catalog).await {
            Ok(resolved) => resolved,
            Err(ResolveError::Unreachable(reason)) => {
                warn!(request = %request.id, %reason, "fetch service unreachable after retry");
                self.reply(&message.sender, self.messages.unreachable()).await;
                return Ok(RequestOutcome::Unreachable);
            }
            Err(ResolveError::NotFound(reason)) => {
                self.reply(&message.sender, self.messages.not_found(&reason))
                    .await;
                return Ok(RequestOutcome::NotFound(reason));
            }
            Err(ResolveError::InvalidResponse(reason)) => {
                warn!(request = %request.id, %reason, "fetch service response unusable");
                self.reply(&message.sender, self.messages.not_found("Download failed"))
                    .await;
                return Ok(RequestOutcome::NotFound(reason));
            }
            Err(other) => return Err(other),
        };

        if entry.size_bytes > self.settings.max_file_bytes {
            warn!(request = %request.id, size = %entry.human_size(), "artifact exceeds size limit");
            self.reply(
                &message.sender,
                self.messages
                    .too_large(&entry, self.settings.max_file_size_mb),
            )
            .await;
            return Ok(RequestOutcome::TooLarge {
                size_bytes: entry.size_bytes,
            });
        }

        self.deliver(message, &query.text, &entry, cache_hit).await
    }

    async fn lookup_catalog(&self, query: &str) -> CatalogMatch {
        let fallback = CatalogMatch {
            package_id: query.to_string(),
            ..CatalogMatch::default()
        };
        match self.catalog.search_one(query).await {
            Ok(Some(hit)) => match hit.package_id() {
                Some(package_id) => {
                    debug!(query, package = %package_id, "catalog match");
                    CatalogMatch {
                        package_id,
                        title: hit.title,
                        icon_url: hit.icon_url,
                        rating: hit.rating,
                    }
                }
                None => {
                    debug!(query, url = %hit.detail_url, "catalog match without package id");
                    fallback
                }
            },
            Ok(None) => fallback,
            Err(err) => {
                warn!(query, error = %err, "catalog lookup failed; using raw query");
                fallback
            }
        }
    }

    /// Cached entry whose file still exists; a vanished file invalidates it.
    async fn probe_cache(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.cache.get(key).await?;
        match entry.backing_path.as_deref() {
            Some(path) if file_exists(path).await => {
                debug!(key, "cache hit");
                Some(entry)
            }
            _ => {
                warn!(key, "cached artifact missing on disk; invalidating");
                self.cache.invalidate(key).await;
                None
            }
        }
    }

    async fn resolve(&self, key: &str, catalog: &CatalogMatch) -> Result<Resolved, ResolveError> {
        if let Some(entry) = self.probe_cache(key).await {
            return Ok(Resolved {
                entry,
                cache_hit: true,
            });
        }

        let flight = self.flights.begin(key);
        if !flight.is_leader() {
            debug!(key, "waiting for in-flight resolution of the same query");
            flight.wait().await;
            if let Some(entry) = self.probe_cache(key).await {
                return Ok(Resolved {
                    entry,
                    cache_hit: true,
                });
            }
        }

        let entry = self
            .resolve_retry
            .run(
                "resolve",
                |_| self.submit_resolution(key, catalog),
                ResolveError::is_connectivity,
                |_| self.repair_fetch(),
            )
            .await?;
        drop(flight);
        Ok(Resolved {
            entry,
            cache_hit: false,
        })
    }

    async fn repair_fetch(&self) {
        if let Err(err) = self.fetch.ensure_live().await {
            warn!(error = %err, "fetch service still down before retry");
        }
    }

    async fn submit_resolution(
        &self,
        key: &str,
        catalog: &CatalogMatch,
    ) -> Result<Arc<CacheEntry>, ResolveError> {
        let job = ResolutionJob {
            key: key.to_string(),
            catalog: catalog.clone(),
            fetch: Arc::clone(&self.fetch),
            cache: Arc::clone(&self.cache),
            reaper: self.reaper.clone(),
            downloads_dir: self.settings.downloads_dir.clone(),
            max_file_bytes: self.settings.max_file_bytes,
        };
        self.downstream.submit(job.run()).await?
    }

    async fn deliver(
        &self,
        message: &InboundMessage,
        key: &str,
        entry: &CacheEntry,
        cache_hit: bool,
    ) -> Result<RequestOutcome, ResolveError> {
        let to = message.sender.as_str();
        self.send_details(to, entry).await?;

        let Some(path) = entry.backing_path.as_deref() else {
            let url = entry.remote_url.as_deref().unwrap_or_default();
            self.transport
                .send(to, OutboundMessage::Text(self.messages.link_only(entry, url)))
                .await?;
            self.react(message, "✅").await;
            return Ok(RequestOutcome::LinkSent);
        };

        // Another request may have evicted the file while this one waited.
        if !file_exists(path).await {
            error!(path = %path.display(), "artifact vanished before delivery");
            self.cache.invalidate(key).await;
            self.reply(to, self.messages.file_missing()).await;
            return Ok(RequestOutcome::FileMissing);
        }

        let data = tokio::fs::read(path).await?;
        let file_name = entry
            .filename
            .clone()
            .unwrap_or_else(|| file_name_of(path));
        info!(
            target: "pkgbot::requests",
            file = %file_name,
            size = %entry.human_size(),
            multi_part = entry.is_multi_part,
            cache_hit,
            "sending artifact"
        );
        self.transport
            .send(
                to,
                OutboundMessage::Document {
                    data,
                    file_name,
                    mimetype: APK_MIME.to_string(),
                },
            )
            .await?;
        if entry.is_multi_part {
            self.transport
                .send(to, OutboundMessage::Text(self.messages.xapk_instructions()))
                .await?;
        }
        self.react(message, "✅").await;
        self.cache
            .extend_ttl(key, self.settings.retention_ttl)
            .await;
        Ok(RequestOutcome::Delivered { cache_hit })
    }

    async fn send_details(&self, to: &str, entry: &CacheEntry) -> Result<(), TransportError> {
        let caption = self.messages.details(entry);
        if let Some(icon) = entry.icon_url.as_deref() {
            match self.fetch_icon(icon).await {
                Ok(data) => {
                    return self
                        .transport
                        .send(to, OutboundMessage::Image { data, caption })
                        .await;
                }
                Err(err) => debug!(icon, error = %err, "icon unavailable; sending text details"),
            }
        }
        self.transport.send(to, OutboundMessage::Text(caption)).await
    }

    async fn fetch_icon(&self, url: &str) -> Result<Vec<u8>, reqwest::Error> {
        let response = self
            .icons
            .get(url)
            .timeout(self.settings.icon_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn react(&self, message: &InboundMessage, emoji: &str) {
        if let Err(err) = self
            .transport
            .react(&message.sender, &message.message_id, emoji)
            .await
        {
            debug!(emoji, error = %err, "reaction not delivered");
        }
    }

    /// Best-effort text reply; skipped while the session is down.
    async fn reply(&self, to: &str, text: String) {
        if !self.transport.is_live() {
            return;
        }
        if let Err(err) = self.transport.send(to, OutboundMessage::Text(text)).await {
            warn!(error = %err, "failed to send reply");
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "package.apk".to_string())
}

fn version_from_filename(filename: &str) -> Option<String> {
    VERSION_IN_FILENAME
        .captures(filename)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Work item run on the downstream executor.
struct ResolutionJob {
    key: String,
    catalog: CatalogMatch,
    fetch: Arc<dyn FetchService>,
    cache: Arc<ResultCache>,
    reaper: FileReaper,
    downloads_dir: PathBuf,
    max_file_bytes: u64,
}

impl ResolutionJob {
    async fn run(self) -> Result<Arc<CacheEntry>, ResolveError> {
        self.fetch.ensure_live().await?;
        let package = self.catalog.package_id.as_str();

        let mut response = self.fetch.link(package).await?;
        if let Some(reason) = response.error.take() {
            return Err(ResolveError::NotFound(reason));
        }
        if !response.has_file() && response.url.is_some() {
            debug!(package, "no local file yet; requesting full download");
            let remote_url = response.url.take();
            let mut downloaded = self.fetch.download(package).await?;
            if let Some(reason) = downloaded.error.take() {
                return Err(ResolveError::NotFound(reason));
            }
            if downloaded.url.is_none() {
                downloaded.url = remote_url;
            }
            response = downloaded;
        }
        if !response.has_file() && response.url.is_none() {
            return Err(ResolveError::InvalidResponse(
                "neither a file nor a url in fetch response".to_string(),
            ));
        }

        let entry = self.build_entry(response).await;
        if !entry.has_local_file() {
            return Ok(Arc::new(entry));
        }
        if entry.size_bytes > self.max_file_bytes {
            if let Some(path) = entry.backing_path.clone() {
                self.reaper.schedule(path, "oversized");
            }
            return Ok(Arc::new(entry));
        }
        Ok(self.cache.set(&self.key, entry).await)
    }

    async fn build_entry(&self, response: FetchResponse) -> CacheEntry {
        let backing_path = response
            .filename
            .as_deref()
            .filter(|_| response.file_path.is_some())
            .map(|name| self.downloads_dir.join(name));
        let size_bytes = match (response.size, backing_path.as_deref()) {
            (Some(size), _) => size,
            (None, Some(path)) => tokio::fs::metadata(path)
                .await
                .map(|meta| meta.len())
                .unwrap_or(0),
            (None, None) => 0,
        };
        let is_multi_part = response.is_xapk.unwrap_or(false)
            || response
                .filename
                .as_deref()
                .is_some_and(|name| name.to_ascii_lowercase().ends_with(".xapk"));
        let version = response
            .filename
            .as_deref()
            .and_then(version_from_filename)
            .unwrap_or_else(|| "Latest".to_string());

        CacheEntry {
            key: self.key.clone(),
            display_name: self
                .catalog
                .title
                .clone()
                .unwrap_or_else(|| self.key.clone()),
            package_id: response
                .package
                .unwrap_or_else(|| self.catalog.package_id.clone()),
            version,
            size_bytes,
            rating: self.catalog.rating.clone(),
            icon_url: self.catalog.icon_url.clone(),
            filename: response.filename,
            is_multi_part,
            backing_path,
            remote_url: response.url,
        }
    }
}
