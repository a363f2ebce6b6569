use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::Router;
use pkgbot_core::catalog::{CatalogProvider, DisabledCatalog, PlayStoreCatalog};
use pkgbot_core::config::{env_string, BotConfig, CatalogSettings};
use pkgbot_core::controller::{Components, PipelineSettings};
use pkgbot_core::fetch::{FetchClient, HttpFetchService, ServiceSupervisor};
use pkgbot_core::messages::Messages;
use pkgbot_core::retry::RetryPolicy;
use pkgbot_core::tasks::{TaskHandle, TaskManager};
use pkgbot_core::{
    Dispatcher, DownstreamExecutor, FileReaper, Orchestrator, RequestExecutor, RequestLedger,
    ResultCache, SessionTracker, StatsSources,
};
use tracing::{info, warn};

use crate::bridge::BridgeTransport;
use crate::webhook::{self, WebhookState};

const DEFAULT_LISTEN: &str = "127.0.0.1:8088";
const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:3000";
const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct BootstrapOutput {
    pub router: Router,
    pub listen: SocketAddr,
    pub session: Arc<SessionTracker>,
    pub supervisor: Arc<ServiceSupervisor>,
    pub background_tasks: TaskManager,
}

pub(crate) async fn build() -> anyhow::Result<BootstrapOutput> {
    let config = BotConfig::from_env();
    let listen: SocketAddr = env_string("PKGBOT_LISTEN")
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
        .parse()
        .context("PKGBOT_LISTEN must be a socket address")?;
    let bridge_url = env_string("PKGBOT_BRIDGE_URL").unwrap_or_else(|| DEFAULT_BRIDGE_URL.to_string());

    tokio::fs::create_dir_all(&config.downloads_dir)
        .await
        .with_context(|| format!("creating downloads directory {}", config.downloads_dir.display()))?;

    let client = Arc::new(FetchClient::new(&config.fetch).context("building fetch client")?);
    let supervisor = Arc::new(ServiceSupervisor::new(
        client.clone(),
        config.fetch.launch.clone(),
        config.fetch.ready_timeout,
        config.fetch.poll_interval,
    ));
    let fetch = Arc::new(HttpFetchService::new(
        client,
        Arc::clone(&supervisor),
        RetryPolicy::new(config.fetch.attempts, config.fetch.backoff),
    ));
    let catalog: Arc<dyn CatalogProvider> = match &config.catalog {
        CatalogSettings::Disabled => Arc::new(DisabledCatalog),
        CatalogSettings::PlayStore { base_url } => Arc::new(
            PlayStoreCatalog::new(base_url, CATALOG_TIMEOUT).context("building catalog client")?,
        ),
    };

    let session = Arc::new(SessionTracker::new());
    let transport = Arc::new(
        BridgeTransport::new(&bridge_url, Arc::clone(&session)).context("building bridge client")?,
    );
    let reaper = FileReaper::new(config.cache.grace);
    let cache = Arc::new(ResultCache::new(config.cache.ttl, Arc::new(reaper.clone())));
    let ledger = Arc::new(RequestLedger::new());
    let downstream = DownstreamExecutor::new(config.fetch.concurrency);
    let requests = RequestExecutor::new(config.queue_concurrency);

    let orchestrator = Arc::new(Orchestrator::new(
        Components {
            cache: Arc::clone(&cache),
            ledger: Arc::clone(&ledger),
            downstream: downstream.clone(),
            fetch,
            catalog,
            transport: transport.clone(),
            reaper,
            messages: Messages::new(config.follow_url.clone()),
        },
        PipelineSettings::from_config(&config),
    )
    .context("building orchestrator")?);
    let dispatcher = Dispatcher::new(orchestrator, requests.clone(), Arc::clone(&ledger), transport);
    let stats = StatsSources {
        cache: Arc::clone(&cache),
        ledger: Arc::clone(&ledger),
        requests,
        downstream,
        supervisor: Arc::clone(&supervisor),
        session: Arc::clone(&session),
    };

    let mut background_tasks = TaskManager::new();
    background_tasks.push(cache.spawn_janitor(config.cache.sweep_interval));
    background_tasks.push(ledger.spawn_sweeper(config.ledger.sweep_interval, config.ledger.max_age));
    background_tasks.push(stats.spawn_reporter(config.stats_interval));
    background_tasks.push(spawn_fetch_warmup(Arc::clone(&supervisor)));

    info!(
        target: "pkgbot::bootstrap",
        %listen,
        bridge = %bridge_url,
        fetch = %config.fetch.base_url,
        queue_concurrency = config.queue_concurrency,
        fetch_concurrency = config.fetch.concurrency,
        max_file_size_mb = config.max_file_size_mb,
        cache_ttl_secs = config.cache.ttl.as_secs(),
        downloads = %config.downloads_dir.display(),
        "pkgbot configured"
    );

    let router = webhook::router(WebhookState {
        dispatcher,
        session: Arc::clone(&session),
        stats,
    });
    Ok(BootstrapOutput {
        router,
        listen,
        session,
        supervisor,
        background_tasks,
    })
}

/// Brings the fetch service up at startup instead of on the first request.
fn spawn_fetch_warmup(supervisor: Arc<ServiceSupervisor>) -> TaskHandle {
    TaskHandle::new(
        "fetch.warmup",
        tokio::spawn(async move {
            if let Err(err) = supervisor.ensure_live().await {
                warn!(target: "pkgbot::fetch", error = %err, "fetch service not available at startup");
            }
        }),
    )
}
