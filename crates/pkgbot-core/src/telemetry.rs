use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::cache::{CacheStats, ResultCache};
use crate::executor::{DownstreamExecutor, ExecutorStats, RequestExecutor};
use crate::fetch::{ServiceState, ServiceSupervisor};
use crate::ledger::RequestLedger;
use crate::tasks::{spawn_periodic, TaskHandle};
use crate::transport::{SessionState, SessionTracker};

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub cache: CacheStats,
    pub requests: ExecutorStats,
    pub downstream: ExecutorStats,
    pub ledger_entries: usize,
    pub fetch_service: ServiceState,
    pub session: SessionState,
}

/// Handles to everything the periodic report and `/stats` read from.
#[derive(Clone)]
pub struct StatsSources {
    pub cache: Arc<ResultCache>,
    pub ledger: Arc<RequestLedger>,
    pub requests: RequestExecutor,
    pub downstream: DownstreamExecutor,
    pub supervisor: Arc<ServiceSupervisor>,
    pub session: Arc<SessionTracker>,
}

impl StatsSources {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache: self.cache.stats(),
            requests: self.requests.stats(),
            downstream: self.downstream.stats(),
            ledger_entries: self.ledger.len(),
            fetch_service: self.supervisor.state(),
            session: self.session.current(),
        }
    }

    pub fn spawn_reporter(&self, interval: Duration) -> TaskHandle {
        let sources = self.clone();
        spawn_periodic("stats.reporter", interval, move || {
            let snapshot = sources.snapshot();
            async move { log_snapshot(&snapshot) }
        })
    }
}

fn log_snapshot(snapshot: &StatsSnapshot) {
    info!(
        target: "pkgbot::stats",
        cache_entries = snapshot.cache.entries,
        cache_hits = snapshot.cache.hits,
        cache_misses = snapshot.cache.misses,
        requests_waiting = snapshot.requests.waiting,
        requests_running = snapshot.requests.running,
        downstream_waiting = snapshot.downstream.waiting,
        downstream_running = snapshot.downstream.running,
        ledger_entries = snapshot.ledger_entries,
        fetch_service = snapshot.fetch_service.as_str(),
        session = snapshot.session.as_str(),
        "pipeline stats"
    );
}
