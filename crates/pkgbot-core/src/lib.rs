//! Request pipeline for a chat bot that resolves package queries into
//! downloadable artifacts and delivers them back to the requester.
//!
//! The crate owns every piece that does not depend on a concrete chat
//! bridge: configuration, the two bounded executors, the expiring artifact
//! cache, the request ledger, the fetch-service client and supervisor, the
//! catalog lookup, and the orchestration that ties them together.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod executor;
pub mod fetch;
pub mod http_client;
pub mod ledger;
pub mod messages;
pub mod normalize;
pub mod retry;
pub mod singleflight;
pub mod tasks;
pub mod telemetry;
pub mod transport;
pub mod util;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{CacheEntry, EvictionCause, EvictionListener, FileReaper, ResultCache};
pub use config::BotConfig;
pub use controller::{ChatRequest, Orchestrator, RequestOutcome};
pub use dispatcher::{Disposition, Dispatcher};
pub use executor::{DownstreamExecutor, ExecutorStats, RequestExecutor};
pub use ledger::{RequestLedger, RequestRecord, RequestStatus};
pub use telemetry::{StatsSnapshot, StatsSources};
pub use transport::{ChatTransport, InboundMessage, OutboundMessage, SessionState, SessionTracker};
