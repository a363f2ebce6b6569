use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target of the per-request lifecycle events mirrored to the rolling log.
pub const REQUEST_TARGET: &str = "pkgbot::requests";

static REQUEST_LOG_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Installs the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(filter));

    if std::env::var("PKGBOT_LOG_ROLL").ok().as_deref() != Some("1") {
        let _ = registry.try_init();
        return;
    }

    let dir = std::env::var("PKGBOT_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let rotation = std::env::var("PKGBOT_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
    if std::fs::create_dir_all(&dir).is_err() {
        tracing::warn!(directory = %dir, "failed to create request log directory");
    }
    let writer = match rotation.to_lowercase().as_str() {
        "hourly" => tracing_appender::rolling::hourly(&dir, "requests"),
        "minutely" => tracing_appender::rolling::minutely(&dir, "requests"),
        _ => tracing_appender::rolling::daily(&dir, "requests"),
    };
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = REQUEST_LOG_GUARD.set(guard);
    let targets = Targets::new().with_target(REQUEST_TARGET, tracing::Level::INFO);
    let request_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(nb)
        .with_filter(targets);
    let _ = registry.with(request_layer).try_init();
}
