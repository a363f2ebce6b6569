use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

const DEFAULT_FETCH_URL: &str = "http://127.0.0.1:8001";
const DEFAULT_CATALOG_URL: &str = "https://play.google.com";

pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

pub fn env_u64(key: &str, default: u64) -> u64 {
    match env_string(key) {
        None => default,
        Some(raw) => match raw.parse::<u64>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default, "ignoring unparseable numeric setting");
                default
            }
        },
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_u64(key, default))
}

fn env_concurrency(key: &str, default: u64) -> usize {
    env_u64(key, default).max(1) as usize
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    pub base_url: String,
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub download_timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
    pub launch: Option<Vec<String>>,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl FetchSettings {
    fn from_env() -> Self {
        let launch = env_string("PKGBOT_FETCH_LAUNCH").and_then(|raw| {
            match shell_words::split(&raw) {
                Ok(words) if !words.is_empty() => Some(words),
                Ok(_) => None,
                Err(err) => {
                    warn!(error = %err, "PKGBOT_FETCH_LAUNCH is not a valid command line; lazy start disabled");
                    None
                }
            }
        });
        Self {
            base_url: env_string("PKGBOT_FETCH_URL")
                .unwrap_or_else(|| DEFAULT_FETCH_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            concurrency: env_concurrency("PKGBOT_FETCH_CONCURRENCY", 10),
            request_timeout: env_secs("PKGBOT_FETCH_TIMEOUT_SECS", 30).max(Duration::from_secs(1)),
            download_timeout: env_secs("PKGBOT_FETCH_DOWNLOAD_TIMEOUT_SECS", 180)
                .max(Duration::from_secs(1)),
            attempts: env_u64("PKGBOT_FETCH_ATTEMPTS", 3).clamp(1, 10) as u32,
            backoff: Duration::from_millis(env_u64("PKGBOT_FETCH_BACKOFF_MS", 1000)),
            launch,
            ready_timeout: env_secs("PKGBOT_FETCH_READY_SECS", 30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub ttl: Duration,
    /// TTL applied after a successful delivery; never shorter than `ttl`.
    pub retention: Duration,
    pub grace: Duration,
    pub sweep_interval: Duration,
}

impl CacheSettings {
    fn from_env() -> Self {
        let ttl = env_secs("PKGBOT_CACHE_TTL_SECS", 900).max(Duration::from_secs(1));
        let retention = env_secs("PKGBOT_CACHE_RETENTION_SECS", 3600).max(ttl);
        Self {
            ttl,
            retention,
            grace: Duration::from_millis(env_u64("PKGBOT_CACHE_GRACE_MS", 1000)),
            sweep_interval: env_secs("PKGBOT_CACHE_SWEEP_SECS", 10).max(Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSettings {
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub max_age: Duration,
}

impl LedgerSettings {
    fn from_env() -> Self {
        Self {
            retention: env_secs("PKGBOT_LEDGER_RETENTION_SECS", 60),
            sweep_interval: env_secs("PKGBOT_LEDGER_SWEEP_SECS", 60).max(Duration::from_secs(1)),
            max_age: env_secs("PKGBOT_LEDGER_MAX_AGE_SECS", 600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSettings {
    Disabled,
    PlayStore { base_url: String },
}

impl CatalogSettings {
    fn from_env() -> Self {
        let mode = env_string("PKGBOT_CATALOG").unwrap_or_else(|| "play".to_string());
        match mode.to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" => CatalogSettings::Disabled,
            "play" => CatalogSettings::PlayStore {
                base_url: env_string("PKGBOT_CATALOG_URL")
                    .unwrap_or_else(|| DEFAULT_CATALOG_URL.to_string())
                    .trim_end_matches('/')
                    .to_string(),
            },
            other => {
                warn!(mode = other, "unknown PKGBOT_CATALOG mode; catalog lookups disabled");
                CatalogSettings::Disabled
            }
        }
    }
}

/// Process configuration, loaded once at startup from `PKGBOT_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotConfig {
    pub fetch: FetchSettings,
    pub queue_concurrency: usize,
    pub max_file_size_mb: u64,
    pub cache: CacheSettings,
    pub downloads_dir: PathBuf,
    pub ledger: LedgerSettings,
    pub stats_interval: Duration,
    pub catalog: CatalogSettings,
    pub follow_url: Option<String>,
}

impl BotConfig {
    pub fn from_env() -> Self {
        Self {
            fetch: FetchSettings::from_env(),
            queue_concurrency: env_concurrency("PKGBOT_QUEUE_CONCURRENCY", 100),
            max_file_size_mb: env_u64("PKGBOT_MAX_FILE_SIZE_MB", 2048),
            cache: CacheSettings::from_env(),
            downloads_dir: env_string("PKGBOT_DOWNLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("downloads")),
            ledger: LedgerSettings::from_env(),
            stats_interval: env_secs("PKGBOT_STATS_INTERVAL_SECS", 300)
                .max(Duration::from_secs(1)),
            catalog: CatalogSettings::from_env(),
            follow_url: env_string("PKGBOT_FOLLOW_URL"),
        }
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}
