use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Whether a regular file currently exists at `path`. I/O errors count as absent.
pub async fn file_exists(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file())
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Two-decimal megabyte rendering used in chat replies ("12.34MB").
pub fn human_size(bytes: u64) -> String {
    format!("{:.2}MB", bytes_to_mb(bytes))
}
