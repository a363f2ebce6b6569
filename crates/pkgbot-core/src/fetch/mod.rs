//! Boundary to the external fetch service that turns a package id into a
//! downloaded artifact.

mod client;
mod supervisor;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::retry::RetryPolicy;

pub use client::FetchClient;
pub use supervisor::{HealthProbe, ServiceState, ServiceSupervisor, SupervisorError};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub concurrency: Option<u64>,
}

impl HealthReport {
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("ok")
    }
}

/// Shared shape of `/link` and `/download` responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FetchResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub is_xapk: Option<bool>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FetchResponse {
    pub fn has_file(&self) -> bool {
        self.filename.is_some() && self.file_path.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch service unreachable: {0}")]
    Unreachable(String),
    #[error("fetch service returned HTTP {status}")]
    Status { status: u16 },
    #[error("invalid fetch service response: {0}")]
    Decode(String),
}

impl FetchError {
    /// The service could not be reached or did not answer, as opposed to a
    /// well-formed negative response.
    pub fn is_connectivity(&self) -> bool {
        match self {
            FetchError::Unreachable(_) => true,
            FetchError::Status { status } => matches!(status, 502..=504),
            FetchError::Decode(_) => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::Status {
                status: status.as_u16(),
            }
        } else {
            FetchError::Unreachable(err.to_string())
        }
    }
}

#[async_trait]
pub trait FetchService: Send + Sync {
    /// Makes sure the service answers, starting it if possible.
    async fn ensure_live(&self) -> Result<(), FetchError>;
    async fn link(&self, package: &str) -> Result<FetchResponse, FetchError>;
    async fn download(&self, package: &str) -> Result<FetchResponse, FetchError>;
}

/// HTTP fetch service guarded by a supervisor: each call gets a few attempts
/// and the first connectivity failure triggers a liveness repair.
pub struct HttpFetchService {
    client: Arc<FetchClient>,
    supervisor: Arc<ServiceSupervisor>,
    policy: RetryPolicy,
}

impl HttpFetchService {
    pub fn new(client: Arc<FetchClient>, supervisor: Arc<ServiceSupervisor>, policy: RetryPolicy) -> Self {
        Self {
            client,
            supervisor,
            policy,
        }
    }

    pub fn supervisor(&self) -> &Arc<ServiceSupervisor> {
        &self.supervisor
    }

    async fn repair(&self, attempt: u32) {
        if attempt == 1 {
            if let Err(err) = self.supervisor.ensure_live().await {
                tracing::warn!(target: "pkgbot::fetch", error = %err, "fetch service repair failed");
            }
        }
    }
}

#[async_trait]
impl FetchService for HttpFetchService {
    async fn ensure_live(&self) -> Result<(), FetchError> {
        self.supervisor
            .ensure_live()
            .await
            .map_err(|err| FetchError::Unreachable(err.to_string()))
    }

    async fn link(&self, package: &str) -> Result<FetchResponse, FetchError> {
        self.policy
            .run(
                "fetch.link",
                |_| self.client.link(package),
                FetchError::is_connectivity,
                |attempt| self.repair(attempt),
            )
            .await
    }

    async fn download(&self, package: &str) -> Result<FetchResponse, FetchError> {
        self.policy
            .run(
                "fetch.download",
                |_| self.client.download(package),
                FetchError::is_connectivity,
                |attempt| self.repair(attempt),
            )
            .await
    }
}
