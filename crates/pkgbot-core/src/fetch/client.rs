use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{FetchError, FetchResponse, HealthProbe, HealthReport};
use crate::config::FetchSettings;
use crate::http_client;

/// Thin JSON client for the fetch service. Single attempt per call.
#[derive(Debug, Clone)]
pub struct FetchClient {
    base_url: String,
    http: reqwest::Client,
    request_timeout: Duration,
    download_timeout: Duration,
}

impl FetchClient {
    pub fn new(settings: &FetchSettings) -> Result<Self, FetchError> {
        let http = http_client::builder()
            .build()
            .map_err(|err| FetchError::Unreachable(err.to_string()))?;
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            http,
            request_timeout: settings.request_timeout,
            download_timeout: settings.download_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        package: Option<&str>,
        timeout: Duration,
    ) -> Result<T, FetchError> {
        let mut request = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .timeout(timeout);
        if let Some(package) = package {
            request = request.query(&[("package", package)]);
        }
        let response = request.send().await.map_err(FetchError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }
        response.json::<T>().await.map_err(FetchError::from_reqwest)
    }

    pub async fn health(&self) -> Result<HealthReport, FetchError> {
        self.get_json("/health", None, self.request_timeout).await
    }

    pub async fn link(&self, package: &str) -> Result<FetchResponse, FetchError> {
        self.get_json("/link", Some(package), self.request_timeout)
            .await
    }

    pub async fn download(&self, package: &str) -> Result<FetchResponse, FetchError> {
        self.get_json("/download", Some(package), self.download_timeout)
            .await
    }
}

#[async_trait]
impl HealthProbe for FetchClient {
    async fn probe(&self) -> Result<(), FetchError> {
        let report = self.health().await?;
        if report.is_ok() {
            Ok(())
        } else {
            Err(FetchError::Unreachable(format!(
                "health status `{}`",
                report.status
            )))
        }
    }
}
