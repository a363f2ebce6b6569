//! Outbound half of the HTTP chat bridge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use pkgbot_core::http_client;
use pkgbot_core::transport::{ChatTransport, OutboundMessage, SessionTracker, TransportError};
use serde::Serialize;
use tracing::debug;

#[derive(Serialize, Default)]
struct SendBody<'a> {
    to: &'a str,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mimetype: Option<&'a str>,
}

#[derive(Serialize)]
struct ReactBody<'a> {
    to: &'a str,
    message_id: &'a str,
    emoji: &'a str,
}

pub(crate) struct BridgeTransport {
    base_url: String,
    http: reqwest::Client,
    session: Arc<SessionTracker>,
}

impl BridgeTransport {
    pub(crate) fn new(base_url: &str, session: Arc<SessionTracker>) -> Result<Self, reqwest::Error> {
        // Documents can be large; allow uploads to take a while.
        let http = http_client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            session,
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), TransportError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected(format!("HTTP {status}: {detail}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for BridgeTransport {
    fn is_live(&self) -> bool {
        self.session.is_live()
    }

    async fn send(&self, to: &str, message: OutboundMessage) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::Offline);
        }
        let kind = message.kind();
        let engine = base64::engine::general_purpose::STANDARD;
        let body = match &message {
            OutboundMessage::Text(text) => SendBody {
                to,
                kind,
                text: Some(text.as_str()),
                ..SendBody::default()
            },
            OutboundMessage::Image { data, caption } => SendBody {
                to,
                kind,
                caption: Some(caption.as_str()),
                data_b64: Some(engine.encode(data)),
                ..SendBody::default()
            },
            OutboundMessage::Document {
                data,
                file_name,
                mimetype,
            } => SendBody {
                to,
                kind,
                data_b64: Some(engine.encode(data)),
                file_name: Some(file_name.as_str()),
                mimetype: Some(mimetype.as_str()),
                ..SendBody::default()
            },
        };
        debug!(to, kind, "bridge send");
        self.post("/send", &body).await
    }

    async fn react(&self, to: &str, message_id: &str, emoji: &str) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::Offline);
        }
        self.post(
            "/react",
            &ReactBody {
                to,
                message_id,
                emoji,
            },
        )
        .await
    }
}
