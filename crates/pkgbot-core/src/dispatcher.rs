use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::controller::{ChatRequest, Orchestrator, RequestOutcome};
use crate::executor::{RequestExecutor, Ticket};
use crate::ledger::RequestLedger;
use crate::transport::{ChatTransport, InboundMessage, OutboundMessage, STATUS_BROADCAST};
use crate::util::now_millis;

/// Decryption chatter some bridges surface as plain text.
const PROTOCOL_NOISE: &[&str] = &["Session error", "decrypt", "Bad MAC", "MessageCounterError"];

const GREETINGS: &[&str] = &["hi", "hello", "السلام عليكم", "مرحبا"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Offline,
    FromSelf,
    StatusBroadcast,
    Empty,
    ProtocolNoise,
    Command,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::Offline => "offline",
            IgnoreReason::FromSelf => "from_self",
            IgnoreReason::StatusBroadcast => "status_broadcast",
            IgnoreReason::Empty => "empty",
            IgnoreReason::ProtocolNoise => "protocol_noise",
            IgnoreReason::Command => "command",
        }
    }
}

pub enum Disposition {
    Ignored(IgnoreReason),
    Greeted,
    /// Submitted to the request executor; the ticket resolves with the outcome.
    Queued {
        request_id: String,
        ticket: Ticket<RequestOutcome>,
    },
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ignored(reason) => reason.as_str(),
            Disposition::Greeted => "greeted",
            Disposition::Queued { .. } => "queued",
        }
    }
}

/// Front door for inbound chat messages: filters, greets, and queues.
#[derive(Clone)]
pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    requests: RequestExecutor,
    ledger: Arc<RequestLedger>,
    transport: Arc<dyn ChatTransport>,
}

impl Dispatcher {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        requests: RequestExecutor,
        ledger: Arc<RequestLedger>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            orchestrator,
            requests,
            ledger,
            transport,
        }
    }

    pub fn requests(&self) -> &RequestExecutor {
        &self.requests
    }

    fn screen(&self, message: &InboundMessage) -> Option<IgnoreReason> {
        let text = message.text.trim();
        if !self.transport.is_live() {
            Some(IgnoreReason::Offline)
        } else if message.from_me {
            Some(IgnoreReason::FromSelf)
        } else if message.sender == STATUS_BROADCAST {
            Some(IgnoreReason::StatusBroadcast)
        } else if text.is_empty() {
            Some(IgnoreReason::Empty)
        } else if PROTOCOL_NOISE.iter().any(|noise| text.contains(noise)) {
            Some(IgnoreReason::ProtocolNoise)
        } else if text.starts_with('/') {
            Some(IgnoreReason::Command)
        } else {
            None
        }
    }

    pub async fn dispatch(&self, message: InboundMessage) -> Disposition {
        if let Some(reason) = self.screen(&message) {
            debug!(sender = %message.sender, reason = reason.as_str(), "inbound message ignored");
            return Disposition::Ignored(reason);
        }

        if is_greeting(&message.text) {
            let settings = self.orchestrator.settings();
            let welcome = self
                .orchestrator
                .messages()
                .welcome(settings.max_file_size_mb, self.requests.stats().concurrency);
            if let Err(err) = self
                .transport
                .send(&message.sender, OutboundMessage::Text(welcome))
                .await
            {
                warn!(sender = %message.sender, error = %err, "failed to send welcome");
            }
            return Disposition::Greeted;
        }

        let request_id = self.ledger.next_id(&message.sender, now_millis());
        let stats = self.requests.stats();
        info!(
            target: "pkgbot::requests",
            request = %request_id,
            text = %message.text,
            waiting = stats.waiting,
            running = stats.running,
            "request queued"
        );
        let orchestrator = Arc::clone(&self.orchestrator);
        let request = ChatRequest {
            id: request_id.clone(),
            message,
        };
        let ticket = self
            .requests
            .submit(async move { orchestrator.handle(request).await });
        Disposition::Queued { request_id, ticket }
    }
}

fn is_greeting(text: &str) -> bool {
    let text = text.trim().to_lowercase();
    GREETINGS.iter().any(|greeting| text == *greeting)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FileReaper, ResultCache};
    use crate::controller::{Components, PipelineSettings};
    use crate::executor::DownstreamExecutor;
    use crate::fetch::FetchResponse;
    use crate::messages::Messages;
    use crate::test_support::{RecordingTransport, ScriptReply, ScriptedFetch, StaticCatalog};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Fixture {
        dispatcher: Dispatcher,
        transport: Arc<RecordingTransport>,
        fetch: Arc<ScriptedFetch>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(
            ScriptedFetch::new()
                .on_link(ScriptReply::Response(FetchResponse {
                    success: true,
                    filename: Some("WhatsApp_2.24.1_.apk".into()),
                    file_path: Some("downloads/WhatsApp_2.24.1_.apk".into()),
                    size: Some(1024),
                    ..FetchResponse::default()
                }))
                .materialize_into(dir.path()),
        );
        let transport = Arc::new(RecordingTransport::new(true));
        let reaper = FileReaper::new(Duration::from_millis(10));
        let ledger = Arc::new(RequestLedger::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Components {
                cache: Arc::new(ResultCache::new(Duration::from_secs(60), Arc::new(reaper.clone()))),
                ledger: Arc::clone(&ledger),
                downstream: DownstreamExecutor::new(2),
                fetch: fetch.clone(),
                catalog: Arc::new(StaticCatalog::empty()),
                transport: transport.clone(),
                reaper,
                messages: Messages::default(),
            },
            PipelineSettings {
                max_file_size_mb: 2048,
                max_file_bytes: 2048 * 1024 * 1024,
                retention_ttl: Duration::from_secs(600),
                ledger_retention: Duration::from_secs(60),
                downloads_dir: dir.path().to_path_buf(),
                icon_timeout: Duration::from_millis(200),
            },
        )
        .unwrap());
        let dispatcher = Dispatcher::new(
            orchestrator,
            RequestExecutor::new(4),
            ledger,
            transport.clone(),
        );
        Fixture {
            dispatcher,
            transport,
            fetch,
            _dir: dir,
        }
    }

    fn message(sender: &str, text: &str, from_me: bool) -> InboundMessage {
        InboundMessage {
            message_id: "m1".into(),
            sender: sender.into(),
            text: text.into(),
            from_me,
        }
    }

    const USER: &str = "963900000000@s.whatsapp.net";

    #[tokio::test]
    async fn filters_messages_that_are_not_requests() {
        let f = fixture();
        let cases = [
            (message(USER, "whatsapp", true), IgnoreReason::FromSelf),
            (message(STATUS_BROADCAST, "whatsapp", false), IgnoreReason::StatusBroadcast),
            (message(USER, "   ", false), IgnoreReason::Empty),
            (message(USER, "Bad MAC error", false), IgnoreReason::ProtocolNoise),
            (message(USER, "/help", false), IgnoreReason::Command),
        ];
        for (msg, expected) in cases {
            match f.dispatcher.dispatch(msg).await {
                Disposition::Ignored(reason) => assert_eq!(reason, expected),
                other => panic!("expected {expected:?}, got {}", other.as_str()),
            }
        }
        assert!(f.transport.sent().is_empty());
        assert_eq!(f.fetch.link_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn offline_session_drops_everything() {
        let f = fixture();
        f.transport.set_live(false);
        assert!(matches!(
            f.dispatcher.dispatch(message(USER, "whatsapp", false)).await,
            Disposition::Ignored(IgnoreReason::Offline)
        ));
    }

    #[tokio::test]
    async fn greeting_gets_welcome_and_is_not_queued() {
        let f = fixture();
        let disposition = f.dispatcher.dispatch(message(USER, "  Hello ", false)).await;
        assert!(matches!(disposition, Disposition::Greeted));
        let texts = f.transport.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("2048MB"));
        assert_eq!(f.dispatcher.requests().stats().waiting, 0);
        assert_eq!(f.fetch.link_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn request_is_queued_and_runs_to_completion() {
        let f = fixture();
        let Disposition::Queued { request_id, ticket } =
            f.dispatcher.dispatch(message(USER, "WhatsApp", false)).await
        else {
            panic!("expected request to be queued");
        };
        assert!(request_id.starts_with(&format!("{USER}_")));
        let outcome = ticket.await.unwrap();
        assert_eq!(outcome, RequestOutcome::Delivered { cache_hit: false });
        assert_eq!(f.transport.documents(), vec!["WhatsApp_2.24.1_.apk"]);
    }
}
