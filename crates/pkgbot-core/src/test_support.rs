//! Fakes shared by the pipeline tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::catalog::{CatalogError, CatalogHit, CatalogProvider};
use crate::fetch::{FetchError, FetchResponse, FetchService};
use crate::transport::{ChatTransport, OutboundMessage, TransportError};

pub mod env {
    use once_cell::sync::Lazy;
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    pub struct EnvGuard {
        _lock: MutexGuard<'static, ()>,
        saved: Vec<(&'static str, Option<String>)>,
    }

    pub fn guard() -> EnvGuard {
        EnvGuard {
            _lock: ENV_LOCK
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            saved: Vec::new(),
        }
    }

    impl EnvGuard {
        fn remember(&mut self, key: &'static str) {
            if self.saved.iter().any(|(k, _)| *k == key) {
                return;
            }
            self.saved.push((key, std::env::var(key).ok()));
        }

        pub fn set(&mut self, key: &'static str, value: &str) {
            self.remember(key);
            std::env::set_var(key, value);
        }

        pub fn remove(&mut self, key: &'static str) {
            self.remember(key);
            std::env::remove_var(key);
        }

        pub fn set_opt(&mut self, key: &'static str, value: Option<&str>) {
            match value {
                Some(value) => self.set(key, value),
                None => self.remove(key),
            }
        }

        pub fn apply<'a, I>(&mut self, pairs: I)
        where
            I: IntoIterator<Item = (&'static str, Option<&'a str>)>,
        {
            for (key, value) in pairs {
                self.set_opt(key, value);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, val) in self.saved.drain(..) {
                match val {
                    Some(v) => std::env::set_var(key, v),
                    None => std::env::remove_var(key),
                }
            }
        }
    }
}

/// Records everything sent; liveness is switchable.
pub(crate) struct RecordingTransport {
    live: AtomicBool,
    sent: Mutex<Vec<(String, OutboundMessage)>>,
    reactions: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub(crate) fn new(live: bool) -> Self {
        Self {
            live: AtomicBool::new(live),
            sent: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<(String, OutboundMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|(_, message)| match message {
                OutboundMessage::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn documents(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|(_, message)| match message {
                OutboundMessage::Document { file_name, .. } => Some(file_name),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn reactions(&self) -> Vec<String> {
        self.reactions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn send(&self, to: &str, message: OutboundMessage) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::Offline);
        }
        self.sent.lock().unwrap().push((to.to_string(), message));
        Ok(())
    }

    async fn react(&self, _to: &str, _message_id: &str, emoji: &str) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::Offline);
        }
        self.reactions.lock().unwrap().push(emoji.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ScriptReply {
    Response(FetchResponse),
    Unreachable,
}

impl ScriptReply {
    fn to_result(&self) -> Result<FetchResponse, FetchError> {
        match self {
            ScriptReply::Response(response) => Ok(response.clone()),
            ScriptReply::Unreachable => Err(FetchError::Unreachable("connection refused".into())),
        }
    }
}

/// Replays queued replies per endpoint; the last reply repeats. When a
/// downloads directory is set, every reply carrying a file writes it there.
pub(crate) struct ScriptedFetch {
    link_replies: Mutex<VecDeque<ScriptReply>>,
    download_replies: Mutex<VecDeque<ScriptReply>>,
    packages: Mutex<Vec<String>>,
    downloads_dir: Option<PathBuf>,
    delay: Duration,
    pub(crate) ensure_calls: AtomicU32,
    pub(crate) link_calls: AtomicU32,
    pub(crate) download_calls: AtomicU32,
}

impl ScriptedFetch {
    pub(crate) fn new() -> Self {
        Self {
            link_replies: Mutex::new(VecDeque::new()),
            download_replies: Mutex::new(VecDeque::new()),
            packages: Mutex::new(Vec::new()),
            downloads_dir: None,
            delay: Duration::ZERO,
            ensure_calls: AtomicU32::new(0),
            link_calls: AtomicU32::new(0),
            download_calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn on_link(self, reply: ScriptReply) -> Self {
        self.link_replies.lock().unwrap().push_back(reply);
        self
    }

    pub(crate) fn on_download(self, reply: ScriptReply) -> Self {
        self.download_replies.lock().unwrap().push_back(reply);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn materialize_into(mut self, dir: &Path) -> Self {
        self.downloads_dir = Some(dir.to_path_buf());
        self
    }

    pub(crate) fn packages(&self) -> Vec<String> {
        self.packages.lock().unwrap().clone()
    }

    async fn reply(
        &self,
        replies: &Mutex<VecDeque<ScriptReply>>,
        package: &str,
    ) -> Result<FetchResponse, FetchError> {
        self.packages.lock().unwrap().push(package.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reply = {
            let mut queue = replies.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        };
        let result = reply
            .map(|reply| reply.to_result())
            .unwrap_or_else(|| Err(FetchError::Status { status: 500 }));
        if let (Ok(response), Some(dir)) = (&result, &self.downloads_dir) {
            if let (Some(name), Some(_)) = (&response.filename, &response.file_path) {
                std::fs::write(dir.join(name), b"PK\x03\x04artifact").unwrap();
            }
        }
        result
    }
}

#[async_trait]
impl FetchService for ScriptedFetch {
    async fn ensure_live(&self) -> Result<(), FetchError> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn link(&self, package: &str) -> Result<FetchResponse, FetchError> {
        self.link_calls.fetch_add(1, Ordering::SeqCst);
        self.reply(&self.link_replies, package).await
    }

    async fn download(&self, package: &str) -> Result<FetchResponse, FetchError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        self.reply(&self.download_replies, package).await
    }
}

/// Fixed catalog answer that records the searched terms.
pub(crate) struct StaticCatalog {
    hit: Option<CatalogHit>,
    fail: bool,
    terms: Mutex<Vec<String>>,
}

impl StaticCatalog {
    pub(crate) fn hit(hit: CatalogHit) -> Self {
        Self {
            hit: Some(hit),
            fail: false,
            terms: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            hit: None,
            fail: false,
            terms: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            hit: None,
            fail: true,
            terms: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn terms(&self) -> Vec<String> {
        self.terms.lock().unwrap().clone()
    }
}

#[async_trait]
impl CatalogProvider for StaticCatalog {
    async fn search_one(&self, term: &str) -> Result<Option<CatalogHit>, CatalogError> {
        self.terms.lock().unwrap().push(term.to_string());
        if self.fail {
            return Err(CatalogError::Status(503));
        }
        Ok(self.hit.clone())
    }
}
