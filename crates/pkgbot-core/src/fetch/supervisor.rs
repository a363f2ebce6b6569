use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{info, warn};

use super::FetchError;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<(), FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Unknown,
    Starting,
    Live,
    Unreachable,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Unknown => "unknown",
            ServiceState::Starting => "starting",
            ServiceState::Live => "live",
            ServiceState::Unreachable => "unreachable",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("fetch service is down and no launch command is configured")]
    NoLauncher,
    #[error("failed to launch fetch service: {0}")]
    Launch(#[from] std::io::Error),
    #[error("fetch service not live after {0:?}")]
    NotReady(Duration),
    /// A cycle that just finished, or failed moments ago, already answered.
    #[error("fetch service unavailable: {0}")]
    Unavailable(String),
}

/// How long a failed cycle answers for later callers without a new health check.
const FAILURE_COOLDOWN: Duration = Duration::from_secs(1);

struct CycleOutcome {
    result: Result<(), String>,
    finished: Instant,
}

/// Owns the fetch service's liveness. `ensure_live` is serialized; a caller
/// that queued behind a running cycle takes that cycle's outcome, so no
/// caller waits longer than one ready budget.
pub struct ServiceSupervisor {
    probe: Arc<dyn HealthProbe>,
    launch: Option<Vec<String>>,
    ready_timeout: Duration,
    poll_interval: Duration,
    state: Mutex<ServiceState>,
    child: tokio::sync::Mutex<Option<Child>>,
    cycles: AtomicU64,
    last: Mutex<Option<CycleOutcome>>,
}

impl ServiceSupervisor {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        launch: Option<Vec<String>>,
        ready_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            probe,
            launch: launch.filter(|argv| !argv.is_empty()),
            ready_timeout,
            poll_interval: poll_interval.max(Duration::from_millis(10)),
            state: Mutex::new(ServiceState::Unknown),
            child: tokio::sync::Mutex::new(None),
            cycles: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ServiceState::Unknown)
    }

    fn set_state(&self, next: ServiceState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                info!(target: "pkgbot::fetch", from = state.as_str(), to = next.as_str(), "fetch service state");
                *state = next;
            }
        }
    }

    pub async fn ensure_live(&self) -> Result<(), SupervisorError> {
        let seen = self.cycles.load(Ordering::SeqCst);
        if let Some(reason) = self.recent_failure() {
            return Err(SupervisorError::Unavailable(reason));
        }
        let mut child = self.child.lock().await;
        if self.cycles.load(Ordering::SeqCst) != seen {
            if let Some(result) = self.last_result() {
                return result.map_err(SupervisorError::Unavailable);
            }
        }
        let result = self.run_cycle(&mut child).await;
        self.record(&result);
        result
    }

    fn recent_failure(&self) -> Option<String> {
        let last = self.last.lock().ok()?;
        match last.as_ref()? {
            CycleOutcome {
                result: Err(reason),
                finished,
            } if finished.elapsed() < FAILURE_COOLDOWN => Some(reason.clone()),
            _ => None,
        }
    }

    fn last_result(&self) -> Option<Result<(), String>> {
        let last = self.last.lock().ok()?;
        last.as_ref().map(|outcome| outcome.result.clone())
    }

    fn record(&self, result: &Result<(), SupervisorError>) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(CycleOutcome {
                result: result.as_ref().map(|_| ()).map_err(|err| err.to_string()),
                finished: Instant::now(),
            });
        }
        self.cycles.fetch_add(1, Ordering::SeqCst);
    }

    async fn run_cycle(&self, child: &mut Option<Child>) -> Result<(), SupervisorError> {
        if self.probe.probe().await.is_ok() {
            self.set_state(ServiceState::Live);
            return Ok(());
        }
        let Some(argv) = self.launch.as_ref() else {
            self.set_state(ServiceState::Unreachable);
            return Err(SupervisorError::NoLauncher);
        };

        if let Some(existing) = child.as_mut() {
            if let Ok(Some(status)) = existing.try_wait() {
                warn!(target: "pkgbot::fetch", %status, "launched fetch service exited");
                *child = None;
            }
        }
        if child.is_none() {
            self.set_state(ServiceState::Starting);
            match spawn_service(argv) {
                Ok(spawned) => {
                    info!(target: "pkgbot::fetch", program = %argv[0], pid = ?spawned.id(), "launched fetch service");
                    *child = Some(spawned);
                }
                Err(err) => {
                    self.set_state(ServiceState::Unreachable);
                    return Err(SupervisorError::Launch(err));
                }
            }
        } else {
            self.set_state(ServiceState::Starting);
        }

        let deadline = Instant::now() + self.ready_timeout;
        while Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;
            if self.probe.probe().await.is_ok() {
                self.set_state(ServiceState::Live);
                return Ok(());
            }
        }
        self.set_state(ServiceState::Unreachable);
        Err(SupervisorError::NotReady(self.ready_timeout))
    }

    /// Kills a service this supervisor launched, if any.
    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Some(mut running) = child.take() {
            if let Err(err) = running.kill().await {
                warn!(target: "pkgbot::fetch", error = %err, "failed to stop fetch service");
            } else {
                info!(target: "pkgbot::fetch", "fetch service stopped");
            }
        }
    }
}

fn spawn_service(argv: &[String]) -> std::io::Result<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty launch command"))?;
    Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Healthy once `healthy_after` probes have failed.
    struct ScriptedProbe {
        calls: AtomicU32,
        healthy_after: u32,
        delay: Duration,
    }

    impl ScriptedProbe {
        fn new(healthy_after: u32) -> Arc<Self> {
            Self::slow(healthy_after, Duration::ZERO)
        }

        fn slow(healthy_after: u32, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                healthy_after,
                delay,
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self) -> Result<(), FetchError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.healthy_after {
                Ok(())
            } else {
                Err(FetchError::Unreachable("connection refused".into()))
            }
        }
    }

    fn noop_command() -> Option<Vec<String>> {
        Some(vec!["sh".into(), "-c".into(), "sleep 5".into()])
    }

    #[tokio::test]
    async fn live_service_is_not_launched() {
        let probe = ScriptedProbe::new(0);
        let supervisor = ServiceSupervisor::new(probe.clone(), None, Duration::from_secs(1), Duration::from_millis(10));
        assert_eq!(supervisor.state(), ServiceState::Unknown);
        supervisor.ensure_live().await.unwrap();
        assert_eq!(supervisor.state(), ServiceState::Live);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn down_without_launcher_is_unreachable() {
        let supervisor = ServiceSupervisor::new(
            ScriptedProbe::new(u32::MAX),
            None,
            Duration::from_secs(1),
            Duration::from_millis(10),
        );
        let err = supervisor.ensure_live().await.unwrap_err();
        assert!(matches!(err, SupervisorError::NoLauncher));
        assert_eq!(supervisor.state(), ServiceState::Unreachable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launches_and_polls_until_live() {
        let probe = ScriptedProbe::new(3);
        let supervisor = ServiceSupervisor::new(
            probe.clone(),
            noop_command(),
            Duration::from_secs(2),
            Duration::from_millis(10),
        );
        supervisor.ensure_live().await.unwrap();
        assert_eq!(supervisor.state(), ServiceState::Live);
        assert!(probe.calls.load(Ordering::SeqCst) >= 4);
        supervisor.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn gives_up_after_ready_budget() {
        let supervisor = ServiceSupervisor::new(
            ScriptedProbe::new(u32::MAX),
            noop_command(),
            Duration::from_millis(100),
            Duration::from_millis(20),
        );
        let err = supervisor.ensure_live().await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotReady(_)));
        assert_eq!(supervisor.state(), ServiceState::Unreachable);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn queued_caller_takes_the_running_cycle_outcome() {
        let probe = ScriptedProbe::slow(0, Duration::from_millis(100));
        let supervisor = Arc::new(ServiceSupervisor::new(
            probe.clone(),
            None,
            Duration::from_secs(1),
            Duration::from_millis(10),
        ));
        let first = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move { supervisor.ensure_live().await.is_ok() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move { supervisor.ensure_live().await.is_ok() }
        });
        assert!(first.await.unwrap());
        assert!(second.await.unwrap());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recent_failure_answers_without_another_cycle() {
        let probe = ScriptedProbe::new(u32::MAX);
        let supervisor = ServiceSupervisor::new(
            probe.clone(),
            None,
            Duration::from_secs(1),
            Duration::from_millis(10),
        );
        assert!(matches!(
            supervisor.ensure_live().await.unwrap_err(),
            SupervisorError::NoLauncher
        ));
        let err = supervisor.ensure_live().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Unavailable(ref reason) if reason.contains("no launch command")));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.state(), ServiceState::Unreachable);

        tokio::time::sleep(FAILURE_COOLDOWN + Duration::from_millis(50)).await;
        assert!(matches!(
            supervisor.ensure_live().await.unwrap_err(),
            SupervisorError::NoLauncher
        ));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_callers_wait_at_most_one_ready_budget() {
        let budget = Duration::from_millis(200);
        let supervisor = Arc::new(ServiceSupervisor::new(
            ScriptedProbe::new(u32::MAX),
            noop_command(),
            budget,
            Duration::from_millis(20),
        ));
        let callers: Vec<_> = (0..5)
            .map(|_| {
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move {
                    let started = Instant::now();
                    let failed = supervisor.ensure_live().await.is_err();
                    (failed, started.elapsed())
                })
            })
            .collect();
        let mut slowest = Duration::ZERO;
        for caller in callers {
            let (failed, elapsed) = caller.await.unwrap();
            assert!(failed);
            slowest = slowest.max(elapsed);
        }
        assert!(slowest < budget * 3, "slowest caller waited {slowest:?}");
        assert_eq!(supervisor.state(), ServiceState::Unreachable);
        supervisor.shutdown().await;
    }
}
