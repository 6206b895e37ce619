//! Single-active-app process manager
//!
//! One worker task owns the running backend. Requests reach it only through a
//! bounded job queue and get their answer on a private oneshot channel, so
//! switches are strictly serialized. A shutdown signal cuts short a switch
//! that is still waiting for its backend to become ready. Readers query the
//! active app through a separate `RwLock` snapshot that is only written inside
//! the worker's critical section.

use crate::config::ManagerConfig;
use crate::control::{ProcessController, ShellController};
use crate::error::GatewayErrorCode;
use crate::readiness::{HttpProbe, ReadinessProbe};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Outcome of one switch job
pub type SwitchResult = Result<(), SwitchError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwitchError {
    /// A newer switch completed after this job was submitted
    #[error("app changed while the switch to '{app}' was queued")]
    Stale { app: String },
    #[error("failed to start app '{app}': {reason}")]
    SpawnFailed { app: String, reason: String },
    #[error("app '{app}' did not become ready: {reason}")]
    NotReady { app: String, reason: String },
    #[error("process manager stopped")]
    Stopped,
}

impl SwitchError {
    pub fn error_code(&self) -> GatewayErrorCode {
        match self {
            SwitchError::Stale { .. } => GatewayErrorCode::StaleSwitch,
            SwitchError::SpawnFailed { .. } | SwitchError::NotReady { .. } => {
                GatewayErrorCode::StartupFailed
            }
            SwitchError::Stopped => GatewayErrorCode::ShuttingDown,
        }
    }
}

/// Request to make `app` the active backend
#[derive(Debug)]
pub struct SwitchJob {
    app: String,
    entrypoint: String,
    host: String,
    submitted_at: Instant,
    result_tx: oneshot::Sender<SwitchResult>,
}

impl SwitchJob {
    /// Create a job stamped with the current time, and the receiver for its result
    pub fn new(
        app: &str,
        entrypoint: &str,
        host: &str,
    ) -> (Self, oneshot::Receiver<SwitchResult>) {
        let (result_tx, result_rx) = oneshot::channel();
        let job = Self {
            app: app.to_string(),
            entrypoint: entrypoint.to_string(),
            host: host.to_string(),
            submitted_at: Instant::now(),
            result_tx,
        };
        (job, result_rx)
    }

    /// Override the submission timestamp
    pub fn with_submitted_at(mut self, submitted_at: Instant) -> Self {
        self.submitted_at = submitted_at;
        self
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    fn respond(self, result: SwitchResult) {
        if self.result_tx.send(result).is_err() {
            debug!(app = %self.app, "Switch requester went away before the result");
        }
    }
}

/// Read-side view of the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStatus {
    pub active_app: Option<String>,
    pub last_changed_at: Instant,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Capacity of the job queue; submitters wait while it is full
    pub queue_capacity: usize,
    /// Time between soft stop and hard kill
    pub grace_period: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            grace_period: Duration::from_secs(30),
        }
    }
}

impl From<&ManagerConfig> for ManagerSettings {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            grace_period: config.shutdown_grace_period(),
        }
    }
}

/// State owned by the worker. `process` is only present while `active_app` is.
struct ManagerState<H> {
    active_app: Option<String>,
    last_changed_at: Instant,
    process: Option<H>,
}

struct Shared<C: ProcessController, P> {
    controller: C,
    probe: P,
    grace_period: Duration,
    state: Mutex<ManagerState<C::Handle>>,
    snapshot: RwLock<ManagerStatus>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Keeps at most one backend process alive and switches between apps on request.
///
/// Like the rest of the gateway it is shared behind an `Arc`; [`new`](Self::new)
/// spawns the worker and must be called inside a tokio runtime.
pub struct ProcessManager<C: ProcessController = ShellController, P = HttpProbe> {
    jobs: mpsc::Sender<SwitchJob>,
    shared: Arc<Shared<C, P>>,
}

impl<C, P> ProcessManager<C, P>
where
    C: ProcessController,
    P: ReadinessProbe,
{
    pub fn new(
        controller: C,
        probe: P,
        settings: ManagerSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let shared = Arc::new(Shared {
            controller,
            probe,
            grace_period: settings.grace_period,
            state: Mutex::new(ManagerState {
                active_app: None,
                last_changed_at: now,
                process: None,
            }),
            snapshot: RwLock::new(ManagerStatus {
                active_app: None,
                last_changed_at: now,
                pid: None,
            }),
            shutdown_rx: shutdown_rx.clone(),
        });

        let (jobs, jobs_rx) = mpsc::channel(settings.queue_capacity.max(1));
        tokio::spawn(run_worker(Arc::clone(&shared), jobs_rx, shutdown_rx));

        Arc::new(Self { jobs, shared })
    }

    /// Enqueue a job. Waits while the queue is full; never drops the job.
    pub async fn submit(&self, job: SwitchJob) -> Result<(), SwitchError> {
        self.jobs.send(job).await.map_err(|_| SwitchError::Stopped)
    }

    /// Make `app` active and wait for the outcome
    pub async fn activate(&self, app: &str, entrypoint: &str, host: &str) -> SwitchResult {
        let (job, result_rx) = SwitchJob::new(app, entrypoint, host);
        self.submit(job).await?;
        result_rx.await.unwrap_or(Err(SwitchError::Stopped))
    }

    /// Name of the active app
    pub fn active_app(&self) -> Option<String> {
        self.shared.snapshot.read().active_app.clone()
    }

    pub fn status(&self) -> ManagerStatus {
        self.shared.snapshot.read().clone()
    }

    /// Terminate the active backend, waiting for any in-flight switch first
    pub async fn shutdown(&self) {
        self.shared.terminate_active().await;
    }
}

async fn run_worker<C, P>(
    shared: Arc<Shared<C, P>>,
    mut jobs: mpsc::Receiver<SwitchJob>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    C: ProcessController,
    P: ReadinessProbe,
{
    debug!("Process manager worker started");

    while !*shutdown_rx.borrow() {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    // Owner of the shutdown channel is gone
                    break;
                }
            }
            job = jobs.recv() => {
                match job {
                    Some(job) => shared.process_job(job).await,
                    None => break,
                }
            }
        }
    }

    info!("Process manager worker stopping");
    jobs.close();
    while let Ok(job) = jobs.try_recv() {
        job.respond(Err(SwitchError::Stopped));
    }
    shared.terminate_active().await;
}

/// Resolves once shutdown is signalled. A dropped sender never interrupts a switch.
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    if shutdown_rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl<C, P> Shared<C, P>
where
    C: ProcessController,
    P: ReadinessProbe,
{
    async fn process_job(&self, job: SwitchJob) {
        let mut state = self.state.lock().await;

        if state.active_app.as_deref() == Some(job.app.as_str()) {
            debug!(app = %job.app, "App already active");
            job.respond(Ok(()));
            return;
        }

        if state.last_changed_at > job.submitted_at {
            info!(
                app = %job.app,
                active_app = ?state.active_app,
                "Rejecting stale switch, app changed after submission"
            );
            let app = job.app.clone();
            job.respond(Err(SwitchError::Stale { app }));
            return;
        }

        info!(from = ?state.active_app, to = %job.app, "Switching app");

        if let Some(previous) = state.process.take() {
            info!(app = ?state.active_app, pid = self.controller.pid(&previous), "Terminating previous backend");
            self.publish(&state);
            self.controller.terminate(previous, self.grace_period).await;
        }

        let handle = match self.controller.spawn(&job.entrypoint) {
            Ok(handle) => handle,
            Err(e) => {
                error!(app = %job.app, error = %e, "Failed to spawn backend");
                let app = job.app.clone();
                job.respond(Err(SwitchError::SpawnFailed {
                    app,
                    reason: e.to_string(),
                }));
                return;
            }
        };

        let mut shutdown_rx = self.shutdown_rx.clone();
        let ready = tokio::select! {
            ready = self.probe.wait_ready(&job.host) => ready,
            _ = shutdown_requested(&mut shutdown_rx) => {
                warn!(app = %job.app, "Shutdown requested while waiting for readiness, stopping new backend");
                self.controller.terminate(handle, self.grace_period).await;
                job.respond(Err(SwitchError::Stopped));
                return;
            }
        };

        if let Err(e) = ready {
            error!(app = %job.app, host = %job.host, error = %e, "Backend never became ready, stopping it");
            self.controller.terminate(handle, self.grace_period).await;
            let app = job.app.clone();
            job.respond(Err(SwitchError::NotReady {
                app,
                reason: e.to_string(),
            }));
            return;
        }

        let pid = self.controller.pid(&handle);
        state.active_app = Some(job.app.clone());
        state.last_changed_at = Instant::now();
        state.process = Some(handle);
        self.publish(&state);

        info!(app = %job.app, pid, "App is now active");
        job.respond(Ok(()));
    }

    async fn terminate_active(&self) {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.process.take() {
            info!(app = ?state.active_app, pid = self.controller.pid(&handle), "Terminating active backend");
            state.active_app = None;
            self.publish(&state);
            self.controller.terminate(handle, self.grace_period).await;
        } else if state.active_app.take().is_some() {
            warn!("Active app had no running process");
            self.publish(&state);
        }
    }

    fn publish(&self, state: &ManagerState<C::Handle>) {
        let pid = state.process.as_ref().and_then(|h| self.controller.pid(h));
        *self.snapshot.write() = ManagerStatus {
            active_app: state.active_app.clone(),
            last_changed_at: state.last_changed_at,
            pid,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlError;
    use crate::readiness::ProbeError;
    use std::collections::HashSet;
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Stats {
        spawned: AtomicUsize,
        terminated: AtomicUsize,
        alive: AtomicUsize,
        max_alive: AtomicUsize,
        fail_spawn: AtomicBool,
    }

    struct MockController {
        stats: Arc<Stats>,
    }

    struct MockHandle {
        id: u32,
    }

    impl ProcessController for MockController {
        type Handle = MockHandle;

        fn spawn(&self, command: &str) -> Result<MockHandle, ControlError> {
            if self.stats.fail_spawn.load(Ordering::SeqCst) {
                return Err(ControlError::Spawn {
                    command: command.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                });
            }
            let id = self.stats.spawned.fetch_add(1, Ordering::SeqCst) as u32 + 1;
            let alive = self.stats.alive.fetch_add(1, Ordering::SeqCst) + 1;
            self.stats.max_alive.fetch_max(alive, Ordering::SeqCst);
            Ok(MockHandle { id })
        }

        fn terminate(&self, _handle: MockHandle, _grace: Duration) -> impl Future<Output = ()> + Send {
            let stats = Arc::clone(&self.stats);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                stats.alive.fetch_sub(1, Ordering::SeqCst);
                stats.terminated.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn pid(&self, handle: &MockHandle) -> Option<u32> {
            Some(handle.id)
        }
    }

    struct MockProbe {
        delay: Duration,
        failing_hosts: HashSet<String>,
    }

    impl ReadinessProbe for MockProbe {
        fn wait_ready(&self, host: &str) -> impl Future<Output = Result<(), ProbeError>> + Send {
            let delay = self.delay;
            let fails = self.failing_hosts.contains(host);
            let url = format!("http://{}/", host);
            async move {
                tokio::time::sleep(delay).await;
                if fails {
                    Err(ProbeError::Timeout {
                        url,
                        timeout: delay,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    fn manager_with(
        delay: Duration,
        failing_hosts: &[&str],
        queue_capacity: usize,
    ) -> (Arc<ProcessManager<MockController, MockProbe>>, Arc<Stats>, watch::Sender<bool>) {
        let stats = Arc::new(Stats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = ProcessManager::new(
            MockController {
                stats: Arc::clone(&stats),
            },
            MockProbe {
                delay,
                failing_hosts: failing_hosts.iter().map(|h| h.to_string()).collect(),
            },
            ManagerSettings {
                queue_capacity,
                grace_period: Duration::from_millis(50),
            },
            shutdown_rx,
        );
        (manager, stats, shutdown_tx)
    }

    fn test_manager() -> (Arc<ProcessManager<MockController, MockProbe>>, Arc<Stats>, watch::Sender<bool>) {
        manager_with(Duration::from_millis(10), &["bad:1"], 100)
    }

    #[tokio::test]
    async fn test_first_switch_spawns() {
        let (manager, stats, _tx) = test_manager();
        assert_eq!(manager.active_app(), None);

        manager.activate("a", "run a", "a:1").await.unwrap();

        assert_eq!(manager.active_app(), Some("a".to_string()));
        assert_eq!(manager.status().pid, Some(1));
        assert_eq!(stats.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(stats.terminated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_same_app_is_fast_path() {
        let (manager, stats, _tx) = test_manager();
        manager.activate("a", "run a", "a:1").await.unwrap();
        let changed_at = manager.status().last_changed_at;

        for _ in 0..3 {
            manager.activate("a", "run a", "a:1").await.unwrap();
        }

        assert_eq!(stats.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(stats.terminated.load(Ordering::SeqCst), 0);
        assert_eq!(manager.status().last_changed_at, changed_at);
    }

    #[tokio::test]
    async fn test_switch_terminates_previous() {
        let (manager, stats, _tx) = test_manager();
        manager.activate("a", "run a", "a:1").await.unwrap();
        let first_change = manager.status().last_changed_at;

        manager.activate("b", "run b", "b:1").await.unwrap();

        assert_eq!(manager.active_app(), Some("b".to_string()));
        assert_eq!(manager.status().pid, Some(2));
        assert!(manager.status().last_changed_at >= first_change);
        assert_eq!(stats.spawned.load(Ordering::SeqCst), 2);
        assert_eq!(stats.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(stats.max_alive.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_job_rejected_without_side_effects() {
        let (manager, stats, _tx) = test_manager();
        let before = Instant::now();
        manager.activate("a", "run a", "a:1").await.unwrap();
        let status = manager.status();

        let (job, result_rx) = SwitchJob::new("b", "run b", "b:1");
        manager.submit(job.with_submitted_at(before)).await.unwrap();
        let result = result_rx.await.unwrap();

        assert_eq!(result, Err(SwitchError::Stale { app: "b".to_string() }));
        assert_eq!(result.unwrap_err().error_code(), GatewayErrorCode::StaleSwitch);
        assert_eq!(manager.status(), status);
        assert_eq!(stats.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(stats.terminated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_job_for_active_app_wins_over_staleness() {
        let (manager, stats, _tx) = test_manager();
        let before = Instant::now();
        manager.activate("a", "run a", "a:1").await.unwrap();

        let (job, result_rx) = SwitchJob::new("a", "run a", "a:1");
        manager.submit(job.with_submitted_at(before)).await.unwrap();

        assert_eq!(result_rx.await.unwrap(), Ok(()));
        assert_eq!(stats.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_readiness_terminates_new_process() {
        let (manager, stats, _tx) = test_manager();
        let status = manager.status();

        let result = manager.activate("broken", "run broken", "bad:1").await;

        assert!(matches!(result, Err(SwitchError::NotReady { .. })));
        assert_eq!(result.unwrap_err().error_code(), GatewayErrorCode::StartupFailed);
        assert_eq!(manager.status(), status);
        assert_eq!(stats.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(stats.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(stats.alive.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_previous_name_without_process() {
        let (manager, stats, _tx) = test_manager();
        manager.activate("a", "run a", "a:1").await.unwrap();
        let changed_at = manager.status().last_changed_at;

        let result = manager.activate("broken", "run broken", "bad:1").await;
        assert!(result.is_err());

        let status = manager.status();
        assert_eq!(status.active_app, Some("a".to_string()));
        assert_eq!(status.last_changed_at, changed_at);
        assert_eq!(status.pid, None);
        assert_eq!(stats.alive.load(Ordering::SeqCst), 0);
        assert_eq!(stats.terminated.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_reported() {
        let (manager, stats, _tx) = test_manager();
        stats.fail_spawn.store(true, Ordering::SeqCst);

        let result = manager.activate("a", "missing-binary", "a:1").await;

        match result {
            Err(SwitchError::SpawnFailed { app, reason }) => {
                assert_eq!(app, "a");
                assert!(reason.contains("missing-binary"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(manager.active_app(), None);

        // Worker keeps going after a failed job
        stats.fail_spawn.store(false, Ordering::SeqCst);
        manager.activate("a", "run a", "a:1").await.unwrap();
        assert_eq!(manager.active_app(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_job_queued_during_switch_is_stale() {
        let (manager, stats, _tx) = manager_with(Duration::from_millis(200), &[], 100);

        let (job_b, b_rx) = SwitchJob::new("b", "run b", "b:1");
        manager.submit(job_b).await.unwrap();

        // Submitted while b is still starting, resolved after b commits
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (job_a, a_rx) = SwitchJob::new("a", "run a", "a:1");
        manager.submit(job_a).await.unwrap();

        assert_eq!(b_rx.await.unwrap(), Ok(()));
        assert_eq!(a_rx.await.unwrap(), Err(SwitchError::Stale { app: "a".to_string() }));
        assert_eq!(manager.active_app(), Some("b".to_string()));
        assert_eq!(stats.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_switches_keep_one_process() {
        let (manager, stats, _tx) = manager_with(Duration::from_millis(5), &[], 100);

        let mut tasks = Vec::new();
        for i in 0..30 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                let app = ["a", "b", "c"][i % 3];
                if i % 4 == 0 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                manager.activate(app, app, &format!("{}:1", app)).await
            }));
        }

        for task in tasks {
            let result = task.await.unwrap();
            assert!(
                matches!(result, Ok(()) | Err(SwitchError::Stale { .. })),
                "unexpected result: {:?}",
                result
            );
        }

        assert_eq!(stats.max_alive.load(Ordering::SeqCst), 1);
        assert_eq!(stats.alive.load(Ordering::SeqCst), 1);
        assert_eq!(
            stats.spawned.load(Ordering::SeqCst),
            stats.terminated.load(Ordering::SeqCst) + 1
        );
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure_without_dropping() {
        let (manager, stats, _tx) = manager_with(Duration::from_millis(20), &[], 1);

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move { manager.activate("a", "run a", "a:1").await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(()));
        }
        assert_eq!(stats.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_active_process() {
        let (manager, stats, _tx) = test_manager();
        manager.activate("a", "run a", "a:1").await.unwrap();

        manager.shutdown().await;

        assert_eq!(stats.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(stats.alive.load(Ordering::SeqCst), 0);
        assert_eq!(manager.active_app(), None);

        // Nothing left to stop
        manager.shutdown().await;
        assert_eq!(stats.terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_worker_and_process() {
        let (manager, stats, shutdown_tx) = test_manager();
        manager.activate("a", "run a", "a:1").await.unwrap();

        shutdown_tx.send(true).unwrap();

        let mut stopped = false;
        for _ in 0..50 {
            if stats.terminated.load(Ordering::SeqCst) == 1 {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stopped, "worker did not terminate the active process");

        let result = manager.activate("b", "run b", "b:1").await;
        assert_eq!(result, Err(SwitchError::Stopped));
        assert_eq!(stats.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_readiness_wait() {
        let (manager, stats, shutdown_tx) = manager_with(Duration::from_secs(3), &[], 100);

        let pending = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.activate("a", "run a", "a:1").await })
        };
        while stats.spawned.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let start = Instant::now();
        shutdown_tx.send(true).unwrap();
        manager.shutdown().await;

        assert!(
            start.elapsed() < Duration::from_secs(1),
            "shutdown waited for readiness: {:?}",
            start.elapsed()
        );
        assert_eq!(pending.await.unwrap(), Err(SwitchError::Stopped));
        assert_eq!(stats.alive.load(Ordering::SeqCst), 0);
        assert_eq!(stats.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_app(), None);
    }

    #[test]
    fn test_settings_from_config() {
        let settings = ManagerSettings::from(&ManagerConfig::default());
        assert_eq!(settings.queue_capacity, 100);
        assert_eq!(settings.grace_period, Duration::from_secs(30));
    }

    #[test]
    fn test_switch_error_codes() {
        let not_ready = SwitchError::NotReady {
            app: "a".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(not_ready.error_code(), GatewayErrorCode::StartupFailed);
        assert_eq!(SwitchError::Stopped.error_code(), GatewayErrorCode::ShuttingDown);
        assert!(not_ready.to_string().contains("did not become ready"));
    }
}
