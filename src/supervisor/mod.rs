pub mod error;
pub mod launcher;
pub mod process;
pub mod state_machine;
pub mod terminator;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::application::{ApplicationSource, ApplicationSpec, DesiredStatus};
use crate::config::SupervisorConfig;
use crate::process_monitor::{Pid, Prober};
use error::SupervisorError;
use launcher::Launcher;
use process::{ProcessRecord, RecordStore};
use terminator::Terminator;

/// Capacity of the change-notification channel. Slow subscribers lag, they never block the loop.
const EVENT_CAPACITY: usize = 256;

/// Change notifications, delivered after the record commit.
///
/// Delivery is at-least-once; consumers should just re-render current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    StatusChanged { name: String, running: bool },
    Restarted { name: String },
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub restart_cooldown: Duration,
    pub probe_timeout: Duration,
    pub terminate_on_removal: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            restart_cooldown: config.restart_cooldown(),
            probe_timeout: config.probe_timeout(),
            terminate_on_removal: config.terminate_on_removal,
        }
    }
}

struct MonitorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    source: Arc<dyn ApplicationSource>,
    prober: Arc<dyn Prober>,
    launcher: Arc<dyn Launcher>,
    terminator: Arc<dyn Terminator>,
    records: RecordStore,
    events: broadcast::Sender<SupervisorEvent>,
    settings: SupervisorSettings,
    /// Held for a whole reconciliation cycle so cycles never overlap.
    cycle_lock: tokio::sync::Mutex<()>,
    monitor: Mutex<Option<MonitorHandle>>,
}

/// Reconciles desired application state with the host process table.
///
/// Cheap to clone; clones share the same records, loop and event channel.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        source: Arc<dyn ApplicationSource>,
        prober: Arc<dyn Prober>,
        launcher: Arc<dyn Launcher>,
        terminator: Arc<dyn Terminator>,
        settings: SupervisorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let supervisor = Self {
            inner: Arc::new(Inner {
                source,
                prober,
                launcher,
                terminator,
                records: RecordStore::new(),
                events,
                settings,
                cycle_lock: tokio::sync::Mutex::new(()),
                monitor: Mutex::new(None),
            }),
        };
        // 초기 레코드 구성. 프로브는 첫 사이클에서 수행
        let specs = supervisor.inner.source.applications();
        if let Err(e) = supervisor.inner.records.sync(&specs) {
            tracing::error!("Initial record sync failed: {}", e);
        }
        tracing::info!("Supervisor initialized with {} applications", specs.len());
        supervisor
    }

    /// Supervisor backed by the real process table, `kill(2)` and detached spawning.
    #[cfg(unix)]
    pub fn with_system_backends(source: Arc<dyn ApplicationSource>, config: &crate::config::GlobalConfig) -> Self {
        use crate::process_monitor::SystemProber;
        use launcher::DetachedLauncher;
        use terminator::{EscalatingTerminator, NixSignalSender};

        let prober: Arc<dyn Prober> = Arc::new(SystemProber::new());
        let launcher = Arc::new(DetachedLauncher::from_config(prober.clone(), &config.launch));
        let terminator = Arc::new(EscalatingTerminator::from_config(NixSignalSender, &config.terminate));
        Self::new(
            source,
            prober,
            launcher,
            terminator,
            SupervisorSettings::from(&config.supervisor),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of an application's record.
    pub fn record(&self, name: &str) -> Option<ProcessRecord> {
        self.inner.records.get(name).ok()
    }

    // ── Monitoring loop ─────────────────────────────────────────

    fn monitor_slot(&self) -> MutexGuard<'_, Option<MonitorHandle>> {
        self.inner.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start periodic reconciliation. Must be called inside a Tokio runtime.
    /// The first cycle runs immediately.
    pub fn start_monitoring(&self) {
        let mut slot = self.monitor_slot();
        if slot.is_some() {
            tracing::debug!("Process monitoring already running");
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!("Cannot start monitoring outside a Tokio runtime: {}", e);
                return;
            }
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.settings.poll_interval;

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // a long cycle delays the next one instead of causing a burst
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                // 사이클 도중에는 취소하지 않음. 진행 중인 작업은 끝까지 커밋
                Supervisor { inner }.run_cycle().await;
            }
            tracing::info!("Process monitoring stopped");
        });

        *slot = Some(MonitorHandle { token, task });
        tracing::info!("Process monitoring started ({:?} interval)", period);
    }

    /// Stop periodic reconciliation. An in-flight cycle still completes.
    pub fn stop_monitoring(&self) {
        if let Some(handle) = self.monitor_slot().take() {
            handle.token.cancel();
        }
    }

    /// Like [`stop_monitoring`](Self::stop_monitoring), but waits for the loop to exit.
    pub async fn shutdown(&self) {
        let handle = self.monitor_slot().take();
        if let Some(handle) = handle {
            handle.token.cancel();
            if let Err(e) = handle.task.await {
                tracing::error!("Monitoring task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor_slot().is_some()
    }

    /// One reconciliation cycle: re-read desired state, probe every application
    /// and apply corrective actions. Per-application failures are logged and the
    /// cycle moves on to the next name.
    pub async fn run_cycle(&self) {
        let _cycle = self.inner.cycle_lock.lock().await;

        let source = self.inner.source.clone();
        let specs = match run_blocking(move || source.applications()).await {
            Ok(specs) => specs,
            Err(e) => {
                tracing::error!("Failed to read applications: {}", e);
                return;
            }
        };
        let removed = match self.inner.records.sync(&specs) {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!("Record sync failed: {}", e);
                return;
            }
        };
        self.handle_removed(removed).await;

        for spec in &specs {
            if let Err(e) = self.reconcile(spec).await {
                tracing::warn!("Reconciliation of '{}' failed: {}", spec.name, e);
            }
        }
        tracing::debug!("Monitor cycle complete: {} applications", specs.len());
    }

    async fn handle_removed(&self, removed: Vec<(String, ProcessRecord)>) {
        for (name, record) in removed {
            let Some(pid) = record.observed_pid() else {
                continue;
            };
            if self.inner.settings.terminate_on_removal {
                tracing::info!("Terminating removed application '{}' (pid {})", name, pid);
                if let Err(e) = self.terminate(pid).await {
                    tracing::warn!("Failed to terminate removed application '{}': {}", name, e);
                }
            } else {
                tracing::info!("'{}' removed while running (pid {}), leaving it untracked", name, pid);
            }
        }
    }

    async fn reconcile(&self, spec: &ApplicationSpec) -> Result<(), SupervisorError> {
        let name = spec.name.as_str();
        let records = &self.inner.records;
        let gate = records.gate(name)?;
        let Ok(_guard) = gate.try_lock_owned() else {
            tracing::debug!("'{}' busy with a control operation, skipping this cycle", name);
            return Ok(());
        };

        let record = records.get(name)?;
        let probed = self.probe(name, &record.executable_path).await;

        match (record.desired_status, probed) {
            (DesiredStatus::Start, Some(pid)) => {
                let t = records.update(name, |r| r.observe(Some(pid)))?;
                if t.running_changed() {
                    tracing::info!("Process detected as running: {} (pid {})", name, pid);
                    self.emit_status(name, true);
                } else if t.pid_changed() {
                    tracing::info!("'{}' now runs as pid {}", name, pid);
                }
            }
            (DesiredStatus::Start, None) => {
                let cooldown = self.inner.settings.restart_cooldown;
                let (t, due) = records.update(name, |r| {
                    let t = r.observe(None);
                    (t, r.claim_restart(Instant::now(), cooldown))
                })?;
                if t.running_changed() {
                    tracing::warn!("'{}' is no longer running", name);
                    self.emit_status(name, false);
                }
                if !due {
                    tracing::debug!("Restart of '{}' deferred, cool-down active", name);
                    return Ok(());
                }

                tracing::info!("Restarting failed process: {}", name);
                match self.launch(&record.executable_path).await {
                    Ok(pid) => {
                        records.update(name, |r| r.observe(Some(pid)))?;
                        tracing::info!("'{}' restarted (pid {})", name, pid);
                        self.emit(SupervisorEvent::Restarted { name: name.to_string() });
                        self.emit_status(name, true);
                    }
                    Err(e) => tracing::warn!("Restart of '{}' failed: {}", name, e),
                }
            }
            (DesiredStatus::Stop, Some(pid)) => {
                tracing::info!("'{}' is running (pid {}) but should be stopped", name, pid);
                match self.terminate(pid).await {
                    Ok(()) => {
                        records.update(name, |r| r.observe(None))?;
                        self.emit_status(name, false);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to stop '{}': {}", name, e);
                        let t = records.update(name, |r| r.observe(Some(pid)))?;
                        if t.running_changed() {
                            self.emit_status(name, true);
                        }
                    }
                }
            }
            (DesiredStatus::Stop, None) => {
                let t = records.update(name, |r| r.observe(None))?;
                if t.running_changed() {
                    tracing::info!("'{}' stopped", name);
                    self.emit_status(name, false);
                }
            }
        }
        Ok(())
    }

    // ── Public control surface ──────────────────────────────────

    /// Start an application now, outside the loop cadence.
    ///
    /// Already running: succeeds without launching. A live process found by a
    /// fresh probe is adopted instead of launching a duplicate.
    pub async fn try_start_application(&self, name: &str) -> Result<(), SupervisorError> {
        let records = &self.inner.records;
        let gate = records.gate(name)?;
        let _guard = gate.lock_owned().await;
        let record = records.get(name)?;

        if record.observed_running() {
            tracing::debug!("Application already running: {}", name);
            if record.desired_status != DesiredStatus::Start {
                records.update(name, |r| r.desired_status = DesiredStatus::Start)?;
                self.persist(name, DesiredStatus::Start).await;
            }
            return Ok(());
        }

        let pid = match self.probe(name, &record.executable_path).await {
            Some(pid) => {
                tracing::info!("'{}' already alive as pid {}, adopting it", name, pid);
                pid
            }
            None => {
                records.update(name, |r| r.last_restart_attempt = Some(Instant::now()))?;
                self.launch(&record.executable_path).await?
            }
        };

        let t = records.update(name, |r| {
            r.desired_status = DesiredStatus::Start;
            r.observe(Some(pid))
        })?;
        self.persist(name, DesiredStatus::Start).await;
        if t.running_changed() {
            self.emit_status(name, true);
        }
        tracing::info!("Application started: {} (pid {})", name, pid);
        Ok(())
    }

    /// Stop an application now. Stopping an application that is not alive only
    /// records the desired state, so the loop won't bring it back.
    ///
    /// Only a pid from a fresh probe is signalled; the recorded pid may already
    /// belong to another process.
    pub async fn try_stop_application(&self, name: &str) -> Result<(), SupervisorError> {
        let records = &self.inner.records;
        let gate = records.gate(name)?;
        let _guard = gate.lock_owned().await;
        let record = records.get(name)?;

        let target = self.probe(name, &record.executable_path).await;
        if target.is_none() {
            tracing::debug!("'{}' not alive, recording desired stop only", name);
        }

        if let Some(pid) = target {
            if let Err(e) = self.terminate(pid).await {
                let t = records.update(name, |r| r.observe(Some(pid)))?;
                if t.running_changed() {
                    self.emit_status(name, true);
                }
                return Err(e);
            }
        }

        let t = records.update(name, |r| {
            r.desired_status = DesiredStatus::Stop;
            r.observe(None)
        })?;
        self.persist(name, DesiredStatus::Stop).await;
        if target.is_some() || t.running_changed() {
            self.emit_status(name, false);
        }
        tracing::info!("Application stopped: {}", name);
        Ok(())
    }

    /// Re-probe one application immediately and commit what was observed.
    pub async fn try_refresh_application_status(&self, name: &str) -> Result<bool, SupervisorError> {
        let records = &self.inner.records;
        let gate = records.gate(name)?;
        let _guard = gate.lock_owned().await;
        let record = records.get(name)?;

        let probed = self.probe(name, &record.executable_path).await;
        let t = records.update(name, |r| r.observe(probed))?;
        if t.running_changed() {
            self.emit_status(name, t.to.is_running());
        }
        Ok(t.to.is_running())
    }

    pub async fn start_application(&self, name: &str) -> bool {
        match self.try_start_application(name).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to start '{}' [{}]: {}", name, e.error_code(), e);
                false
            }
        }
    }

    pub async fn stop_application(&self, name: &str) -> bool {
        match self.try_stop_application(name).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to stop '{}' [{}]: {}", name, e.error_code(), e);
                false
            }
        }
    }

    /// `true` if the application is configured (its status was re-probed).
    pub async fn refresh_application_status(&self, name: &str) -> bool {
        match self.try_refresh_application_status(name).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Failed to refresh '{}' [{}]: {}", name, e.error_code(), e);
                false
            }
        }
    }

    /// Last observed state; unknown names are not running.
    pub fn is_application_running(&self, name: &str) -> bool {
        self.inner
            .records
            .get(name)
            .map(|r| r.observed_running())
            .unwrap_or(false)
    }

    // ── Blocking primitives, run off the async workers and outside the record lock ──

    /// Probe failures and timeouts count as "not found".
    async fn probe(&self, name: &str, executable: &Path) -> Option<Pid> {
        let prober = self.inner.prober.clone();
        let path = executable.to_path_buf();
        let timeout = self.inner.settings.probe_timeout;
        let task = tokio::task::spawn_blocking(move || prober.probe(&path));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(found))) => found,
            Ok(Ok(Err(e))) => {
                tracing::warn!("Probe for '{}' unavailable: {}", name, e);
                None
            }
            Ok(Err(e)) => {
                tracing::error!("Probe task for '{}' failed: {}", name, e);
                None
            }
            Err(_) => {
                tracing::warn!("Probe for '{}' timed out after {:?}", name, timeout);
                None
            }
        }
    }

    async fn launch(&self, executable: &Path) -> Result<Pid, SupervisorError> {
        let launcher = self.inner.launcher.clone();
        let path: PathBuf = executable.to_path_buf();
        Ok(run_blocking(move || launcher.launch(&path)).await??)
    }

    async fn terminate(&self, pid: Pid) -> Result<(), SupervisorError> {
        let terminator = self.inner.terminator.clone();
        Ok(run_blocking(move || terminator.terminate(pid)).await??)
    }

    /// Best effort: failures are logged, the record keeps the new desired state
    /// until the next snapshot overrides it.
    async fn persist(&self, name: &str, status: DesiredStatus) {
        let source = self.inner.source.clone();
        let owned = name.to_string();
        match run_blocking(move || source.update_status(&owned, status)).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Could not persist status '{}' for '{}'", status, name),
            Err(e) => tracing::error!("Persisting status of '{}' failed: {}", name, e),
        }
    }

    fn emit_status(&self, name: &str, running: bool) {
        self.emit(SupervisorEvent::StatusChanged {
            name: name.to_string(),
            running,
        });
    }

    fn emit(&self, event: SupervisorEvent) {
        tracing::debug!("Event: {:?}", event);
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, SupervisorError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SupervisorError::Internal(anyhow::anyhow!("blocking task failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::error::{LaunchError, ProbeError, TerminateError};

    struct OneApp;

    impl ApplicationSource for OneApp {
        fn applications(&self) -> Vec<ApplicationSpec> {
            vec![ApplicationSpec::new("editor", "/bin/editor", DesiredStatus::Start)]
        }

        fn update_status(&self, _name: &str, _status: DesiredStatus) -> bool {
            true
        }
    }

    struct AlwaysAlive;

    impl Prober for AlwaysAlive {
        fn probe(&self, _executable: &Path) -> Result<Option<Pid>, ProbeError> {
            Ok(Pid::new(100))
        }
    }

    struct NoLaunch;

    impl Launcher for NoLaunch {
        fn launch(&self, executable: &Path) -> Result<Pid, LaunchError> {
            Err(LaunchError::NotExecutable(executable.to_path_buf()))
        }
    }

    struct NoTerminate;

    impl Terminator for NoTerminate {
        fn terminate(&self, pid: Pid) -> Result<(), TerminateError> {
            Err(TerminateError::AllSignalsFailed { pid })
        }
    }

    fn supervisor(settings: SupervisorSettings) -> Supervisor {
        Supervisor::new(
            Arc::new(OneApp),
            Arc::new(AlwaysAlive),
            Arc::new(NoLaunch),
            Arc::new(NoTerminate),
            settings,
        )
    }

    #[test]
    fn settings_follow_config() {
        let settings = SupervisorSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.restart_cooldown, Duration::from_secs(5));
        assert!(!settings.terminate_on_removal);
    }

    #[tokio::test]
    async fn records_exist_before_first_cycle() {
        let sup = supervisor(SupervisorSettings::default());
        let record = sup.record("editor").unwrap();
        assert!(!record.observed_running());
        assert!(!sup.is_application_running("editor"));
        assert!(sup.record("ghost").is_none());
    }

    #[tokio::test]
    async fn monitoring_runs_cycles_until_stopped() {
        let settings = SupervisorSettings {
            poll_interval: Duration::from_millis(10),
            ..SupervisorSettings::default()
        };
        let sup = supervisor(settings);
        let mut events = sup.subscribe();

        sup.start_monitoring();
        assert!(sup.is_monitoring());
        // 두 번째 호출은 무시
        sup.start_monitoring();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("a cycle should run")
            .unwrap();
        assert_eq!(
            event,
            SupervisorEvent::StatusChanged {
                name: "editor".to_string(),
                running: true
            }
        );
        assert!(sup.is_application_running("editor"));

        sup.shutdown().await;
        assert!(!sup.is_monitoring());
    }

    #[test]
    fn start_monitoring_without_runtime_is_noop() {
        let sup = supervisor(SupervisorSettings::default());
        sup.start_monitoring();
        assert!(!sup.is_monitoring());
        sup.stop_monitoring();
    }
}
