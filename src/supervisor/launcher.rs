//! Detached process launch with a settle-and-probe confirmation.
//!
//! A successful `spawn()` only means `exec` happened. GUI toolkits and session
//! managers regularly kill a child within milliseconds when the session
//! environment is wrong, so success is reported only once a probe sees the
//! process alive after the settle delay.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use super::error::LaunchError;
use crate::config::LaunchConfig;
use crate::process_monitor::{Pid, Prober};

/// Starts an application and reports the confirmed live pid.
pub trait Launcher: Send + Sync {
    fn launch(&self, executable: &Path) -> Result<Pid, LaunchError>;
}

/// Environment given to launched applications: the ambient environment plus
/// defaults for whatever session variables are missing.
#[derive(Debug, Clone, Default)]
pub struct LaunchEnvironment {
    defaults: BTreeMap<String, String>,
}

impl LaunchEnvironment {
    pub fn new(defaults: BTreeMap<String, String>) -> Self {
        Self { defaults }
    }

    /// Display, runtime dir and session bus of the current user.
    pub fn session_defaults() -> Self {
        let uid = current_uid();
        let runtime_dir = format!("/run/user/{}", uid);
        let mut defaults = BTreeMap::new();
        defaults.insert("DISPLAY".to_string(), ":0".to_string());
        defaults.insert(
            "DBUS_SESSION_BUS_ADDRESS".to_string(),
            format!("unix:path={}/bus", runtime_dir),
        );
        defaults.insert("XDG_RUNTIME_DIR".to_string(), runtime_dir);
        Self { defaults }
    }

    pub fn from_config(config: &LaunchConfig) -> Self {
        if config.env.is_empty() {
            Self::session_defaults()
        } else {
            Self::new(config.env.clone())
        }
    }

    /// Merge defaults into the current process environment.
    pub fn build(&self) -> Vec<(String, String)> {
        self.build_from(std::env::vars())
    }

    /// Merge defaults into `ambient`; existing values always win.
    pub fn build_from(&self, ambient: impl IntoIterator<Item = (String, String)>) -> Vec<(String, String)> {
        let mut env: BTreeMap<String, String> = ambient.into_iter().collect();
        for (key, value) in &self.defaults {
            env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        env.into_iter().collect()
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

/// Launches detached children and confirms them with a [`Prober`].
///
/// Strategy 1 double-forks the executable into a new session. If it cannot be
/// confirmed, strategy 2 hands it to `sh -c '... &'` with an explicit
/// environment. Either way the program ends up reparented to init and no
/// handle to it is kept.
pub struct DetachedLauncher {
    prober: Arc<dyn Prober>,
    environment: LaunchEnvironment,
    settle_delay: Duration,
    shell: PathBuf,
}

impl DetachedLauncher {
    pub fn new(prober: Arc<dyn Prober>, environment: LaunchEnvironment, settle_delay: Duration) -> Self {
        Self {
            prober,
            environment,
            settle_delay,
            shell: PathBuf::from("/bin/sh"),
        }
    }

    pub fn from_config(prober: Arc<dyn Prober>, config: &LaunchConfig) -> Self {
        Self {
            prober,
            environment: LaunchEnvironment::from_config(config),
            settle_delay: config.settle_delay(),
            shell: config.shell.clone(),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    fn spawn_direct(&self, executable: &Path, env: &[(String, String)]) -> std::io::Result<()> {
        let mut cmd = Command::new(executable);
        cmd.env_clear().envs(env.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = executable.parent() {
            cmd.current_dir(dir);
        }
        crate::utils::detach(&mut cmd);

        // only the intermediate is our child; it exits as soon as the program is forked off
        let status = cmd.spawn()?.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("detach helper exited with {}", status),
            ))
        }
    }

    fn spawn_via_shell(&self, executable: &Path, env: &[(String, String)]) -> std::io::Result<()> {
        let status = Command::new(&self.shell)
            .arg("-c")
            .arg(r#""$0" </dev/null >/dev/null 2>&1 &"#)
            .arg(executable)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("shell exited with {}", status),
            ))
        }
    }

    /// Wait out the settle delay, then look for the process.
    fn confirm(&self, executable: &Path) -> Option<Pid> {
        std::thread::sleep(self.settle_delay);
        match self.prober.probe(executable) {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!("Settle probe for {} failed: {}", executable.display(), e);
                None
            }
        }
    }
}

impl Launcher for DetachedLauncher {
    fn launch(&self, executable: &Path) -> Result<Pid, LaunchError> {
        check_executable(executable)?;
        let env = self.environment.build();

        match self.spawn_direct(executable, &env) {
            Ok(()) => {
                if let Some(pid) = self.confirm(executable) {
                    tracing::info!("Launched {} (pid {})", executable.display(), pid);
                    return Ok(pid);
                }
                tracing::warn!(
                    "{} not alive after {:?}, retrying through {}",
                    executable.display(),
                    self.settle_delay,
                    self.shell.display()
                );
            }
            Err(e) => {
                tracing::warn!("Direct spawn of {} failed: {}", executable.display(), e);
            }
        }

        self.spawn_via_shell(executable, &env)
            .map_err(|e| LaunchError::LaunchFailed {
                path: executable.to_path_buf(),
                reason: format!("shell spawn failed: {}", e),
            })?;

        match self.confirm(executable) {
            Some(pid) => {
                tracing::info!("Launched {} via shell (pid {})", executable.display(), pid);
                Ok(pid)
            }
            None => Err(LaunchError::LaunchFailed {
                path: executable.to_path_buf(),
                reason: "process not found after launch".to_string(),
            }),
        }
    }
}

/// The path must be an existing regular file with an execute bit.
pub fn check_executable(path: &Path) -> Result<(), LaunchError> {
    let not_executable = || LaunchError::NotExecutable(path.to_path_buf());
    let meta = std::fs::metadata(path).map_err(|_| not_executable())?;
    if !meta.is_file() {
        return Err(not_executable());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(not_executable());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::error::ProbeError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports a fixed result and counts calls.
    struct FixedProber {
        result: Option<u32>,
        calls: AtomicUsize,
    }

    impl FixedProber {
        fn new(result: Option<u32>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Prober for FixedProber {
        fn probe(&self, _executable: &Path) -> Result<Option<Pid>, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.and_then(Pid::new))
        }
    }

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn environment_fills_only_missing_values() {
        let env = LaunchEnvironment::new(
            vars(&[("DISPLAY", ":0"), ("XDG_RUNTIME_DIR", "/run/user/1000")])
                .into_iter()
                .collect(),
        );
        let built = env.build_from(vars(&[("DISPLAY", ":7"), ("HOME", "/home/me")]));
        assert!(built.contains(&("DISPLAY".to_string(), ":7".to_string())));
        assert!(built.contains(&("XDG_RUNTIME_DIR".to_string(), "/run/user/1000".to_string())));
        assert!(built.contains(&("HOME".to_string(), "/home/me".to_string())));
        assert_eq!(built.len(), 3);
    }

    #[test]
    fn session_defaults_cover_display_and_bus() {
        let built = LaunchEnvironment::session_defaults().build_from(Vec::new());
        let keys: Vec<&str> = built.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["DBUS_SESSION_BUS_ADDRESS", "DISPLAY", "XDG_RUNTIME_DIR"]);
        let bus = &built[0].1;
        assert!(bus.starts_with("unix:path=/run/user/"));
        assert!(bus.ends_with("/bus"));
    }

    #[test]
    fn config_env_overrides_builtin_defaults() {
        let mut config = LaunchConfig::default();
        config.env.insert("WAYLAND_DISPLAY".to_string(), "wayland-0".to_string());
        let built = LaunchEnvironment::from_config(&config).build_from(Vec::new());
        assert_eq!(built, vars(&[("WAYLAND_DISPLAY", "wayland-0")]));
    }

    #[test]
    fn rejects_missing_path_before_spawning() {
        let prober = FixedProber::new(Some(1));
        let launcher = DetachedLauncher::new(prober.clone(), LaunchEnvironment::default(), Duration::ZERO);
        let err = launcher.launch(Path::new("/nonexistent/editor")).unwrap_err();
        assert!(matches!(err, LaunchError::NotExecutable(_)));
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[cfg(unix)]
    #[test]
    fn rejects_file_without_execute_bit() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.sh");
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(check_executable(&path), Err(LaunchError::NotExecutable(_))));
        assert!(matches!(check_executable(dir.path()), Err(LaunchError::NotExecutable(_))));

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(check_executable(&path).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn confirmed_by_settle_probe() {
        let prober = FixedProber::new(Some(4242));
        let launcher = DetachedLauncher::new(prober.clone(), LaunchEnvironment::default(), Duration::ZERO);
        let pid = launcher.launch(Path::new("/bin/true")).unwrap();
        assert_eq!(pid.as_u32(), 4242);
        // 첫 번째 전략에서 확인되면 셸 폴백은 실행되지 않음
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn direct_spawn_returns_while_program_still_runs() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Instant;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long-running");
        let marker = dir.path().join("done");
        std::fs::write(&path, format!("#!/bin/sh\nsleep 1\ntouch {}\n", marker.display())).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let launcher = DetachedLauncher::new(FixedProber::new(Some(1)), LaunchEnvironment::default(), Duration::ZERO);
        let started = Instant::now();
        launcher
            .spawn_direct(&path, &vars(&[("PATH", "/usr/bin:/bin")]))
            .unwrap();
        // the program sleeps for a second; spawning must not wait for it
        assert!(started.elapsed() < Duration::from_millis(900));
        assert!(!marker.exists());

        let deadline = Instant::now() + Duration::from_secs(10);
        while !marker.exists() {
            assert!(Instant::now() < deadline, "detached program never finished");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[cfg(unix)]
    #[test]
    fn falls_back_to_shell_then_fails() {
        let prober = FixedProber::new(None);
        let launcher = DetachedLauncher::new(prober.clone(), LaunchEnvironment::default(), Duration::ZERO);
        let err = launcher.launch(Path::new("/bin/true")).unwrap_err();
        assert!(matches!(err, LaunchError::LaunchFailed { .. }));
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
    }

    #[cfg(unix)]
    #[test]
    fn broken_shell_is_launch_failed() {
        let prober = FixedProber::new(None);
        let launcher = DetachedLauncher::new(prober, LaunchEnvironment::default(), Duration::ZERO)
            .with_shell("/nonexistent/sh");
        let err = launcher.launch(Path::new("/bin/true")).unwrap_err();
        match err {
            LaunchError::LaunchFailed { reason, .. } => assert!(reason.contains("shell spawn failed")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
