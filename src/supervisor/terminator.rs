//! Escalating termination: SIGTERM → SIGHUP → SIGINT → SIGKILL.
//!
//! Some toolkits only clean up (temp files, sockets, lock files) on a specific
//! signal, so each step gets a grace period before the next, harsher one.

use std::time::{Duration, Instant};

use super::error::TerminateError;
use crate::config::TerminateConfig;
use crate::process_monitor::Pid;

/// Signals in the escalation, mildest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    Terminate,
    Hangup,
    Interrupt,
    Kill,
}

pub const ESCALATION: [TermSignal; 4] = [
    TermSignal::Terminate,
    TermSignal::Hangup,
    TermSignal::Interrupt,
    TermSignal::Kill,
];

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The process is already gone.
    #[error("no such process")]
    NoSuchProcess,
    #[error("{0}")]
    Os(String),
}

/// Low-level signal delivery, separated so escalation can be tested without real processes.
pub trait SignalSender: Send + Sync {
    fn send(&self, pid: Pid, signal: TermSignal) -> Result<(), SendError>;
    fn is_alive(&self, pid: Pid) -> bool;
}

/// Stops a process by pid.
pub trait Terminator: Send + Sync {
    fn terminate(&self, pid: Pid) -> Result<(), TerminateError>;
}

pub struct EscalatingTerminator<S> {
    sender: S,
    grace_period: Duration,
    poll_interval: Duration,
}

impl<S: SignalSender> EscalatingTerminator<S> {
    pub fn new(sender: S, grace_period: Duration, poll_interval: Duration) -> Self {
        Self {
            sender,
            grace_period,
            poll_interval,
        }
    }

    pub fn from_config(sender: S, config: &TerminateConfig) -> Self {
        Self::new(sender, config.grace_period(), config.poll_interval())
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    /// Poll until the process is gone or the grace period runs out.
    /// A grace period too large to represent as a deadline never runs out.
    fn wait_for_exit(&self, pid: Pid) -> bool {
        let deadline = Instant::now().checked_add(self.grace_period);
        loop {
            if !self.sender.is_alive(pid) {
                return true;
            }
            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => return false,
                Some(deadline) => self.poll_interval.min(deadline - now),
                None => self.poll_interval,
            };
            std::thread::sleep(pause);
        }
    }
}

impl<S: SignalSender> Terminator for EscalatingTerminator<S> {
    fn terminate(&self, pid: Pid) -> Result<(), TerminateError> {
        for signal in ESCALATION {
            match self.sender.send(pid, signal) {
                Ok(()) => {
                    if self.wait_for_exit(pid) {
                        tracing::info!("Process {} exited after {:?}", pid, signal);
                        return Ok(());
                    }
                    tracing::debug!("Process {} still alive after {:?}", pid, signal);
                }
                Err(SendError::NoSuchProcess) => {
                    tracing::debug!("Process {} already gone", pid);
                    return Ok(());
                }
                Err(SendError::Os(e)) => {
                    tracing::warn!("Failed to send {:?} to {}: {}", signal, pid, e);
                }
            }
        }
        tracing::error!("Process {} survived all termination signals", pid);
        Err(TerminateError::AllSignalsFailed { pid })
    }
}

/// Real signal delivery through `kill(2)`.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct NixSignalSender;

#[cfg(unix)]
impl NixSignalSender {
    fn raw(pid: Pid) -> Option<nix::unistd::Pid> {
        i32::try_from(pid.as_u32()).ok().map(nix::unistd::Pid::from_raw)
    }
}

#[cfg(unix)]
impl SignalSender for NixSignalSender {
    fn send(&self, pid: Pid, signal: TermSignal) -> Result<(), SendError> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};

        let raw = Self::raw(pid).ok_or_else(|| SendError::Os(format!("pid {} out of range", pid)))?;
        let signal = match signal {
            TermSignal::Terminate => Signal::SIGTERM,
            TermSignal::Hangup => Signal::SIGHUP,
            TermSignal::Interrupt => Signal::SIGINT,
            TermSignal::Kill => Signal::SIGKILL,
        };
        match kill(raw, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(SendError::NoSuchProcess),
            Err(e) => Err(SendError::Os(e.to_string())),
        }
    }

    fn is_alive(&self, pid: Pid) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;

        let Some(raw) = Self::raw(pid) else {
            return false;
        };
        match kill(raw, None) {
            Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
            Err(_) => false,
        }
    }
}

/// A zombie has exited but not been reaped; it still answers `kill(pid, 0)`.
#[cfg(target_os = "linux")]
fn is_zombie(pid: Pid) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // comm may contain spaces or parens; the state follows the last ')'
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|state| state == "Z")
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: Pid) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Fails every signal before `effective`; the process dies once `effective` is sent.
    struct ScriptedSender {
        effective: Option<TermSignal>,
        refuse: bool,
        sent: Mutex<Vec<TermSignal>>,
    }

    impl ScriptedSender {
        fn new(effective: Option<TermSignal>) -> Self {
            Self {
                effective,
                refuse: false,
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<TermSignal> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl SignalSender for ScriptedSender {
        fn send(&self, _pid: Pid, signal: TermSignal) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(signal);
            if self.refuse {
                return Err(SendError::Os("EPERM".to_string()));
            }
            Ok(())
        }

        fn is_alive(&self, _pid: Pid) -> bool {
            match self.effective {
                Some(effective) => !self.sent.lock().unwrap().contains(&effective),
                None => true,
            }
        }
    }

    fn terminator(sender: ScriptedSender) -> EscalatingTerminator<ScriptedSender> {
        EscalatingTerminator::new(sender, Duration::ZERO, Duration::from_millis(1))
    }

    fn pid() -> Pid {
        Pid::new(200).unwrap()
    }

    #[test]
    fn escalates_to_force_kill() {
        let t = terminator(ScriptedSender::new(Some(TermSignal::Kill)));
        assert_eq!(t.terminate(pid()), Ok(()));
        assert_eq!(t.sender().sent(), ESCALATION.to_vec());
    }

    #[test]
    fn stops_at_first_effective_signal() {
        let t = terminator(ScriptedSender::new(Some(TermSignal::Terminate)));
        assert_eq!(t.terminate(pid()), Ok(()));
        assert_eq!(t.sender().sent(), vec![TermSignal::Terminate]);

        let t = terminator(ScriptedSender::new(Some(TermSignal::Hangup)));
        assert_eq!(t.terminate(pid()), Ok(()));
        assert_eq!(t.sender().sent(), vec![TermSignal::Terminate, TermSignal::Hangup]);
    }

    #[test]
    fn all_signals_failed() {
        let t = terminator(ScriptedSender::new(None));
        assert_eq!(
            t.terminate(pid()),
            Err(TerminateError::AllSignalsFailed { pid: pid() })
        );
        assert_eq!(t.sender().sent().len(), 4);
    }

    #[test]
    fn send_errors_escalate() {
        let mut sender = ScriptedSender::new(None);
        sender.refuse = true;
        let t = terminator(sender);
        assert!(t.terminate(pid()).is_err());
        assert_eq!(t.sender().sent(), ESCALATION.to_vec());
    }

    #[test]
    fn vanished_process_counts_as_terminated() {
        struct Gone;
        impl SignalSender for Gone {
            fn send(&self, _pid: Pid, _signal: TermSignal) -> Result<(), SendError> {
                Err(SendError::NoSuchProcess)
            }
            fn is_alive(&self, _pid: Pid) -> bool {
                false
            }
        }
        let t = EscalatingTerminator::new(Gone, Duration::ZERO, Duration::from_millis(1));
        assert!(t.terminate(pid()).is_ok());
    }

    /// 두 번째 is_alive 호출에서 종료되는 프로세스
    struct SlowExit {
        checks: Mutex<u32>,
    }

    impl SignalSender for SlowExit {
        fn send(&self, _pid: Pid, _signal: TermSignal) -> Result<(), SendError> {
            Ok(())
        }
        fn is_alive(&self, _pid: Pid) -> bool {
            let mut checks = self.checks.lock().unwrap();
            *checks += 1;
            *checks < 2
        }
    }

    #[test]
    fn waits_within_grace_period() {
        let t = EscalatingTerminator::new(
            SlowExit { checks: Mutex::new(0) },
            Duration::from_secs(2),
            Duration::from_millis(5),
        );
        assert!(t.terminate(pid()).is_ok());
        assert_eq!(*t.sender().checks.lock().unwrap(), 2);
    }

    #[test]
    fn huge_grace_period_does_not_overflow() {
        let sender = SlowExit { checks: Mutex::new(0) };
        let t = EscalatingTerminator::new(sender, Duration::MAX, Duration::from_millis(1));
        assert!(t.terminate(pid()).is_ok());
        assert_eq!(*t.sender().checks.lock().unwrap(), 2);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn terminates_real_process() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = Pid::new(child.id()).unwrap();
        let t = EscalatingTerminator::new(NixSignalSender, Duration::from_secs(2), Duration::from_millis(20));

        assert!(t.sender().is_alive(pid));
        assert!(t.terminate(pid).is_ok());
        // 자식 프로세스라 좀비 상태로 남아 있을 수 있음, 회수
        let _ = child.wait();
        assert!(!t.sender().is_alive(pid));
    }
}
