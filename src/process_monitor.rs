//! Liveness probing: "is a process for this executable alive, and which pid is it?"
//!
//! Two tiers, first match wins:
//! 1. exact base-name match (the `pidof` view of the process table)
//! 2. full-path match anywhere in the command line (the `pgrep -f` view)
//!
//! Wrapper scripts and symlinks change what the kernel reports as the process
//! name, so a single strategy gives false negatives.

use std::fmt;
use std::num::NonZeroU32;
use std::path::Path;

use sysinfo::{ProcessStatus, System};

use crate::supervisor::error::ProbeError;

/// Linux truncates `/proc/<pid>/comm` to 15 bytes.
const COMM_MAX_LEN: usize = 15;

/// A positive OS process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(NonZeroU32);

impl Pid {
    /// Returns `None` for 0, which no live process can have.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn as_u32(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    pub executable_path: Option<String>,
    /// 프로세스 커맨드라인 인수 (예: ["/usr/bin/python3", "/opt/tools/editor"])
    pub cmd: Vec<String>,
}

/// Finds the live process backing an executable.
pub trait Prober: Send + Sync {
    fn probe(&self, executable: &Path) -> Result<Option<Pid>, ProbeError>;
}

/// Probes the host process table through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProber;

impl SystemProber {
    pub fn new() -> Self {
        Self
    }
}

impl Prober for SystemProber {
    fn probe(&self, executable: &Path) -> Result<Option<Pid>, ProbeError> {
        let processes = get_running_processes();
        if processes.is_empty() {
            // our own process is always listed, so an empty table means introspection failed
            return Err(ProbeError::Unavailable(
                "process table returned no entries".to_string(),
            ));
        }
        Ok(find_pid(&processes, executable, std::process::id()))
    }
}

/// 크로스 플랫폼: 실행 중인 모든 프로세스 목록 가져오기 (좀비 제외)
pub fn get_running_processes() -> Vec<RunningProcess> {
    let mut sys = System::new();
    sys.refresh_processes();

    let processes: Vec<RunningProcess> = sys
        .processes()
        .iter()
        .filter(|(_, process)| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .map(|(pid, process)| RunningProcess {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            executable_path: process.exe().and_then(|p| p.to_str()).map(String::from),
            cmd: process.cmd().to_vec(),
        })
        .collect();

    tracing::trace!("Found {} running processes", processes.len());
    processes
}

/// Applies both probe tiers to a process listing, skipping `own_pid`.
///
/// Within a tier the lowest pid wins. On Linux the listing can include
/// threads, and a process's main thread always has the lowest id.
pub fn find_pid(processes: &[RunningProcess], executable: &Path, own_pid: u32) -> Option<Pid> {
    let candidates = || processes.iter().filter(move |p| p.pid != own_pid);

    if let Some(base) = executable.file_name().and_then(|n| n.to_str()) {
        let by_name = candidates()
            .filter(|p| matches_base_name(p, base))
            .map(|p| p.pid)
            .min()
            .and_then(Pid::new);
        if by_name.is_some() {
            return by_name;
        }
    }

    let full = executable.to_str()?;
    if full.is_empty() {
        return None;
    }
    candidates()
        .filter(|p| p.cmd.join(" ").contains(full))
        .map(|p| p.pid)
        .min()
        .and_then(Pid::new)
}

fn matches_base_name(process: &RunningProcess, base: &str) -> bool {
    if process.name == base {
        return true;
    }
    if base.len() > COMM_MAX_LEN && base.is_char_boundary(COMM_MAX_LEN) && process.name == base[..COMM_MAX_LEN] {
        return true;
    }
    let file_name_of = |s: &str| Path::new(s).file_name().and_then(|n| n.to_str()).map(str::to_owned);
    if process.executable_path.as_deref().and_then(file_name_of).as_deref() == Some(base) {
        return true;
    }
    process.cmd.first().map(String::as_str).and_then(file_name_of).as_deref() == Some(base)
}
