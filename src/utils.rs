//! Shared utility functions for the procwarden daemon.

use std::process::{Command, Stdio};

/// Detach a command from the supervisor: no inherited stdio and, on Unix, a
/// double fork. The spawned child starts a new session, forks the real program
/// and exits at once, so the program is reparented to init and the supervisor
/// only ever waits for the short-lived intermediate.
#[cfg(unix)]
pub fn detach(cmd: &mut Command) -> &mut Command {
    use nix::unistd::{fork, setsid, ForkResult};
    use std::os::unix::process::CommandExt;

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: setsid, fork and _exit are async-signal-safe. The intermediate
    // leaves through _exit without running destructors or atexit handlers.
    unsafe {
        cmd.pre_exec(|| {
            setsid().map_err(std::io::Error::from)?;
            match fork().map_err(std::io::Error::from)? {
                ForkResult::Parent { .. } => nix::libc::_exit(0),
                ForkResult::Child => Ok(()),
            }
        })
    }
}

#[cfg(not(unix))]
pub fn detach(cmd: &mut Command) -> &mut Command {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
}
