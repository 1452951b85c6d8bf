use crate::process_monitor::Pid;

/// What the supervisor currently believes about an application's process.
///
/// `Running` carries the pid, so "pid set iff running" holds by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObservedState {
    /// Fresh record, not probed yet. Counts as not running.
    #[default]
    Unknown,
    Running(Pid),
    Stopped,
}

/// Outcome of folding a probe result into an [`ObservedState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ObservedState,
    pub to: ObservedState,
}

impl Transition {
    /// True when the running flag flipped, i.e. a status-change notification is due.
    pub fn running_changed(&self) -> bool {
        self.from.is_running() != self.to.is_running()
    }

    pub fn pid_changed(&self) -> bool {
        self.from.pid() != self.to.pid()
    }
}

impl ObservedState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }

    pub fn pid(&self) -> Option<Pid> {
        match self {
            Self::Running(pid) => Some(*pid),
            _ => None,
        }
    }

    /// Apply a liveness observation: `Some(pid)` means alive, `None` means gone.
    pub fn observe(&mut self, probed: Option<Pid>) -> Transition {
        let from = *self;
        let to = match probed {
            Some(pid) => Self::Running(pid),
            None => Self::Stopped,
        };
        if from != to {
            tracing::debug!("Observed state: {:?} -> {:?}", from, to);
        }
        *self = to;
        Transition { from, to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(raw: u32) -> Pid {
        Pid::new(raw).unwrap()
    }

    #[test]
    fn unknown_to_running_is_a_change() {
        let mut state = ObservedState::default();
        assert_eq!(state, ObservedState::Unknown);
        let t = state.observe(Some(pid(100)));
        assert!(t.running_changed());
        assert_eq!(state.pid(), Some(pid(100)));
    }

    #[test]
    fn unknown_to_stopped_is_not_a_change() {
        let mut state = ObservedState::Unknown;
        let t = state.observe(None);
        assert!(!t.running_changed());
        assert_eq!(state, ObservedState::Stopped);
    }

    #[test]
    fn pid_swap_keeps_running() {
        let mut state = ObservedState::Running(pid(100));
        let t = state.observe(Some(pid(101)));
        assert!(!t.running_changed());
        assert!(t.pid_changed());
        assert_eq!(state.pid(), Some(pid(101)));
    }

    #[test]
    fn running_to_stopped_clears_pid() {
        let mut state = ObservedState::Running(pid(100));
        let t = state.observe(None);
        assert!(t.running_changed());
        assert!(!state.is_running());
        assert_eq!(state.pid(), None);
    }
}
