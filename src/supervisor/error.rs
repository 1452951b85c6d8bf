//! Supervisor 전용 에러 타입. 애플리케이션 단위 실패는 모두 로컬이며
//! 루프를 중단시키지 않습니다. 호출자는 `error_code()`로 종류를 구분합니다.

use std::path::PathBuf;

use super::process::ProcessError;
use crate::process_monitor::Pid;

/// Launcher failures.
#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error("'{0}' does not exist or is not executable")]
    NotExecutable(PathBuf),

    #[error("failed to launch '{path}': {reason}")]
    LaunchFailed { path: PathBuf, reason: String },
}

/// Terminator failures.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TerminateError {
    #[error("process {pid} survived every termination signal")]
    AllSignalsFailed { pid: Pid },
}

/// Liveness probing failures. Never escalated: the supervisor treats these as "not found".
#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("process table unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the public control surface.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Application '{0}' not found")]
    ApplicationNotFound(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Terminate(#[from] TerminateError),

    #[error(transparent)]
    Process(ProcessError),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ProcessError> for SupervisorError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::NotFound(name) => Self::ApplicationNotFound(name),
            other => Self::Process(other),
        }
    }
}

impl SupervisorError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ApplicationNotFound(_) => "APPLICATION_NOT_FOUND",
            Self::Launch(LaunchError::NotExecutable(_)) => "NOT_EXECUTABLE",
            Self::Launch(LaunchError::LaunchFailed { .. }) => "LAUNCH_FAILED",
            Self::Terminate(_) => "TERMINATE_FAILED",
            Self::Process(_) => "PROCESS_STORE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_follow_taxonomy() {
        let err = SupervisorError::from(LaunchError::NotExecutable(PathBuf::from("/bin/nope")));
        assert_eq!(err.error_code(), "NOT_EXECUTABLE");
        assert!(err.to_string().contains("/bin/nope"));

        let err = SupervisorError::from(LaunchError::LaunchFailed {
            path: PathBuf::from("/bin/editor"),
            reason: "process not found after launch".to_string(),
        });
        assert_eq!(err.error_code(), "LAUNCH_FAILED");

        let pid = Pid::new(42).unwrap();
        let err = SupervisorError::from(TerminateError::AllSignalsFailed { pid });
        assert_eq!(err.error_code(), "TERMINATE_FAILED");
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn missing_record_maps_to_not_found() {
        let err = SupervisorError::from(ProcessError::NotFound("ghost".to_string()));
        assert!(matches!(err, SupervisorError::ApplicationNotFound(ref n) if n == "ghost"));
        let err = SupervisorError::from(ProcessError::LockPoisoned);
        assert_eq!(err.error_code(), "PROCESS_STORE_ERROR");
    }

    #[test]
    fn not_found_message_names_application() {
        let err = SupervisorError::ApplicationNotFound("editor".to_string());
        assert_eq!(err.error_code(), "APPLICATION_NOT_FOUND");
        assert_eq!(err.to_string(), "Application 'editor' not found");
    }
}
