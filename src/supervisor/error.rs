//! Supervisor 전용 에러 타입

use super::state_machine::TransitionError;

fn tail_suffix(tail: &[String]) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("\n--- stderr ---\n{}", tail.join("\n"))
    }
}

/// Supervisor 작업 중 발생할 수 있는 에러 유형
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to start '{program}': {reason}{}", tail_suffix(.stderr_tail))]
    Spawn {
        program: String,
        reason: String,
        stderr_tail: Vec<String>,
    },

    #[error("Daemon did not accept connections on {endpoint} after {attempts} attempts{}", tail_suffix(.stderr_tail))]
    NotReady {
        endpoint: String,
        attempts: u32,
        stderr_tail: Vec<String>,
    },

    #[error("No daemon listening on {0} and spawning is disabled")]
    NotRunning(String),

    #[error("Daemon crashed {crashes} times within {window_secs}s, giving up")]
    CrashLoop { crashes: usize, window_secs: u64 },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "PROCESS_SPAWN",
            Self::NotReady { .. } => "DAEMON_NOT_READY",
            Self::NotRunning(_) => "DAEMON_NOT_RUNNING",
            Self::CrashLoop { .. } => "CRASH_LOOP",
            Self::Transition(_) => "INVALID_STATE",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Last lines the daemon wrote to stderr, if any were captured.
    pub fn stderr_tail(&self) -> &[String] {
        match self {
            Self::Spawn { stderr_tail, .. } | Self::NotReady { stderr_tail, .. } => stderr_tail,
            _ => &[],
        }
    }

    /// No automatic recovery should be attempted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CrashLoop { .. })
    }
}
