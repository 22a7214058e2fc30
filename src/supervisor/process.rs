//! Daemon child process with stdio capture.
//!
//! stdout and stderr are forwarded to `tracing` at the level signal-cli
//! printed; the last stderr lines are kept in a ring buffer so spawn and
//! readiness failures can show why the daemon died.

use regex::Regex;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use super::error::SupervisorError;

/// Matches signal-cli's log prefix, e.g. `WARN  ManagerImpl - ...`
const LOG_PATTERN: &str = r"^(?:\S+\s+)?(?P<level>TRACE|DEBUG|INFO|WARN|WARNING|ERROR|FATAL)\b";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

fn parse_log_level(line: &str, pattern: Option<&Regex>) -> LogLevel {
    if let Some(re) = pattern {
        if let Some(caps) = re.captures(line) {
            if let Some(level_match) = caps.name("level") {
                return match level_match.as_str() {
                    "ERROR" | "FATAL" => LogLevel::Error,
                    "WARN" | "WARNING" => LogLevel::Warn,
                    "DEBUG" | "TRACE" => LogLevel::Debug,
                    _ => LogLevel::Info,
                };
            }
        }
    }
    LogLevel::Info
}

fn forward(pid: u32, line: &str, level: LogLevel) {
    match level {
        LogLevel::Error => tracing::error!(target: "signal_cli", pid, "{}", line),
        LogLevel::Warn => tracing::warn!(target: "signal_cli", pid, "{}", line),
        LogLevel::Info => tracing::info!(target: "signal_cli", pid, "{}", line),
        LogLevel::Debug => tracing::debug!(target: "signal_cli", pid, "{}", line),
    }
}

/// Ring buffer of the most recent output lines.
struct OutputTail {
    lines: VecDeque<String>,
    max_size: usize,
}

impl OutputTail {
    fn with_capacity(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size.min(1024)),
            max_size: max_size.max(1),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub description: String,
}

pub struct DaemonProcess {
    pub pid: u32,
    stderr_tail: Arc<Mutex<OutputTail>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl DaemonProcess {
    pub fn spawn(program: &str, args: &[String], tail_lines: usize) -> Result<Self, SupervisorError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
            stderr_tail: Vec::new(),
        })?;
        let pid = child.id().unwrap_or(0);
        tracing::info!("Started {} (pid {})", program, pid);

        let stderr_tail = Arc::new(Mutex::new(OutputTail::with_capacity(tail_lines)));
        let log_regex = Regex::new(LOG_PATTERN).ok().map(Arc::new);
        let mut readers = Vec::new();

        // ── stdout reader ────────────────────────────────────
        if let Some(stdout) = child.stdout.take() {
            let re = log_regex.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    forward(pid, &line, parse_log_level(&line, re.as_deref()));
                }
            }));
        }

        // ── stderr reader ────────────────────────────────────
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            let re = log_regex;
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    forward(pid, &line, parse_log_level(&line, re.as_deref()));
                    tail.lock().unwrap_or_else(PoisonError::into_inner).push(line);
                }
            }));
        }

        // ── process waiter ───────────────────────────────────
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            // let the readers drain what the process wrote before dying
            for reader in readers {
                let _ = tokio::time::timeout(Duration::from_millis(500), reader).await;
            }
            let info = match status {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    description: status.to_string(),
                },
                Err(e) => ExitInfo {
                    code: None,
                    description: format!("failed to wait for process: {}", e),
                },
            };
            tracing::info!("signal-cli (pid {}) {}", pid, info.description);
            let _ = exit_tx.send(Some(info));
        });

        Ok(Self {
            pid,
            stderr_tail,
            exit_rx,
            kill_tx: Some(kill_tx),
        })
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    /// Receiver that turns `Some` when the process exits.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Polite stop: SIGTERM on unix, hard kill elsewhere.
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
                tracing::warn!("SIGTERM to pid {} failed: {}", self.pid, e);
                self.kill();
            }
        }
        #[cfg(not(unix))]
        self.kill();
    }

    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for exit, giving up after `timeout`.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(info)) => info.clone(),
            _ => None,
        }
    }
}
