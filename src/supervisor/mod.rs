//! signal-cli daemon lifecycle.
//!
//! The [`Supervisor`] starts the daemon (or adopts one that is already
//! listening), waits until its endpoint accepts connections, notices when it
//! dies and restarts it under a bounded crash policy.

pub mod error;
pub mod process;
pub mod state_machine;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::transport::Endpoint;
use crate::utils::backoff_delay;
pub use error::SupervisorError;
use process::DaemonProcess;
pub use state_machine::{DaemonState, StateMachine};

/// Everything needed to run one daemon.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub endpoint: Endpoint,
    /// Account the daemon is scoped to via `-a`, if any
    pub account: Option<String>,
    pub spawn: bool,
    pub adopt_existing: bool,
    pub readiness_attempts: u32,
    pub readiness_initial_delay: Duration,
    pub readiness_max_delay: Duration,
    pub stop_grace: Duration,
    pub stderr_tail_lines: usize,
    pub restart: RestartPolicy,
    /// Used to spot other daemons sharing our data directory
    pub config_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Crashes tolerated inside `window`; one more is fatal
    pub max_crashes: usize,
    pub window: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

/// Deterministic daemon command line.
pub fn daemon_args(config_dir: Option<&std::path::Path>, account: Option<&str>, endpoint: &Endpoint) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(dir) = config_dir {
        args.push("--config".to_string());
        args.push(dir.to_string_lossy().into_owned());
    }
    if let Some(account) = account {
        args.push("-a".to_string());
        args.push(account.to_string());
    }
    args.push("daemon".to_string());
    match endpoint {
        Endpoint::Tcp { host, port } => {
            args.push("--tcp".to_string());
            args.push(format!("{}:{}", host, port));
        }
        Endpoint::Unix(path) => {
            args.push("--socket".to_string());
            args.push(path.to_string_lossy().into_owned());
        }
    }
    args
}

impl SupervisorConfig {
    pub fn from_client_config(config: &ClientConfig) -> Self {
        let endpoint = config.endpoint();
        let account = if config.daemon.multi_account {
            None
        } else {
            config.account.clone().filter(|a| !a.is_empty())
        };
        let args = daemon_args(
            Some(&config.signal_cli_config_dir),
            account.as_deref(),
            &endpoint,
        );
        Self {
            program: config.signal_cli_path.clone(),
            args,
            endpoint,
            account,
            spawn: config.daemon.spawn,
            adopt_existing: config.daemon.adopt_existing,
            readiness_attempts: config.daemon.readiness_attempts,
            readiness_initial_delay: Duration::from_millis(config.daemon.readiness_initial_delay_ms),
            readiness_max_delay: Duration::from_millis(config.daemon.readiness_max_delay_ms),
            stop_grace: Duration::from_millis(config.daemon.stop_grace_ms),
            stderr_tail_lines: config.daemon.stderr_tail_lines,
            restart: RestartPolicy {
                max_crashes: config.restart.max_crashes,
                window: Duration::from_secs(config.restart.window_secs),
                backoff_initial: Duration::from_millis(config.restart.backoff_initial_ms),
                backoff_max: Duration::from_millis(config.restart.backoff_max_ms),
            },
            config_dir: Some(config.signal_cli_config_dir.clone()),
        }
    }
}

/// A daemon the supervisor is responsible for.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    pub endpoint: Endpoint,
    /// `None` for an adopted daemon
    pub pid: Option<u32>,
    /// Spawned by us (stop kills it) or adopted (stop leaves it running)
    pub owned: bool,
    /// Account passed with `-a`; requests need no `account` param then
    pub account: Option<String>,
    state_rx: watch::Receiver<DaemonState>,
}

impl DaemonHandle {
    pub fn state(&self) -> DaemonState {
        *self.state_rx.borrow()
    }
}

/// Recent crash instants, pruned to the policy window.
#[derive(Debug, Default)]
struct CrashHistory {
    crashes: VecDeque<Instant>,
}

impl CrashHistory {
    fn record(&mut self, now: Instant, window: Duration) -> usize {
        self.crashes.push_back(now);
        while let Some(first) = self.crashes.front() {
            if now.duration_since(*first) > window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.len()
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    machine: StateMachine,
    process: Option<DaemonProcess>,
    handle: Option<DaemonHandle>,
    crashes: CrashHistory,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            machine: StateMachine::new(),
            process: None,
            handle: None,
            crashes: CrashHistory::default(),
        }
    }

    pub fn state(&self) -> DaemonState {
        self.machine.state()
    }

    /// Follow lifecycle changes; `Crashed` is the connectivity-lost signal.
    pub fn watch_state(&self) -> watch::Receiver<DaemonState> {
        self.machine.subscribe()
    }

    pub fn handle(&self) -> Option<&DaemonHandle> {
        self.handle.as_ref()
    }

    fn make_handle(&self, pid: Option<u32>, owned: bool, account: Option<String>) -> DaemonHandle {
        DaemonHandle {
            endpoint: self.config.endpoint.clone(),
            pid,
            owned,
            account,
            state_rx: self.machine.subscribe(),
        }
    }

    fn reachability_timeout(&self) -> Duration {
        self.config.readiness_max_delay.max(Duration::from_millis(200))
    }

    /// Start or adopt a daemon and wait until it accepts connections.
    pub async fn start(&mut self) -> Result<DaemonHandle, SupervisorError> {
        let endpoint = self.config.endpoint.clone();

        if self.config.adopt_existing && endpoint.is_reachable(self.reachability_timeout()).await {
            tracing::info!("Adopting signal-cli daemon already listening on {}", endpoint);
            self.machine.transition(DaemonState::Starting)?;
            self.machine.transition(DaemonState::Ready)?;
            let account = self.config.account.clone();
            let handle = self.make_handle(None, false, account);
            self.handle = Some(handle.clone());
            return Ok(handle);
        }

        if !self.config.spawn {
            return Err(SupervisorError::NotRunning(endpoint.to_string()));
        }

        let others = crate::process_monitor::find_signal_cli_daemons_async(
            self.config
                .config_dir
                .as_ref()
                .map(|d| d.to_string_lossy().into_owned()),
        )
        .await;
        if !others.is_empty() {
            let pids: Vec<u32> = others.iter().map(|p| p.pid).collect();
            tracing::warn!(
                "Another signal-cli daemon is using the same data directory (pid {:?}); the new one may fail to lock it",
                pids
            );
        }

        self.machine.transition(DaemonState::Starting)?;
        let mut process = match DaemonProcess::spawn(
            &self.config.program,
            &self.config.args,
            self.config.stderr_tail_lines,
        ) {
            Ok(p) => p,
            Err(e) => {
                let _ = self.machine.transition(DaemonState::Stopped);
                return Err(e);
            }
        };
        self.watch_exit(&process);

        let attempts = self.config.readiness_attempts.max(1);
        for attempt in 0..attempts {
            if let Some(exit) = process.exit_info() {
                return Err(self.early_exit(&process, exit.description));
            }
            if endpoint.is_reachable(self.reachability_timeout()).await {
                // it may have died right after accepting
                if let Some(exit) = process.exit_info() {
                    return Err(self.early_exit(&process, exit.description));
                }
                self.machine.transition(DaemonState::Ready)?;
                tracing::info!(
                    "signal-cli daemon ready on {} (pid {}) after {} attempt(s)",
                    endpoint,
                    process.pid,
                    attempt + 1
                );
                let handle = self.make_handle(Some(process.pid), true, self.config.account.clone());
                self.process = Some(process);
                self.handle = Some(handle.clone());
                return Ok(handle);
            }
            tokio::time::sleep(backoff_delay(
                self.config.readiness_initial_delay,
                self.config.readiness_max_delay,
                attempt,
            ))
            .await;
        }

        if let Some(exit) = process.exit_info() {
            return Err(self.early_exit(&process, exit.description));
        }
        let stderr_tail = process.stderr_tail();
        let _ = self.machine.transition(DaemonState::Stopping);
        process.kill();
        process.wait_for_exit(self.config.stop_grace).await;
        if self.state() == DaemonState::Stopping {
            let _ = self.machine.transition(DaemonState::Stopped);
        }
        tracing::error!("signal-cli daemon never became ready on {}", endpoint);
        Err(SupervisorError::NotReady {
            endpoint: endpoint.to_string(),
            attempts,
            stderr_tail,
        })
    }

    fn early_exit(&self, process: &DaemonProcess, description: String) -> SupervisorError {
        tracing::error!("signal-cli daemon {} before becoming ready", description);
        // the exit watcher may have got there first
        let _ = self.machine.transition(DaemonState::Crashed);
        SupervisorError::Spawn {
            program: self.config.program.clone(),
            reason: format!("{} before becoming ready", description),
            stderr_tail: process.stderr_tail(),
        }
    }

    /// Moves the state machine to `Crashed` (or `Stopped` on a requested
    /// stop) once the child exits.
    fn watch_exit(&self, process: &DaemonProcess) {
        let machine = self.machine.clone();
        let mut exit_rx = process.exit_watch();
        let pid = process.pid;
        tokio::spawn(async move {
            if exit_rx.wait_for(Option::is_some).await.is_err() {
                return;
            }
            match machine.state() {
                DaemonState::Stopping => {
                    let _ = machine.transition(DaemonState::Stopped);
                }
                DaemonState::Starting | DaemonState::Ready => {
                    tracing::warn!("signal-cli daemon (pid {}) exited unexpectedly", pid);
                    let _ = machine.transition(DaemonState::Crashed);
                }
                _ => {}
            }
        });
    }

    /// Restart after a crash, honouring the crash window. Exceeding
    /// `max_crashes` within the window is fatal.
    pub async fn restart(&mut self) -> Result<DaemonHandle, SupervisorError> {
        let recent = self.crashes.record(Instant::now(), self.config.restart.window);
        if recent > self.config.restart.max_crashes {
            tracing::error!(
                "signal-cli daemon crashed {} times within {:?}, not restarting",
                recent,
                self.config.restart.window
            );
            return Err(SupervisorError::CrashLoop {
                crashes: recent,
                window_secs: self.config.restart.window.as_secs(),
            });
        }

        if let Some(process) = self.process.take() {
            tracing::warn!("Daemon stderr before crash:\n{}", process.stderr_tail().join("\n"));
        }
        self.handle = None;

        let delay = backoff_delay(
            self.config.restart.backoff_initial,
            self.config.restart.backoff_max,
            recent.saturating_sub(1) as u32,
        );
        tracing::info!("Restarting signal-cli daemon in {:?} (crash {} in window)", delay, recent);
        tokio::time::sleep(delay).await;

        if self.state() == DaemonState::Crashed {
            self.machine.transition(DaemonState::Stopped)?;
        }
        self.start().await
    }

    /// Return a live daemon, starting, re-adopting or restarting as needed.
    pub async fn ensure_running(&mut self) -> Result<DaemonHandle, SupervisorError> {
        match self.state() {
            DaemonState::Ready => {
                if let Some(handle) = self.handle.clone() {
                    if self.is_healthy(&handle).await {
                        return Ok(handle);
                    }
                }
                // adopted daemon went away, or ours stopped accepting connections
                if self.process.as_ref().map_or(false, DaemonProcess::is_running) {
                    tracing::warn!("Owned daemon stopped answering; restarting it");
                    self.stop().await;
                } else {
                    let _ = self.machine.transition(DaemonState::Stopping);
                    let _ = self.machine.transition(DaemonState::Stopped);
                    self.handle = None;
                    self.process = None;
                }
                self.start().await
            }
            DaemonState::Crashed => self.restart().await,
            DaemonState::Stopped => self.start().await,
            DaemonState::Starting | DaemonState::Stopping => {
                Err(SupervisorError::Transition(state_machine::TransitionError::InvalidTransition(
                    self.state(),
                    DaemonState::Starting,
                )))
            }
        }
    }

    /// Ready, process alive (when owned) and endpoint accepting connections.
    pub async fn is_healthy(&self, handle: &DaemonHandle) -> bool {
        if handle.state() != DaemonState::Ready {
            return false;
        }
        if handle.owned && !self.process.as_ref().map_or(false, DaemonProcess::is_running) {
            return false;
        }
        handle.endpoint.is_reachable(self.reachability_timeout()).await
    }

    /// Stop an owned daemon (SIGTERM, then kill after the grace period).
    /// An adopted daemon is only forgotten.
    pub async fn stop(&mut self) {
        let handle = self.handle.take();
        let Some(mut process) = self.process.take() else {
            if handle.is_some() {
                tracing::info!("Detaching from adopted signal-cli daemon");
            }
            if self.state() == DaemonState::Ready {
                let _ = self.machine.transition(DaemonState::Stopping);
            }
            if matches!(self.state(), DaemonState::Stopping | DaemonState::Crashed) {
                let _ = self.machine.transition(DaemonState::Stopped);
            }
            return;
        };

        if !process.is_running() {
            let _ = self.machine.transition(DaemonState::Stopped);
            return;
        }

        let _ = self.machine.transition(DaemonState::Stopping);
        tracing::info!("Stopping signal-cli daemon (pid {})", process.pid);
        process.terminate();
        if process.wait_for_exit(self.config.stop_grace).await.is_none() {
            tracing::warn!(
                "signal-cli daemon (pid {}) ignored SIGTERM for {:?}, killing",
                process.pid,
                self.config.stop_grace
            );
            process.kill();
            process.wait_for_exit(Duration::from_secs(5)).await;
        }
        // the exit watcher normally does this already
        if self.state() == DaemonState::Stopping {
            let _ = self.machine.transition(DaemonState::Stopped);
        }
    }
}
