//! Supervisor lifecycle with stand-in daemons (`sleep`, `sh`) and a test
//! listener playing the daemon's socket.

#![cfg(unix)]

use std::time::Duration;
use tokio::net::TcpListener;

use signal_tui::supervisor::{
    DaemonState, RestartPolicy, Supervisor, SupervisorConfig, SupervisorError,
};
use signal_tui::transport::Endpoint;

fn config(program: &str, args: &[&str], port: u16) -> SupervisorConfig {
    SupervisorConfig {
        program: program.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        endpoint: Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port,
        },
        account: Some("+15550000000".into()),
        spawn: true,
        adopt_existing: false,
        readiness_attempts: 5,
        readiness_initial_delay: Duration::from_millis(20),
        readiness_max_delay: Duration::from_millis(200),
        stop_grace: Duration::from_secs(2),
        stderr_tail_lines: 20,
        restart: RestartPolicy {
            max_crashes: 1,
            window: Duration::from_secs(60),
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
        },
        config_dir: None,
    }
}

fn kill_hard(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
}

async fn wait_for_state(supervisor: &Supervisor, want: DaemonState) {
    let mut rx = supervisor.watch_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("never reached {:?}", want))
        .unwrap();
}

#[tokio::test]
async fn test_crash_restart_then_crash_loop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut supervisor = Supervisor::new(config("sleep", &["30"], port));

    let handle = supervisor.start().await.unwrap();
    assert_eq!(supervisor.state(), DaemonState::Ready);
    assert!(handle.owned);
    let first_pid = handle.pid.unwrap();

    kill_hard(first_pid);
    wait_for_state(&supervisor, DaemonState::Crashed).await;
    println!("✓ crash detected");

    let handle = supervisor.ensure_running().await.unwrap();
    assert_eq!(supervisor.state(), DaemonState::Ready);
    let second_pid = handle.pid.unwrap();
    assert_ne!(first_pid, second_pid);
    assert!(supervisor.is_healthy(&handle).await);

    kill_hard(second_pid);
    wait_for_state(&supervisor, DaemonState::Crashed).await;
    let err = supervisor.restart().await.unwrap_err();
    assert!(matches!(err, SupervisorError::CrashLoop { crashes: 2, .. }));
    assert!(err.is_fatal());
    assert_eq!(supervisor.state(), DaemonState::Crashed);
    println!("✓ second crash in the window is fatal");

    drop(listener);
}

#[tokio::test]
async fn test_early_exit_reports_stderr() {
    // nothing listens here, so readiness can only fail
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = unused.local_addr().unwrap().port();
    drop(unused);

    let mut supervisor = Supervisor::new(config(
        "sh",
        &["-c", "echo 'Config file is in use by another instance' >&2; exit 3"],
        port,
    ));
    let err = supervisor.start().await.unwrap_err();
    match &err {
        SupervisorError::Spawn { stderr_tail, .. } => {
            assert!(stderr_tail.iter().any(|l| l.contains("in use by another instance")));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(err.error_code(), "PROCESS_SPAWN");
    assert_eq!(supervisor.state(), DaemonState::Crashed);
}

#[tokio::test]
async fn test_missing_binary_is_spawn_error() {
    let mut supervisor = Supervisor::new(config("/nonexistent/signal-cli", &[], 1));
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::Spawn { .. }));
    assert_eq!(supervisor.state(), DaemonState::Stopped);
}

#[tokio::test]
async fn test_stop_terminates_owned_daemon() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut supervisor = Supervisor::new(config("sleep", &["30"], port));

    let handle = supervisor.start().await.unwrap();
    supervisor.stop().await;
    assert_eq!(supervisor.state(), DaemonState::Stopped);
    assert!(supervisor.handle().is_none());
    assert!(!supervisor.is_healthy(&handle).await);
    drop(listener);
}

#[tokio::test]
async fn test_adopts_listening_daemon_without_spawning() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut cfg = config("/nonexistent/signal-cli", &[], port);
    cfg.adopt_existing = true;
    cfg.spawn = false;
    let mut supervisor = Supervisor::new(cfg);

    let handle = supervisor.start().await.unwrap();
    assert!(!handle.owned);
    assert_eq!(handle.pid, None);
    assert_eq!(supervisor.state(), DaemonState::Ready);

    // an adopted daemon is left running
    supervisor.stop().await;
    assert_eq!(supervisor.state(), DaemonState::Stopped);
    assert!(handle.endpoint.is_reachable(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_no_daemon_and_spawn_disabled() {
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = unused.local_addr().unwrap().port();
    drop(unused);
    let mut cfg = config("signal-cli", &[], port);
    cfg.spawn = false;
    let mut supervisor = Supervisor::new(cfg);
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::NotRunning(_)));
}
