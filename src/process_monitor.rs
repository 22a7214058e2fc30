use serde::{Deserialize, Serialize};
use sysinfo::System;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    /// 프로세스 커맨드라인 인수 (예: ["java", "-cp", "...", "org.asamk.signal.Main", "daemon"])
    #[serde(default)]
    pub cmd: Vec<String>,
}

/// 크로스 플랫폼: 실행 중인 모든 프로세스 목록 가져오기
pub fn get_running_processes() -> Vec<RunningProcess> {
    let mut sys = System::new();
    sys.refresh_processes();

    let processes: Vec<RunningProcess> = sys
        .processes()
        .iter()
        .map(|(pid, process)| RunningProcess {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            cmd: process.cmd().to_vec(),
        })
        .collect();

    tracing::debug!("Found {} running processes", processes.len());
    processes
}

/// signal-cli daemon 으로 보이는 프로세스인지 판단
///
/// 네이티브 바이너리와 JVM 실행 모두 커맨드라인에 "signal-cli" 또는
/// 메인 클래스 이름이 들어가고, 서브커맨드로 "daemon" 이 붙는다.
pub fn is_signal_cli_daemon(process: &RunningProcess) -> bool {
    let cmdline = process.cmd.join(" ").to_lowercase();
    let is_signal_cli = process.name.to_lowercase().contains("signal-cli")
        || cmdline.contains("signal-cli")
        || cmdline.contains("org.asamk.signal");
    is_signal_cli && process.cmd.iter().any(|a| a == "daemon")
}

/// 같은 설정 디렉토리를 쓰는 signal-cli daemon 검색
///
/// `config_dir` 가 None 이면 모든 signal-cli daemon 을 반환한다.
pub fn find_signal_cli_daemons(config_dir: Option<&str>) -> Vec<RunningProcess> {
    get_running_processes()
        .into_iter()
        .filter(is_signal_cli_daemon)
        .filter(|p| match config_dir {
            Some(dir) => p.cmd.iter().any(|a| a == dir),
            None => true,
        })
        .collect()
}

// ── Async wrappers ─────────────────────────────────────────
// sysinfo 시스템 콜은 동기적으로 OS 프로세스 테이블 전체를 스캔합니다.
// tokio 워커 스레드에서 직접 호출하면 런타임 전체가 블로킹되므로,
// spawn_blocking을 통해 전용 블로킹 스레드풀에서 실행합니다.

/// `find_signal_cli_daemons`의 비동기 래퍼.
pub async fn find_signal_cli_daemons_async(config_dir: Option<String>) -> Vec<RunningProcess> {
    tokio::task::spawn_blocking(move || find_signal_cli_daemons(config_dir.as_deref()))
        .await
        .unwrap_or_default()
}
