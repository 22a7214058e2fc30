use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::Endpoint;

/// How the client reaches signal-cli.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Long-lived `signal-cli daemon` speaking JSON-RPC over a local socket
    #[default]
    Daemon,
    /// One `signal-cli` process per request, no event stream
    OneShot,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ClientConfig {
    /// signal-cli 실행 파일 (PATH 에 있으면 이름만)
    pub signal_cli_path: String,
    /// signal-cli `--config` 디렉토리
    pub signal_cli_config_dir: PathBuf,
    /// E.164 account, e.g. "+15551234567". Empty until linked.
    pub account: Option<String>,
    pub device_name: String,
    pub mode: TransportMode,
    /// Contact/group cache file
    pub cache_path: PathBuf,
    // 테이블은 값 필드 뒤에 와야 toml 직렬화가 된다
    pub daemon: DaemonConfig,
    pub restart: RestartConfig,
    pub reconnect: ReconnectConfig,
    pub linking: LinkingConfig,
    pub rpc: RpcConfig,
    pub events: EventConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    /// Unix socket path; takes precedence over host/port when set
    pub socket: Option<PathBuf>,
    /// Start a daemon when none is listening on the endpoint
    pub spawn: bool,
    /// 이미 떠 있는 daemon 이 있으면 새로 띄우지 않고 붙는다
    pub adopt_existing: bool,
    /// The daemon serves several accounts; requests carry an `account` param
    pub multi_account: bool,
    pub readiness_attempts: u32,
    pub readiness_initial_delay_ms: u64,
    pub readiness_max_delay_ms: u64,
    /// Grace period between SIGTERM and kill on stop
    pub stop_grace_ms: u64,
    /// Number of stderr lines kept for diagnostics
    pub stderr_tail_lines: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct RestartConfig {
    /// Crashes tolerated inside `window_secs` before giving up
    pub max_crashes: usize,
    pub window_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ReconnectConfig {
    pub attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct LinkingConfig {
    /// How long a linking URI stays valid
    pub expiry_secs: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct RpcConfig {
    pub call_timeout_secs: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct EventConfig {
    /// Lossy events (typing, receipts, ...) kept per subscriber
    pub buffer: usize,
    /// Total events kept per subscriber; messages are never dropped below this
    pub message_buffer: usize,
}

fn home_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    let var = "USERPROFILE";
    #[cfg(not(target_os = "windows"))]
    let var = "HOME";
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

impl Default for ClientConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            signal_cli_path: "signal-cli".to_string(),
            signal_cli_config_dir: home.join(".local").join("share").join("signal-cli"),
            account: None,
            device_name: "Signal TUI".to_string(),
            mode: TransportMode::Daemon,
            daemon: DaemonConfig::default(),
            restart: RestartConfig::default(),
            reconnect: ReconnectConfig::default(),
            linking: LinkingConfig::default(),
            rpc: RpcConfig::default(),
            events: EventConfig::default(),
            cache_path: home.join(".config").join("signal-tui").join("contacts.json"),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7583,
            socket: None,
            spawn: true,
            adopt_existing: true,
            multi_account: false,
            readiness_attempts: 10,
            readiness_initial_delay_ms: 50,
            readiness_max_delay_ms: 1000,
            stop_grace_ms: 3000,
            stderr_tail_lines: 50,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_crashes: 1,
            window_secs: 60,
            backoff_initial_ms: 500,
            backoff_max_ms: 10_000,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff_initial_ms: 500,
            backoff_max_ms: 10_000,
        }
    }
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self { expiry_secs: 90 }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { call_timeout_secs: 30 }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            buffer: 256,
            message_buffer: 4096,
        }
    }
}

impl ClientConfig {
    /// Default location: `$HOME/.config/signal-tui/config.toml`
    pub fn default_path() -> PathBuf {
        home_dir().join(".config").join("signal-tui").join("config.toml")
    }

    /// 설정 로드 (파일이 없으면 기본값)
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&s)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let s = toml::to_string_pretty(self)?;
        std::fs::write(path, s)?;
        Ok(())
    }

    /// Endpoint the daemon listens on.
    pub fn endpoint(&self) -> Endpoint {
        match &self.daemon.socket {
            Some(path) => Endpoint::Unix(path.clone()),
            None => Endpoint::Tcp {
                host: self.daemon.host.clone(),
                port: self.daemon.port,
            },
        }
    }

    pub fn is_configured(&self) -> bool {
        self.account.as_deref().map_or(false, |a| !a.is_empty())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc.call_timeout_secs)
    }

    pub fn linking_expiry(&self) -> Duration {
        Duration::from_secs(self.linking.expiry_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_signal_cli_conventions() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.signal_cli_path, "signal-cli");
        assert_eq!(cfg.daemon.port, 7583);
        assert_eq!(cfg.mode, TransportMode::Daemon);
        assert!(!cfg.is_configured());
        assert_eq!(
            cfg.endpoint(),
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 7583
            }
        );
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: ClientConfig = toml::from_str(
            r#"
            account = "+15551234567"
            mode = "one_shot"

            [daemon]
            socket = "/run/signal-cli.sock"

            [linking]
            expiry_secs = 30
            "#,
        )
        .unwrap();
        assert!(cfg.is_configured());
        assert_eq!(cfg.mode, TransportMode::OneShot);
        assert_eq!(cfg.linking_expiry(), Duration::from_secs(30));
        assert_eq!(cfg.daemon.readiness_attempts, 10);
        assert_eq!(
            cfg.endpoint(),
            Endpoint::Unix(PathBuf::from("/run/signal-cli.sock"))
        );
    }

    #[test]
    fn save_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let mut cfg = ClientConfig::default();
        cfg.account = Some("+15550000000".to_string());
        cfg.events.buffer = 8;
        cfg.save(&path).unwrap();

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded.account.as_deref(), Some("+15550000000"));
        assert_eq!(loaded.events.buffer, 8);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg = ClientConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.device_name, "Signal TUI");
    }

    #[test]
    fn invalid_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "daemon = [not toml").unwrap();
        assert!(ClientConfig::load(&path).is_err());
    }
}
