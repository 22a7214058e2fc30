//! One signal-cli process per request.
//!
//! Fallback when no daemon is wanted. Each call maps to a CLI invocation with
//! `--output=json`; stdout is parsed as the result and a non-zero exit becomes
//! [`RpcError::Remote`] carrying the exit code and stderr. There is no event
//! stream. Device linking keeps the `link` process alive between `startLink`
//! and `finishLink`.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::rpc::{RpcBackend, RpcError};
use crate::utils::apply_creation_flags;

/// `link` process between startLink and finishLink
struct PendingLink {
    child: Child,
    stdout_rest: JoinHandle<String>,
    stderr: JoinHandle<String>,
}

pub struct OneShotBackend {
    program: String,
    config_dir: Option<PathBuf>,
    account: Mutex<Option<String>>,
    device_name: String,
    link: tokio::sync::Mutex<Option<PendingLink>>,
    closed: CancellationToken,
}

impl OneShotBackend {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            program: config.signal_cli_path.clone(),
            config_dir: Some(config.signal_cli_config_dir.clone()),
            account: Mutex::new(config.account.clone()),
            device_name: config.device_name.clone(),
            link: tokio::sync::Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Backend around an arbitrary executable (scripts in tests).
    pub fn with_program(program: impl Into<String>, account: Option<String>) -> Self {
        Self {
            program: program.into(),
            config_dir: None,
            account: Mutex::new(account),
            device_name: "signal-tui".to_string(),
            link: tokio::sync::Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    fn account(&self) -> Option<String> {
        self.account
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn command(&self, with_account: bool) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(dir) = &self.config_dir {
            cmd.arg("--config").arg(dir);
        }
        if with_account {
            if let Some(account) = self.account() {
                cmd.arg("-a").arg(account);
            }
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_creation_flags(&mut cmd);
        cmd
    }

    async fn run(&self, method: &str, args: Vec<String>, timeout: Duration) -> Result<Value, RpcError> {
        let mut cmd = self.command(true);
        cmd.arg("--output=json").args(&args);
        tracing::debug!("Running signal-cli {}", args.join(" "));

        let child = cmd
            .spawn()
            .map_err(|e| RpcError::Spawn(format!("{}: {}", self.program, e)))?;
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| RpcError::Spawn(e.to_string()))?,
            Err(_) => {
                return Err(RpcError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(RpcError::Remote {
                code: output.status.code().map(i64::from).unwrap_or(-1),
                message,
            });
        }
        parse_output(&stdout)
    }

    async fn start_link(&self, timeout: Duration) -> Result<Value, RpcError> {
        let mut slot = self.link.lock().await;
        if let Some(mut previous) = slot.take() {
            tracing::info!("Abandoning previous link attempt");
            let _ = previous.child.start_kill();
        }

        let mut cmd = self.command(false);
        cmd.arg("link").arg("-n").arg(&self.device_name);
        let mut child = cmd
            .spawn()
            .map_err(|e| RpcError::Spawn(format!("{}: {}", self.program, e)))?;

        let (Some(stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(RpcError::Spawn("link process has no output pipes".into()));
        };
        let mut lines = BufReader::new(stdout);

        let mut first = String::new();
        let read = tokio::time::timeout(timeout, lines.read_line(&mut first)).await;
        let uri = first.trim().to_string();
        if !matches!(read, Ok(Ok(n)) if n > 0) || !is_link_uri(&uri) {
            let _ = child.start_kill();
            let mut err = String::new();
            let _ = tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut err)).await;
            return Err(match read {
                Err(_) => RpcError::Timeout {
                    method: "startLink".into(),
                    after: timeout,
                },
                _ => RpcError::InvalidResponse(format!(
                    "expected a device link URI, got '{}' {}",
                    uri,
                    err.trim()
                )),
            });
        }

        let stdout_rest = tokio::spawn(async move {
            let mut rest = String::new();
            let _ = lines.read_to_string(&mut rest).await;
            rest
        });
        let stderr = tokio::spawn(async move {
            let mut err = String::new();
            let _ = stderr.read_to_string(&mut err).await;
            err
        });
        *slot = Some(PendingLink {
            child,
            stdout_rest,
            stderr,
        });
        Ok(json!({ "deviceLinkUri": uri }))
    }

    async fn finish_link(&self, timeout: Duration) -> Result<Value, RpcError> {
        let Some(mut link) = self.link.lock().await.take() else {
            return Err(RpcError::InvalidParams("no link in progress".into()));
        };

        let status = match tokio::time::timeout(timeout, link.child.wait()).await {
            Ok(status) => status.map_err(|e| RpcError::Spawn(e.to_string()))?,
            Err(_) => {
                let _ = link.child.start_kill();
                return Err(RpcError::Timeout {
                    method: "finishLink".into(),
                    after: timeout,
                });
            }
        };
        let stdout = link.stdout_rest.await.unwrap_or_default();
        let stderr = link.stderr.await.unwrap_or_default();

        if !status.success() {
            return Err(RpcError::Remote {
                code: status.code().map(i64::from).unwrap_or(-1),
                message: stderr.trim().to_string(),
            });
        }

        let number = extract_account(&stdout).or_else(|| extract_account(&stderr));
        if let Some(number) = &number {
            self.set_account(number);
        }
        Ok(json!({ "number": number }))
    }
}

#[async_trait]
impl RpcBackend for OneShotBackend {
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, RpcError> {
        if self.closed.is_cancelled() {
            return Err(RpcError::ConnectionLost);
        }
        match method {
            "startLink" => self.start_link(timeout).await,
            "finishLink" => self.finish_link(timeout).await,
            _ => {
                let args = cli_args(method, &params)?;
                self.run(method, args, timeout).await
            }
        }
    }

    fn supports_events(&self) -> bool {
        false
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Some(mut link) = self.link.lock().await.take() {
            let _ = link.child.start_kill();
        }
    }

    fn set_account(&self, account: &str) {
        *self.account.lock().unwrap_or_else(PoisonError::into_inner) = Some(account.to_string());
    }
}

/// CLI arguments equivalent to a JSON-RPC call.
pub fn cli_args(method: &str, params: &Value) -> Result<Vec<String>, RpcError> {
    let text = |key: &str| params.get(key).and_then(Value::as_str).map(String::from);

    match method {
        "send" => {
            let message = text("message")
                .ok_or_else(|| RpcError::InvalidParams("send requires 'message'".into()))?;
            let mut args = vec!["send".to_string(), format!("--message={}", message)];
            if let Some(group) = text("groupId") {
                args.push("-g".to_string());
                args.push(group);
                return Ok(args);
            }
            let recipients: Vec<String> = match params.get("recipient") {
                Some(Value::String(r)) => vec![r.clone()],
                Some(Value::Array(rs)) => rs.iter().filter_map(Value::as_str).map(String::from).collect(),
                _ => Vec::new(),
            };
            if recipients.is_empty() {
                return Err(RpcError::InvalidParams(
                    "send requires 'recipient' or 'groupId'".into(),
                ));
            }
            args.extend(recipients);
            Ok(args)
        }
        "listContacts" => Ok(vec!["listContacts".to_string()]),
        "listGroups" => Ok(vec!["listGroups".to_string(), "-d".to_string()]),
        "sendSyncRequest" => Ok(vec!["sendSyncRequest".to_string()]),
        "trust" => {
            let recipient = match params.get("recipient") {
                Some(Value::String(r)) => Some(r.clone()),
                Some(Value::Array(rs)) => rs.first().and_then(Value::as_str).map(String::from),
                _ => None,
            }
            .ok_or_else(|| RpcError::InvalidParams("trust requires 'recipient'".into()))?;
            Ok(vec!["trust".to_string(), "-a".to_string(), recipient])
        }
        "version" => Ok(vec!["version".to_string()]),
        other => Err(RpcError::Unsupported(other.to_string())),
    }
}

/// stdout of a JSON-mode invocation: nothing, one document, or one per line.
pub fn parse_output(stdout: &str) -> Result<Value, RpcError> {
    let lines: Vec<&str> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let parse = |l: &str| {
        serde_json::from_str::<Value>(l).map_err(|e| RpcError::InvalidResponse(format!("{}: {}", e, l)))
    };
    match lines.as_slice() {
        [] => Ok(Value::Null),
        [single] => parse(single),
        many => many.iter().map(|l| parse(l)).collect::<Result<Vec<_>, _>>().map(Value::Array),
    }
}

fn is_link_uri(s: &str) -> bool {
    s.starts_with("sgnl://") || s.starts_with("tsdevice:")
}

/// First E.164 number mentioned in `link` output.
pub fn extract_account(output: &str) -> Option<String> {
    let re = Regex::new(r"\+\d{6,15}").ok()?;
    re.find(output).map(|m| m.as_str().to_string())
}

/// `signal-cli --version`, e.g. "signal-cli 0.13.4".
pub async fn cli_version(program: &str) -> Option<String> {
    let mut cmd = Command::new(program);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    apply_creation_flags(&mut cmd);
    let output = tokio::time::timeout(Duration::from_secs(10), cmd.output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!version.is_empty()).then_some(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_to_contact_and_group() {
        let args = cli_args("send", &json!({"recipient": ["+15551234567"], "message": "hi"})).unwrap();
        assert_eq!(args, vec!["send", "--message=hi", "+15551234567"]);

        let args = cli_args("send", &json!({"groupId": "abc==", "message": "yo"})).unwrap();
        assert_eq!(args, vec!["send", "--message=yo", "-g", "abc=="]);

        assert!(matches!(
            cli_args("send", &json!({"message": "lost"})),
            Err(RpcError::InvalidParams(_))
        ));
    }

    #[test]
    fn dash_leading_body_stays_one_argument() {
        let args = cli_args("send", &json!({"recipient": "+15551234567", "message": "-1 from me"})).unwrap();
        assert_eq!(args, vec!["send", "--message=-1 from me", "+15551234567"]);

        let args = cli_args("send", &json!({"recipient": "+15551234567", "message": "--help"})).unwrap();
        assert_eq!(args[1], "--message=--help");
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn listing_and_unknown_methods() {
        assert_eq!(cli_args("listGroups", &Value::Null).unwrap(), vec!["listGroups", "-d"]);
        assert_eq!(
            cli_args("trust", &json!({"recipient": "+1555"})).unwrap(),
            vec!["trust", "-a", "+1555"]
        );
        assert!(matches!(
            cli_args("subscribeReceive", &Value::Null),
            Err(RpcError::Unsupported(_))
        ));
    }

    #[test]
    fn output_parsing() {
        assert_eq!(parse_output("").unwrap(), Value::Null);
        assert_eq!(parse_output("[{\"number\":\"+1\"}]\n").unwrap(), json!([{"number": "+1"}]));
        assert_eq!(parse_output("{\"a\":1}\n\n{\"a\":2}\n").unwrap(), json!([{"a": 1}, {"a": 2}]));
        assert!(matches!(parse_output("INFO noise"), Err(RpcError::InvalidResponse(_))));
    }

    #[test]
    fn account_extraction() {
        assert_eq!(
            extract_account("Associated with: +15551234567\n").as_deref(),
            Some("+15551234567")
        );
        assert_eq!(extract_account("Device linked"), None);
        assert!(is_link_uri("sgnl://linkdevice?uuid=x&pub_key=y"));
        assert!(!is_link_uri("INFO starting"));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn script(dir: &TempDir, body: &str) -> String {
            let path = dir.path().join("fake-signal-cli");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        #[tokio::test]
        async fn successful_call_parses_stdout() {
            let dir = TempDir::new().unwrap();
            let program = script(&dir, r#"echo '[{"number":"+15550001111","name":"Ann"}]'"#);
            let backend = OneShotBackend::with_program(program, Some("+15550000000".into()));
            let out = backend
                .call("listContacts", Value::Null, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(out[0]["name"], "Ann");
            assert!(!backend.supports_events());
        }

        #[tokio::test]
        async fn nonzero_exit_is_remote_error() {
            let dir = TempDir::new().unwrap();
            let program = script(&dir, "echo 'User +1 is not registered.' >&2\nexit 3");
            let backend = OneShotBackend::with_program(program, None);
            let err = backend
                .call("send", json!({"recipient": ["+1"], "message": "x"}), Duration::from_secs(5))
                .await
                .unwrap_err();
            assert_eq!(
                err,
                RpcError::Remote {
                    code: 3,
                    message: "User +1 is not registered.".into()
                }
            );
        }

        #[tokio::test]
        async fn missing_binary_is_spawn_error() {
            let backend = OneShotBackend::with_program("/nonexistent/signal-cli", None);
            let err = backend
                .call("listContacts", Value::Null, Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(matches!(err, RpcError::Spawn(_)));
        }

        #[tokio::test]
        async fn link_flow_reports_uri_then_account() {
            let dir = TempDir::new().unwrap();
            let program = script(
                &dir,
                "echo 'sgnl://linkdevice?uuid=abc&pub_key=def'\nsleep 0.2\necho 'Associated with: +15557654321'",
            );
            let backend = OneShotBackend::with_program(program, None);
            let t = Duration::from_secs(5);

            let started = backend.call("startLink", Value::Null, t).await.unwrap();
            assert_eq!(started["deviceLinkUri"], "sgnl://linkdevice?uuid=abc&pub_key=def");

            let finished = backend.call("finishLink", Value::Null, t).await.unwrap();
            assert_eq!(finished["number"], "+15557654321");
            assert_eq!(backend.account().as_deref(), Some("+15557654321"));
        }

        #[tokio::test]
        async fn closed_backend_refuses_calls() {
            let backend = OneShotBackend::with_program("true", None);
            backend.close().await;
            assert!(backend.is_closed());
            assert_eq!(
                backend.call("version", Value::Null, Duration::from_secs(1)).await,
                Err(RpcError::ConnectionLost)
            );
        }
    }
}
