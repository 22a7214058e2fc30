//! In-process stand-in for `signal-cli daemon --tcp`.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use signal_tui::config::TransportMode;
use signal_tui::ClientConfig;

pub enum Reply {
    Result(Value),
    Error(i64, String),
    /// Never answer
    Silent,
    /// Drop the connection without answering
    HangUp,
}

type Handler = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

pub struct FakeDaemon {
    pub port: u16,
    notify: broadcast::Sender<String>,
    seen: Arc<Mutex<Vec<Value>>>,
}

impl FakeDaemon {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (notify, _) = broadcast::channel::<String>(64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        let notify_tx = notify.clone();
        let seen_log = seen.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut notes = notify_tx.subscribe();
                let handler = handler.clone();
                let seen = seen_log.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    loop {
                        tokio::select! {
                            line = lines.next_line() => {
                                let Ok(Some(line)) = line else { break };
                                let Ok(request) = serde_json::from_str::<Value>(&line) else { continue };
                                seen.lock().unwrap().push(request.clone());
                                let method = request["method"].as_str().unwrap_or_default().to_string();
                                let response = match handler(&method, &request["params"]) {
                                    Reply::Result(result) => {
                                        json!({"jsonrpc": "2.0", "id": request["id"], "result": result})
                                    }
                                    Reply::Error(code, message) => json!({
                                        "jsonrpc": "2.0",
                                        "id": request["id"],
                                        "error": {"code": code, "message": message}
                                    }),
                                    Reply::Silent => continue,
                                    Reply::HangUp => break,
                                };
                                let mut out = response.to_string();
                                out.push('\n');
                                if write.write_all(out.as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                            note = notes.recv() => {
                                let Ok(note) = note else { continue };
                                if write.write_all(note.as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self { port, notify, seen }
    }

    /// Push a JSON-RPC notification to every open connection.
    pub fn notify(&self, method: &str, params: Value) {
        let mut line = json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string();
        line.push('\n');
        let _ = self.notify.send(line);
    }

    /// Push an arbitrary frame, e.g. the bare `{"contacts_changed": true}`.
    pub fn push_frame(&self, frame: Value) {
        let mut line = frame.to_string();
        line.push('\n');
        let _ = self.notify.send(line);
    }

    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r["method"] == method)
            .cloned()
            .collect()
    }

    /// Wait until `method` has been called at least `count` times.
    pub async fn wait_for_calls(&self, method: &str, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.requests(method).len() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "'{}' was not called {} time(s)",
                method,
                count
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Config that adopts the fake daemon and never spawns signal-cli.
pub fn client_config(tmp: &TempDir, port: u16, account: Option<&str>) -> ClientConfig {
    let mut cfg = ClientConfig::default();
    cfg.mode = TransportMode::Daemon;
    cfg.account = account.map(String::from);
    cfg.signal_cli_config_dir = tmp.path().join("signal-cli");
    cfg.cache_path = tmp.path().join("contacts.json");
    cfg.daemon.port = port;
    cfg.daemon.spawn = false;
    cfg.daemon.adopt_existing = true;
    cfg.daemon.readiness_max_delay_ms = 200;
    cfg.reconnect.attempts = 5;
    cfg.reconnect.backoff_initial_ms = 20;
    cfg.reconnect.backoff_max_ms = 100;
    cfg.rpc.call_timeout_secs = 5;
    cfg
}

pub fn contact(number: &str, name: &str) -> Value {
    json!({"number": number, "uuid": null, "name": name, "profile": null, "isBlocked": false})
}
