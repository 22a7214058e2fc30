use std::path::PathBuf;

use signal_tui::session::DisconnectReason;
use signal_tui::{ClientConfig, Event, EventFilter, LinkingStatus, SessionState, SignalClient};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("SIGNAL_TUI_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| ClientConfig::default_path());
    let config = ClientConfig::load(&config_path)?;
    tracing::info!("signal-tui core starting (config {})", config_path.display());

    let client = SignalClient::new(config);
    if !client.is_cli_installed() {
        tracing::warn!("'{}' not found on PATH", client.config().signal_cli_path);
    } else if let Some(version) = client.cli_version().await {
        tracing::info!("Using {}", version);
    }
    if let Err(e) = client.connect().await {
        tracing::error!("Failed to connect to signal-cli: {}", e);
    }

    // 이벤트 로그
    let mut events = client.subscribe_events(EventFilter::all());
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::IncomingMessage(msg) => tracing::info!(
                    "[{}] {}: {}",
                    msg.group_id.as_deref().unwrap_or("direct"),
                    msg.sender_name.as_deref().unwrap_or(&msg.sender),
                    if msg.body.is_empty() { "<attachment>" } else { &msg.body }
                ),
                Event::ProtocolError { detail } => tracing::warn!("Protocol error: {}", detail),
                other => tracing::debug!("Event: {:?}", other),
            }
        }
    });

    // Persist the account once linked so the next start skips linking
    let mut state_rx = client.watch_state();
    let saver = client.clone();
    let save_path = config_path.clone();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow_and_update().clone();
            if let SessionState::Linked { account } = state {
                if saver.config().account.as_deref() != Some(account.as_str()) {
                    let mut updated = saver.config().clone();
                    updated.account = Some(account);
                    if let Err(e) = updated.save(&save_path) {
                        tracing::warn!("Failed to save config: {}", e);
                    }
                }
            }
        }
    });

    if client.state()
        == (SessionState::Disconnected {
            reason: DisconnectReason::NotLinked,
        })
    {
        match client.start_linking().await {
            Ok(mut linking) => {
                while let Some(status) = linking.next().await {
                    match status {
                        LinkingStatus::AwaitingScan { uri } => {
                            println!("Scan this link from Signal on your phone (Settings > Linked devices):\n{}", uri)
                        }
                        LinkingStatus::Confirmed { account } => tracing::info!("Linked as {}", account),
                        other => tracing::warn!("Linking ended: {:?}", other),
                    }
                }
            }
            Err(e) => tracing::error!("Cannot start linking: {}", e),
        }
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, cleaning up...");
    client.shutdown().await;
    tracing::info!("signal-tui core stopped");
    Ok(())
}
