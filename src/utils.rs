//! Shared helpers for the signal-tui session client.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Command;

/// Apply platform-specific flags to hide the console window on Windows.
/// On non-Windows platforms, this is a no-op.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Exponential backoff: `initial * 2^attempt`, capped at `max`.
pub fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

/// Look up an executable on `PATH` (or accept it as-is when it is a path).
pub fn find_executable(program: &str) -> Option<std::path::PathBuf> {
    let candidate = std::path::Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| {
            let plain = dir.join(program);
            #[cfg(target_os = "windows")]
            {
                vec![plain.clone(), plain.with_extension("exe"), plain.with_extension("bat")]
            }
            #[cfg(not(target_os = "windows"))]
            {
                vec![plain]
            }
        })
        .find(|p| p.is_file())
}
