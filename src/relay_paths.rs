//! Home-based storage paths for the relay daemon and CLI.
//!
//! Everything lives under `~/.printf-relay/`:
//! - `config.yaml` - Daemon configuration
//! - `history.json` - Client-local transfer history
//! - `blobs/` - Uploaded file bytes (local blob store)
//! - `logs/relay.log` - Log file when file logging is enabled
//! - `relay.port` - Ports of the running daemon
//!
//! `PRINTF_RELAY_HOME` overrides the location.

use anyhow::{Context, Result};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;

/// The name of the relay directory under the user's home.
const RELAY_DIR: &str = ".printf-relay";

/// Environment variable that replaces the home-based directory.
pub const HOME_ENV: &str = "PRINTF_RELAY_HOME";

thread_local! {
    static TEST_HOME: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

/// Restores the previous override when dropped.
pub struct TestHomeGuard {
    previous: Option<PathBuf>,
}

impl Drop for TestHomeGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        TEST_HOME.with(|home| *home.borrow_mut() = previous);
    }
}

/// Points this thread's relay home at `dir` until the guard drops.
pub fn set_home_for_test(dir: PathBuf) -> TestHomeGuard {
    let previous = TEST_HOME.with(|home| home.borrow_mut().replace(dir));
    TestHomeGuard { previous }
}

/// Returns the relay directory, creating it if needed.
pub fn relay_home_dir() -> Result<PathBuf> {
    let dir = match TEST_HOME.with(|home| home.borrow().clone()) {
        Some(dir) => dir,
        None => match std::env::var_os(HOME_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .context("Could not determine home directory for relay storage")?
                .join(RELAY_DIR),
        },
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create relay directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the config path: `~/.printf-relay/config.yaml`
pub fn config_path() -> Result<PathBuf> {
    Ok(relay_home_dir()?.join("config.yaml"))
}

/// Returns the history path: `~/.printf-relay/history.json`
pub fn history_path() -> Result<PathBuf> {
    Ok(relay_home_dir()?.join("history.json"))
}

/// Returns the blob directory: `~/.printf-relay/blobs/`
///
/// Creates the directory if it doesn't exist.
pub fn blobs_dir() -> Result<PathBuf> {
    let dir = relay_home_dir()?.join("blobs");
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create blobs directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the log file path: `~/.printf-relay/logs/relay.log`
pub fn log_path() -> Result<PathBuf> {
    let dir = relay_home_dir()?.join("logs");
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
    Ok(dir.join("relay.log"))
}

/// Returns the daemon port file: `~/.printf-relay/relay.port`
pub fn port_file_path() -> Result<PathBuf> {
    Ok(relay_home_dir()?.join("relay.port"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_follow_test_home() {
        let dir = tempdir().unwrap();
        let _guard = set_home_for_test(dir.path().to_path_buf());

        assert_eq!(relay_home_dir().unwrap(), dir.path());
        assert_eq!(config_path().unwrap(), dir.path().join("config.yaml"));
        assert_eq!(history_path().unwrap(), dir.path().join("history.json"));
        assert_eq!(port_file_path().unwrap(), dir.path().join("relay.port"));
        assert!(blobs_dir().unwrap().is_dir());
        assert!(log_path().unwrap().parent().unwrap().is_dir());
    }

    #[test]
    fn test_guard_restores_previous_home() {
        let outer = tempdir().unwrap();
        let inner = tempdir().unwrap();
        let _outer_guard = set_home_for_test(outer.path().to_path_buf());
        {
            let _inner_guard = set_home_for_test(inner.path().to_path_buf());
            assert_eq!(relay_home_dir().unwrap(), inner.path());
        }
        assert_eq!(relay_home_dir().unwrap(), outer.path());
    }

    #[test]
    #[serial_test::serial]
    fn test_env_override() {
        let dir = tempdir().unwrap();
        std::env::set_var(HOME_ENV, dir.path());
        let home = relay_home_dir();
        std::env::remove_var(HOME_ENV);
        assert_eq!(home.unwrap(), dir.path());
    }
}
