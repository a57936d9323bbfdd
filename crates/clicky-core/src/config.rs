//! Configuration resolution for clicky.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/clicky/settings.json)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Complete clicky configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub engine: EngineSettings,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    /// Frames buffered between a relay and the HTTP body before the relay
    /// has to wait for the client.
    pub frame_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            log_level: "info".to_string(),
            log_json: false,
            frame_buffer: 64,
        }
    }
}

/// Execution engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Path to the `gptscript` binary.
    pub gptscript_bin: PathBuf,
    /// Hard ceiling for a single run (seconds). Default: 15 minutes.
    pub run_timeout_secs: u64,
    /// Capacity of the engine event channel.
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            gptscript_bin: PathBuf::from("gptscript"),
            run_timeout_secs: 15 * 60,
            event_buffer: 256,
        }
    }
}

impl EngineSettings {
    pub const fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config() -> Result<Config> {
    let mut config = match global_config_path() {
        Some(path) if path.exists() => {
            debug!(path = %path.display(), "Loading config file");
            load_config_file(&path)?
        }
        Some(path) => {
            debug!(path = %path.display(), "No config file, using defaults");
            Config::default()
        }
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/clicky/settings.json"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("clicky").join("settings.json"))
    }
}

/// Read a settings file. Missing sections fall back to their defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `CLICKY_SERVES_*` overrides. `lookup` abstracts the environment so
/// the resolution order can be tested without mutating process state.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("CLICKY_SERVES_SERVER_PORT") {
        match val.parse() {
            Ok(port) => config.server.port = port,
            Err(e) => warn!(value = %val, error = %e, "Ignoring invalid CLICKY_SERVES_SERVER_PORT"),
        }
    }
    if let Some(val) = lookup("CLICKY_SERVES_LOG_LEVEL") {
        config.server.log_level = val;
    }
    if lookup("CLICKY_SERVES_DEBUG").is_some_and(|v| !v.is_empty()) {
        config.server.log_level = "debug".to_string();
    }
    if let Some(val) = lookup("CLICKY_SERVES_GPTSCRIPT_BIN") {
        config.engine.gptscript_bin = PathBuf::from(val);
    }
    if let Some(val) = lookup("CLICKY_SERVES_RUN_TIMEOUT_SECS") {
        match val.parse() {
            Ok(secs) => config.engine.run_timeout_secs = secs,
            Err(e) => {
                warn!(value = %val, error = %e, "Ignoring invalid CLICKY_SERVES_RUN_TIMEOUT_SECS");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_run_timeout_is_15_minutes() {
        let config = Config::default();
        assert_eq!(config.engine.run_timeout(), Duration::from_secs(900));
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"engine": {"run_timeout_secs": 30}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.engine.run_timeout_secs, 30);
        assert_eq!(config.engine.gptscript_bin, PathBuf::from("gptscript"));
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CLICKY_SERVES_SERVER_PORT", "9090"),
            ("CLICKY_SERVES_DEBUG", "1"),
            ("CLICKY_SERVES_RUN_TIMEOUT_SECS", "not-a-number"),
        ]);
        let mut config = Config::default();
        config.engine.run_timeout_secs = 42;

        apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string));

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.engine.run_timeout_secs, 42);
    }

    #[test]
    fn invalid_port_override_is_logged_and_ignored() {
        use std::io::Write;
        use std::sync::{Arc, Mutex};

        #[derive(Clone, Default)]
        struct Capture(Arc<Mutex<Vec<u8>>>);

        impl Write for Capture {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let mut config = Config::default();
        tracing::subscriber::with_default(subscriber, || {
            apply_env_overrides(&mut config, |k| {
                (k == "CLICKY_SERVES_SERVER_PORT").then(|| "70000".to_string())
            });
        });

        assert_eq!(config.server.port, 8080);
        let logged = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("WARN"), "{logged}");
        assert!(logged.contains("Ignoring invalid CLICKY_SERVES_SERVER_PORT"), "{logged}");
    }
}
