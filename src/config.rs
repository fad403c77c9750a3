// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading.
//!
//! Lookup order: an explicit path, then the project file `deskbridge.json`
//! in the working directory, then `~/.deskbridge/config.json`, then defaults.
//! Every field has a default so a partial file is always valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BridgeError;

/// Project-level config file name, looked up in the working directory.
pub const PROJECT_CONFIG_FILE: &str = "deskbridge.json";

/// Environment variable that switches on development mode.
pub const ENV_VAR: &str = "DESKBRIDGE_ENV";

/// Default port of the managed backend server.
pub const DEFAULT_SERVER_PORT: u16 = 19020;

/// Default port of the UI bridge.
pub const DEFAULT_BRIDGE_PORT: u16 = 19021;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Development mode: the server is not supervised and heartbeat
    /// failures never restart it.
    pub development: bool,
    pub server: ServerConfig,
    pub bridge: BridgeConfig,
    pub log: LogConfig,
}

/// Managed backend server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Executable file name, without directory. Defaults to `server`
    /// with the platform executable suffix.
    pub executable: Option<String>,
    /// Directory holding the executable; also the server's working directory.
    pub resources_dir: Option<PathBuf>,
    pub port: u16,
    pub heartbeat_path: String,
    pub api_prefix: String,
    pub heartbeat_timeout_ms: u64,
    /// Consecutive heartbeat failures before the server is restarted.
    pub heartbeat_failure_threshold: u32,
    /// Interval of the background heartbeat loop in `run` mode.
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            executable: None,
            resources_dir: None,
            port: DEFAULT_SERVER_PORT,
            heartbeat_path: "/heartbeat".to_string(),
            api_prefix: "/api".to_string(),
            heartbeat_timeout_ms: 1000,
            heartbeat_failure_threshold: 30,
            heartbeat_interval_ms: 2000,
        }
    }
}

impl ServerConfig {
    /// Executable name with the platform suffix applied.
    pub fn executable_name(&self) -> String {
        match &self.executable {
            Some(name) if !name.trim().is_empty() => {
                let name = name.trim();
                if std::env::consts::EXE_SUFFIX.is_empty()
                    || name.ends_with(std::env::consts::EXE_SUFFIX)
                {
                    name.to_string()
                } else {
                    format!("{}{}", name, std::env::consts::EXE_SUFFIX)
                }
            }
            _ => format!("server{}", std::env::consts::EXE_SUFFIX),
        }
    }

    /// Directory the executable lives in.
    pub fn resources_dir(&self) -> PathBuf {
        self.resources_dir.clone().unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("resources")
        })
    }

    /// Full path of the server executable.
    pub fn executable_path(&self) -> PathBuf {
        self.resources_dir().join(self.executable_name())
    }

    /// Base URL of the managed server.
    pub fn base_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(100))
    }
}

/// UI bridge listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: DEFAULT_BRIDGE_PORT,
        }
    }
}

/// Log sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// Size cap of `main.log` in bytes before it is rotated.
    pub max_file_size: u64,
    /// Log directory. Defaults to `log/` next to the executable.
    pub dir: Option<PathBuf>,
    /// Console output override. Defaults to on in development only.
    pub console: Option<bool>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            max_file_size: 1024 * 1024,
            dir: None,
            console: None,
        }
    }
}

impl Config {
    /// Whether development mode is active, from the file or the environment.
    pub fn is_development(&self) -> bool {
        self.development
            || std::env::var(ENV_VAR)
                .map(|v| v.eq_ignore_ascii_case("development"))
                .unwrap_or(false)
    }

    /// Resolved log directory.
    pub fn log_dir(&self) -> PathBuf {
        if let Some(dir) = &self.log.dir {
            return dir.clone();
        }
        if self.is_development() {
            return PathBuf::from("log");
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("log")))
            .unwrap_or_else(|| PathBuf::from("log"))
    }

    /// Whether log lines also go to the console.
    pub fn console_logging(&self) -> bool {
        self.log.console.unwrap_or_else(|| self.is_development())
    }
}

/// User-level config directory (`~/.deskbridge`).
pub fn get_config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".deskbridge"))
}

fn read_config_file(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&content).map_err(|e| {
        BridgeError::Config(format!("{}: {}", path.display(), e)).into()
    })
}

/// Load configuration following the documented lookup order.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return read_config_file(path);
    }

    let project = PathBuf::from(PROJECT_CONFIG_FILE);
    if project.exists() {
        return read_config_file(&project);
    }

    if let Ok(dir) = get_config_dir() {
        let user = dir.join("config.json");
        if user.exists() {
            return read_config_file(&user);
        }
    }

    Ok(Config::default())
}

/// Persist configuration to the user-level config file.
pub fn save_config(config: &Config) -> Result<PathBuf> {
    let path = get_config_dir()?.join("config.json");
    save_config_to(config, &path)?;
    Ok(path)
}

/// Write `config` as pretty JSON to `path`, creating parent directories.
pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 19020);
        assert_eq!(config.server.heartbeat_failure_threshold, 30);
        assert_eq!(config.server.heartbeat_timeout(), Duration::from_millis(1000));
        assert_eq!(config.log.max_file_size, 1024 * 1024);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.bridge.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"server": {"port": 5000}}"#).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.heartbeat_path, "/heartbeat");
        assert_eq!(config.bridge.port, DEFAULT_BRIDGE_PORT);
    }

    #[test]
    fn test_executable_name_override() {
        let mut server = ServerConfig::default();
        assert_eq!(
            server.executable_name(),
            format!("server{}", std::env::consts::EXE_SUFFIX)
        );

        server.executable = Some("jm".to_string());
        assert_eq!(
            server.executable_name(),
            format!("jm{}", std::env::consts::EXE_SUFFIX)
        );

        server.executable = Some("   ".to_string());
        assert!(server.executable_name().starts_with("server"));
    }

    #[test]
    fn test_executable_path_joins_resources_dir() {
        let server = ServerConfig {
            executable: Some("backend".to_string()),
            resources_dir: Some(PathBuf::from("/opt/app/resources")),
            ..ServerConfig::default()
        };
        assert!(server
            .executable_path()
            .starts_with(Path::new("/opt/app/resources")));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.json");
        fs::write(&path, r#"{"development": true, "log": {"level": "debug"}}"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert!(config.development);
        assert!(config.is_development());
        assert_eq!(config.log.level, "debug");
        assert!(config.console_logging());
    }

    #[test]
    fn test_load_explicit_file_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let mut config = Config::default();
        config.server.port = 4242;
        config.server.executable = Some("backend".to_string());

        save_config_to(&config, &path).unwrap();
        let loaded = load_config(Some(&path)).unwrap();

        assert_eq!(loaded.server.port, 4242);
        assert_eq!(loaded.server.executable.as_deref(), Some("backend"));
    }

    #[test]
    fn test_console_override() {
        let mut config = Config::default();
        config.log.console = Some(true);
        assert!(config.console_logging());
    }
}
