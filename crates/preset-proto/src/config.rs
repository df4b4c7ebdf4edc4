use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub stations: StationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Exit the process once the session has been torn down.
    #[serde(default = "default_true")]
    pub exit_when_idle: bool,
    /// Re-issue a persisted PLAY redelivery on startup.
    #[serde(default)]
    pub resume_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_socket_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    /// Explicit path to the mpv binary; searched for when unset.
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default = "default_network_timeout")]
    pub network_timeout_secs: u32,
    #[serde(default = "default_cache_secs")]
    pub cache_secs: u32,
    #[serde(default = "default_volume")]
    pub volume: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Where the preset list comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationsConfig {
    /// Path to the TOML preset file (highest priority).
    #[serde(default = "default_stations_toml")]
    pub stations_toml: PathBuf,
    /// URL or file path for an m3u list, used when the TOML file is absent.
    /// Entries become presets 1..N in list order.
    #[serde(default)]
    pub m3u_url: Option<String>,
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8979
}

fn default_socket_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_network_timeout() -> u32 {
    15
}

fn default_cache_secs() -> u32 {
    10
}

fn default_volume() -> f32 {
    0.7
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_stations_toml() -> PathBuf {
    platform::config_dir().join("stations.toml")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`, writing a default file there first if none exists.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            exit_when_idle: true,
            resume_on_start: false,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_socket_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            binary: None,
            network_timeout_secs: default_network_timeout(),
            cache_secs: default_cache_secs(),
            volume: default_volume(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            stations_toml: default_stations_toml(),
            m3u_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8979);
        assert_eq!(config.socket.port, platform::DAEMON_TCP_PORT);
        assert!(config.daemon.exit_when_idle);
        assert!(!config.daemon.resume_on_start);
        assert!(config
            .stations
            .stations_toml
            .ends_with("radio-presets/stations.toml"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [network]
            poll_interval_ms = 500

            [mpv]
            network_timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.network.poll_interval_ms, 500);
        assert_eq!(config.mpv.network_timeout_secs, 5);
        assert_eq!(config.mpv.cache_secs, 10);
        assert!(config.http.enabled);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.http.port, 8979);
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.socket.port, config.socket.port);
    }
}
