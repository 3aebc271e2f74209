use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub playlist: PlaylistConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// JSON file backing favorites, recents, broken stations and preferences.
    #[serde(default = "default_storage_file")]
    pub storage_file: PathBuf,
    /// Forget every broken station on startup.  Operator knob; clients
    /// cannot clear the broken set.
    #[serde(default)]
    pub reset_broken_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Playlist source: an http(s) URL or a local file path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistConfig {
    #[serde(default = "default_playlist_source")]
    pub source: String,
}

/// Failure-detection budgets.  These are tunables, not hard contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// How long a load may stay pending after load-start before the station
    /// is declared broken.
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    /// Delay after a stall before checking whether buffering recovered.
    #[serde(default = "default_stall_check_ms")]
    pub stall_check_ms: u64,
    /// Settle delay between a failure and the automatic failover selection.
    #[serde(default = "default_failover_delay_ms")]
    pub failover_delay_ms: u64,
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

impl PlaybackConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn stall_check(&self) -> Duration {
        Duration::from_millis(self.stall_check_ms)
    }

    pub fn failover_delay(&self) -> Duration {
        Duration::from_millis(self.failover_delay_ms)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            storage_file: default_storage_file(),
            reset_broken_on_start: false,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            source: default_playlist_source(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: default_load_timeout_ms(),
            stall_check_ms: default_stall_check_ms(),
            failover_delay_ms: default_failover_delay_ms(),
            default_volume: default_volume(),
        }
    }
}

fn default_storage_file() -> PathBuf {
    platform::data_dir().join("registry.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_playlist_source() -> String {
    "Radyo.m3u".to_string()
}

fn default_load_timeout_ms() -> u64 {
    8000
}

fn default_stall_check_ms() -> u64 {
    5000
}

fn default_failover_delay_ms() -> u64 {
    1000
}

fn default_volume() -> f32 {
    0.8
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8989);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.playlist.source, "Radyo.m3u");
        assert_eq!(config.playback.load_timeout(), Duration::from_secs(8));
        assert_eq!(config.playback.stall_check(), Duration::from_secs(5));
        assert_eq!(config.playback.failover_delay(), Duration::from_secs(1));
        assert!(config
            .daemon
            .storage_file
            .ends_with("plusradio/registry.json"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
[playlist]
source = "https://example.org/list.m3u"

[playback]
load_timeout_ms = 3000
"#,
        )
        .unwrap();
        assert_eq!(config.playlist.source, "https://example.org/list.m3u");
        assert_eq!(config.playback.load_timeout_ms, 3000);
        assert_eq!(config.playback.stall_check_ms, 5000);
        assert_eq!(config.http.port, 8989);
        assert!(!config.daemon.reset_broken_on_start);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back = Config::from_toml_str(&text).unwrap();
        assert_eq!(back.playback.failover_delay_ms, 1000);
        assert_eq!(back.daemon.storage_file, config.daemon.storage_file);
    }
}
