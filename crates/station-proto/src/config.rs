use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;
use crate::protocol::Station;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub station: StationConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub track: TrackConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
}

/// The one station this player plays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default = "default_station_name")]
    pub name: String,
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    /// Page scraped for the "now playing" label.
    #[serde(default = "default_page_url")]
    pub page_url: String,
    #[serde(default = "default_track_selector")]
    pub track_selector: String,
    /// Start playing as soon as the stream is prepared at daemon startup.
    #[serde(default)]
    pub autoplay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_volume")]
    pub volume: f32,
    /// Volume while another player holds ducking focus.
    #[serde(default = "default_duck_volume")]
    pub duck_volume: f32,
    #[serde(default = "default_ipc_timeout_secs")]
    pub ipc_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackConfig {
    /// Re-scrape the page every N seconds while the daemon runs.  0 = only
    /// at startup, on Play and on explicit refresh.
    #[serde(default)]
    pub refresh_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_track_timeout_secs")]
    pub timeout_secs: u64,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_socket_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Also write each rendered notification to `notification.json` in the
    /// data dir, for desktop widgets that poll it.
    #[serde(default = "default_file_sink")]
    pub file_sink: bool,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            name: default_station_name(),
            stream_url: default_stream_url(),
            page_url: default_page_url(),
            track_selector: default_track_selector(),
            autoplay: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            duck_volume: default_duck_volume(),
            ipc_timeout_secs: default_ipc_timeout_secs(),
        }
    }
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            refresh_secs: 0,
            user_agent: default_user_agent(),
            timeout_secs: default_track_timeout_secs(),
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

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_socket_port(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            file_sink: default_file_sink(),
        }
    }
}

fn default_station_name() -> String {
    "7000FM".to_string()
}

fn default_stream_url() -> String {
    "https://stream.7000fm.gr/radio/8000/radio.mp3".to_string()
}

fn default_page_url() -> String {
    "https://7000fm.gr/".to_string()
}

fn default_track_selector() -> String {
    "#current-track".to_string()
}

fn default_volume() -> f32 {
    1.0
}

fn default_duck_volume() -> f32 {
    0.2
}

fn default_ipc_timeout_secs() -> u64 {
    5
}

fn default_user_agent() -> String {
    format!("station-daemon/{}", env!("CARGO_PKG_VERSION"))
}

fn default_track_timeout_secs() -> u64 {
    10
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_socket_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_file_sink() -> bool {
    true
}

impl StationConfig {
    pub fn to_station(&self) -> Station {
        Station {
            name: self.name.clone(),
            stream_url: self.stream_url.clone(),
            page_url: self.page_url.clone(),
        }
    }
}

impl Config {
    /// Load from the default location, writing defaults there on first run.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.socket.bind_address, self.socket.port)
    }
}
