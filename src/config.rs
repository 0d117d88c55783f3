//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::mapif::MAX_CASTLES_PER_FRAME;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Server name reported to the login server
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Address the char port binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port for game clients and map servers
    #[serde(default = "default_char_port")]
    pub char_port: u16,

    /// Public address of this char server, reported to login (host name or IPv4)
    #[serde(default = "default_char_ip")]
    pub char_ip: String,

    /// Login server host
    #[serde(default = "default_login_host")]
    pub login_host: String,

    /// Login server port
    #[serde(default = "default_login_port")]
    pub login_port: u16,

    /// Inter-server user id (used towards login, expected from map servers)
    #[serde(default = "default_server_userid")]
    pub server_userid: String,

    /// Inter-server password
    #[serde(default = "default_server_passwd")]
    pub server_passwd: String,

    /// Maintenance flag reported to login
    #[serde(default)]
    pub maintenance: u16,

    /// "New" display flag reported to login
    #[serde(default)]
    pub new_display: u16,

    /// Maximum number of connected map servers
    #[serde(default = "default_max_map_servers")]
    pub max_map_servers: usize,

    /// Largest frame accepted on any connection
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Event loop tick rate in milliseconds
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,

    /// Delay before a pending map-server kick is assumed complete
    #[serde(default = "default_kick_timeout")]
    pub kick_timeout_secs: u64,

    /// Castle store sync interval in seconds (0 to disable)
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_secs: u64,

    /// Delay between login connection attempts
    #[serde(default = "default_login_reconnect")]
    pub login_reconnect_secs: u64,

    /// Keepalive interval towards the login server
    #[serde(default = "default_login_ping")]
    pub login_ping_secs: u64,

    /// Persistent storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Backend used by the persistent stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Flat text files with an in-memory index
    Text,
}

/// Persistent storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Selected backend
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Castle snapshot file
    #[serde(default = "default_castle_file")]
    pub castle_file: PathBuf,

    /// Number of castle slots in the world
    #[serde(default = "default_castle_count")]
    pub castle_count: u32,
}

// Default value functions
fn default_server_name() -> String {
    "Charserver".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_char_port() -> u16 {
    6121
}

fn default_char_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_login_host() -> String {
    "127.0.0.1".to_string()
}

fn default_login_port() -> u16 {
    6900
}

fn default_server_userid() -> String {
    "s1".to_string()
}

fn default_server_passwd() -> String {
    "p1".to_string()
}

fn default_max_map_servers() -> usize {
    30
}

fn default_max_frame_size() -> usize {
    65535
}

fn default_tick_rate() -> u64 {
    100
}

fn default_kick_timeout() -> u64 {
    30
}

fn default_autosave_interval() -> u64 {
    300 // 5 minutes
}

fn default_login_reconnect() -> u64 {
    10
}

fn default_login_ping() -> u64 {
    60
}

fn default_backend() -> StoreBackend {
    StoreBackend::Text
}

fn default_castle_file() -> PathBuf {
    PathBuf::from("save/castle.txt")
}

fn default_castle_count() -> u32 {
    crate::storage::castle::MAX_GUILD_CASTLES
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            castle_file: default_castle_file(),
            castle_count: default_castle_count(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/char-server.toml"),
            server_name: default_server_name(),
            bind_address: default_bind_address(),
            char_port: default_char_port(),
            char_ip: default_char_ip(),
            login_host: default_login_host(),
            login_port: default_login_port(),
            server_userid: default_server_userid(),
            server_passwd: default_server_passwd(),
            maintenance: 0,
            new_display: 0,
            max_map_servers: default_max_map_servers(),
            max_frame_size: default_max_frame_size(),
            tick_rate_ms: default_tick_rate(),
            kick_timeout_secs: default_kick_timeout(),
            autosave_interval_secs: default_autosave_interval(),
            login_reconnect_secs: default_login_reconnect(),
            login_ping_secs: default_login_ping(),
            storage: StorageConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("CHARSERVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/char-server.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            toml::from_str(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CHARSERVER_SERVER_NAME") {
            self.server_name = val;
        }
        if let Ok(val) = env::var("CHARSERVER_BIND_ADDRESS") {
            self.bind_address = val;
        }
        if let Ok(val) = env::var("CHARSERVER_CHAR_PORT") {
            if let Ok(port) = val.parse() {
                self.char_port = port;
            }
        }
        if let Ok(val) = env::var("CHARSERVER_CHAR_IP") {
            self.char_ip = val;
        }
        if let Ok(val) = env::var("CHARSERVER_LOGIN_HOST") {
            self.login_host = val;
        }
        if let Ok(val) = env::var("CHARSERVER_LOGIN_PORT") {
            if let Ok(port) = val.parse() {
                self.login_port = port;
            }
        }
        if let Ok(val) = env::var("CHARSERVER_USERID") {
            self.server_userid = val;
        }
        if let Ok(val) = env::var("CHARSERVER_PASSWD") {
            self.server_passwd = val;
        }
        if let Ok(val) = env::var("CHARSERVER_KICK_TIMEOUT") {
            if let Ok(secs) = val.parse() {
                self.kick_timeout_secs = secs;
            }
        }
        if let Ok(val) = env::var("CHARSERVER_CASTLE_FILE") {
            self.storage.castle_file = PathBuf::from(val);
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.server_userid.len() > 23 || self.server_passwd.len() > 23 {
            anyhow::bail!("Inter-server user id and password must be at most 23 bytes");
        }

        if self.server_name.len() > 19 {
            anyhow::bail!("Server name must be at most 19 bytes");
        }

        if self.max_map_servers == 0 || self.max_map_servers > 255 {
            anyhow::bail!("Max map servers must be between 1 and 255");
        }

        // Every fixed frame in the catalogue must fit
        if self.max_frame_size < 128 || self.max_frame_size > u16::MAX as usize {
            anyhow::bail!("Max frame size must be between 128 and 65535 bytes");
        }

        if self.tick_rate_ms < 10 || self.tick_rate_ms > 5000 {
            anyhow::bail!("Tick rate must be between 10ms and 5000ms");
        }

        if self.kick_timeout_secs == 0 {
            anyhow::bail!("Kick timeout must be at least one second");
        }

        if self.storage.castle_count == 0
            || self.storage.castle_count as usize > MAX_CASTLES_PER_FRAME
        {
            anyhow::bail!(
                "Castle count must be between 1 and {}",
                MAX_CASTLES_PER_FRAME
            );
        }

        Ok(())
    }

    /// Forced-disconnect guard delay
    pub fn kick_timeout(&self) -> Duration {
        Duration::from_secs(self.kick_timeout_secs)
    }

    /// Login server address as `host:port`
    pub fn login_address(&self) -> String {
        format!("{}:{}", self.login_host, self.login_port)
    }

    /// Char port listen address as `host:port`
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.char_port)
    }
}
