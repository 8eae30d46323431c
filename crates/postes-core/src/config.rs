use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    NoHomeDir,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Configuration for the postes client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub photo: PhotoConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the remote API, without trailing slash
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Transport timeout for every HTTP request
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Interval between periodic passes run by the daemon
    #[serde(default = "default_sync_interval")]
    pub interval_seconds: u64,

    /// Upper bound for one submission; a timeout counts as a transient failure
    #[serde(default = "default_timeout_secs")]
    pub submit_timeout_secs: u64,

    /// First delay applied after a pass with transient failures
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Cap for the exponential backoff
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Run a pass as soon as the daemon starts
    #[serde(default = "default_true")]
    pub sync_on_start: bool,

    /// Keep delivered records as SYNCED rows instead of deleting them
    #[serde(default)]
    pub retain_synced: bool,

    /// Move a record to the dead-letter status after this many rejections.
    /// Unset keeps rejected records pending forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_after: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local SQLite database (defaults to ~/.local/share/postes/postes.db)
    pub database_path: Option<PathBuf>,
    /// Directory for resized photos (defaults to ~/.local/share/postes/photos)
    pub photo_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoConfig {
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_base_url() -> String {
    "https://postes.g2telecom.com.br/api".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_sync_interval() -> u64 {
    60
}

fn default_backoff_base() -> u64 {
    2
}

fn default_backoff_max() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_probe_interval() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_max_width() -> u32 {
    800
}

fn default_jpeg_quality() -> u8 {
    50
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_sync_interval(),
            submit_timeout_secs: default_timeout_secs(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            sync_on_start: true,
            retain_synced: false,
            dead_letter_after: None,
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl Default for PhotoConfig {
    fn default() -> Self {
        Self {
            max_width: default_max_width(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl SyncSettings {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs.max(1))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn data_dir() -> Result<PathBuf, ConfigError> {
    let home_dir = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home_dir.join(".local").join("share").join("postes"))
}

fn write_toml<T: Serialize>(path: &Path, value: &T, header: &str) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let body = toml::to_string_pretty(value)?;
    fs::write(path, format!("{header}{body}")).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

const CONFIG_HEADER: &str = "# postes client configuration\n\n";

impl Config {
    /// Default config location, honouring `POSTES_CONFIG`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Ok(custom_path) = std::env::var("POSTES_CONFIG") {
            return Ok(PathBuf::from(custom_path));
        }
        let home_dir = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home_dir.join(".config").join("postes").join("config.toml"))
    }

    /// Load configuration from the default location, writing defaults if absent
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_or_create(&Self::default_path()?)
    }

    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }
        Self::load_from(path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        read_toml(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        write_toml(path, self, CONFIG_HEADER)
    }

    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("postes.db")),
        }
    }

    pub fn photo_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.photo_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("photos")),
        }
    }
}

/// Machine-specific session state, kept out of the config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub auth: AuthState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthState {
    pub username: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl State {
    /// State file location, honouring `POSTES_STATE`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Ok(custom_path) = std::env::var("POSTES_STATE") {
            return Ok(PathBuf::from(custom_path));
        }
        Ok(data_dir()?.join("session.toml"))
    }

    /// Missing state file means "not logged in"
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        read_toml(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        write_toml(path, self, "")
    }

    pub fn store_tokens(&mut self, username: Option<String>, access: String, refresh: String) {
        if username.is_some() {
            self.auth.username = username;
        }
        self.auth.access_token = Some(access);
        self.auth.refresh_token = Some(refresh);
        self.auth.updated_at = Some(Utc::now());
    }

    pub fn store_access_token(&mut self, access: String) {
        self.auth.access_token = Some(access);
        self.auth.updated_at = Some(Utc::now());
    }

    pub fn clear_tokens(&mut self) {
        self.auth = AuthState::default();
    }

    pub fn is_logged_in(&self) -> bool {
        self.auth
            .access_token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }
}
