use crate::delivery::constants::DEFAULT_MAX_UPLOAD_BYTES;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "parcel";
const APP_NAME: &str = "parcel_relay";
const CONFIG_FILE: &str = "config.json";
const DEFAULT_PORT: u16 = 5000;

/// How a receiver acknowledges a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Downloading the payload clears the slot
    #[default]
    FetchClears,
    /// Downloading leaves the slot pending until the receiver calls `complete`
    ExplicitComplete,
}

/// What happens to a payload once its slot no longer needs it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Delete on overwrite, fetch-clear and completion
    #[default]
    DeleteOnRelease,
    /// Never delete payloads
    Keep,
}

impl FromStr for AckMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fetch_clears" | "fetch" => Ok(AckMode::FetchClears),
            "explicit_complete" | "complete" => Ok(AckMode::ExplicitComplete),
            other => Err(anyhow::anyhow!("Unknown ack mode: {}", other)),
        }
    }
}

impl FromStr for RetentionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "delete_on_release" | "delete" => Ok(RetentionPolicy::DeleteOnRelease),
            "keep" => Ok(RetentionPolicy::Keep),
            other => Err(anyhow::anyhow!("Unknown retention policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Holds the registry document and the payload directory
    pub data_dir: PathBuf,
    pub ack_mode: AckMode,
    pub retention: RetentionPolicy,
    /// Mirror the registry to `registry.json` so it survives restarts
    pub persist_registry: bool,
    pub max_upload_bytes: u64,
    pub request_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let data_dir = ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./parcel_data"));

        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            data_dir,
            ack_mode: AckMode::default(),
            retention: RetentionPolicy::default(),
            persist_registry: true,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            request_timeout_secs: 300,
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("Invalid boolean: {}", other)),
    }
}

impl RelayConfig {
    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("PARCEL_CONFIG") {
            return Some(PathBuf::from(path));
        }

        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load defaults, then `config.json` if present, then environment overrides.
    ///
    /// A `.env` file in the working directory is read first.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {:?}", path))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Invalid config file {:?}", path))?
            }
            _ => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `PARCEL_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("PORT") {
            let port: u16 = port.trim().parse().context("Invalid PORT")?;
            self.bind_addr.set_port(port);
        }
        if let Some(addr) = lookup("PARCEL_BIND") {
            self.bind_addr = addr.trim().parse().context("Invalid PARCEL_BIND")?;
        }
        if let Some(dir) = lookup("PARCEL_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(mode) = lookup("PARCEL_ACK_MODE") {
            self.ack_mode = mode.parse()?;
        }
        if let Some(policy) = lookup("PARCEL_RETENTION") {
            self.retention = policy.parse()?;
        }
        if let Some(persist) = lookup("PARCEL_PERSIST") {
            self.persist_registry = parse_bool(&persist).context("Invalid PARCEL_PERSIST")?;
        }
        if let Some(max) = lookup("PARCEL_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = max
                .trim()
                .parse()
                .context("Invalid PARCEL_MAX_UPLOAD_BYTES")?;
        }
        if let Some(secs) = lookup("PARCEL_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = secs
                .trim()
                .parse()
                .context("Invalid PARCEL_REQUEST_TIMEOUT_SECS")?;
        }
        Ok(())
    }
}
