use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read credentials file {path}: {source}")]
    ReadCredentials { path: PathBuf, source: std::io::Error },
    #[error("Failed to parse credentials file {path}: {source}")]
    ParseCredentials { path: PathBuf, source: serde_json::Error },
}

/// Command line surface of the server.
#[derive(Parser, Debug, Clone)]
#[command(name = "cc_server", about = "Channel server for collaborative chat and code editing")]
pub struct Config {
    /// Keep documents in the external persistent store instead of memory.
    #[arg(short = 'u', long = "usemongo")]
    pub use_persistent_store: bool,

    /// JSON file holding the persistent store's connection details.
    #[arg(short = 'm', long = "mongocreds", default_value = "db_creds.json")]
    pub credentials: PathBuf,

    #[arg(short = 'w', long = "wsport", default_value_t = 8000)]
    pub port: u16,

    /// Directory the web client is served from.
    #[arg(long, default_value = "cc_web")]
    pub static_dir: PathBuf,

    /// How long an empty channel lingers before it is destroyed.
    #[arg(long, default_value_t = 5 * 60 * 60)]
    pub idle_timeout_secs: u64,
}

impl Config {
    pub fn idle_delay(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct StoreCredentials {
    pub url: String,
}

impl StoreCredentials {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadCredentials {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::ParseCredentials {
            path: path.to_path_buf(),
            source,
        })
    }
}
