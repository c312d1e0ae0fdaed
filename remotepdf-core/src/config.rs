use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

/// Size assumed for downloads whose length the server does not advertise.
pub const DEFAULT_ASSUMED_DOWNLOAD_SIZE: u64 = 10_000_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ViewerConfig {
    /// Overrides the platform cache directory.
    pub cache_dir: Option<PathBuf>,
    pub assumed_download_size: u64,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    pub user_agent: String,
    pub probe_before_fetch: bool,
    pub render_cache_capacity: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            assumed_download_size: DEFAULT_ASSUMED_DOWNLOAD_SIZE,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(600),
            user_agent: concat!("remotepdf/", env!("CARGO_PKG_VERSION")).to_string(),
            probe_before_fetch: true,
            render_cache_capacity: 10,
        }
    }
}

impl ViewerConfig {
    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
