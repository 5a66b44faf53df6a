//! Configuration Storage
//!
//! Reads and writes the descriptor file.
//! Location: ~/.oxidefs on macOS/Linux, %APPDATA%\OxideFS on Windows

use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use super::resolver::StaticResolver;
use super::types::{ConfigFile, CONFIG_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideFS"));
        }
        dirs::home_dir()
            .map(|home| home.join(".oxidefs"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".oxidefs"))
            .ok_or(StorageError::NoConfigDir)
    }
}

pub fn connections_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("connections.json"))
}

pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: connections_file()?,
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load configuration from disk.
    ///
    /// A missing file yields defaults. A corrupted file is backed up and
    /// replaced by defaults.
    pub async fn load(&self) -> Result<ConfigFile, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        match serde_json::from_str::<ConfigFile>(&contents) {
            Ok(mut config) => {
                if config.version > CONFIG_VERSION {
                    return Err(StorageError::VersionTooNew {
                        found: config.version,
                        supported: CONFIG_VERSION,
                    });
                }
                let origin = self.path.display().to_string();
                for target in &mut config.targets {
                    target.provenance.get_or_insert_with(|| origin.clone());
                }
                info!("Loaded {} target(s) from {:?}", config.targets.len(), self.path);
                Ok(config)
            }
            Err(e) => {
                warn!("Config file corrupted: {}", e);
                match self.backup().await {
                    Ok(backup_path) => {
                        warn!("Corrupted config backed up to {:?}, using defaults", backup_path)
                    }
                    Err(backup_err) => error!("Failed to backup corrupted config: {}", backup_err),
                }
                Ok(ConfigFile::default())
            }
        }
    }

    /// Load and wrap the targets in a resolver for the registry
    pub async fn load_resolver(&self) -> Result<(ConfigFile, StaticResolver), StorageError> {
        let config = self.load().await?;
        let resolver = StaticResolver::new(config.targets.clone());
        Ok((config, resolver))
    }

    /// Save configuration to disk (temp file + rename)
    pub async fn save(&self, config: &ConfigFile) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if fs::metadata(&self.path).await.is_ok() {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}
