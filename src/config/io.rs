use std::env::current_exe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use directories_next::ProjectDirs;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use serde_json;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{debug, info, warn};
use std::fs::OpenOptions;
use std::str;

use crate::config::types::Config;
use crate::error::ConfigError;

// creates a path to <exe name>.json in the same directory as the executable
// this could be useful for usb sticks
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            // F:\wireless-flat-panel.exe => F:\wireless-flat-panel.json
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// creates a path to wireless-flat-panel.json in an os dependent standard directory, such as %AppData% on
// windows.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "darkskygeek", "wireless-flat-panel").map(|dirs| {
        dirs.config_dir().join("wireless-flat-panel.json")
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    let portable = get_portable_config_path();
    if let Some(path) = portable {
        match std::fs::metadata(&path) {
            Ok(attr) => {
                if attr.is_file() {
                    return Ok(path);
                }
            }
            Err(err) => {
                debug!("Could not read metadata of: {}; Using local path instead. ({:?})", path.to_string_lossy(), err);
            },
        }
    }

    match get_local_config_path() {
        None => Err(ConfigError::NoConfigPath),
        Some(path) => Ok(path),
    }
}

pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    /// Holds an exclusive lock on the config file for as long as the guard lives, so that only one
    /// instance talks to the panel at a time.
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<std::fs::File>, ConfigError> {
        self.rw_lock.try_write().map_err(|source| ConfigError::CanNotLock { source })
    }
}

struct ConfigIOInner {
    path: PathBuf,
    file: std::fs::File,
}

#[derive(Clone)]
pub struct ConfigIO {
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    /// Opens the config file at its default location.
    pub fn new_sync() -> Result<Self, ConfigError> {
        let path = get_config_path()?;
        ConfigIO::open(&path)
    }

    /// Opens (creating it if needed) the config file at `path`.
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(path)?;

        let inner = ConfigIOInner {
            path: path.to_path_buf(),
            file,
        };
        Ok(ConfigIO { inner: Arc::new(Mutex::new(inner)) })
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).path.clone()
    }

    pub fn locker(&self) -> Result<ConfigIOLocker, ConfigError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(inner.file.try_clone()?),
        })
    }

    // The File returned from here should never be closed!
    fn get_file(&self) -> Result<File, ConfigError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let file = inner.file.try_clone()?; // std File
        Ok(File::from_std(file)) // tokio File
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        let mut file = self.get_file()?;
        debug!("Reading config file");

        let mut content = vec![];
        file.rewind().await?;
        file.read_to_end(&mut content).await?;

        if content.is_empty() {
            return Ok(Config::default());
        }

        let content = str::from_utf8(&content)?;
        Ok(serde_json::from_str(content)?)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;
        debug!("Saving config");

        let content = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
