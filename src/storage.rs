use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not create the storage directory at {1:?}")]
    CreateDir(#[source] std::io::Error, PathBuf),
    #[error("could not read {1:?}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("could not write {1:?}")]
    Write(#[source] std::io::Error, PathBuf),
    #[error("could not parse {1:?}")]
    Parse(#[source] serde_json::Error, PathBuf),
    #[error("could not serialize `{1}`")]
    Serialize(#[source] serde_json::Error, String),
    #[error("`{key}` is stored with version {found}, newer than the supported {supported}")]
    UnsupportedVersion { key: String, found: u32, supported: u32 },
}

/// The envelope every stored document is wrapped in.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StorageFile<T> {
    pub version: u32,
    pub minor_version: u32,
    pub key: String,
    pub data: T,
}

impl<T> StorageFile<T> {
    pub fn new(key: impl Into<String>, data: T, version: u32, minor_version: u32) -> Self {
        Self { version, minor_version, key: key.into(), data }
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "storage::Args")]
pub struct Args {
    /// Directory holding the `.storage/` directory with the entity registry and the
    /// configured devices.
    #[arg(short = 's', long, env = "NEOPOOL_BRIDGE_STORAGE", default_value = ".")]
    storage: PathBuf,
}

impl Args {
    pub fn to_storage(&self) -> Storage {
        Storage::new(&self.storage)
    }
}

#[derive(Debug, Clone)]
pub struct Storage {
    storage_dir: PathBuf,
}

impl Storage {
    /// Storage kept in `{config_dir}/.storage`.
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self { storage_dir: config_dir.as_ref().join(".storage") }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    /// `None` if nothing has been stored under `key` yet.
    ///
    /// Documents of a newer major version than `supported` are refused.
    pub async fn load<T: DeserializeOwned>(
        &self,
        key: &str,
        supported: u32,
    ) -> Result<Option<StorageFile<T>>, Error> {
        let path = self.file_path(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key, "nothing stored yet");
                return Ok(None);
            }
            Err(e) => return Err(Error::Read(e, path)),
        };
        let file: StorageFile<T> =
            serde_json::from_str(&content).map_err(|e| Error::Parse(e, path))?;
        if file.version > supported {
            return Err(Error::UnsupportedVersion {
                key: key.to_string(),
                found: file.version,
                supported,
            });
        }
        debug!(key, version = file.version, minor_version = file.minor_version, "loaded");
        Ok(Some(file))
    }

    /// Write through a temporary file, so that a crash never leaves a truncated document.
    pub async fn save<T: Serialize>(&self, file: &StorageFile<T>) -> Result<(), Error> {
        fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(|e| Error::CreateDir(e, self.storage_dir.clone()))?;
        let path = self.file_path(&file.key);
        let temp_path = self.file_path(&format!("{}.tmp", file.key));
        let content =
            serde_json::to_string_pretty(file).map_err(|e| Error::Serialize(e, file.key.clone()))?;
        fs::write(&temp_path, content).await.map_err(|e| Error::Write(e, temp_path.clone()))?;
        fs::rename(&temp_path, &path).await.map_err(|e| Error::Write(e, path))?;
        debug!(key = %file.key, version = file.version, "saved");
        Ok(())
    }
}
