//! services/api/src/adapters/local_storage.rs
//!
//! File-backed key-value storage for state that must survive a restart, such
//! as the offline queue. Each key is one JSON file in the storage directory.

use async_trait::async_trait;
use session_reliability_core::ports::{LocalStorage, PortError, PortResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Creates the storage directory if it does not exist yet.
    pub async fn open(dir: impl AsRef<Path>) -> PortResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| PortError::Unavailable(format!("cannot create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PortResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(PortError::Invalid(format!("'{key}' is not a valid storage key")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl LocalStorage for FileStorage {
    async fn read(&self, key: &str) -> PortResult<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PortError::Unavailable(format!("cannot read {}: {e}", path.display()))),
        }
    }

    /// Writes through a temporary file and a rename, so readers never see a torn value.
    async fn write(&self, key: &str, value: &str) -> PortResult<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)
            .await
            .map_err(|e| PortError::Unavailable(format!("cannot write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| PortError::Unavailable(format!("cannot replace {}: {e}", path.display())))?;
        Ok(())
    }
}
