//! JSON-file record store: one `<domain>.json` file per key.

use crate::store::RecordStore;
use crate::types::{Result, ScriptsiftError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Directory-backed store. Writes go through a temp file and a rename, so a
/// reader sees either the old or the new value for a key.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store under `~/.scriptsift/records`.
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            ScriptsiftError::ConfigError("Could not determine home directory".to_string())
        })?;
        Ok(Self::new(home.join(".scriptsift").join("records")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, domain: &str) -> Result<PathBuf> {
        let valid = !domain.is_empty()
            && !domain.starts_with('.')
            && domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '[' | ']'));
        if !valid {
            return Err(ScriptsiftError::Storage(format!("invalid record key {:?}", domain)));
        }
        Ok(self.root.join(format!("{}.json", domain.replace(':', "_"))))
    }
}

impl RecordStore for FileStore {
    async fn get(&self, domain: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(domain)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&raw).map(Some).map_err(|e| ScriptsiftError::CorruptRecord {
            domain: domain.to_string(),
            reason: e.to_string(),
        })
    }

    async fn set(&self, domain: &str, value: serde_json::Value) -> Result<()> {
        let path = self.path_for(domain)?;
        tokio::fs::create_dir_all(&self.root).await?;

        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&value)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        trace!("Wrote {:?}", path);
        Ok(())
    }

    async fn remove(&self, domain: &str) -> Result<()> {
        let path = self.path_for(domain)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed record file {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
