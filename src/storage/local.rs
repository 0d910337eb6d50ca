//! Filesystem-backed volumes
//!
//! Volumes live under a single root directory, one subdirectory per user
//! (`<root>/vol-<user>`). The same root is what the sandbox mounts, so files
//! written here are visible to executed code in its working directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use wildmatch::WildMatch;

use super::{validate_name, volume_name, PersistentArea, StorageError, VolumeProvider};

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Root directory holding all user volumes
#[derive(Debug, Clone)]
pub struct LocalVolumes {
    root: PathBuf,
}

impl LocalVolumes {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory backing the volume called `volume`
    pub fn volume_dir(&self, volume: &str) -> PathBuf {
        self.root.join(volume)
    }
}

#[async_trait]
impl VolumeProvider for LocalVolumes {
    async fn open(&self, user_id: &str) -> Result<Arc<dyn PersistentArea>, StorageError> {
        let name = volume_name(user_id);
        let dir = self.volume_dir(&name);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            debug!(volume = %name, "Creating volume");
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        Ok(Arc::new(LocalVolume { name, dir }))
    }
}

/// One user's volume
#[derive(Debug, Clone)]
pub struct LocalVolume {
    name: String,
    dir: PathBuf,
}

impl LocalVolume {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl PersistentArea for LocalVolume {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, name: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path(name)?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| io_error(&path, e))
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path(name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn list(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let matcher = WildMatch::new(pattern);
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.dir, e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if matcher.matches(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}
