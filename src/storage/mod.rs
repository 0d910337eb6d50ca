//! Per-user persistent file area
//!
//! Every user gets one durable directory (a "volume") shared by all of their
//! conversations. It holds uploaded attachments, the most recently generated
//! script and session state documents. Volumes are created lazily on first
//! use and never torn down.

pub mod local;

use std::sync::Arc;

use async_trait::async_trait;

pub use local::{LocalVolume, LocalVolumes};

/// Error type for persistent area operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A user-scoped file area
#[async_trait]
pub trait PersistentArea: Send + Sync {
    /// Volume name, as understood by the sandbox when mounting it
    fn name(&self) -> &str;

    /// Create or overwrite `name`
    async fn put(&self, name: &str, data: Vec<u8>) -> Result<(), StorageError>;

    /// Read `name`, `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Names of top-level files matching a `*`/`?` wildcard pattern, sorted
    async fn list(&self, pattern: &str) -> Result<Vec<String>, StorageError>;

    /// Remove `name`; removing a missing file is not an error
    async fn delete(&self, name: &str) -> Result<(), StorageError>;
}

/// Hands out the persistent area for a user
#[async_trait]
pub trait VolumeProvider: Send + Sync {
    async fn open(&self, user_id: &str) -> Result<Arc<dyn PersistentArea>, StorageError>;
}

/// Volume name for a user identifier
pub fn volume_name(user_id: &str) -> String {
    format!("vol-{}", sanitize_file_stem(user_id))
}

/// Map an identifier onto a safe file stem
///
/// `[A-Za-z0-9-]` is kept; every other byte, `_` included, becomes `_xx`
/// (lowercase hex). Distinct identifiers therefore never share a stem.
pub fn sanitize_file_stem(id: &str) -> String {
    if id.is_empty() {
        return "_".to_string();
    }
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("_{:02x}", byte));
        }
    }
    stem
}

/// Reject names that would escape the volume or address a subdirectory
pub(crate) fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}
