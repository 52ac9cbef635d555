//! Blob storage for uploaded object bytes.
//!
//! Blobs are addressed by the object's local reference (36 random alphanumerics, never
//! the user-supplied filename) and are write-once: a reference that already holds bytes
//! cannot be written again.

use piedpiper_types::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub mod local;
pub mod memory;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;

/// Length of every local reference handed out by the catalog.
pub const LOCAL_REFERENCE_LEN: usize = 36;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid blob reference {0:?}")]
    InvalidReference(String),
    #[error("blob {0} already exists")]
    AlreadyExists(String),
    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlobError::InvalidReference(_) => ErrorKind::Invalid,
            BlobError::AlreadyExists(_) => ErrorKind::Conflict,
            BlobError::Io(_) => ErrorKind::Internal,
        }
    }
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Where the bytes of an uploaded blob can be read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobHandle {
    /// File on local disk, suitable for streaming.
    File { path: PathBuf, len: u64 },
    Bytes(Arc<[u8]>),
}

impl BlobHandle {
    pub fn len(&self) -> u64 {
        match self {
            BlobHandle::File { len, .. } => *len,
            BlobHandle::Bytes(bytes) => bytes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads the whole blob into memory.
    pub fn read_all(&self) -> BlobResult<Vec<u8>> {
        match self {
            BlobHandle::File { path, .. } => Ok(std::fs::read(path)?),
            BlobHandle::Bytes(bytes) => Ok(bytes.to_vec()),
        }
    }
}

/// Blob store capability used by the upload and fetch paths.
pub trait BlobStore: Send + Sync {
    /// Durably stores `bytes` under `reference`. Fails with `AlreadyExists` if the
    /// reference already holds a blob.
    fn put(&self, reference: &str, bytes: &[u8]) -> BlobResult<()>;

    /// `None` when nothing has been uploaded under `reference` yet.
    fn fetch(&self, reference: &str) -> BlobResult<Option<BlobHandle>>;

    fn exists(&self, reference: &str) -> BlobResult<bool> {
        Ok(self.fetch(reference)?.is_some())
    }
}

/// Rejects anything that is not exactly 36 ASCII alphanumerics, which also rules out
/// path separators and dot segments.
pub fn validate_reference(reference: &str) -> BlobResult<()> {
    if reference.len() == LOCAL_REFERENCE_LEN
        && reference.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        Ok(())
    } else {
        Err(BlobError::InvalidReference(reference.to_string()))
    }
}
