use crate::{validate_reference, BlobError, BlobHandle, BlobResult, BlobStore};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Blob store rooted at a directory; each blob is one file named by its reference.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Creates the root directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> BlobResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, reference: &str) -> BlobResult<PathBuf> {
        validate_reference(reference)?;
        Ok(self.root.join(reference))
    }

    #[cfg(unix)]
    fn sync_root(&self) -> io::Result<()> {
        File::open(&self.root)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_root(&self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobStore for LocalBlobStore {
    fn put(&self, reference: &str, bytes: &[u8]) -> BlobResult<()> {
        let path = self.path_for(reference)?;
        if path.exists() {
            return Err(BlobError::AlreadyExists(reference.to_string()));
        }

        // Temp files are created owner-only (0600) and carry a dot prefix, so they can
        // never be mistaken for a reference.
        let mut temp = tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(&self.root)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;

        temp.persist_noclobber(&path).map_err(|err| {
            if err.error.kind() == io::ErrorKind::AlreadyExists {
                BlobError::AlreadyExists(reference.to_string())
            } else {
                BlobError::Io(err.error)
            }
        })?;
        self.sync_root()?;

        debug!("Stored blob {} ({} bytes)", reference, bytes.len());
        Ok(())
    }

    fn fetch(&self, reference: &str) -> BlobResult<Option<BlobHandle>> {
        let path = self.path_for(reference)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(BlobHandle::File {
                path,
                len: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
