use crate::{validate_reference, BlobError, BlobHandle, BlobResult, BlobStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory blob store (for testing).
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<RwLock<HashMap<String, Arc<[u8]>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, reference: &str, bytes: &[u8]) -> BlobResult<()> {
        validate_reference(reference)?;
        let mut blobs = self.inner.write();
        if blobs.contains_key(reference) {
            return Err(BlobError::AlreadyExists(reference.to_string()));
        }
        blobs.insert(reference.to_string(), Arc::from(bytes));
        Ok(())
    }

    fn fetch(&self, reference: &str) -> BlobResult<Option<BlobHandle>> {
        validate_reference(reference)?;
        Ok(self
            .inner
            .read()
            .get(reference)
            .map(|bytes| BlobHandle::Bytes(Arc::clone(bytes))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_contents() {
        let store = MemoryBlobStore::new();
        let other = store.clone();
        let reference = "Z".repeat(crate::LOCAL_REFERENCE_LEN);

        store.put(&reference, b"abc").unwrap();
        assert_eq!(other.len(), 1);
        assert!(matches!(
            other.put(&reference, b"abc"),
            Err(BlobError::AlreadyExists(_))
        ));
        let handle = other.fetch(&reference).unwrap().unwrap();
        assert_eq!(handle.read_all().unwrap(), b"abc");
    }
}
