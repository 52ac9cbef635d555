use piedpiper_files::{BlobError, BlobHandle, BlobStore};
use piedpiper_storage::{
    Collection, KvStore, KvStoreExt, ReadTxnExt, StoreError, StoreResult, WriteTxn, WriteTxnExt,
};
use piedpiper_types::{ErrorKind, Object, ObjectId, UploadId, UploadSession};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum UploadError {
    /// Unknown and already consumed sessions look the same.
    #[error("upload session {0} not found")]
    SessionNotFound(UploadId),
    #[error("object {0} has not been uploaded yet")]
    NotYetUploaded(ObjectId),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::SessionNotFound(_) => ErrorKind::NotFound,
            UploadError::NotYetUploaded(_) => ErrorKind::Precondition,
            // Blob references are generated server-side.
            UploadError::Blob(_) | UploadError::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Inserts the session for a freshly created object inside the caller's transaction.
pub(crate) fn insert_session(tx: &mut dyn WriteTxn, object: &Object) -> StoreResult<UploadSession> {
    let session = UploadSession {
        id: UploadId(tx.next_sequence(Collection::Uploads)?),
        object: object.clone(),
    };
    tx.put_json(Collection::Uploads, &session.id.to_key(), &session)?;
    Ok(session)
}

/// Consumes upload sessions and hands their bytes to the blob store.
pub struct UploadSessionManager {
    store: Arc<dyn KvStore>,
    blobs: Arc<dyn BlobStore>,
}

impl UploadSessionManager {
    pub fn new(store: Arc<dyn KvStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }

    pub fn get_session(&self, id: UploadId) -> Result<Option<UploadSession>, UploadError> {
        if id.0 == 0 {
            return Ok(None);
        }
        Ok(self
            .store
            .with_read(|tx| tx.get_json(Collection::Uploads, &id.to_key()))?)
    }

    /// Stores `bytes` as the content of the session's object and consumes the session.
    ///
    /// The session is deleted only after the blob write is durable. If the blob is
    /// already present the session is stale: it is removed and the call fails as if the
    /// session did not exist.
    pub fn upload(&self, id: UploadId, bytes: &[u8]) -> Result<Object, UploadError> {
        let session = self
            .get_session(id)?
            .ok_or(UploadError::SessionNotFound(id))?;
        let object = session.object;

        match self.blobs.put(&object.local_reference, bytes) {
            Ok(()) => {}
            Err(BlobError::AlreadyExists(_)) => {
                warn!("Upload {} targets an already stored blob; dropping session", id);
                self.delete_session(id)?;
                return Err(UploadError::SessionNotFound(id));
            }
            Err(err) => return Err(err.into()),
        }

        self.delete_session(id)?;
        info!(
            "Object {} ({}) of {} uploaded: {} bytes",
            object.id,
            object.name,
            object.owner,
            bytes.len()
        );
        Ok(object)
    }

    /// Where to read the object's bytes from, once they have been uploaded.
    pub fn fetch_blob_handle(&self, object: &Object) -> Result<BlobHandle, UploadError> {
        self.blobs
            .fetch(&object.local_reference)?
            .ok_or(UploadError::NotYetUploaded(object.id))
    }

    fn delete_session(&self, id: UploadId) -> Result<(), UploadError> {
        self.store
            .with_write(|tx| tx.delete(Collection::Uploads, &id.to_key()))?;
        Ok(())
    }
}
