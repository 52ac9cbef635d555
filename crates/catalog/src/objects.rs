use crate::uploads::{insert_session, UploadError, UploadSessionManager};
use piedpiper_auth::{TokenError, TokenService, UserDirectory, UserError};
use piedpiper_files::{BlobHandle, LOCAL_REFERENCE_LEN};
use piedpiper_storage::{Collection, KvStore, KvStoreExt, ReadTxnExt, StoreError, WriteTxnExt};
use piedpiper_types::{random_alphanumeric, ErrorKind, Object, ObjectId, UploadId, User};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("user {0:?} not found")]
    UserNotFound(String),
    #[error("no object named {filename:?} owned by {owner:?}")]
    ObjectNotFound { owner: String, filename: String },
    #[error("invalid object request: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    User(UserError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CatalogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatalogError::Token(err) => err.kind(),
            CatalogError::UserNotFound(_) | CatalogError::ObjectNotFound { .. } => {
                ErrorKind::NotFound
            }
            CatalogError::Invalid(_) => ErrorKind::Invalid,
            CatalogError::Upload(err) => err.kind(),
            CatalogError::User(err) => err.kind(),
            CatalogError::Store(_) => ErrorKind::Internal,
        }
    }
}

impl From<UserError> for CatalogError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::NotFound(username) => CatalogError::UserNotFound(username),
            other => CatalogError::User(other),
        }
    }
}

/// Outcome of [`ObjectCatalog::reconcile_owner_index`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub objects_scanned: usize,
    pub users_updated: usize,
    /// Objects whose owner has no user record.
    pub orphaned_objects: usize,
}

/// Object metadata keyed by id, plus the per-user owner index.
pub struct ObjectCatalog {
    store: Arc<dyn KvStore>,
    users: Arc<UserDirectory>,
    tokens: Arc<TokenService>,
    uploads: Arc<UploadSessionManager>,
}

impl ObjectCatalog {
    pub fn new(
        store: Arc<dyn KvStore>,
        users: Arc<UserDirectory>,
        tokens: Arc<TokenService>,
        uploads: Arc<UploadSessionManager>,
    ) -> Self {
        Self {
            store,
            users,
            tokens,
            uploads,
        }
    }

    /// Creates object metadata for the token's user and returns the id of the upload
    /// session that will receive its bytes.
    ///
    /// The object and its session are written in one transaction and the owner index in
    /// a second one. A failure between the two leaves an unindexed object, which
    /// [`Self::reconcile_owner_index`] repairs.
    pub fn create_object(&self, token_hex: &str, filename: &str) -> Result<UploadId, CatalogError> {
        if filename.is_empty() {
            return Err(CatalogError::Invalid("filename must not be empty"));
        }

        let token = self.tokens.validate_token(token_hex)?;
        let owner = token.user.username;
        if self.users.get_user(&owner)?.is_none() {
            return Err(CatalogError::UserNotFound(owner));
        }

        let local_reference = random_alphanumeric(LOCAL_REFERENCE_LEN);
        let (object, upload_id) = self.store.with_write(|tx| -> Result<_, StoreError> {
            let object = Object {
                id: ObjectId(tx.next_sequence(Collection::Objects)?),
                name: filename.to_string(),
                owner: owner.clone(),
                local_reference: local_reference.clone(),
            };
            tx.put_json(Collection::Objects, &object.id.to_key(), &object)?;
            let session = insert_session(tx, &object)?;
            Ok((object, session.id))
        })?;

        if let Err(err) = self.users.append_object_id(&owner, object.id) {
            error!(
                "Object {} stored but owner index of {} not updated: {}",
                object.id, owner, err
            );
            return Err(err.into());
        }

        info!(
            "Object {} ({}) created by {} with upload id {}",
            object.id, object.name, owner, upload_id
        );
        Ok(upload_id)
    }

    /// First object in `owner`'s index whose name equals `filename`. With duplicate
    /// names the oldest object wins.
    pub fn resolve_object(&self, owner: &str, filename: &str) -> Result<Object, CatalogError> {
        let user = self
            .users
            .get_user(owner)?
            .ok_or_else(|| CatalogError::UserNotFound(owner.to_string()))?;

        let found = self.store.with_read(|tx| -> Result<_, StoreError> {
            for id in &user.object_ids {
                let object: Option<Object> = tx.get_json(Collection::Objects, &id.to_key())?;
                match object {
                    Some(object) if object.name == filename => return Ok(Some(object)),
                    Some(_) => {}
                    None => debug!("Owner index of {} references missing object {}", owner, id),
                }
            }
            Ok(None)
        })?;

        found.ok_or_else(|| CatalogError::ObjectNotFound {
            owner: owner.to_string(),
            filename: filename.to_string(),
        })
    }

    /// Full fetch path: validate the token, resolve the filename among the token user's
    /// objects and locate the uploaded bytes.
    pub fn open_object(
        &self,
        token_hex: &str,
        filename: &str,
    ) -> Result<(Object, BlobHandle), CatalogError> {
        let token = self.tokens.validate_token(token_hex)?;
        let object = self.resolve_object(&token.user.username, filename)?;
        let handle = self.uploads.fetch_blob_handle(&object)?;
        Ok((object, handle))
    }

    /// Objects owned by the token's user, in index order.
    pub fn list_objects(&self, token_hex: &str) -> Result<Vec<Object>, CatalogError> {
        let token = self.tokens.validate_token(token_hex)?;
        let owner = token.user.username;
        let user = self
            .users
            .get_user(&owner)?
            .ok_or(CatalogError::UserNotFound(owner))?;
        self.objects_of(&user)
    }

    fn objects_of(&self, user: &User) -> Result<Vec<Object>, CatalogError> {
        let objects = self.store.with_read(|tx| -> Result<_, StoreError> {
            let mut objects = Vec::with_capacity(user.object_ids.len());
            for id in &user.object_ids {
                if let Some(object) = tx.get_json::<Object>(Collection::Objects, &id.to_key())? {
                    objects.push(object);
                }
            }
            Ok(objects)
        })?;
        Ok(objects)
    }

    /// Rebuilds every owner index from a full scan of the objects collection.
    ///
    /// Ids are assigned in increasing order, so ascending id order is creation order.
    /// Run while no requests are being served.
    pub fn reconcile_owner_index(&self) -> Result<ReconcileReport, CatalogError> {
        let mut report = ReconcileReport::default();
        let mut owned: BTreeMap<String, Vec<ObjectId>> = BTreeMap::new();

        for (_, raw) in self.store.scan(Collection::Objects)? {
            let object: Object = serde_json::from_slice(&raw).map_err(StoreError::from)?;
            owned.entry(object.owner).or_default().push(object.id);
            report.objects_scanned += 1;
        }

        for user in self.users.list_users()? {
            let expected = owned.remove(&user.username).unwrap_or_default();
            if user.object_ids != expected {
                warn!(
                    "Owner index of {} out of date ({} ids, expected {}); rewriting",
                    user.username,
                    user.object_ids.len(),
                    expected.len()
                );
                self.users.replace_object_ids(&user.username, expected)?;
                report.users_updated += 1;
            }
        }

        for (owner, ids) in owned {
            warn!("{} objects owned by unknown user {}", ids.len(), owner);
            report.orphaned_objects += ids.len();
        }

        info!(
            "Owner index reconciled: {} objects scanned, {} users updated, {} orphaned",
            report.objects_scanned, report.users_updated, report.orphaned_objects
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use piedpiper_auth::{derive_token_id, PasswordPolicy, TokenPolicy};
    use piedpiper_files::MemoryBlobStore;
    use piedpiper_storage::MemoryStore;
    use piedpiper_types::{Clock, ManualClock, Timestamp};

    struct Harness {
        store: Arc<dyn KvStore>,
        users: Arc<UserDirectory>,
        tokens: Arc<TokenService>,
        uploads: Arc<UploadSessionManager>,
        catalog: ObjectCatalog,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new() -> Self {
            let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
            let users = Arc::new(UserDirectory::new(
                Arc::clone(&store),
                PasswordPolicy::insecure_fast(),
            ));
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ));
            let tokens = Arc::new(TokenService::new(
                Arc::clone(&store),
                Arc::clone(&users),
                clock.clone(),
                TokenPolicy::default(),
            ));
            let uploads = Arc::new(UploadSessionManager::new(
                Arc::clone(&store),
                Arc::new(MemoryBlobStore::new()),
            ));
            let catalog = ObjectCatalog::new(
                Arc::clone(&store),
                Arc::clone(&users),
                Arc::clone(&tokens),
                Arc::clone(&uploads),
            );
            Self {
                store,
                users,
                tokens,
                uploads,
                catalog,
                clock,
            }
        }

        fn login(&self, username: &str) -> String {
            self.users.create_user(username, "pw").unwrap();
            let now = Timestamp::from_datetime(self.clock.now()).to_string();
            let response = self.tokens.authenticate(username, "pw", &now).unwrap();
            derive_token_id(username, &response.nonce, &response.expiration).to_hex()
        }
    }

    #[test]
    fn test_create_object_indexes_and_opens_session() {
        let h = Harness::new();
        let token = h.login("alice");

        let upload_id = h.catalog.create_object(&token, "notes.txt").unwrap();
        assert_eq!(upload_id, UploadId(1));

        let session = h.uploads.get_session(upload_id).unwrap().unwrap();
        assert_eq!(session.object.id, ObjectId(1));
        assert_eq!(session.object.owner, "alice");
        assert_eq!(session.object.local_reference.len(), LOCAL_REFERENCE_LEN);
        assert_ne!(session.object.local_reference, "notes.txt");

        let alice = h.users.get_user("alice").unwrap().unwrap();
        assert_eq!(alice.object_ids, vec![ObjectId(1)]);
    }

    #[test]
    fn test_create_object_rejects_bad_tokens_and_names() {
        let h = Harness::new();
        let token = h.login("alice");

        assert_eq!(
            h.catalog.create_object(&token, "").unwrap_err().kind(),
            ErrorKind::Invalid
        );
        assert!(matches!(
            h.catalog.create_object("deadbeef", "a.txt"),
            Err(CatalogError::Token(TokenError::InvalidToken(_)))
        ));

        h.clock.advance(chrono::Duration::hours(145));
        assert!(matches!(
            h.catalog.create_object(&token, "a.txt"),
            Err(CatalogError::Token(TokenError::ExpiredToken))
        ));
    }

    #[test]
    fn test_resolve_prefers_oldest_duplicate() {
        let h = Harness::new();
        let token = h.login("alice");
        let first = h.catalog.create_object(&token, "dup.txt").unwrap();
        h.catalog.create_object(&token, "other.txt").unwrap();
        h.catalog.create_object(&token, "dup.txt").unwrap();

        let object = h.catalog.resolve_object("alice", "dup.txt").unwrap();
        let first_session = h.uploads.get_session(first).unwrap().unwrap();
        assert_eq!(object, first_session.object);
    }

    #[test]
    fn test_resolve_errors() {
        let h = Harness::new();
        h.login("alice");
        assert!(matches!(
            h.catalog.resolve_object("bob", "x"),
            Err(CatalogError::UserNotFound(_))
        ));
        let err = h.catalog.resolve_object("alice", "x").unwrap_err();
        assert!(matches!(err, CatalogError::ObjectNotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_objects_are_private_to_their_owner() {
        let h = Harness::new();
        let alice = h.login("alice");
        let bob = h.login("bob");
        let upload = h.catalog.create_object(&alice, "secret.txt").unwrap();
        h.uploads.upload(upload, b"alice only").unwrap();

        assert!(matches!(
            h.catalog.open_object(&bob, "secret.txt"),
            Err(CatalogError::ObjectNotFound { .. })
        ));
        assert!(h.catalog.list_objects(&bob).unwrap().is_empty());
        assert_eq!(h.catalog.list_objects(&alice).unwrap().len(), 1);
    }

    #[test]
    fn test_open_before_upload_is_precondition() {
        let h = Harness::new();
        let token = h.login("alice");
        h.catalog.create_object(&token, "later.txt").unwrap();

        let err = h.catalog.open_object(&token, "later.txt").unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Upload(UploadError::NotYetUploaded(_))
        ));
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_reconcile_repairs_missing_and_dangling_entries() {
        let h = Harness::new();
        let token = h.login("alice");
        h.login("bob");
        h.catalog.create_object(&token, "a.txt").unwrap();

        // Simulate a crash between the two creation transactions, a dangling index
        // entry and an object owned by nobody.
        h.store
            .with_write(|tx| -> Result<(), StoreError> {
                for (id, owner) in [(2, "alice"), (3, "ghost")] {
                    let object = Object {
                        id: ObjectId(id),
                        name: format!("{id}.txt"),
                        owner: owner.to_string(),
                        local_reference: random_alphanumeric(LOCAL_REFERENCE_LEN),
                    };
                    tx.put_json(Collection::Objects, &object.id.to_key(), &object)?;
                }
                Ok(())
            })
            .unwrap();
        h.users.append_object_id("bob", ObjectId(99)).unwrap();

        let report = h.catalog.reconcile_owner_index().unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                objects_scanned: 3,
                users_updated: 2,
                orphaned_objects: 1,
            }
        );
        assert_eq!(
            h.users.get_user("alice").unwrap().unwrap().object_ids,
            vec![ObjectId(1), ObjectId(2)]
        );
        assert!(h.users.get_user("bob").unwrap().unwrap().object_ids.is_empty());

        // A second pass has nothing left to do.
        let again = h.catalog.reconcile_owner_index().unwrap();
        assert_eq!(again.users_updated, 0);
    }
}
