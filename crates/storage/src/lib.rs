//! Key-value store adapter.
//!
//! Four named collections (sorted byte-key → byte-value maps) with a per-collection
//! sequence counter, accessed through atomic read and write transactions. Writes are
//! serialized process-wide; reads observe a consistent snapshot.

use serde::de::DeserializeOwned;
use serde::Serialize;

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Transaction error: {0}")]
    Transaction(#[from] sled::transaction::UnabortableTransactionError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt record in {collection}: {reason}")]
    Corrupt {
        collection: &'static str,
        reason: String,
    },
    #[error("Transaction aborted")]
    Aborted,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Named collections. Each entity kind lives in exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Users,
    Objects,
    Uploads,
    Tokens,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Users,
        Collection::Objects,
        Collection::Uploads,
        Collection::Tokens,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Objects => "objects",
            Collection::Uploads => "uploads",
            Collection::Tokens => "tokens",
        }
    }

    fn index(&self) -> usize {
        match self {
            Collection::Users => 0,
            Collection::Objects => 1,
            Collection::Uploads => 2,
            Collection::Tokens => 3,
        }
    }
}

/// Read access inside a transaction.
pub trait ReadTxn {
    fn get(&self, collection: Collection, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;
}

/// Mutable access inside a write transaction. Effects become visible to other
/// transactions only after the enclosing `update` returns `Ok`.
pub trait WriteTxn: ReadTxn {
    fn put(&mut self, collection: Collection, key: &[u8], value: Vec<u8>) -> StoreResult<()>;

    /// Returns whether the key existed.
    fn delete(&mut self, collection: Collection, key: &[u8]) -> StoreResult<bool>;

    /// Next value of the collection's counter. Starts at 1, never reused.
    fn next_sequence(&mut self, collection: Collection) -> StoreResult<u64>;
}

/// Abstract store. Object safe so components can share an `Arc<dyn KvStore>`.
///
/// Closures may run more than once (optimistic backends retry on conflict), so they
/// must not have side effects outside the transaction they are handed.
pub trait KvStore: Send + Sync {
    fn view(&self, f: &mut dyn FnMut(&dyn ReadTxn) -> StoreResult<()>) -> StoreResult<()>;

    fn update(&self, f: &mut dyn FnMut(&mut dyn WriteTxn) -> StoreResult<()>)
        -> StoreResult<()>;

    /// Every `(key, value)` pair of a collection in key order.
    fn scan(&self, collection: Collection) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    fn flush(&self) -> StoreResult<()>;
}

/// Typed front-end over [`KvStore`]: closures return any error that a
/// [`StoreError`] converts into, and a closure error aborts the transaction and is
/// handed back unchanged.
pub trait KvStoreExt: KvStore {
    fn with_read<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(&dyn ReadTxn) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut outcome: Option<Result<T, E>> = None;
        let result = self.view(&mut |tx: &dyn ReadTxn| match f(tx) {
            Ok(value) => {
                outcome = Some(Ok(value));
                Ok(())
            }
            Err(err) => {
                outcome = Some(Err(err));
                Err(StoreError::Aborted)
            }
        });
        settle(result, outcome)
    }

    fn with_write<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(&mut dyn WriteTxn) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut outcome: Option<Result<T, E>> = None;
        let result = self.update(&mut |tx: &mut dyn WriteTxn| match f(tx) {
            Ok(value) => {
                outcome = Some(Ok(value));
                Ok(())
            }
            Err(err) => {
                outcome = Some(Err(err));
                Err(StoreError::Aborted)
            }
        });
        settle(result, outcome)
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

fn settle<T, E: From<StoreError>>(
    result: StoreResult<()>,
    outcome: Option<Result<T, E>>,
) -> Result<T, E> {
    match (result, outcome) {
        (Ok(()), Some(outcome)) => outcome,
        (Err(StoreError::Aborted), Some(Err(err))) => Err(err),
        (Err(err), _) => Err(err.into()),
        (Ok(()), None) => Err(StoreError::Aborted.into()),
    }
}

/// JSON record helpers for any transaction.
pub trait ReadTxnExt: ReadTxn {
    fn get_json<T: DeserializeOwned>(
        &self,
        collection: Collection,
        key: &[u8],
    ) -> StoreResult<Option<T>> {
        self.get(collection, key)?
            .map(|raw| serde_json::from_slice(&raw))
            .transpose()
            .map_err(Into::into)
    }
}

impl<R: ReadTxn + ?Sized> ReadTxnExt for R {}

pub trait WriteTxnExt: WriteTxn {
    fn put_json<T: Serialize>(
        &mut self,
        collection: Collection,
        key: &[u8],
        value: &T,
    ) -> StoreResult<()> {
        let data = serde_json::to_vec(value)?;
        self.put(collection, key, data)
    }
}

impl<W: WriteTxn + ?Sized> WriteTxnExt for W {}

pub(crate) fn decode_sequence(collection: Collection, raw: &[u8]) -> StoreResult<u64> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| StoreError::Corrupt {
        collection: collection.name(),
        reason: format!("sequence value has {} bytes, expected 8", raw.len()),
    })?;
    Ok(u64::from_be_bytes(bytes))
}
