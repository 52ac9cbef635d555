use crate::{decode_sequence, Collection, KvStore, ReadTxn, StoreError, StoreResult, WriteTxn};
use parking_lot::Mutex;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};
use std::cell::RefCell;
use std::path::Path;

const SEQUENCES_TREE: &str = "__sequences";

/// Sled-backed implementation. One tree per collection plus a private tree that
/// holds the sequence counters, so counters survive restarts.
pub struct SledStore {
    db: Db,
    /// Indexed by `Collection::index`; the sequences tree is last.
    trees: Vec<Tree>,
    write_lock: Mutex<()>,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Store backed by a throwaway sled instance, removed on drop.
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let mut trees = Vec::with_capacity(Collection::ALL.len() + 1);
        for collection in Collection::ALL {
            trees.push(db.open_tree(collection.name())?);
        }
        trees.push(db.open_tree(SEQUENCES_TREE)?);
        tracing::debug!("Opened sled store with {} collections", Collection::ALL.len());

        Ok(Self {
            db,
            trees,
            write_lock: Mutex::new(()),
        })
    }

    fn run<A>(
        &self,
        f: impl Fn(&[TransactionalTree]) -> StoreResult<A>,
    ) -> StoreResult<A> {
        let result = self
            .trees
            .as_slice()
            .transaction(|trees| f(trees.as_slice()).map_err(into_conflictable));

        match result {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }
}

fn into_conflictable(err: StoreError) -> ConflictableTransactionError<StoreError> {
    match err {
        // Conflicts must reach sled so it can retry the closure.
        StoreError::Transaction(inner) => inner.into(),
        other => ConflictableTransactionError::Abort(other),
    }
}

struct SledTxn<'a> {
    trees: &'a [TransactionalTree],
}

impl SledTxn<'_> {
    fn tree(&self, collection: Collection) -> &TransactionalTree {
        &self.trees[collection.index()]
    }

    fn sequences(&self) -> &TransactionalTree {
        &self.trees[Collection::ALL.len()]
    }
}

impl ReadTxn for SledTxn<'_> {
    fn get(&self, collection: Collection, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.tree(collection).get(key)?.map(|value| value.to_vec()))
    }
}

impl WriteTxn for SledTxn<'_> {
    fn put(&mut self, collection: Collection, key: &[u8], value: Vec<u8>) -> StoreResult<()> {
        self.tree(collection).insert(key, value)?;
        Ok(())
    }

    fn delete(&mut self, collection: Collection, key: &[u8]) -> StoreResult<bool> {
        Ok(self.tree(collection).remove(key)?.is_some())
    }

    fn next_sequence(&mut self, collection: Collection) -> StoreResult<u64> {
        let current = match self.sequences().get(collection.name())? {
            Some(raw) => decode_sequence(collection, &raw)?,
            None => 0,
        };
        let next = current.checked_add(1).ok_or_else(|| StoreError::Corrupt {
            collection: collection.name(),
            reason: "sequence exhausted".to_string(),
        })?;
        self.sequences()
            .insert(collection.name(), next.to_be_bytes().to_vec())?;
        Ok(next)
    }
}

impl KvStore for SledStore {
    fn view(&self, f: &mut dyn FnMut(&dyn ReadTxn) -> StoreResult<()>) -> StoreResult<()> {
        let f = RefCell::new(f);
        self.run(|trees| {
            let txn = SledTxn { trees };
            let mut f = f.borrow_mut();
            (*f)(&txn)
        })
    }

    fn update(
        &self,
        f: &mut dyn FnMut(&mut dyn WriteTxn) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let _writer = self.write_lock.lock();
        let f = RefCell::new(f);
        self.run(|trees| {
            let mut txn = SledTxn { trees };
            let mut f = f.borrow_mut();
            (*f)(&mut txn)
        })?;
        // Durable before the caller sees success.
        self.db.flush()?;
        Ok(())
    }

    fn scan(&self, collection: Collection) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.trees[collection.index()]
            .iter()
            .map(|entry| {
                let (key, value) = entry?;
                Ok((key.to_vec(), value.to_vec()))
            })
            .collect()
    }

    fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
