use crate::{Collection, KvStore, ReadTxn, StoreResult, WriteTxn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct MemoryState {
    collections: HashMap<Collection, BTreeMap<Vec<u8>, Vec<u8>>>,
    sequences: HashMap<Collection, u64>,
}

impl MemoryState {
    fn lookup(&self, collection: Collection, key: &[u8]) -> Option<Vec<u8>> {
        self.collections
            .get(&collection)
            .and_then(|entries| entries.get(key))
            .cloned()
    }
}

/// In-memory store for tests and ephemeral runs. Nothing is persisted.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    write_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

struct SnapshotTxn<'a> {
    state: &'a MemoryState,
}

impl ReadTxn for SnapshotTxn<'_> {
    fn get(&self, collection: Collection, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.state.lookup(collection, key))
    }
}

/// Stages writes in an overlay that is applied only when the closure succeeds.
struct StagedTxn<'a> {
    base: &'a MemoryState,
    overlay: BTreeMap<(Collection, Vec<u8>), Option<Vec<u8>>>,
    sequences: HashMap<Collection, u64>,
}

impl ReadTxn for StagedTxn<'_> {
    fn get(&self, collection: Collection, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        match self.overlay.get(&(collection, key.to_vec())) {
            Some(staged) => Ok(staged.clone()),
            None => Ok(self.base.lookup(collection, key)),
        }
    }
}

impl WriteTxn for StagedTxn<'_> {
    fn put(&mut self, collection: Collection, key: &[u8], value: Vec<u8>) -> StoreResult<()> {
        self.overlay.insert((collection, key.to_vec()), Some(value));
        Ok(())
    }

    fn delete(&mut self, collection: Collection, key: &[u8]) -> StoreResult<bool> {
        let existed = self.get(collection, key)?.is_some();
        self.overlay.insert((collection, key.to_vec()), None);
        Ok(existed)
    }

    fn next_sequence(&mut self, collection: Collection) -> StoreResult<u64> {
        let current = match self.sequences.get(&collection) {
            Some(value) => *value,
            None => self.base.sequences.get(&collection).copied().unwrap_or(0),
        };
        let next = current + 1;
        self.sequences.insert(collection, next);
        Ok(next)
    }
}

impl KvStore for MemoryStore {
    fn view(&self, f: &mut dyn FnMut(&dyn ReadTxn) -> StoreResult<()>) -> StoreResult<()> {
        let state = self.state.read();
        f(&SnapshotTxn { state: &state })
    }

    fn update(
        &self,
        f: &mut dyn FnMut(&mut dyn WriteTxn) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let _writer = self.write_lock.lock();

        // Only this writer mutates state, so staging against a read guard is safe.
        let (overlay, sequences) = {
            let state = self.state.read();
            let mut txn = StagedTxn {
                base: &state,
                overlay: BTreeMap::new(),
                sequences: HashMap::new(),
            };
            f(&mut txn)?;
            (txn.overlay, txn.sequences)
        };

        let mut state = self.state.write();
        for ((collection, key), value) in overlay {
            let entries = state.collections.entry(collection).or_default();
            match value {
                Some(value) => {
                    entries.insert(key, value);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        state.sequences.extend(sequences);
        Ok(())
    }

    fn scan(&self, collection: Collection) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let state = self.state.read();
        Ok(state
            .collections
            .get(&collection)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}
