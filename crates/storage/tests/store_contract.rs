//! Behaviour shared by every store backend: sequences, atomicity and scan order.

use piedpiper_storage::{
    Collection, KvStore, KvStoreExt, MemoryStore, ReadTxnExt, SledStore, StoreError, StoreResult,
    WriteTxnExt,
};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn backends() -> Vec<(&'static str, Arc<dyn KvStore>)> {
    vec![
        ("memory", Arc::new(MemoryStore::new())),
        ("sled", Arc::new(SledStore::temporary().expect("temporary sled"))),
    ]
}

fn next(store: &dyn KvStore, collection: Collection) -> u64 {
    store
        .with_write(|tx| -> StoreResult<u64> { tx.next_sequence(collection) })
        .unwrap()
}

#[test]
fn test_sequences_start_at_one_and_are_per_collection() {
    for (name, store) in backends() {
        assert_eq!(next(store.as_ref(), Collection::Objects), 1, "{name}");
        assert_eq!(next(store.as_ref(), Collection::Objects), 2, "{name}");
        assert_eq!(next(store.as_ref(), Collection::Uploads), 1, "{name}");
    }
}

#[test]
fn test_failed_transaction_discards_writes() {
    for (name, store) in backends() {
        let result: StoreResult<()> = store.with_write(|tx| {
            tx.put_json(Collection::Users, b"bob", &"record")?;
            tx.next_sequence(Collection::Objects)?;
            Err(StoreError::Corrupt {
                collection: "users",
                reason: "forced".to_string(),
            })
        });
        assert!(matches!(result, Err(StoreError::Corrupt { .. })), "{name}");

        let found: Option<String> = store
            .with_read(|tx| tx.get_json(Collection::Users, b"bob"))
            .unwrap();
        assert_eq!(found, None, "{name}");
        // The aborted increment is not observable either.
        assert_eq!(next(store.as_ref(), Collection::Objects), 1, "{name}");
    }
}

#[test]
fn test_reads_inside_write_see_own_writes() {
    for (name, store) in backends() {
        let seen = store
            .with_write(|tx| -> StoreResult<Option<Vec<u8>>> {
                tx.put(Collection::Tokens, b"k", b"v".to_vec())?;
                let staged = tx.get(Collection::Tokens, b"k")?;
                assert!(tx.delete(Collection::Tokens, b"k")?);
                assert!(!tx.delete(Collection::Tokens, b"k")?);
                Ok(staged)
            })
            .unwrap();
        assert_eq!(seen, Some(b"v".to_vec()), "{name}");
    }
}

#[test]
fn test_scan_returns_big_endian_keys_in_numeric_order() {
    for (name, store) in backends() {
        store
            .with_write(|tx| -> StoreResult<()> {
                for id in [300u64, 2, 17] {
                    tx.put(Collection::Objects, &id.to_be_bytes(), id.to_string().into_bytes())?;
                }
                Ok(())
            })
            .unwrap();

        let ids: Vec<u64> = store
            .scan(Collection::Objects)
            .unwrap()
            .into_iter()
            .map(|(key, _)| u64::from_be_bytes(key.try_into().unwrap()))
            .collect();
        assert_eq!(ids, vec![2, 17, 300], "{name}");
        assert!(store.scan(Collection::Users).unwrap().is_empty(), "{name}");
    }
}

#[test]
fn test_concurrent_writers_never_share_a_sequence_value() {
    for (name, store) in backends() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..25)
                        .map(|_| next(store.as_ref(), Collection::Uploads))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=200).collect::<Vec<_>>(), "{name}");
    }
}

#[test]
fn test_sled_sequences_survive_reopen() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("prod.db");

    {
        let store = SledStore::open(&path).unwrap();
        assert_eq!(next(&store, Collection::Objects), 1);
        assert_eq!(next(&store, Collection::Objects), 2);
        store
            .with_write(|tx| -> StoreResult<()> {
                tx.put_json(Collection::Users, b"alice", &vec![1u64, 2])
            })
            .unwrap();
        store.flush().unwrap();
    }

    let store = SledStore::open(&path).unwrap();
    assert_eq!(next(&store, Collection::Objects), 3);
    let ids: Option<Vec<u64>> = store
        .with_read(|tx| tx.get_json(Collection::Users, b"alice"))
        .unwrap();
    assert_eq!(ids, Some(vec![1, 2]));
}
