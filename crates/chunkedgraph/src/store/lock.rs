//! Root leases.
//!
//! Writers in different processes serialize edits per root through a lease
//! cell on the root row, so the primitive lives at the storage layer: a
//! conditional mutation that only succeeds when no unexpired lease exists.
//! The cell value carries the holder's operation id and the acquisition
//! timestamp; expiry is evaluated against the reader's clock.

use super::{CellKey, ColumnStore, RowKey, Timestamp};
use crate::attributes::{Attribute, Family};
use crate::error::Result;
use crate::id::NodeId;

use sled::transaction::TransactionError;

type TxnResult<T> = std::result::Result<T, TransactionError<()>>;

fn lease_key(root: NodeId) -> [u8; 19] {
    // A single untimestamped cell slot per root, like the counters.
    CellKey::column_start(RowKey::Id(root), Attribute::Lock)
}

fn encode_lease(operation_id: u64, timestamp: Timestamp) -> [u8; 16] {
    let mut bytes = [0; 16];
    bytes[..8].copy_from_slice(&operation_id.to_le_bytes());
    bytes[8..].copy_from_slice(&timestamp.to_le_bytes());
    bytes
}

fn decode_lease(bytes: &[u8]) -> Option<(u64, Timestamp)> {
    if bytes.len() != 16 {
        return None;
    }
    Some((
        u64::from_le_bytes(bytes[..8].try_into().unwrap()),
        u64::from_le_bytes(bytes[8..].try_into().unwrap()),
    ))
}

/// Attempts to acquire the lease on `root`. Succeeds when the slot is empty,
/// the current lease has expired, or `operation_id` already holds it (which
/// refreshes the acquisition time).
pub fn lock_root(
    store: &ColumnStore,
    root: NodeId,
    operation_id: u64,
    now: Timestamp,
    expiry_micros: u64,
) -> Result<bool> {
    let key = lease_key(root);
    let acquired: TxnResult<bool> = store.tree(Family::Concurrency).transaction(|txn| {
        if let Some(held) = txn.get(key)?.as_deref().and_then(decode_lease) {
            let (holder, since) = held;
            if holder != operation_id && now.saturating_sub(since) < expiry_micros {
                return Ok(false);
            }
        }
        txn.insert(&key[..], &encode_lease(operation_id, now)[..])?;
        Ok(true)
    });
    let acquired = acquired?;
    if !acquired {
        log::debug!("operation {}: root {} is already leased", operation_id, root);
    }
    Ok(acquired)
}

/// Releases the lease on `root` if `operation_id` holds it.
pub fn unlock_root(store: &ColumnStore, root: NodeId, operation_id: u64) -> Result<bool> {
    let key = lease_key(root);
    let released: TxnResult<bool> = store.tree(Family::Concurrency).transaction(|txn| {
        match txn.get(key)?.as_deref().and_then(decode_lease) {
            Some((holder, _)) if holder == operation_id => {
                txn.remove(&key[..])?;
                Ok(true)
            }
            _ => Ok(false),
        }
    });
    Ok(released?)
}

/// Extends the lease on `root` if `operation_id` still holds it. Unlike
/// acquisition this ignores expiry: a holder that comes back late learns the
/// truth from the return value instead of silently re-locking.
pub fn renew_lock(
    store: &ColumnStore,
    root: NodeId,
    operation_id: u64,
    now: Timestamp,
) -> Result<bool> {
    let key = lease_key(root);
    let renewed: TxnResult<bool> = store.tree(Family::Concurrency).transaction(|txn| {
        match txn.get(key)?.as_deref().and_then(decode_lease) {
            Some((holder, _)) if holder == operation_id => {
                txn.insert(&key[..], &encode_lease(operation_id, now)[..])?;
                Ok(true)
            }
            _ => Ok(false),
        }
    });
    Ok(renewed?)
}

/// The lease currently written on `root`, expired or not.
pub fn read_lease(store: &ColumnStore, root: NodeId) -> Result<Option<(u64, Timestamp)>> {
    let bytes = store.tree(Family::Concurrency).get(lease_key(root))?;
    Ok(bytes.as_deref().and_then(decode_lease))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RetryPolicy;

    const EXPIRY: u64 = 1_000_000;

    fn store() -> (sled::Db, ColumnStore) {
        let db = sled::Config::default().temporary(true).open().unwrap();
        let store = ColumnStore::open(&db, "testgraph", RetryPolicy::default()).unwrap();
        (db, store)
    }

    #[test]
    fn second_writer_is_rejected_until_release() {
        let (_db, store) = store();
        let root = NodeId(7);

        assert!(lock_root(&store, root, 1, 100, EXPIRY).unwrap());
        assert!(!lock_root(&store, root, 2, 200, EXPIRY).unwrap());
        assert_eq!(read_lease(&store, root).unwrap(), Some((1, 100)));

        // Only the holder can release.
        assert!(!unlock_root(&store, root, 2).unwrap());
        assert!(unlock_root(&store, root, 1).unwrap());
        assert!(lock_root(&store, root, 2, 300, EXPIRY).unwrap());
    }

    #[test]
    fn expired_leases_are_taken_over() {
        let (_db, store) = store();
        let root = NodeId(7);

        assert!(lock_root(&store, root, 1, 100, EXPIRY).unwrap());
        assert!(lock_root(&store, root, 2, 100 + EXPIRY, EXPIRY).unwrap());
        assert_eq!(read_lease(&store, root).unwrap(), Some((2, 100 + EXPIRY)));

        // The evicted holder can no longer renew or release.
        assert!(!renew_lock(&store, root, 1, 100 + EXPIRY + 1).unwrap());
        assert!(!unlock_root(&store, root, 1).unwrap());
    }

    #[test]
    fn renewal_extends_the_lease() {
        let (_db, store) = store();
        let root = NodeId(7);

        assert!(lock_root(&store, root, 1, 100, EXPIRY).unwrap());
        assert!(renew_lock(&store, root, 1, 500_000).unwrap());
        // Another writer at a time where the original lease would have expired
        // still loses against the renewed one.
        assert!(!lock_root(&store, root, 2, 100 + EXPIRY, EXPIRY).unwrap());
    }
}
