//! The operation log.
//!
//! Every committed edit gets one record row keyed by its operation id.
//! Operation ids come from a global counter and are monotone; an id whose
//! edit aborted before commit has no record row.

use crate::attributes::Attribute;
use crate::error::Result;
use crate::store::{record_from_bytes, record_to_bytes, ColumnStore, Mutation, RowKey, Timestamp};

use rkyv::{Archive, Deserialize, Serialize};

#[derive(Archive, Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OperationKind {
    Merge,
    Split,
}

/// What happened, who asked for it, and which rows it produced. Ids are stored
/// raw so the record stays readable without graph metadata.
#[derive(Archive, Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OperationRecord {
    pub operation_id: u64,
    pub kind: OperationKind,
    pub user: String,
    pub source_ids: Vec<u64>,
    pub sink_ids: Vec<u64>,
    pub source_coords: Vec<[i32; 3]>,
    pub sink_coords: Vec<[i32; 3]>,
    pub added_edges: Vec<[u64; 2]>,
    pub removed_edges: Vec<[u64; 2]>,
    pub old_root_ids: Vec<u64>,
    pub new_root_ids: Vec<u64>,
    pub timestamp: Timestamp,
}

pub fn create_operation_id(store: &ColumnStore) -> Result<u64> {
    store.increment(RowKey::OperationCounter, 1)
}

pub fn max_operation_id(store: &ColumnStore) -> Result<u64> {
    store.counter(RowKey::OperationCounter)
}

/// The log-row write for `record`, to be committed together with the edit's
/// other mutations.
pub fn operation_mutation(record: &OperationRecord) -> Mutation {
    Mutation {
        row: RowKey::Operation(record.operation_id),
        attribute: Attribute::OperationLog,
        timestamp: record.timestamp,
        value: record_to_bytes(record),
    }
}

pub fn read_operation(store: &ColumnStore, operation_id: u64) -> Result<Option<OperationRecord>> {
    let cell = store.read_latest(
        RowKey::Operation(operation_id),
        Attribute::OperationLog,
        u64::MAX,
    )?;
    Ok(cell.map(|c| record_from_bytes(&c.value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RetryPolicy;

    #[test]
    fn records_round_trip_through_the_store() {
        let db = sled::Config::default().temporary(true).open().unwrap();
        let store = ColumnStore::open(&db, "testgraph", RetryPolicy::default()).unwrap();

        let id = create_operation_id(&store).unwrap();
        assert_eq!(id, 1);
        let record = OperationRecord {
            operation_id: id,
            kind: OperationKind::Merge,
            user: "proofreader@example.org".into(),
            source_ids: vec![100],
            sink_ids: vec![200],
            source_coords: vec![[1, 2, 3]],
            sink_coords: vec![[4, 5, 6]],
            added_edges: vec![[100, 200]],
            removed_edges: vec![],
            old_root_ids: vec![900, 901],
            new_root_ids: vec![902],
            timestamp: 42,
        };
        store.bulk_mutate(&[operation_mutation(&record)]).unwrap();

        assert_eq!(read_operation(&store, id).unwrap(), Some(record));
        assert_eq!(read_operation(&store, 999).unwrap(), None);
        assert_eq!(max_operation_id(&store).unwrap(), 1);
    }

    #[test]
    fn operation_ids_are_monotone() {
        let db = sled::Config::default().temporary(true).open().unwrap();
        let store = ColumnStore::open(&db, "testgraph", RetryPolicy::default()).unwrap();
        let ids: Vec<u64> = (0..5).map(|_| create_operation_id(&store).unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }
}
