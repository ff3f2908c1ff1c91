//! The versioned column store.
//!
//! Rows are keyed by [`RowKey`], columns by [`Attribute`], and every cell
//! carries a timestamp with multiple versions per column. One sled tree per
//! column family holds the cells of one graph; the fixed-width
//! [`CellKey`] encoding makes a prefix scan return cells newest first.
//!
//! Transient I/O failures are retried here with exponential backoff bounded by
//! the lease budget; everything else escalates immediately.

mod cell_key;
pub mod lock;

pub use cell_key::{CellKey, RowKey};

use crate::attributes::{Attribute, Family, Retention};
use crate::error::{ChunkedGraphError, Result};
use crate::id::NodeId;

use chunkedgraph_core::SmallKeyHashMap;
use rayon::prelude::*;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::ser::Serializer;
use rkyv::{archived_root, AlignedVec, Archive, Deserialize, Infallible};
use sled::Tree;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch.
pub type Timestamp = u64;

/// Requests covering more row keys than this are split and fanned out.
const MAX_ROW_KEYS_PER_REQUEST: usize = 20_000;
/// Mutations are applied in batches of at most this many cells.
const WRITE_BLOCK_SIZE: usize = 2_000;

/// Hands out strictly increasing timestamps, even when the wall clock stalls
/// within one microsecond.
#[derive(Default)]
pub struct TimestampOracle {
    last: AtomicU64,
}

impl TimestampOracle {
    pub fn now(&self) -> Timestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Cell {
    pub timestamp: Timestamp,
    pub value: Vec<u8>,
}

/// One cell write. All engine writes are additive; deletions only happen as
/// retention pruning and lease release inside the store itself.
#[derive(Clone, Debug)]
pub struct Mutation {
    pub row: RowKey,
    pub attribute: Attribute,
    pub timestamp: Timestamp,
    pub value: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Total time spent sleeping before escalating; bounded by the lease
    /// expiry so a writer cannot outlive its lock while retrying.
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(15),
            budget: Duration::from_secs(60),
        }
    }
}

pub struct ColumnStore {
    trees: [Tree; 4],
    retry: RetryPolicy,
}

impl ColumnStore {
    /// Opens the four family trees of one graph.
    pub fn open(db: &sled::Db, graph_name: &str, retry: RetryPolicy) -> Result<Self> {
        let mut trees = Vec::with_capacity(4);
        for family in Family::ALL {
            trees.push(db.open_tree(format!("{}-{}", graph_name, family.name()))?);
        }
        Ok(Self {
            trees: trees.try_into().expect("four families"),
            retry,
        })
    }

    pub fn tree(&self, family: Family) -> &Tree {
        &self.trees[family.index()]
    }

    /// All cells of one column with timestamps in `[start, end]`, newest first.
    pub fn read_cells(
        &self,
        row: RowKey,
        attribute: Attribute,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Cell>> {
        let tree = self.tree(attribute.family());
        let lo = CellKey::new(row, attribute, end).into_sled_key();
        let hi = CellKey::new(row, attribute, start).into_sled_key();
        let raw = self.with_retries(|| {
            let mut out = Vec::new();
            for kv in tree.range(lo..=hi) {
                let (key, value) = kv?;
                out.push((key, value));
            }
            Ok(out)
        })?;
        raw.into_iter()
            .map(|(key, value)| {
                let key = CellKey::from_sled_key(&key)
                    .ok_or_else(|| ChunkedGraphError::Internal("malformed cell key".into()))?;
                Ok(Cell {
                    timestamp: key.timestamp,
                    value: value.to_vec(),
                })
            })
            .collect()
    }

    /// The newest cell of a column with timestamp at most `at`.
    pub fn read_latest(&self, row: RowKey, attribute: Attribute, at: Timestamp) -> Result<Option<Cell>> {
        let tree = self.tree(attribute.family());
        let lo = CellKey::new(row, attribute, at).into_sled_key();
        let hi = CellKey::column_end(row, attribute);
        let first = self.with_retries(|| match tree.range(lo..=hi).next() {
            Some(kv) => kv.map(Some),
            None => Ok(None),
        })?;
        first
            .map(|(key, value)| {
                let key = CellKey::from_sled_key(&key)
                    .ok_or_else(|| ChunkedGraphError::Internal("malformed cell key".into()))?;
                Ok(Cell {
                    timestamp: key.timestamp,
                    value: value.to_vec(),
                })
            })
            .transpose()
    }

    /// Reads one column for many node rows, fanning out over worker threads in
    /// bounded sub-requests.
    pub fn read_column(
        &self,
        ids: &[NodeId],
        attribute: Attribute,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<SmallKeyHashMap<NodeId, Vec<Cell>>> {
        let read_chunk = |chunk: &[NodeId]| -> Result<Vec<(NodeId, Vec<Cell>)>> {
            let mut out = Vec::with_capacity(chunk.len());
            for &id in chunk {
                let cells = self.read_cells(RowKey::Id(id), attribute, start, end)?;
                if !cells.is_empty() {
                    out.push((id, cells));
                }
            }
            Ok(out)
        };

        let per_chunk: Vec<Vec<(NodeId, Vec<Cell>)>> = if ids.len() <= MAX_ROW_KEYS_PER_REQUEST {
            vec![read_chunk(ids)?]
        } else {
            ids.par_chunks(MAX_ROW_KEYS_PER_REQUEST)
                .map(read_chunk)
                .collect::<Result<Vec<_>>>()?
        };

        let mut merged = SmallKeyHashMap::default();
        for rows in per_chunk {
            merged.extend(rows);
        }
        Ok(merged)
    }

    /// Scans one column over a contiguous id range (e.g. every node of one
    /// chunk). Returns `(id, cell)` pairs, rows ascending, cells newest first.
    pub fn read_id_range(
        &self,
        start: NodeId,
        end: NodeId,
        attribute: Attribute,
        end_time: Timestamp,
    ) -> Result<Vec<(NodeId, Cell)>> {
        let tree = self.tree(attribute.family());
        let lo = CellKey::row_start(RowKey::Id(start));
        let hi = CellKey::row_end(RowKey::Id(end));
        let raw = self.with_retries(|| {
            let mut out = Vec::new();
            for kv in tree.range(lo..=hi) {
                let (key, value) = kv?;
                out.push((key, value));
            }
            Ok(out)
        })?;

        let qualifier = attribute.qualifier();
        let mut cells = Vec::new();
        for (key, value) in raw {
            let key = CellKey::from_sled_key(&key)
                .ok_or_else(|| ChunkedGraphError::Internal("malformed cell key".into()))?;
            if key.qualifier != qualifier || key.timestamp > end_time {
                continue;
            }
            let RowKey::Id(id) = key.row else { continue };
            cells.push((
                id,
                Cell {
                    timestamp: key.timestamp,
                    value: value.to_vec(),
                },
            ));
        }
        Ok(cells)
    }

    /// Atomically bumps the counter cell of `row` and returns the new value.
    pub fn increment(&self, row: RowKey, delta: u64) -> Result<u64> {
        let tree = self.tree(Family::Concurrency);
        // Counters live in a single untimestamped cell slot.
        let key = CellKey::column_start(row, Attribute::Counter);
        let new = self.with_retries(|| {
            tree.update_and_fetch(key, |old| {
                let prev = old
                    .and_then(|b| b.try_into().ok().map(u64::from_le_bytes))
                    .unwrap_or(0);
                Some((prev + delta).to_le_bytes().to_vec())
            })
        })?;
        match new {
            Some(bytes) => crate::attributes::decode_u64(&bytes),
            None => Err(ChunkedGraphError::Internal("counter vanished".into())),
        }
    }

    /// Raises the counter cell of `row` to at least `floor` and returns the
    /// resulting value.
    pub fn raise_counter(&self, row: RowKey, floor: u64) -> Result<u64> {
        let tree = self.tree(Family::Concurrency);
        let key = CellKey::column_start(row, Attribute::Counter);
        let new = self.with_retries(|| {
            tree.update_and_fetch(key, |old| {
                let prev = old
                    .and_then(|b| b.try_into().ok().map(u64::from_le_bytes))
                    .unwrap_or(0);
                Some(prev.max(floor).to_le_bytes().to_vec())
            })
        })?;
        match new {
            Some(bytes) => crate::attributes::decode_u64(&bytes),
            None => Err(ChunkedGraphError::Internal("counter vanished".into())),
        }
    }

    /// Current counter value without bumping it.
    pub fn counter(&self, row: RowKey) -> Result<u64> {
        let tree = self.tree(Family::Concurrency);
        let key = CellKey::column_start(row, Attribute::Counter);
        match self.with_retries(|| tree.get(key))? {
            Some(bytes) => crate::attributes::decode_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Unordered bulk write in bounded batches. Latest-only families are pruned
    /// of older cells in the same batch.
    pub fn bulk_mutate(&self, mutations: &[Mutation]) -> Result<()> {
        let mut per_family: [Vec<&Mutation>; 4] = Default::default();
        for m in mutations {
            per_family[m.attribute.family().index()].push(m);
        }

        for family in Family::ALL {
            let group = &per_family[family.index()];
            if group.is_empty() {
                continue;
            }
            let tree = self.tree(family);
            for block in group.chunks(WRITE_BLOCK_SIZE) {
                let mut batch = sled::Batch::default();
                for m in block {
                    if family.retention() == Retention::LatestOnly {
                        for stale in self.read_cells(m.row, m.attribute, 0, u64::MAX)? {
                            batch.remove(
                                &CellKey::new(m.row, m.attribute, stale.timestamp).into_sled_key()[..],
                            );
                        }
                    }
                    batch.insert(
                        &CellKey::new(m.row, m.attribute, m.timestamp).into_sled_key()[..],
                        m.value.as_slice(),
                    );
                }
                self.with_retries(|| tree.apply_batch(batch.clone()))?;
            }
        }
        Ok(())
    }

    fn with_retries<T>(&self, mut f: impl FnMut() -> sled::Result<T>) -> Result<T> {
        let mut delay = self.retry.initial;
        let mut slept = Duration::ZERO;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) => {
                    if slept + delay > self.retry.budget {
                        return Err(ChunkedGraphError::StorageExhausted(e.to_string()));
                    }
                    log::debug!("transient storage error, retrying in {:?}: {}", delay, e);
                    std::thread::sleep(delay);
                    slept += delay;
                    delay = (delay * 2).min(self.retry.max);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_transient(e: &sled::Error) -> bool {
    matches!(e, sled::Error::Io(_))
}

/// Serializes a structured record for a `Codec::Record` column.
pub(crate) fn record_to_bytes<T>(value: &T) -> Vec<u8>
where
    T: rkyv::Serialize<AllocSerializer<1024>>,
{
    let mut serializer = AllocSerializer::<1024>::default();
    serializer.serialize_value(value).unwrap();
    serializer.into_serializer().into_inner().to_vec()
}

/// Deserializes a structured record.
pub(crate) fn record_from_bytes<T>(bytes: &[u8]) -> T
where
    T: Archive,
    T::Archived: Deserialize<T, Infallible>,
{
    // NB: sled value buffers carry no alignment guarantee, so the archive is
    // copied into an aligned buffer before access.
    let mut aligned = AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    let archived = unsafe { archived_root::<T>(&aligned) };
    archived.deserialize(&mut Infallible).unwrap()
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{encode_ids, encode_u64};

    fn store() -> (sled::Db, ColumnStore) {
        let db = sled::Config::default().temporary(true).open().unwrap();
        let store = ColumnStore::open(&db, "testgraph", RetryPolicy::default()).unwrap();
        (db, store)
    }

    fn put(store: &ColumnStore, row: RowKey, attr: Attribute, ts: Timestamp, value: Vec<u8>) {
        store
            .bulk_mutate(&[Mutation {
                row,
                attribute: attr,
                timestamp: ts,
                value,
            }])
            .unwrap();
    }

    #[test]
    fn cells_come_back_newest_first() {
        let (_db, store) = store();
        let row = RowKey::Id(NodeId(10));
        for ts in [5, 1, 9] {
            put(&store, row, Attribute::Parent, ts, encode_u64(ts));
        }

        let cells = store.read_cells(row, Attribute::Parent, 0, u64::MAX).unwrap();
        assert_eq!(cells.iter().map(|c| c.timestamp).collect::<Vec<_>>(), vec![9, 5, 1]);

        // Timestamped reads see the past.
        let cells = store.read_cells(row, Attribute::Parent, 0, 5).unwrap();
        assert_eq!(cells.iter().map(|c| c.timestamp).collect::<Vec<_>>(), vec![5, 1]);

        let latest = store.read_latest(row, Attribute::Parent, 4).unwrap().unwrap();
        assert_eq!(latest.timestamp, 1);
        assert!(store.read_latest(row, Attribute::Parent, 0).unwrap().is_none());
    }

    #[test]
    fn columns_do_not_bleed_into_each_other() {
        let (_db, store) = store();
        let row = RowKey::Id(NodeId(10));
        put(&store, row, Attribute::Parent, 1, encode_u64(1));
        put(&store, row, Attribute::Children, 1, encode_ids(&[NodeId(2)]));
        put(&store, RowKey::Id(NodeId(11)), Attribute::Parent, 1, encode_u64(3));

        assert_eq!(store.read_cells(row, Attribute::Parent, 0, u64::MAX).unwrap().len(), 1);
        assert_eq!(
            store.read_cells(row, Attribute::Children, 0, u64::MAX).unwrap().len(),
            1
        );
    }

    #[test]
    fn id_range_scan_filters_by_column() {
        let (_db, store) = store();
        for id in [20u64, 21, 22, 30] {
            put(&store, RowKey::Id(NodeId(id)), Attribute::Children, 3, encode_ids(&[]));
            put(&store, RowKey::Id(NodeId(id)), Attribute::Parent, 3, encode_u64(id));
        }

        let rows = store
            .read_id_range(NodeId(20), NodeId(29), Attribute::Children, u64::MAX)
            .unwrap();
        let ids: Vec<u64> = rows.iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![20, 21, 22]);

        // A time bound hides newer rows.
        assert!(store
            .read_id_range(NodeId(20), NodeId(29), Attribute::Children, 2)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn counters_are_atomic_and_start_at_zero() {
        let (_db, store) = store();
        let row = RowKey::Id(NodeId(99));
        assert_eq!(store.counter(row).unwrap(), 0);
        assert_eq!(store.increment(row, 3).unwrap(), 3);
        assert_eq!(store.increment(row, 1).unwrap(), 4);
        assert_eq!(store.counter(row).unwrap(), 4);

        // The operation counter is a different row entirely.
        assert_eq!(store.increment(RowKey::OperationCounter, 1).unwrap(), 1);
    }

    #[test]
    fn latest_only_families_keep_one_version() {
        let (_db, store) = store();
        let row = RowKey::Operation(5);
        put(&store, row, Attribute::OperationLog, 1, vec![1]);
        put(&store, row, Attribute::OperationLog, 2, vec![2]);

        let cells = store.read_cells(row, Attribute::OperationLog, 0, u64::MAX).unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].timestamp, 2);
    }

    #[test]
    fn timestamp_oracle_is_strictly_increasing() {
        let oracle = TimestampOracle::default();
        let mut last = 0;
        for _ in 0..1000 {
            let now = oracle.now();
            assert!(now > last);
            last = now;
        }
    }
}
