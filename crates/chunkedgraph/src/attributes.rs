//! The closed set of column attributes and their value codecs.
//!
//! Every column value in the store belongs to exactly one [`Attribute`], which
//! fixes its column family, qualifier bytes, and codec. Integers are
//! little-endian fixed width; variable-width arrays are prefixed with a `u32`
//! count. Structured records (graph meta, operation log) pass through as
//! opaque rkyv bytes.

use crate::error::{ChunkedGraphError, Result};
use crate::id::NodeId;

/// Column families, named "0".."3" in storage.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Family {
    /// Parents, children, cross-chunk edges, root history. Full history kept.
    Hierarchy,
    /// Lease cells and id counters. Latest cell only.
    Concurrency,
    /// Atomic adjacency arrays and the connected toggle log. Full history kept.
    Adjacency,
    /// Graph meta and operation-log records. Latest cell only.
    Log,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Retention {
    Unlimited,
    LatestOnly,
}

impl Family {
    pub const ALL: [Family; 4] = [
        Family::Hierarchy,
        Family::Concurrency,
        Family::Adjacency,
        Family::Log,
    ];

    pub fn index(self) -> usize {
        match self {
            Family::Hierarchy => 0,
            Family::Concurrency => 1,
            Family::Adjacency => 2,
            Family::Log => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Family::Hierarchy => "0",
            Family::Concurrency => "1",
            Family::Adjacency => "2",
            Family::Log => "3",
        }
    }

    pub fn retention(self) -> Retention {
        match self {
            Family::Hierarchy | Family::Adjacency => Retention::Unlimited,
            Family::Concurrency | Family::Log => Retention::LatestOnly,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Attribute {
    /// Single parent id, appended per edit; the newest cell is current.
    Parent,
    /// Full child list, written once when the node is created.
    Children,
    FormerRoots,
    NewRoots,
    /// Atomic endpoint pairs of cross-chunk edges relevant at the given layer.
    CrossChunkEdges(u8),
    /// Growing partner list; the concatenation of all cells, oldest first.
    AtomicPartners,
    /// Toggle log of partner indices; odd occurrence count means active.
    Connected,
    Affinities,
    Areas,
    Lock,
    Counter,
    GraphMeta,
    OperationLog,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Codec {
    U64,
    U64Array,
    U64PairArray,
    F32Array,
    /// Opaque structured value with its own layout: rkyv records for meta and
    /// operation logs, the fixed 16-byte lease cell for locks.
    Record,
}

impl Attribute {
    pub fn family(self) -> Family {
        match self {
            Attribute::Parent
            | Attribute::Children
            | Attribute::FormerRoots
            | Attribute::NewRoots
            | Attribute::CrossChunkEdges(_) => Family::Hierarchy,
            Attribute::Lock | Attribute::Counter => Family::Concurrency,
            Attribute::AtomicPartners
            | Attribute::Connected
            | Attribute::Affinities
            | Attribute::Areas => Family::Adjacency,
            Attribute::GraphMeta | Attribute::OperationLog => Family::Log,
        }
    }

    pub fn qualifier(self) -> [u8; 2] {
        match self {
            Attribute::Parent => [0, 0],
            Attribute::Children => [1, 0],
            Attribute::FormerRoots => [2, 0],
            Attribute::NewRoots => [3, 0],
            Attribute::CrossChunkEdges(layer) => [4, layer],
            Attribute::AtomicPartners => [5, 0],
            Attribute::Connected => [6, 0],
            Attribute::Affinities => [7, 0],
            Attribute::Areas => [8, 0],
            Attribute::Lock => [9, 0],
            Attribute::Counter => [10, 0],
            Attribute::GraphMeta => [11, 0],
            Attribute::OperationLog => [12, 0],
        }
    }

    pub fn codec(self) -> Codec {
        match self {
            Attribute::Parent | Attribute::Counter => Codec::U64,
            Attribute::Children
            | Attribute::FormerRoots
            | Attribute::NewRoots
            | Attribute::AtomicPartners
            | Attribute::Connected
            | Attribute::Areas => Codec::U64Array,
            Attribute::CrossChunkEdges(_) => Codec::U64PairArray,
            Attribute::Affinities => Codec::F32Array,
            Attribute::Lock | Attribute::GraphMeta | Attribute::OperationLog => Codec::Record,
        }
    }
}

pub fn encode_u64(value: u64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| corrupt("u64", bytes.len()))?;
    Ok(u64::from_le_bytes(arr))
}

pub fn encode_u64s(values: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + 8 * values.len());
    bytes.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn decode_u64s(bytes: &[u8]) -> Result<Vec<u64>> {
    let (count, payload) = split_count(bytes)?;
    if payload.len() != 8 * count {
        return Err(corrupt("u64 array", bytes.len()));
    }
    Ok(payload
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

pub fn encode_ids(ids: &[NodeId]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + 8 * ids.len());
    bytes.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    for id in ids {
        bytes.extend_from_slice(&id.0.to_le_bytes());
    }
    bytes
}

pub fn decode_ids(bytes: &[u8]) -> Result<Vec<NodeId>> {
    Ok(decode_u64s(bytes)?.into_iter().map(NodeId).collect())
}

pub fn encode_id_pairs(pairs: &[[NodeId; 2]]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + 16 * pairs.len());
    bytes.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for [a, b] in pairs {
        bytes.extend_from_slice(&a.0.to_le_bytes());
        bytes.extend_from_slice(&b.0.to_le_bytes());
    }
    bytes
}

pub fn decode_id_pairs(bytes: &[u8]) -> Result<Vec<[NodeId; 2]>> {
    let (count, payload) = split_count(bytes)?;
    if payload.len() != 16 * count {
        return Err(corrupt("id pair array", bytes.len()));
    }
    Ok(payload
        .chunks_exact(16)
        .map(|c| {
            [
                NodeId(u64::from_le_bytes(c[..8].try_into().unwrap())),
                NodeId(u64::from_le_bytes(c[8..].try_into().unwrap())),
            ]
        })
        .collect())
}

pub fn encode_f32s(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + 4 * values.len());
    bytes.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn decode_f32s(bytes: &[u8]) -> Result<Vec<f32>> {
    let (count, payload) = split_count(bytes)?;
    if payload.len() != 4 * count {
        return Err(corrupt("f32 array", bytes.len()));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn split_count(bytes: &[u8]) -> Result<(usize, &[u8])> {
    if bytes.len() < 4 {
        return Err(corrupt("count prefix", bytes.len()));
    }
    let count = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
    Ok((count, &bytes[4..]))
}

fn corrupt(what: &str, len: usize) -> ChunkedGraphError {
    ChunkedGraphError::Internal(format!("corrupt {} cell of {} bytes", what, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codecs_round_trip() {
        assert_eq!(decode_u64(&encode_u64(42)).unwrap(), 42);
        let ids = vec![NodeId(1), NodeId(u64::MAX)];
        assert_eq!(decode_ids(&encode_ids(&ids)).unwrap(), ids);
        let pairs = vec![[NodeId(1), NodeId(2)], [NodeId(3), NodeId(4)]];
        assert_eq!(decode_id_pairs(&encode_id_pairs(&pairs)).unwrap(), pairs);
        let affs = vec![0.5, f32::INFINITY];
        assert_eq!(decode_f32s(&encode_f32s(&affs)).unwrap(), affs);
        assert_eq!(decode_u64s(&encode_u64s(&[])).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn truncated_cells_are_rejected() {
        assert!(decode_u64(&[1, 2, 3]).is_err());
        let mut bytes = encode_u64s(&[1, 2, 3]);
        bytes.pop();
        assert!(decode_u64s(&bytes).is_err());
    }

    #[test]
    fn every_attribute_has_a_distinct_column() {
        let attrs = [
            Attribute::Parent,
            Attribute::Children,
            Attribute::FormerRoots,
            Attribute::NewRoots,
            Attribute::CrossChunkEdges(2),
            Attribute::CrossChunkEdges(3),
            Attribute::AtomicPartners,
            Attribute::Connected,
            Attribute::Affinities,
            Attribute::Areas,
            Attribute::Lock,
            Attribute::Counter,
            Attribute::GraphMeta,
            Attribute::OperationLog,
        ];
        for (i, a) in attrs.iter().enumerate() {
            for b in &attrs[i + 1..] {
                assert!(a.family() != b.family() || a.qualifier() != b.qualifier());
            }
        }
    }
}
