use crate::attributes::Attribute;
use crate::id::NodeId;

/// Row-key categories. Node and chunk rows share the id keyspace (a chunk row
/// is the id with segment zero, which is never allocated to a node).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum RowKey {
    Id(NodeId),
    Operation(u64),
    Meta,
    OperationCounter,
}

impl RowKey {
    /// We implement this manually so we have control over the `Ord` as
    /// interpreted by `sled`: ids sort numerically within their category.
    pub fn into_sled_bytes(self) -> [u8; 9] {
        let (tag, payload) = match self {
            RowKey::Id(id) => (0u8, id.0),
            RowKey::Operation(op) => (1, op),
            RowKey::Meta => (2, 0),
            RowKey::OperationCounter => (3, 0),
        };
        let mut bytes = [0; 9];
        bytes[0] = tag;
        bytes[1..].copy_from_slice(&payload.to_be_bytes());
        bytes
    }

    pub fn from_sled_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 9 {
            return None;
        }
        let payload = u64::from_be_bytes(bytes[1..9].try_into().unwrap());
        match bytes[0] {
            0 => Some(RowKey::Id(NodeId(payload))),
            1 => Some(RowKey::Operation(payload)),
            2 => Some(RowKey::Meta),
            3 => Some(RowKey::OperationCounter),
            _ => None,
        }
    }
}

/// One cell address within a family tree: row, column qualifier, timestamp.
///
/// The timestamp is stored bit-inverted so that a prefix scan over
/// `row + qualifier` visits cells newest first, which is the order every read
/// path wants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CellKey {
    pub row: RowKey,
    pub qualifier: [u8; 2],
    pub timestamp: u64,
}

impl CellKey {
    pub fn new(row: RowKey, attribute: Attribute, timestamp: u64) -> Self {
        Self {
            row,
            qualifier: attribute.qualifier(),
            timestamp,
        }
    }

    pub fn into_sled_key(self) -> [u8; 19] {
        let mut bytes = [0; 19];
        bytes[..9].copy_from_slice(&self.row.into_sled_bytes());
        bytes[9..11].copy_from_slice(&self.qualifier);
        bytes[11..].copy_from_slice(&(!self.timestamp).to_be_bytes());
        bytes
    }

    pub fn from_sled_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 19 {
            return None;
        }
        Some(Self {
            row: RowKey::from_sled_bytes(&bytes[..9])?,
            qualifier: [bytes[9], bytes[10]],
            timestamp: !u64::from_be_bytes(bytes[11..].try_into().unwrap()),
        })
    }

    /// First possible key of a column, i.e. the newest conceivable cell.
    pub fn column_start(row: RowKey, attribute: Attribute) -> [u8; 19] {
        CellKey::new(row, attribute, u64::MAX).into_sled_key()
    }

    /// Last possible key of a column, i.e. the oldest conceivable cell.
    pub fn column_end(row: RowKey, attribute: Attribute) -> [u8; 19] {
        CellKey::new(row, attribute, 0).into_sled_key()
    }

    /// First possible key of an entire row, across all columns.
    pub fn row_start(row: RowKey) -> [u8; 19] {
        let mut bytes = [0; 19];
        bytes[..9].copy_from_slice(&row.into_sled_bytes());
        bytes
    }

    /// Last possible key of an entire row, across all columns.
    pub fn row_end(row: RowKey) -> [u8; 19] {
        let mut bytes = [0xff; 19];
        bytes[..9].copy_from_slice(&row.into_sled_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip() {
        let key = CellKey::new(
            RowKey::Id(NodeId(0x0123_4567_89ab_cdef)),
            Attribute::Parent,
            987_654_321,
        );
        assert_eq!(CellKey::from_sled_key(&key.into_sled_key()), Some(key));

        let op = CellKey::new(RowKey::Operation(17), Attribute::OperationLog, 1);
        assert_eq!(CellKey::from_sled_key(&op.into_sled_key()), Some(op));
    }

    #[test]
    fn newer_cells_sort_first_within_a_column() {
        let row = RowKey::Id(NodeId(42));
        let older = CellKey::new(row, Attribute::Parent, 100).into_sled_key();
        let newer = CellKey::new(row, Attribute::Parent, 200).into_sled_key();
        assert!(newer < older);
        assert!(CellKey::column_start(row, Attribute::Parent) <= newer);
        assert!(older <= CellKey::column_end(row, Attribute::Parent));
    }

    #[test]
    fn rows_group_before_qualifiers() {
        let a = CellKey::new(RowKey::Id(NodeId(1)), Attribute::Areas, 5).into_sled_key();
        let b = CellKey::new(RowKey::Id(NodeId(2)), Attribute::Parent, 5).into_sled_key();
        assert!(a < b);
    }
}
