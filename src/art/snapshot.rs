//! Breadth-first binary snapshots of a tree.
//!
//! A snapshot is a flat sequence of per-node records in BFS order, the
//! root first. Each record is a 12-byte header followed by the layout's
//! shape data, plus the stored values when the node is a leaf:
//!
//! | layout  | shape data        | leaf values |
//! |---------|-------------------|-------------|
//! | Node4   | 4 key bytes       | 4 x u64     |
//! | Node16  | 16 key bytes      | 16 x u64    |
//! | Node48  | 256 index bytes   | 48 x u64    |
//! | Node256 | 32-byte bitmap    | 256 x u64   |
//!
//! Inner records carry only the shape; children are the following
//! records and reattach positionally, in ascending byte order. All
//! multi-byte fields are little endian, so a snapshot written on one
//! machine reads back on another.

use std::collections::VecDeque;

use log::debug;
use thiserror::Error;

use super::node::{Node, NodeType, Repr, Slot, MAX_PREFIX};
use super::{ArtTree, MemoryStats, Value};

/// Initial buffer capacity for a snapshot write.
const INITIAL_CAPACITY: usize = 1 << 20;

const RECORD_HEADER_LEN: usize = 12;
const FLAG_LEAF: u8 = 1;

/// A malformed snapshot buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    /// The buffer ended in the middle of a record.
    #[error("snapshot truncated at byte {0}")]
    Truncated(usize),
    /// A record carried an unrecognized layout tag.
    #[error("unknown node type tag {tag} at byte {offset}")]
    UnknownNodeType {
        /// The unrecognized tag byte.
        tag: u8,
        /// Byte offset of the record.
        offset: usize,
    },
    /// A record violated a structural invariant.
    #[error("invalid record at byte {offset}: {reason}")]
    InvalidRecord {
        /// Byte offset of the record.
        offset: usize,
        /// Which invariant failed.
        reason: &'static str,
    },
    /// The number of records disagrees with the recorded child counts.
    #[error("child records do not match the recorded child counts")]
    ChildCountMismatch,
}

impl ArtTree {
    /// Writes the whole tree into a fresh byte buffer.
    ///
    /// The buffer starts at 1 MiB and grows as needed; a cleared tree
    /// produces an empty buffer.
    pub fn serialize(&self) -> Vec<u8> {
        self.serialize_with_capacity(INITIAL_CAPACITY)
    }

    /// Like [`ArtTree::serialize`] with a caller-provided initial
    /// buffer capacity, for callers that know their snapshot size.
    pub fn serialize_with_capacity(&self, capacity: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(capacity);
        let Some(root) = self.root() else {
            return buf;
        };
        let mut count = 0usize;
        let mut queue: VecDeque<&Node> = VecDeque::new();
        queue.push_back(root);
        while let Some(node) = queue.pop_front() {
            write_record(&mut buf, node);
            count += 1;
            if !node.header.is_leaf {
                node.for_each_child(|child| queue.push_back(child));
            }
        }
        debug!("serialized {count} nodes into {} bytes", buf.len());
        buf
    }

    /// Rebuilds a tree from a snapshot buffer.
    ///
    /// Every structural invariant is checked; a malformed buffer yields
    /// a typed error and no tree.
    pub fn deserialize(bytes: &[u8]) -> Result<ArtTree, SnapshotError> {
        if bytes.is_empty() {
            return Ok(ArtTree::from_parts(None, MemoryStats::default(), 0));
        }

        let mut stats = MemoryStats::default();
        let mut cursor = Cursor { buf: bytes, pos: 0 };
        let mut records = Vec::new();
        while cursor.remaining() > 0 {
            records.push(parse_record(&mut cursor, &mut stats)?);
        }
        let n = records.len();

        // Record order equals BFS pop order, so one cursor pass hands
        // every inner record its contiguous run of child records. A
        // record's children always come strictly after it; anything
        // else cannot be a BFS image.
        let mut starts = vec![0usize; n];
        let mut next = 1usize;
        for (i, record) in records.iter().enumerate() {
            let header = &record.node.header;
            if header.is_leaf {
                continue;
            }
            if next <= i {
                return Err(SnapshotError::ChildCountMismatch);
            }
            starts[i] = next;
            next += header.child_count as usize;
            if next > n {
                return Err(SnapshotError::ChildCountMismatch);
            }
        }
        if next != n {
            return Err(SnapshotError::ChildCountMismatch);
        }

        // Leaves must sit exactly where the eighth key byte indexes
        // them; anything else cannot have come from a real tree.
        let mut key_count = 0u64;
        let mut depths = vec![0u8; n];
        for (i, record) in records.iter().enumerate() {
            let header = &record.node.header;
            let depth = depths[i] as usize;
            if depth + header.prefix_len as usize > 7 {
                return Err(SnapshotError::InvalidRecord {
                    offset: record.offset,
                    reason: "prefix overruns the key",
                });
            }
            let at_leaf_depth = depth + header.prefix_len as usize == 7;
            if header.is_leaf != at_leaf_depth {
                return Err(SnapshotError::InvalidRecord {
                    offset: record.offset,
                    reason: "leaf flag disagrees with node depth",
                });
            }
            if header.is_leaf {
                key_count += header.child_count as u64;
            } else {
                let child_depth = (depth + header.prefix_len as usize + 1) as u8;
                for k in starts[i]..starts[i] + header.child_count as usize {
                    depths[k] = child_depth;
                }
            }
        }

        let mut presents = Vec::with_capacity(n);
        let mut nodes: Vec<Option<Box<Node>>> = Vec::with_capacity(n);
        for record in records {
            presents.push(record.present);
            nodes.push(Some(record.node));
        }

        // Children carry larger indices than their parents, so a
        // reverse pass attaches fully-built subtrees.
        for i in (0..n).rev() {
            let (is_leaf, cc) = {
                let header = &nodes[i].as_ref().expect("unattached record").header;
                (header.is_leaf, header.child_count as usize)
            };
            if is_leaf || cc == 0 {
                continue;
            }
            let mut kids = Vec::with_capacity(cc);
            for k in starts[i]..starts[i] + cc {
                kids.push(nodes[k].take().expect("child ranges are disjoint"));
            }
            let mut kids = kids.into_iter();
            let node = nodes[i].as_mut().expect("unattached record");
            match &mut node.repr {
                Repr::Node4 { children, .. } => {
                    for slot in children[..cc].iter_mut() {
                        *slot = Slot::Child(kids.next().expect("validated child count"));
                    }
                }
                Repr::Node16 { children, .. } => {
                    for slot in children[..cc].iter_mut() {
                        *slot = Slot::Child(kids.next().expect("validated child count"));
                    }
                }
                Repr::Node48 { index, children } => {
                    for b in 0..256usize {
                        let idx = index[b] as usize;
                        if idx > 0 {
                            children[idx - 1] =
                                Slot::Child(kids.next().expect("validated child count"));
                        }
                    }
                }
                Repr::Node256 { children } => {
                    let bytes_present =
                        presents[i].as_ref().expect("inner Node256 keeps its bitmap");
                    for &b in bytes_present {
                        children[b as usize] =
                            Slot::Child(kids.next().expect("validated child count"));
                    }
                }
            }
            debug_assert!(kids.next().is_none());
        }

        let root = nodes[0].take().expect("root record exists");
        debug!(
            "restored {n} nodes ({key_count} keys) from {} bytes",
            bytes.len()
        );
        Ok(ArtTree::from_parts(Some(root), stats, key_count))
    }
}

fn write_record(buf: &mut Vec<u8>, node: &Node) {
    let header = &node.header;
    buf.extend_from_slice(&header.child_count.to_le_bytes());
    buf.push(header.prefix_len);
    buf.extend_from_slice(&header.prefix);
    buf.push(node.node_type().tag());
    buf.push(if header.is_leaf { FLAG_LEAF } else { 0 });
    match &node.repr {
        Repr::Node4 { keys, children } => {
            buf.extend_from_slice(keys);
            if header.is_leaf {
                write_values(buf, children.iter());
            }
        }
        Repr::Node16 { keys, children } => {
            buf.extend_from_slice(keys);
            if header.is_leaf {
                write_values(buf, children.iter());
            }
        }
        Repr::Node48 { index, children } => {
            buf.extend_from_slice(&index[..]);
            if header.is_leaf {
                write_values(buf, children.iter());
            }
        }
        Repr::Node256 { children } => {
            let mut bitmap = [0u8; 32];
            for (b, slot) in children.iter().enumerate() {
                if !slot.is_empty() {
                    bitmap[b / 8] |= 1 << (b % 8);
                }
            }
            buf.extend_from_slice(&bitmap);
            if header.is_leaf {
                write_values(buf, children.iter());
            }
        }
    }
}

fn write_values<'a>(buf: &mut Vec<u8>, slots: impl Iterator<Item = &'a Slot>) {
    for slot in slots {
        debug_assert!(!matches!(slot, Slot::Child(_)));
        buf.extend_from_slice(&slot.value().0.to_le_bytes());
    }
}

struct RawRecord {
    offset: usize,
    node: Box<Node>,
    /// Key bytes flagged present in an inner Node256 bitmap, kept until
    /// the children are attached.
    present: Option<Vec<u8>>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        if self.remaining() < n {
            return Err(SnapshotError::Truncated(self.pos));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16_le(&mut self) -> Result<u16, SnapshotError> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn take_u64_le(&mut self) -> Result<u64, SnapshotError> {
        let raw: [u8; 8] = self.take(8)?.try_into().expect("fixed-size read");
        Ok(u64::from_le_bytes(raw))
    }
}

fn parse_record(cursor: &mut Cursor<'_>, stats: &mut MemoryStats) -> Result<RawRecord, SnapshotError> {
    let offset = cursor.pos;
    let invalid = |reason| SnapshotError::InvalidRecord { offset, reason };
    if cursor.remaining() < RECORD_HEADER_LEN {
        return Err(SnapshotError::Truncated(offset));
    }

    let child_count = cursor.take_u16_le()?;
    let prefix_len = cursor.take_u8()?;
    let prefix: [u8; MAX_PREFIX] = cursor.take(MAX_PREFIX)?.try_into().expect("fixed-size read");
    let tag = cursor.take_u8()?;
    let flags = cursor.take_u8()?;

    let ty = NodeType::from_tag(tag).ok_or(SnapshotError::UnknownNodeType { tag, offset })?;
    if flags & !FLAG_LEAF != 0 {
        return Err(invalid("unknown flag bits"));
    }
    let is_leaf = flags & FLAG_LEAF != 0;
    if prefix_len as usize > MAX_PREFIX {
        return Err(invalid("prefix length exceeds 7"));
    }
    if child_count as usize > ty.capacity() {
        return Err(invalid("child count exceeds capacity"));
    }

    let mut node = Node::alloc(ty, stats);
    node.header.child_count = child_count;
    node.header.prefix_len = prefix_len;
    node.header.prefix = prefix;
    node.header.is_leaf = is_leaf;

    let cc = child_count as usize;
    let mut present = None;
    match &mut node.repr {
        Repr::Node4 { keys, children } => {
            keys.copy_from_slice(cursor.take(4)?);
            if !strictly_ascending(&keys[..cc]) {
                return Err(invalid("keys not strictly ascending"));
            }
            if is_leaf {
                for (j, slot) in children.iter_mut().enumerate() {
                    let raw = cursor.take_u64_le()?;
                    if j < cc {
                        *slot = Slot::Value(Value(raw));
                    }
                }
            }
        }
        Repr::Node16 { keys, children } => {
            keys.copy_from_slice(cursor.take(16)?);
            if !strictly_ascending(&keys[..cc]) {
                return Err(invalid("keys not strictly ascending"));
            }
            if is_leaf {
                for (j, slot) in children.iter_mut().enumerate() {
                    let raw = cursor.take_u64_le()?;
                    if j < cc {
                        *slot = Slot::Value(Value(raw));
                    }
                }
            }
        }
        Repr::Node48 { index, children } => {
            index.copy_from_slice(cursor.take(256)?);
            let mut seen = [false; 48];
            let mut populated = 0usize;
            for b in 0..256usize {
                let idx = index[b] as usize;
                if idx == 0 {
                    continue;
                }
                if idx > 48 {
                    return Err(invalid("slot index out of range"));
                }
                if seen[idx - 1] {
                    return Err(invalid("duplicate slot index"));
                }
                seen[idx - 1] = true;
                populated += 1;
            }
            if populated != cc {
                return Err(invalid("index population disagrees with child count"));
            }
            if is_leaf {
                let mut values = [0u64; 48];
                for value in values.iter_mut() {
                    *value = cursor.take_u64_le()?;
                }
                for b in 0..256usize {
                    let idx = index[b] as usize;
                    if idx > 0 {
                        children[idx - 1] = Slot::Value(Value(values[idx - 1]));
                    }
                }
            }
        }
        Repr::Node256 { children } => {
            let bitmap: [u8; 32] = cursor.take(32)?.try_into().expect("fixed-size read");
            let mut bytes_present = Vec::with_capacity(cc);
            for b in 0..256usize {
                if bitmap[b / 8] & (1 << (b % 8)) != 0 {
                    bytes_present.push(b as u8);
                }
            }
            if bytes_present.len() != cc {
                return Err(invalid("bitmap population disagrees with child count"));
            }
            if is_leaf {
                for b in 0..256usize {
                    let raw = cursor.take_u64_le()?;
                    if bitmap[b / 8] & (1 << (b % 8)) != 0 {
                        children[b] = Slot::Value(Value(raw));
                    }
                }
            } else {
                present = Some(bytes_present);
            }
        }
    }

    Ok(RawRecord {
        offset,
        node,
        present,
    })
}

fn strictly_ascending(keys: &[u8]) -> bool {
    keys.windows(2).all(|w| w[0] < w[1])
}
