//! Adaptive Radix Tree (ART) over fixed-width 64-bit keys.
//!
//! Based on "The Adaptive Radix Tree: ARTful Indexing for Main-Memory
//! Databases" by Leis et al., 2013, specialized for `u64` keys:
//!
//! - Keys traverse in big-endian byte order, so byte-lexicographic
//!   order equals numeric order.
//! - Depths 0-6 hold inner nodes; every depth-7 node is a leaf whose
//!   slots store opaque user values rather than child pointers.
//! - A contiguous run of keys sharing their upper 7 bytes can be
//!   written with one value in a single leaf operation.
//! - Path compression folds up to 7 singleton levels into a node's
//!   prefix.

mod debug;
mod node;
pub mod snapshot;

use log::debug;

pub use node::NodeType;
pub use snapshot::SnapshotError;

use node::{Node, Slot};

/// Opaque pointer-sized token stored in the tree.
///
/// The tree never interprets or owns the bits. The all-zero token is
/// the null sentinel handed back for absent keys; storing it is
/// allowed and the key still counts as present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Value(
    /// Raw token bits.
    pub u64,
);

impl Value {
    /// The null token, returned for absent keys.
    pub const NULL: Value = Value(0);

    /// Returns true for the null token.
    pub fn is_null(self) -> bool {
        self == Value::NULL
    }
}

impl From<u64> for Value {
    fn from(raw: u64) -> Self {
        Value(raw)
    }
}

/// Node allocation statistics for the tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Number of live Node4 instances.
    pub node4_count: usize,
    /// Number of live Node16 instances.
    pub node16_count: usize,
    /// Number of live Node48 instances.
    pub node48_count: usize,
    /// Number of live Node256 instances.
    pub node256_count: usize,
    /// Bytes currently allocated for nodes, including their out-of-line
    /// slot arrays.
    pub node_bytes: u64,
}

impl MemoryStats {
    pub(crate) fn on_alloc(&mut self, ty: NodeType) {
        match ty {
            NodeType::Node4 => self.node4_count += 1,
            NodeType::Node16 => self.node16_count += 1,
            NodeType::Node48 => self.node48_count += 1,
            NodeType::Node256 => self.node256_count += 1,
        }
        self.node_bytes += ty.footprint();
    }

    pub(crate) fn on_free(&mut self, ty: NodeType) {
        match ty {
            NodeType::Node4 => self.node4_count -= 1,
            NodeType::Node16 => self.node16_count -= 1,
            NodeType::Node48 => self.node48_count -= 1,
            NodeType::Node256 => self.node256_count -= 1,
        }
        self.node_bytes -= ty.footprint();
    }
}

/// An adaptive radix tree mapping `u64` keys to opaque values.
#[derive(Debug)]
pub struct ArtTree {
    root: Option<Box<Node>>,
    stats: MemoryStats,
    key_count: u64,
}

impl ArtTree {
    /// Creates an empty tree with a Node4 root.
    pub fn new() -> Self {
        let mut stats = MemoryStats::default();
        let root = Node::alloc(NodeType::Node4, &mut stats);
        ArtTree {
            root: Some(root),
            stats,
            key_count: 0,
        }
    }

    pub(crate) fn from_parts(root: Option<Box<Node>>, stats: MemoryStats, key_count: u64) -> Self {
        ArtTree {
            root,
            stats,
            key_count,
        }
    }

    pub(crate) fn root(&self) -> Option<&Node> {
        self.root.as_deref()
    }

    /// Binds `value` to `key`, overwriting any previous binding.
    pub fn insert(&mut self, key: u64, value: Value) {
        self.insert_run(key, 1, value);
    }

    /// Binds `value` to every key in `[start, start + length)`.
    ///
    /// The run must stay under one leaf: `start % 256 + length <= 256`
    /// and `length > 0`. Violations are contract failures and panic.
    pub fn range_insert(&mut self, start: u64, length: u32, value: Value) {
        assert!(length > 0, "range_insert requires a non-empty run");
        assert!(
            start % 256 + length as u64 <= 256,
            "range_insert run must not cross a leaf boundary: start % 256 + length <= 256",
        );
        self.insert_run(start, length, value);
    }

    fn insert_run(&mut self, start: u64, length: u32, value: Value) {
        let key = start.to_be_bytes();
        let root = self.root.take();
        let (root, added) = Self::insert_rec(root, &key, length, value, 0, &mut self.stats);
        self.root = Some(root);
        self.key_count += added as u64;
    }

    /// Recursive descent for point and range inserts. Takes the node
    /// out of its slot and returns the (possibly replaced) node plus
    /// the number of slots that went from empty to occupied.
    fn insert_rec(
        node: Option<Box<Node>>,
        key: &[u8; 8],
        length: u32,
        value: Value,
        depth: usize,
        stats: &mut MemoryStats,
    ) -> (Box<Node>, u32) {
        let Some(mut node) = node else {
            return Self::make_run_node(key, length, value, depth, stats);
        };

        let mut depth = depth;
        if depth < 7 && node.header.prefix_len > 0 {
            let plen = node.header.prefix_len as usize;
            let p = node.header.common_prefix_len(key, depth);
            if p < plen {
                // Split: a fresh Node4 takes the common part, the old
                // node keeps its tail, and the new run gets its own
                // leaf under the diverging byte.
                let mut parent = Node::alloc(NodeType::Node4, stats);
                parent.header.prefix_len = p as u8;
                parent.header.prefix[..p].copy_from_slice(&node.header.prefix[..p]);

                let old_byte = node.header.prefix[p];
                let rest = plen - p - 1;
                node.header.prefix.copy_within(p + 1..p + 1 + rest, 0);
                node.header.prefix_len = rest as u8;

                let (leaf, added) =
                    Self::make_run_node(key, length, value, depth + p + 1, stats);
                parent.add_child(key[depth + p], Slot::Child(leaf), stats);
                parent.add_child(old_byte, Slot::Child(node), stats);
                return (parent, added);
            }
            depth += plen;
        }

        if depth == 7 {
            let added = node.add_leaf_run(key[7], length, value, stats);
            return (node, added);
        }

        let byte = key[depth];
        if let Some(slot) = node.find_child_mut(byte) {
            let Slot::Child(child) = std::mem::replace(slot, Slot::Empty) else {
                unreachable!("inner slot must hold a child node");
            };
            let (child, added) = Self::insert_rec(Some(child), key, length, value, depth + 1, stats);
            *slot = Slot::Child(child);
            (node, added)
        } else {
            let (leaf, added) = Self::make_run_node(key, length, value, depth + 1, stats);
            node.add_child(byte, Slot::Child(leaf), stats);
            (node, added)
        }
    }

    /// Allocates the leaf for a run whose own depth is `depth`, folding
    /// the remaining key bytes before the final one into its prefix.
    fn make_run_node(
        key: &[u8; 8],
        length: u32,
        value: Value,
        depth: usize,
        stats: &mut MemoryStats,
    ) -> (Box<Node>, u32) {
        let mut node = Node::alloc(NodeType::sized_for_run(length), stats);
        let plen = 7 - depth;
        node.header.prefix[..plen].copy_from_slice(&key[depth..7]);
        node.header.prefix_len = plen as u8;
        node.header.is_leaf = true;
        let added = node.add_leaf_run(key[7], length, value, stats);
        (node, added)
    }

    /// Returns the value bound to `key`, or the null token.
    pub fn search(&self, key: u64) -> Value {
        let bytes = key.to_be_bytes();
        let Some(mut node) = self.root.as_deref() else {
            return Value::NULL;
        };
        let mut depth = 0usize;
        loop {
            if node.header.prefix_len > 0 {
                let plen = node.header.prefix_len as usize;
                if node.header.common_prefix_len(&bytes, depth) < plen {
                    return Value::NULL;
                }
                depth += plen;
            }
            if depth == 7 {
                return match node.find_child(bytes[7]) {
                    Some(slot) => slot.value(),
                    None => Value::NULL,
                };
            }
            match node.find_child(bytes[depth]) {
                Some(Slot::Child(child)) => {
                    node = child.as_ref();
                    depth += 1;
                }
                _ => return Value::NULL,
            }
        }
    }

    /// Returns the values bound to `[start, start + length)`, with the
    /// null token for absent keys.
    ///
    /// The same single-leaf precondition as [`ArtTree::range_insert`]
    /// applies.
    pub fn range_query(&self, start: u64, length: u32) -> Vec<Value> {
        assert!(length > 0, "range_query requires a non-empty run");
        assert!(
            start % 256 + length as u64 <= 256,
            "range_query run must not cross a leaf boundary: start % 256 + length <= 256",
        );
        let bytes = start.to_be_bytes();
        let Some(mut node) = self.root.as_deref() else {
            return vec![Value::NULL; length as usize];
        };
        let mut depth = 0usize;
        loop {
            if node.header.prefix_len > 0 {
                let plen = node.header.prefix_len as usize;
                if node.header.common_prefix_len(&bytes, depth) < plen {
                    return vec![Value::NULL; length as usize];
                }
                depth += plen;
            }
            if depth == 7 {
                return node.find_leaf_run(bytes[7], length);
            }
            match node.find_child(bytes[depth]) {
                Some(Slot::Child(child)) => {
                    node = child.as_ref();
                    depth += 1;
                }
                _ => return vec![Value::NULL; length as usize],
            }
        }
    }

    /// Number of keys currently bound to a value.
    pub fn len(&self) -> u64 {
        self.key_count
    }

    /// Returns true when no key is bound.
    pub fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    /// Bytes currently allocated for nodes.
    pub fn memory_usage(&self) -> u64 {
        self.stats.node_bytes
    }

    /// Per-layout allocation breakdown.
    pub fn memory_stats(&self) -> MemoryStats {
        self.stats
    }

    /// Frees every node. Usage drops to zero; the tree stays usable and
    /// the next insert rebuilds a root lazily.
    pub fn clear(&mut self) {
        let released = self.stats.node_bytes;
        self.root = None;
        self.stats = MemoryStats::default();
        self.key_count = 0;
        debug!("cleared tree, released {released} bytes");
    }
}

impl Default for ArtTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn assert_run(tree: &ArtTree, start: u64, length: u32, expected: Value) {
        let vals = tree.range_query(start, length);
        assert_eq!(vals.len(), length as usize);
        for (i, v) in vals.iter().enumerate() {
            assert_eq!(*v, expected, "key {}", start + i as u64);
        }
    }

    #[test]
    fn simple_insert_search() {
        let mut tree = ArtTree::new();

        tree.insert(100, Value(0xDEAD));
        assert_eq!(tree.search(100), Value(0xDEAD));
        assert_eq!(tree.search(101), Value::NULL);

        tree.insert(1001, Value::NULL);
        tree.insert(1003, Value::NULL);
        tree.insert(1005, Value::NULL);
        assert_eq!(tree.search(1001), Value::NULL);
        assert_eq!(tree.search(1002), Value::NULL);
        assert_eq!(tree.search(1003), Value::NULL);

        tree.insert(1111111111, Value(7));
        tree.insert(1111111112, Value(8));
        assert_eq!(tree.search(1111111111), Value(7));
        assert_eq!(tree.search(1111111112), Value(8));
    }

    #[test]
    fn overwrite_takes_latest() {
        let mut tree = ArtTree::new();
        tree.insert(42, Value(1));
        tree.insert(42, Value(2));
        assert_eq!(tree.search(42), Value(2));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn null_values_count_as_present() {
        let mut tree = ArtTree::new();
        tree.insert(9, Value::NULL);
        tree.insert(9, Value::NULL);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.search(9), Value::NULL);
    }

    #[test]
    fn leaf_fills_through_every_layout() {
        for count in [4u64, 16, 48, 256] {
            let mut tree = ArtTree::new();
            for i in 0..count {
                tree.insert(0x4000 + i, Value(i + 1));
            }
            for i in 0..count {
                assert_eq!(tree.search(0x4000 + i), Value(i + 1), "count {count} key {i}");
            }
            assert_eq!(tree.search(0x4000 + count), Value::NULL);
            assert_eq!(tree.len(), count);
        }
    }

    #[test]
    fn prefix_split_on_shared_upper_bytes() {
        let mut tree = ArtTree::new();
        let keys = [
            u64::from_be_bytes(*b"aabcdef1"),
            u64::from_be_bytes(*b"aabcdef2"),
            u64::from_be_bytes(*b"aabcdef3"),
            u64::from_be_bytes(*b"aabchgi1"),
        ];
        for (i, &k) in keys.iter().enumerate() {
            tree.insert(k, Value(i as u64 + 1));
        }
        for (i, &k) in keys.iter().enumerate() {
            assert_eq!(tree.search(k), Value(i as u64 + 1));
        }
        assert_eq!(tree.search(u64::from_be_bytes(*b"aabchgi2")), Value::NULL);
        assert_eq!(tree.len(), 4);
        assert!(tree.verify_integrity().is_empty());
    }

    #[test]
    fn range_insert_basic() {
        let mut tree = ArtTree::new();

        tree.range_insert(0, 32, Value(12345));
        assert_run(&tree, 0, 32, Value(12345));

        tree.range_insert(32, 224, Value(54321));
        assert_run(&tree, 0, 32, Value(12345));
        assert_run(&tree, 32, 224, Value(54321));

        tree.range_insert(0, 1, Value(9));
        tree.range_insert(1, 1, Value(9));
        assert_run(&tree, 0, 1, Value(9));
        assert_run(&tree, 1, 1, Value(9));
        assert_run(&tree, 2, 30, Value(12345));
        assert_run(&tree, 32, 224, Value(54321));
        assert_eq!(tree.len(), 256);
    }

    #[test]
    fn range_insert_single_then_bulk_overwrites() {
        let mut tree = ArtTree::new();
        for i in 0..256u64 {
            tree.range_insert(i, 1, Value(12345));
        }
        assert_run(&tree, 0, 256, Value(12345));

        tree.range_insert(0, 256, Value(11111));
        for i in 0..256u64 {
            assert_run(&tree, i, 1, Value(11111));
        }

        tree.range_insert(0, 120, Value(22222));
        tree.range_insert(60, 120, Value(33333));
        assert_run(&tree, 0, 60, Value(22222));
        assert_run(&tree, 60, 120, Value(33333));
        assert_eq!(tree.len(), 256);
    }

    #[test]
    fn range_query_on_absent_keys() {
        let tree = ArtTree::new();
        let vals = tree.range_query(0x12345678, 64);
        assert_eq!(vals.len(), 64);
        assert!(vals.iter().all(|v| v.is_null()));

        let mut tree = ArtTree::new();
        tree.insert(1 << 40, Value(5));
        let vals = tree.range_query(0, 16);
        assert!(vals.iter().all(|v| v.is_null()));
    }

    #[test]
    #[should_panic(expected = "leaf boundary")]
    fn range_insert_rejects_straddling_runs() {
        let mut tree = ArtTree::new();
        tree.range_insert(250, 10, Value(1));
    }

    #[test]
    fn memory_usage_tracks_allocations() {
        let mut tree = ArtTree::new();
        assert_eq!(tree.memory_usage(), NodeType::Node4.footprint());

        tree.insert(1, Value(1));
        let after_one = tree.memory_usage();
        assert!(after_one > NodeType::Node4.footprint());

        // Five distinct top bytes force the root through Node4 -> Node16.
        for i in 0..5u64 {
            tree.insert(i << 56, Value(i + 1));
        }
        assert!(tree.memory_usage() > after_one);
        assert_eq!(tree.memory_stats().node16_count, 1);

        tree.clear();
        assert_eq!(tree.memory_usage(), 0);
        assert_eq!(tree.memory_stats(), MemoryStats::default());
        assert_eq!(tree.len(), 0);
    }

    #[test]
    fn cleared_tree_is_reusable() {
        let mut tree = ArtTree::new();
        tree.range_insert(512, 128, Value(1));
        tree.clear();
        assert_eq!(tree.search(512), Value::NULL);

        tree.insert(512, Value(2));
        tree.insert(513, Value(3));
        assert_eq!(tree.search(512), Value(2));
        assert_eq!(tree.search(513), Value(3));
        assert!(tree.verify_integrity().is_empty());
    }

    #[test]
    fn random_inserts_match_model() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut tree = ArtTree::new();
        let mut model: BTreeMap<u64, u64> = BTreeMap::new();

        for _ in 0..10_000 {
            let key: u64 = rng.gen();
            let val: u64 = rng.gen_range(1..u64::MAX);
            tree.insert(key, Value(val));
            model.insert(key, val);
        }

        for (&k, &v) in &model {
            assert_eq!(tree.search(k), Value(v), "key {k:#x}");
        }
        assert_eq!(tree.len(), model.len() as u64);
        assert!(tree.verify_integrity().is_empty());
    }

    #[test]
    fn random_range_inserts_match_model() {
        let mut rng = StdRng::seed_from_u64(0xA57);
        let mut tree = ArtTree::new();
        let mut model: BTreeMap<u64, u64> = BTreeMap::new();

        for _ in 0..2_000 {
            let start: u64 = rng.gen();
            let cap = 256 - (start % 256) as u32;
            let length = rng.gen_range(1..=cap);
            let val: u64 = rng.gen_range(1..u64::MAX);
            tree.range_insert(start, length, Value(val));
            for i in 0..length as u64 {
                model.insert(start + i, val);
            }
        }

        for (&k, &v) in &model {
            assert_run(&tree, k, 1, Value(v));
        }
        assert_eq!(tree.len(), model.len() as u64);
        assert!(tree.verify_integrity().is_empty());
    }
}
