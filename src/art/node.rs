//! ART node types with adaptive sizing.
//!
//! Four layouts share a common header and are swapped in place as a node
//! fills up:
//!
//! - Node4: up to 4 children (most common, smallest)
//! - Node16: 5-16 children (sorted keys, 16-lane SIMD search)
//! - Node48: 17-48 children (256-byte index + 48 slots)
//! - Node256: 49-256 children (direct array indexing)
//!
//! Depth-7 nodes are leaves: their slots hold user values instead of
//! child nodes, and a whole run of consecutive key bytes can be written
//! into one leaf in a single call.

use log::trace;

use super::{MemoryStats, Value};

/// Maximum number of compressed prefix bytes a node can carry.
pub(crate) const MAX_PREFIX: usize = 7;

/// The capacity class of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeType {
    /// Up to 4 children.
    Node4,
    /// Up to 16 children.
    Node16,
    /// Up to 48 children.
    Node48,
    /// Up to 256 children.
    Node256,
}

impl NodeType {
    /// Maximum number of occupied slots for this layout.
    pub fn capacity(self) -> usize {
        match self {
            NodeType::Node4 => 4,
            NodeType::Node16 => 16,
            NodeType::Node48 => 48,
            NodeType::Node256 => 256,
        }
    }

    /// Smallest layout able to hold a fresh run of `length` entries.
    pub(crate) fn sized_for_run(length: u32) -> NodeType {
        if length < 5 {
            NodeType::Node4
        } else if length < 17 {
            NodeType::Node16
        } else if length < 49 {
            NodeType::Node48
        } else {
            NodeType::Node256
        }
    }

    /// Growth target for a leaf that must hold `total` entries in the
    /// worst case. Never called for totals that already fit.
    pub(crate) fn leaf_growth_target(total: u32) -> NodeType {
        if total > 48 {
            NodeType::Node256
        } else if total > 16 {
            NodeType::Node48
        } else {
            NodeType::Node16
        }
    }

    pub(crate) fn next_larger(self) -> NodeType {
        match self {
            NodeType::Node4 => NodeType::Node16,
            NodeType::Node16 => NodeType::Node48,
            NodeType::Node48 => NodeType::Node256,
            NodeType::Node256 => panic!("Node256 cannot grow"),
        }
    }

    /// Heap footprint of one node with this layout, including the
    /// out-of-line slot arrays.
    pub(crate) fn footprint(self) -> u64 {
        let body = std::mem::size_of::<Node>();
        let heap = match self {
            NodeType::Node4 => std::mem::size_of::<[Slot; 4]>(),
            NodeType::Node16 => std::mem::size_of::<[Slot; 16]>(),
            NodeType::Node48 => {
                std::mem::size_of::<[u8; 256]>() + std::mem::size_of::<[Slot; 48]>()
            }
            NodeType::Node256 => std::mem::size_of::<[Slot; 256]>(),
        };
        (body + heap) as u64
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            NodeType::Node4 => 0,
            NodeType::Node16 => 1,
            NodeType::Node48 => 2,
            NodeType::Node256 => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<NodeType> {
        match tag {
            0 => Some(NodeType::Node4),
            1 => Some(NodeType::Node16),
            2 => Some(NodeType::Node48),
            3 => Some(NodeType::Node256),
            _ => None,
        }
    }
}

/// Fields shared by every layout.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Header {
    /// Number of occupied slots.
    pub(crate) child_count: u16,
    /// Number of meaningful bytes in `prefix`.
    pub(crate) prefix_len: u8,
    /// Compressed path bytes that would otherwise be singleton levels.
    pub(crate) prefix: [u8; MAX_PREFIX],
    /// True only for depth-7 nodes, whose slots hold user values.
    pub(crate) is_leaf: bool,
}

impl Header {
    /// Length of the match between this node's prefix and `key` at
    /// `depth`. Equal to `prefix_len` on a full match.
    pub(crate) fn common_prefix_len(&self, key: &[u8; 8], depth: usize) -> usize {
        let limit = (self.prefix_len as usize).min(key.len().saturating_sub(depth));
        for i in 0..limit {
            if key[depth + i] != self.prefix[i] {
                return i;
            }
        }
        limit
    }
}

/// One child slot. Inner nodes hold `Empty`/`Child`, leaves hold
/// `Empty`/`Value`. A stored null token occupies its slot; `Empty` is
/// absence.
#[derive(Debug)]
pub(crate) enum Slot {
    Empty,
    Child(Box<Node>),
    Value(Value),
}

impl Slot {
    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    /// Stored token, or the null token for anything but a value slot.
    pub(crate) fn value(&self) -> Value {
        match self {
            Slot::Value(v) => *v,
            _ => Value::NULL,
        }
    }
}

/// Layout-specific node body.
#[derive(Debug)]
pub(crate) enum Repr {
    Node4 {
        keys: [u8; 4],
        children: Box<[Slot; 4]>,
    },
    Node16 {
        keys: [u8; 16],
        children: Box<[Slot; 16]>,
    },
    Node48 {
        /// 1-based position in `children` per key byte; 0 = absent.
        index: Box<[u8; 256]>,
        children: Box<[Slot; 48]>,
    },
    Node256 {
        children: Box<[Slot; 256]>,
    },
}

impl Repr {
    pub(crate) fn new(ty: NodeType) -> Repr {
        match ty {
            NodeType::Node4 => Repr::Node4 {
                keys: [0; 4],
                children: Box::new(std::array::from_fn(|_| Slot::Empty)),
            },
            NodeType::Node16 => Repr::Node16 {
                keys: [0; 16],
                children: Box::new(std::array::from_fn(|_| Slot::Empty)),
            },
            NodeType::Node48 => Repr::Node48 {
                index: Box::new([0; 256]),
                children: Box::new(std::array::from_fn(|_| Slot::Empty)),
            },
            NodeType::Node256 => Repr::Node256 {
                children: Box::new(std::array::from_fn(|_| Slot::Empty)),
            },
        }
    }

    pub(crate) fn node_type(&self) -> NodeType {
        match self {
            Repr::Node4 { .. } => NodeType::Node4,
            Repr::Node16 { .. } => NodeType::Node16,
            Repr::Node48 { .. } => NodeType::Node48,
            Repr::Node256 { .. } => NodeType::Node256,
        }
    }

    /// Drains every occupied slot in ascending byte order.
    fn into_entries(self, child_count: usize) -> Vec<(u8, Slot)> {
        let mut out = Vec::with_capacity(child_count);
        match self {
            Repr::Node4 { keys, mut children } => {
                for i in 0..child_count {
                    out.push((keys[i], std::mem::replace(&mut children[i], Slot::Empty)));
                }
            }
            Repr::Node16 { keys, mut children } => {
                for i in 0..child_count {
                    out.push((keys[i], std::mem::replace(&mut children[i], Slot::Empty)));
                }
            }
            Repr::Node48 {
                index,
                mut children,
            } => {
                for b in 0..256usize {
                    let idx = index[b];
                    if idx > 0 {
                        let slot = std::mem::replace(&mut children[idx as usize - 1], Slot::Empty);
                        out.push((b as u8, slot));
                    }
                }
            }
            Repr::Node256 { mut children } => {
                for b in 0..256usize {
                    if !children[b].is_empty() {
                        out.push((b as u8, std::mem::replace(&mut children[b], Slot::Empty)));
                    }
                }
            }
        }
        out
    }
}

/// A node in the adaptive radix tree.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) header: Header,
    pub(crate) repr: Repr,
}

impl Node {
    pub(crate) fn alloc(ty: NodeType, stats: &mut MemoryStats) -> Box<Node> {
        stats.on_alloc(ty);
        Box::new(Node {
            header: Header::default(),
            repr: Repr::new(ty),
        })
    }

    pub(crate) fn node_type(&self) -> NodeType {
        self.repr.node_type()
    }

    /// Returns the occupied slot mapped to `byte`, if any.
    pub(crate) fn find_child(&self, byte: u8) -> Option<&Slot> {
        let cc = self.header.child_count as usize;
        match &self.repr {
            Repr::Node4 { keys, children } => keys[..cc]
                .iter()
                .position(|&k| k == byte)
                .map(|i| &children[i]),
            Repr::Node16 { keys, children } => {
                key16_find_eq(keys, byte, cc).map(|i| &children[i])
            }
            Repr::Node48 { index, children } => match index[byte as usize] {
                0 => None,
                idx => Some(&children[idx as usize - 1]),
            },
            Repr::Node256 { children } => {
                let slot = &children[byte as usize];
                if slot.is_empty() {
                    None
                } else {
                    Some(slot)
                }
            }
        }
    }

    pub(crate) fn find_child_mut(&mut self, byte: u8) -> Option<&mut Slot> {
        let cc = self.header.child_count as usize;
        match &mut self.repr {
            Repr::Node4 { keys, children } => keys[..cc]
                .iter()
                .position(|&k| k == byte)
                .map(|i| &mut children[i]),
            Repr::Node16 { keys, children } => {
                key16_find_eq(keys, byte, cc).map(|i| &mut children[i])
            }
            Repr::Node48 { index, children } => match index[byte as usize] {
                0 => None,
                idx => Some(&mut children[idx as usize - 1]),
            },
            Repr::Node256 { children } => {
                let slot = &mut children[byte as usize];
                if slot.is_empty() {
                    None
                } else {
                    Some(slot)
                }
            }
        }
    }

    /// Maps `byte` to `child`, overwriting an existing mapping and
    /// growing to the next layout when the current one is full.
    pub(crate) fn add_child(&mut self, byte: u8, child: Slot, stats: &mut MemoryStats) {
        let ty = self.node_type();
        if self.header.child_count as usize >= ty.capacity()
            && ty != NodeType::Node256
            && self.find_child(byte).is_none()
        {
            self.grow_to(ty.next_larger(), stats);
        }
        self.place_child(byte, child);
    }

    /// Insert or overwrite without growth; the caller guarantees room.
    fn place_child(&mut self, byte: u8, child: Slot) {
        let cc = self.header.child_count as usize;
        match &mut self.repr {
            Repr::Node4 { keys, children } => {
                if let Some(i) = keys[..cc].iter().position(|&k| k == byte) {
                    children[i] = child;
                    return;
                }
                debug_assert!(cc < 4);
                let pos = keys[..cc].iter().position(|&k| k > byte).unwrap_or(cc);
                for i in (pos..cc).rev() {
                    keys[i + 1] = keys[i];
                    children.swap(i + 1, i);
                }
                keys[pos] = byte;
                children[pos] = child;
                self.header.child_count += 1;
            }
            Repr::Node16 { keys, children } => {
                if let Some(i) = key16_find_eq(keys, byte, cc) {
                    children[i] = child;
                    return;
                }
                debug_assert!(cc < 16);
                let pos = key16_upper_bound(keys, byte, cc);
                keys.copy_within(pos..cc, pos + 1);
                for i in (pos..cc).rev() {
                    children.swap(i + 1, i);
                }
                keys[pos] = byte;
                children[pos] = child;
                self.header.child_count += 1;
            }
            Repr::Node48 { index, children } => {
                let idx = index[byte as usize];
                if idx > 0 {
                    children[idx as usize - 1] = child;
                    return;
                }
                debug_assert!(cc < 48);
                let mut pos = 0;
                while !children[pos].is_empty() {
                    pos += 1;
                }
                children[pos] = child;
                index[byte as usize] = (pos + 1) as u8;
                self.header.child_count += 1;
            }
            Repr::Node256 { children } => {
                if children[byte as usize].is_empty() {
                    self.header.child_count += 1;
                }
                children[byte as usize] = child;
            }
        }
    }

    /// Replaces the layout with `target`, migrating every entry. The
    /// header keeps its prefix and leaf flag.
    pub(crate) fn grow_to(&mut self, target: NodeType, stats: &mut MemoryStats) {
        let from = self.node_type();
        debug_assert!(target > from);
        let old = std::mem::replace(&mut self.repr, Repr::new(target));
        stats.on_free(from);
        stats.on_alloc(target);
        let cc = std::mem::replace(&mut self.header.child_count, 0);
        for (byte, slot) in old.into_entries(cc as usize) {
            self.place_child(byte, slot);
        }
        debug_assert_eq!(self.header.child_count, cc);
        trace!("node grown {:?} -> {:?} ({} entries)", from, target, cc);
    }

    /// Writes `value` into the `length` slots starting at key byte
    /// `start`, growing the layout up front if the worst case would not
    /// fit. Returns how many slots went from empty to occupied.
    pub(crate) fn add_leaf_run(
        &mut self,
        start: u8,
        length: u32,
        value: Value,
        stats: &mut MemoryStats,
    ) -> u32 {
        debug_assert!(self.header.is_leaf);
        debug_assert!(length > 0 && start as u32 + length <= 256);
        let ty = self.node_type();
        let total = self.header.child_count as u32 + length;
        if total > ty.capacity() as u32 && ty != NodeType::Node256 {
            self.grow_to(NodeType::leaf_growth_target(total), stats);
        }
        let before = self.header.child_count;
        match &mut self.repr {
            Repr::Node4 { keys, children } => {
                run_into_leaf4(keys, children, &mut self.header.child_count, start, length, value);
            }
            Repr::Node16 { keys, children } => {
                run_into_leaf16(keys, children, &mut self.header.child_count, start, length, value);
            }
            Repr::Node48 { index, children } => {
                run_into_leaf48(index, children, &mut self.header.child_count, start, length, value);
            }
            Repr::Node256 { children } => {
                run_into_leaf256(children, &mut self.header.child_count, start, length, value);
            }
        }
        debug_assert!(self.header.child_count as usize <= self.node_type().capacity());
        (self.header.child_count - before) as u32
    }

    /// Reads `length` consecutive slots starting at key byte `start`.
    /// Absent entries come back as the null token.
    pub(crate) fn find_leaf_run(&self, start: u8, length: u32) -> Vec<Value> {
        debug_assert!(self.header.is_leaf);
        let len = length as usize;
        let cc = self.header.child_count as usize;
        let mut out = vec![Value::NULL; len];
        match &self.repr {
            Repr::Node4 { keys, children } => {
                merge_sorted_run(&keys[..cc], &children[..cc], start, &mut out);
            }
            Repr::Node16 { keys, children } => {
                merge_sorted_run(&keys[..cc], &children[..cc], start, &mut out);
            }
            Repr::Node48 { index, children } => {
                for (n, slot_out) in out.iter_mut().enumerate() {
                    let idx = index[start as usize + n];
                    if idx > 0 {
                        *slot_out = children[idx as usize - 1].value();
                    }
                }
            }
            Repr::Node256 { children } => {
                for (n, slot_out) in out.iter_mut().enumerate() {
                    *slot_out = children[start as usize + n].value();
                }
            }
        }
        out
    }

    /// Visits every child of an inner node in ascending byte order.
    pub(crate) fn for_each_child<'a>(&'a self, mut f: impl FnMut(&'a Node)) {
        let cc = self.header.child_count as usize;
        match &self.repr {
            Repr::Node4 { children, .. } => {
                for slot in &children[..cc] {
                    if let Slot::Child(child) = slot {
                        f(child);
                    }
                }
            }
            Repr::Node16 { children, .. } => {
                for slot in &children[..cc] {
                    if let Slot::Child(child) = slot {
                        f(child);
                    }
                }
            }
            Repr::Node48 { index, children } => {
                for b in 0..256usize {
                    let idx = index[b];
                    if idx > 0 {
                        if let Slot::Child(child) = &children[idx as usize - 1] {
                            f(child);
                        }
                    }
                }
            }
            Repr::Node256 { children } => {
                for slot in children.iter() {
                    if let Slot::Child(child) = slot {
                        f(child);
                    }
                }
            }
        }
    }
}

/// Per-key merge of a run into a small sorted leaf. Exact matches are
/// overwritten in place, new keys shift the tail right.
fn run_into_leaf4(
    keys: &mut [u8; 4],
    children: &mut [Slot; 4],
    child_count: &mut u16,
    start: u8,
    length: u32,
    value: Value,
) {
    for n in 0..length as usize {
        let b = (start as usize + n) as u8;
        let cc = *child_count as usize;
        let pos = keys[..cc].iter().position(|&k| k >= b).unwrap_or(cc);
        if pos < cc && keys[pos] == b {
            children[pos] = Slot::Value(value);
        } else {
            debug_assert!(cc < 4);
            for i in (pos..cc).rev() {
                keys[i + 1] = keys[i];
                children.swap(i + 1, i);
            }
            keys[pos] = b;
            children[pos] = Slot::Value(value);
            *child_count += 1;
        }
    }
}

/// Merges a run into a sorted 16-key leaf. The existing keys split into
/// a strictly-below part, a covered middle, and a strictly-above tail;
/// the tail is shifted to make room and the run is written in one pass.
fn run_into_leaf16(
    keys: &mut [u8; 16],
    children: &mut [Slot; 16],
    child_count: &mut u16,
    start: u8,
    length: u32,
    value: Value,
) {
    let len = length as usize;
    let cc = *child_count as usize;
    let start_u = start as usize;
    let end = start_u + len - 1;

    // Last index below the run and first index above it, if any.
    let mut start_index: Option<usize> = None;
    let mut end_index: Option<usize> = None;
    for i in 0..cc {
        if keys[i] as usize >= start_u {
            break;
        }
        start_index = Some(i);
    }
    for j in (0..cc).rev() {
        if keys[j] as usize <= end {
            break;
        }
        end_index = Some(j);
    }

    match (start_index, end_index) {
        (None, None) => {
            // Every existing key is inside the run.
            for i in 0..len {
                keys[i] = (start_u + i) as u8;
                children[i] = Slot::Value(value);
            }
            *child_count = len as u16;
        }
        (Some(si), Some(ei)) => {
            let shift = len - (ei - si - 1);
            keys.copy_within(ei..cc, ei + shift);
            for i in (ei..cc).rev() {
                children.swap(i + shift, i);
            }
            for i in 0..len {
                keys[si + 1 + i] = (start_u + i) as u8;
                children[si + 1 + i] = Slot::Value(value);
            }
            *child_count = (cc + shift) as u16;
        }
        (None, Some(ei)) => {
            let shift = len - ei;
            keys.copy_within(ei..cc, ei + shift);
            for i in (ei..cc).rev() {
                children.swap(i + shift, i);
            }
            for i in 0..len {
                keys[i] = (start_u + i) as u8;
                children[i] = Slot::Value(value);
            }
            *child_count = (cc + shift) as u16;
        }
        (Some(si), None) => {
            for i in 0..len {
                keys[si + 1 + i] = (start_u + i) as u8;
                children[si + 1 + i] = Slot::Value(value);
            }
            *child_count = (si + 1 + len) as u16;
        }
    }
    debug_assert!(*child_count <= 16);
}

fn run_into_leaf48(
    index: &mut [u8; 256],
    children: &mut [Slot; 48],
    child_count: &mut u16,
    start: u8,
    length: u32,
    value: Value,
) {
    let mut insert_pos = 0usize;
    for n in 0..length as usize {
        let b = start as usize + n;
        let idx = index[b];
        if idx > 0 {
            children[idx as usize - 1] = Slot::Value(value);
        } else {
            while !children[insert_pos].is_empty() {
                insert_pos += 1;
            }
            children[insert_pos] = Slot::Value(value);
            index[b] = (insert_pos + 1) as u8;
            insert_pos += 1;
            *child_count += 1;
        }
    }
    debug_assert!(*child_count <= 48);
}

fn run_into_leaf256(
    children: &mut [Slot; 256],
    child_count: &mut u16,
    start: u8,
    length: u32,
    value: Value,
) {
    for n in 0..length as usize {
        let b = start as usize + n;
        if children[b].is_empty() {
            *child_count += 1;
        }
        children[b] = Slot::Value(value);
    }
    debug_assert!(*child_count <= 256);
}

/// Ascending two-pointer walk of sorted leaf keys against a target run.
fn merge_sorted_run(keys: &[u8], children: &[Slot], start: u8, out: &mut [Value]) {
    let mut i = 0;
    for (n, slot_out) in out.iter_mut().enumerate() {
        let target = start as usize + n;
        while i < keys.len() && (keys[i] as usize) < target {
            i += 1;
        }
        if i < keys.len() && keys[i] as usize == target {
            *slot_out = children[i].value();
            i += 1;
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn lane_mask(count: usize) -> i32 {
    debug_assert!(count <= 16);
    ((1u32 << count) - 1) as i32
}

/// Position of `byte` among the first `count` sorted keys, if present.
#[cfg(target_arch = "x86_64")]
pub(crate) fn key16_find_eq(keys: &[u8; 16], byte: u8, count: usize) -> Option<usize> {
    use std::arch::x86_64::{
        __m128i, _mm_cmpeq_epi8, _mm_loadu_si128, _mm_movemask_epi8, _mm_set1_epi8,
    };
    // SAFETY: SSE2 is part of the x86_64 baseline feature set.
    let hits = unsafe {
        let needle = _mm_set1_epi8(byte as i8);
        let lanes = _mm_loadu_si128(keys.as_ptr() as *const __m128i);
        _mm_movemask_epi8(_mm_cmpeq_epi8(needle, lanes))
    };
    let mask = hits & lane_mask(count);
    if mask == 0 {
        None
    } else {
        Some(mask.trailing_zeros() as usize)
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) fn key16_find_eq(keys: &[u8; 16], byte: u8, count: usize) -> Option<usize> {
    keys[..count].iter().position(|&k| k == byte)
}

/// Index of the first key strictly greater than `byte` among the first
/// `count` sorted keys, or `count` when no key is greater. Key bytes
/// span the full 0-255 range, so both sides get their sign bit flipped
/// before the signed lane compare.
#[cfg(target_arch = "x86_64")]
pub(crate) fn key16_upper_bound(keys: &[u8; 16], byte: u8, count: usize) -> usize {
    use std::arch::x86_64::{
        __m128i, _mm_cmplt_epi8, _mm_loadu_si128, _mm_movemask_epi8, _mm_set1_epi8, _mm_xor_si128,
    };
    // SAFETY: SSE2 is part of the x86_64 baseline feature set.
    let above = unsafe {
        let bias = _mm_set1_epi8(-128);
        let needle = _mm_xor_si128(_mm_set1_epi8(byte as i8), bias);
        let lanes = _mm_xor_si128(_mm_loadu_si128(keys.as_ptr() as *const __m128i), bias);
        _mm_movemask_epi8(_mm_cmplt_epi8(needle, lanes))
    };
    let mask = above & lane_mask(count);
    if mask == 0 {
        count
    } else {
        mask.trailing_zeros() as usize
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) fn key16_upper_bound(keys: &[u8; 16], byte: u8, count: usize) -> usize {
    keys[..count].iter().position(|&k| k > byte).unwrap_or(count)
}
