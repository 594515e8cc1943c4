//! # artkv - Adaptive Radix Tree index for 64-bit keys
//!
//! An in-memory ordered index over fixed-width `u64` keys storing
//! opaque pointer-sized values.
//!
//! ## Features
//!
//! - **Adaptive node sizes**: 4, 16, 48 or 256 children per node, grown
//!   in place as nodes fill up.
//! - **Path compression**: up to 7 shared key bytes folded into a
//!   node's prefix.
//! - **Range operations**: one value bound to a run of up to 256
//!   consecutive keys in a single compact leaf write, and queried back
//!   as one length-sized vector.
//! - **Snapshots**: the whole tree serializes breadth-first into a
//!   self-contained little-endian byte buffer and loads back with full
//!   structural validation.
//!
//! ## Example
//!
//! ```rust
//! use artkv::{ArtTree, Value};
//!
//! let mut tree = ArtTree::new();
//! tree.insert(100, Value(42));
//! assert_eq!(tree.search(100), Value(42));
//! assert_eq!(tree.search(101), Value::NULL);
//!
//! tree.range_insert(4096, 32, Value(7));
//! assert!(tree.range_query(4096, 32).iter().all(|&v| v == Value(7)));
//!
//! let snapshot = tree.serialize();
//! let reloaded = artkv::ArtTree::deserialize(&snapshot).unwrap();
//! assert_eq!(reloaded.search(100), Value(42));
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod art;

pub use art::{ArtTree, MemoryStats, NodeType, SnapshotError, Value};

#[cfg(test)]
mod proptests;
