//! Debug utilities for tree troubleshooting.

use super::node::{Node, Repr, Slot};
use super::ArtTree;

impl ArtTree {
    /// Prints the tree level by level for debugging.
    pub fn dump(&self) {
        println!("=== ART dump ===");
        println!(
            "keys: {}  bytes: {}  stats: {:?}",
            self.len(),
            self.memory_usage(),
            self.memory_stats()
        );
        let Some(root) = self.root() else {
            println!("(empty)");
            println!("================");
            return;
        };
        let mut level = 0usize;
        let mut current: Vec<&Node> = vec![root];
        while !current.is_empty() {
            println!("--- level {level} ({} nodes) ---", current.len());
            let mut next = Vec::new();
            for node in current {
                Self::dump_node(node);
                if !node.header.is_leaf {
                    node.for_each_child(|child| next.push(child));
                }
            }
            current = next;
            level += 1;
        }
        println!("================");
    }

    fn dump_node(node: &Node) {
        let header = &node.header;
        let prefix = &header.prefix[..header.prefix_len as usize];
        print!(
            "{{ {:?} children={} leaf={} prefix={:?} [",
            node.node_type(),
            header.child_count,
            header.is_leaf,
            prefix
        );
        match &node.repr {
            Repr::Node4 { keys, children } => {
                for (i, slot) in children[..header.child_count as usize].iter().enumerate() {
                    print!("{}:{} ", keys[i], slot_brief(slot));
                }
            }
            Repr::Node16 { keys, children } => {
                for (i, slot) in children[..header.child_count as usize].iter().enumerate() {
                    print!("{}:{} ", keys[i], slot_brief(slot));
                }
            }
            Repr::Node48 { index, children } => {
                for b in 0..256usize {
                    let idx = index[b] as usize;
                    if idx > 0 {
                        print!("{}:{} ", b, slot_brief(&children[idx - 1]));
                    }
                }
            }
            Repr::Node256 { children } => {
                for (b, slot) in children.iter().enumerate() {
                    if !slot.is_empty() {
                        print!("{}:{} ", b, slot_brief(slot));
                    }
                }
            }
        }
        println!("] }}");
    }

    /// Walks the whole tree checking structural invariants. Returns a
    /// description of every violation found; an empty list means the
    /// tree is sound.
    pub fn verify_integrity(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if let Some(root) = self.root() {
            Self::verify_node(root, 0, &mut issues);
        }
        issues
    }

    fn verify_node(node: &Node, depth: usize, issues: &mut Vec<String>) {
        let header = &node.header;
        let ty = node.node_type();
        let plen = header.prefix_len as usize;

        if plen > 7 {
            issues.push(format!("{ty:?} at depth {depth}: prefix_len {plen} > 7"));
            return;
        }
        if depth + plen > 7 {
            issues.push(format!(
                "{ty:?} at depth {depth}: prefix_len {plen} overruns the key"
            ));
            return;
        }
        let at_leaf_depth = depth + plen == 7;
        if header.is_leaf != at_leaf_depth {
            issues.push(format!(
                "{ty:?} at depth {depth}: is_leaf={} but depth+prefix={}",
                header.is_leaf,
                depth + plen
            ));
        }
        let cc = header.child_count as usize;
        if cc > ty.capacity() {
            issues.push(format!(
                "{ty:?} at depth {depth}: child_count {cc} exceeds capacity"
            ));
            return;
        }

        match &node.repr {
            Repr::Node4 { keys, children } => {
                Self::verify_keyed(keys, &children[..], cc, header.is_leaf, depth, plen, issues);
            }
            Repr::Node16 { keys, children } => {
                Self::verify_keyed(keys, &children[..], cc, header.is_leaf, depth, plen, issues);
            }
            Repr::Node48 { index, children } => {
                let mut seen = [false; 48];
                let mut populated = 0usize;
                for b in 0..256usize {
                    let idx = index[b] as usize;
                    if idx == 0 {
                        continue;
                    }
                    if idx > 48 {
                        issues.push(format!("Node48 at depth {depth}: index[{b}] = {idx} > 48"));
                        continue;
                    }
                    if seen[idx - 1] {
                        issues.push(format!("Node48 at depth {depth}: position {idx} mapped twice"));
                    }
                    seen[idx - 1] = true;
                    populated += 1;
                    Self::verify_slot(&children[idx - 1], header.is_leaf, depth, plen, issues);
                }
                if populated != cc {
                    issues.push(format!(
                        "Node48 at depth {depth}: {populated} index entries but child_count {cc}"
                    ));
                }
                for (pos, slot) in children.iter().enumerate() {
                    if !seen[pos] && !slot.is_empty() {
                        issues.push(format!(
                            "Node48 at depth {depth}: position {pos} occupied but unmapped"
                        ));
                    }
                }
            }
            Repr::Node256 { children } => {
                let occupied = children.iter().filter(|s| !s.is_empty()).count();
                if occupied != cc {
                    issues.push(format!(
                        "Node256 at depth {depth}: {occupied} occupied slots but child_count {cc}"
                    ));
                }
                for slot in children.iter() {
                    if !slot.is_empty() {
                        Self::verify_slot(slot, header.is_leaf, depth, plen, issues);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_keyed(
        keys: &[u8],
        children: &[Slot],
        cc: usize,
        is_leaf: bool,
        depth: usize,
        plen: usize,
        issues: &mut Vec<String>,
    ) {
        let ty = if keys.len() == 4 { "Node4" } else { "Node16" };
        if !keys[..cc].windows(2).all(|w| w[0] < w[1]) {
            issues.push(format!(
                "{ty} at depth {depth}: keys {:?} not strictly ascending",
                &keys[..cc]
            ));
        }
        for slot in &children[..cc] {
            if slot.is_empty() {
                issues.push(format!("{ty} at depth {depth}: counted slot is empty"));
            } else {
                Self::verify_slot(slot, is_leaf, depth, plen, issues);
            }
        }
        for slot in &children[cc..] {
            if !slot.is_empty() {
                issues.push(format!("{ty} at depth {depth}: slot beyond child_count occupied"));
            }
        }
    }

    fn verify_slot(slot: &Slot, is_leaf: bool, depth: usize, plen: usize, issues: &mut Vec<String>) {
        match slot {
            Slot::Empty => {}
            Slot::Value(_) => {
                if !is_leaf {
                    issues.push(format!("inner node at depth {depth} stores a value"));
                }
            }
            Slot::Child(child) => {
                if is_leaf {
                    issues.push(format!("leaf at depth {depth} stores a child node"));
                } else {
                    Self::verify_node(child, depth + plen + 1, issues);
                }
            }
        }
    }
}

fn slot_brief(slot: &Slot) -> String {
    match slot {
        Slot::Empty => "-".to_string(),
        Slot::Child(child) => format!("<{:?}>", child.node_type()),
        Slot::Value(v) => format!("{:#x}", v.0),
    }
}

#[cfg(test)]
mod tests {
    use super::super::Value;
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn integrity_holds_after_random_workload() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut tree = ArtTree::new();
        for _ in 0..2_000 {
            if rng.gen_bool(0.5) {
                tree.insert(rng.gen(), Value(rng.gen()));
            } else {
                let start: u64 = rng.gen();
                let cap = 256 - (start % 256) as u32;
                let length = rng.gen_range(1..=cap);
                tree.range_insert(start, length, Value(rng.gen()));
            }
        }
        let issues = tree.verify_integrity();
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn fresh_and_cleared_trees_are_sound() {
        let mut tree = ArtTree::new();
        assert!(tree.verify_integrity().is_empty());
        tree.clear();
        assert!(tree.verify_integrity().is_empty());
    }
}
