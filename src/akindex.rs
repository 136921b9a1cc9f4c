//! AK secondary index engine (C6): a B+tree per AK subfile, root always at
//! node 1. Grounded on `dh_ak.c`'s `compare()` comparator and its
//! internal-node descent rule ("first child whose key is >= the target"),
//! and on `DH_INT_NODE`/`DH_TERM_NODE` in `dh_fmt.h`.
//!
//! Per REDESIGN FLAG 8, node mutation during insert/delete follows a fixed
//! index-and-update protocol: every node touched on a path is read into an
//! owned in-memory value, mutated, and written back in root-to-leaf order,
//! rather than navigating live pointers back and forth mid-edit.

use crate::error::{Result, StoreError};
use crate::layout::{self, AkHeader, DH_AK_NODE_SIZE};
use crate::subfile::SubfileSet;
use std::cmp::Ordering;

const TERM_NODE_HEADER_SIZE: usize = 16;
const INT_NODE_HEADER_SIZE: usize = 4 + 4 * layout::MAX_CHILD + layout::MAX_CHILD;

#[derive(Debug, Clone)]
pub struct Entry {
    pub key: Vec<u8>,
    pub record_id: Vec<u8>,
}

#[derive(Debug, Clone)]
enum AkNode {
    Internal {
        children: Vec<u32>,
        /// keys[i] is the largest key reachable through children[i].
        keys: Vec<Vec<u8>>,
    },
    Terminal {
        left: u32,
        right: u32,
        entries: Vec<Entry>,
    },
    Free {
        next: u32,
    },
}

fn encode_node(node: &AkNode) -> Vec<u8> {
    let mut buf = vec![0u8; DH_AK_NODE_SIZE];
    match node {
        AkNode::Free { next } => {
            buf[2] = layout::AK_FREE_NODE;
            buf[4..8].copy_from_slice(&next.to_le_bytes());
        }
        AkNode::Internal { children, keys } => {
            buf[2] = layout::AK_INT_NODE;
            buf[3] = children.len() as u8;
            let mut off = INT_NODE_HEADER_SIZE;
            for (i, (child, key)) in children.iter().zip(keys.iter()).enumerate() {
                buf[4 + i * 4..8 + i * 4].copy_from_slice(&child.to_le_bytes());
                buf[4 + layout::MAX_CHILD * 4 + i] = key.len() as u8;
                buf[off..off + key.len()].copy_from_slice(key);
                off += key.len();
            }
            buf[0..2].copy_from_slice(&(off as u16).to_le_bytes());
        }
        AkNode::Terminal {
            left,
            right,
            entries,
        } => {
            buf[2] = layout::AK_TERM_NODE;
            buf[4..8].copy_from_slice(&left.to_le_bytes());
            buf[8..12].copy_from_slice(&right.to_le_bytes());
            let mut off = TERM_NODE_HEADER_SIZE;
            for e in entries {
                let rec = crate::record::Record {
                    id: e.key.clone(),
                    payload: crate::record::Payload::Inline(e.record_id.clone()),
                };
                let enc = rec.encode();
                buf[off..off + enc.len()].copy_from_slice(&enc);
                off += enc.len();
            }
            buf[0..2].copy_from_slice(&(off as u16).to_le_bytes());
        }
    }
    buf
}

fn decode_node(buf: &[u8]) -> AkNode {
    let node_type = buf[2];
    match node_type {
        layout::AK_INT_NODE => {
            let used = u16::from_le_bytes(buf[0..2].try_into().unwrap()) as usize;
            let count = buf[3] as usize;
            let mut children = Vec::with_capacity(count);
            let mut keys = Vec::with_capacity(count);
            let mut off = INT_NODE_HEADER_SIZE;
            for i in 0..count {
                let child = u32::from_le_bytes(buf[4 + i * 4..8 + i * 4].try_into().unwrap());
                let klen = buf[4 + layout::MAX_CHILD * 4 + i] as usize;
                children.push(child);
                keys.push(buf[off..off + klen].to_vec());
                off += klen;
            }
            debug_assert!(off <= used.max(off));
            AkNode::Internal { children, keys }
        }
        layout::AK_TERM_NODE => {
            let used = u16::from_le_bytes(buf[0..2].try_into().unwrap()) as usize;
            let left = u32::from_le_bytes(buf[4..8].try_into().unwrap());
            let right = u32::from_le_bytes(buf[8..12].try_into().unwrap());
            let mut entries = Vec::new();
            let mut off = TERM_NODE_HEADER_SIZE;
            while off < used {
                let (rec, next) = crate::record::Record::decode(&buf[off..]);
                let record_id = match rec.payload {
                    crate::record::Payload::Inline(d) => d,
                    _ => Vec::new(),
                };
                entries.push(Entry {
                    key: rec.id,
                    record_id,
                });
                if next == 0 {
                    break;
                }
                off += next;
            }
            AkNode::Terminal {
                left,
                right,
                entries,
            }
        }
        _ => AkNode::Free {
            next: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        },
    }
}

/// Applies the collation map (if attached) then the right-justified/
/// case-insensitive comparison rules from `compare()`.
fn ak_compare(a: &[u8], b: &[u8], header: &AkHeader) -> Ordering {
    let map = |bytes: &[u8]| -> Vec<u8> {
        match &header.collation_map {
            Some(m) => bytes.iter().map(|&c| m[c as usize]).collect(),
            None => bytes.to_vec(),
        }
    };
    let a = map(a);
    let b = map(b);

    if header.right_justified() {
        if let (Ok(x), Ok(y)) = (parse_int(&a), parse_int(&b)) {
            return x.cmp(&y);
        }
        // Pad the shorter side with leading spaces for the comparison.
        let (la, lb) = (a.len(), b.len());
        if la != lb {
            let (shorter_is_a, diff) = if la < lb { (true, lb - la) } else { (false, la - lb) };
            let pad_cmp = if shorter_is_a {
                b[..diff].iter().find(|&&c| c != b' ').map(|_| Ordering::Less)
            } else {
                a[..diff].iter().find(|&&c| c != b' ').map(|_| Ordering::Greater)
            };
            if let Some(o) = pad_cmp {
                return o;
            }
            let rest_a = if shorter_is_a { &a[..] } else { &a[diff..] };
            let rest_b = if shorter_is_a { &b[diff..] } else { &b[..] };
            return compare_bytes(rest_a, rest_b, header.case_insensitive());
        }
    }
    compare_bytes(&a, &b, header.case_insensitive())
}

fn compare_bytes(a: &[u8], b: &[u8], nocase: bool) -> Ordering {
    let n = a.len().min(b.len());
    for i in 0..n {
        let (x, y) = if nocase {
            (a[i].to_ascii_uppercase(), b[i].to_ascii_uppercase())
        } else {
            (a[i], b[i])
        };
        if x != y {
            return x.cmp(&y);
        }
    }
    a.len().cmp(&b.len())
}

fn parse_int(bytes: &[u8]) -> std::result::Result<i64, ()> {
    std::str::from_utf8(bytes)
        .map_err(|_| ())?
        .trim()
        .parse::<i64>()
        .map_err(|_| ())
}

fn encoded_entry_len(e: &Entry) -> usize {
    crate::record::Record {
        id: e.key.clone(),
        payload: crate::record::Payload::Inline(e.record_id.clone()),
    }
    .encode()
    .len()
}

/// Greedily packs `entries` into the fewest ordered chunks that each fit
/// within `capacity` bytes, producing two chunks in the common case and a
/// third (or more) only when the combined content cannot be partitioned
/// into two.
fn partition_entries(entries: &[Entry], capacity: usize) -> Vec<Vec<Entry>> {
    let mut chunks: Vec<Vec<Entry>> = Vec::new();
    let mut cur: Vec<Entry> = Vec::new();
    let mut cur_len = 0usize;
    for e in entries {
        let enc_len = encoded_entry_len(e);
        if !cur.is_empty() && cur_len + enc_len > capacity {
            chunks.push(std::mem::take(&mut cur));
            cur_len = 0;
        }
        cur_len += enc_len;
        cur.push(e.clone());
    }
    if !cur.is_empty() {
        chunks.push(cur);
    }
    if chunks.len() < 2 {
        if let Some(only) = chunks.pop() {
            let mid = (only.len() / 2).max(1);
            let (a, b) = only.split_at(mid.min(only.len()));
            chunks.push(a.to_vec());
            chunks.push(b.to_vec());
        }
    }
    chunks
}

pub struct AkIndex {
    pub akno: u16,
    pub header: AkHeader,
    subfiles: SubfileSet,
}

impl AkIndex {
    pub fn create(akno: u16, mut header: AkHeader, subfiles: SubfileSet) -> Result<Self> {
        if header.data_creation_timestamp == 0 {
            header.data_creation_timestamp = chrono::Utc::now().timestamp();
        }
        let mut idx = Self {
            akno,
            header,
            subfiles,
        };
        idx.write_node(1, &AkNode::Terminal {
            left: 0,
            right: 0,
            entries: Vec::new(),
        })?;
        Ok(idx)
    }

    fn subfile_no(&self) -> u16 {
        layout::AK_BASE_SUBFILE + self.akno
    }

    fn read_node(&self, node: u32) -> Result<AkNode> {
        let raw = self
            .subfiles
            .read_group(self.subfile_no(), node, DH_AK_NODE_SIZE)?;
        Ok(decode_node(&raw))
    }

    fn write_node(&self, node: u32, value: &AkNode) -> Result<()> {
        self.subfiles
            .write_group(self.subfile_no(), node, &encode_node(value))
    }

    fn next_free_node(&mut self) -> Result<u32> {
        if self.header.free_chain != 0 {
            let n = self.header.free_chain;
            if let AkNode::Free { next } = self.read_node(n)? {
                self.header.free_chain = next;
            }
            return Ok(n);
        }
        let size = self.subfiles.file_size(self.subfile_no()).unwrap_or(0);
        Ok((size / DH_AK_NODE_SIZE as u64) as u32 + 1)
    }

    /// Descends from the root, returning the path of internal nodes
    /// visited (node number, child index chosen) and the terminal node
    /// number that should hold `key`.
    fn descend(&self, key: &[u8]) -> Result<(Vec<(u32, usize)>, u32)> {
        let mut path = Vec::new();
        let mut node_num = 1u32;
        loop {
            match self.read_node(node_num)? {
                AkNode::Terminal { .. } => return Ok((path, node_num)),
                AkNode::Internal { children, keys } => {
                    let mut ci = children.len() - 1;
                    for (i, k) in keys.iter().enumerate() {
                        if ak_compare(key, k, &self.header) != Ordering::Greater {
                            ci = i;
                            break;
                        }
                    }
                    path.push((node_num, ci));
                    node_num = children[ci];
                }
                AkNode::Free { .. } => return Err(StoreError::Corrupt("AK free node on path".into())),
            }
        }
    }

    pub fn insert(&mut self, key: &[u8], record_id: &[u8]) -> Result<()> {
        let (path, leaf_num) = self.descend(key)?;
        let mut entries = match self.read_node(leaf_num)? {
            AkNode::Terminal { entries, .. } => entries,
            _ => return Err(StoreError::Corrupt("expected terminal node".into())),
        };
        let pos = entries
            .iter()
            .position(|e| ak_compare(key, &e.key, &self.header) != Ordering::Greater)
            .unwrap_or(entries.len());
        if !self.header.multi_valued() {
            if let Some(e) = entries.get(pos) {
                if ak_compare(&e.key, key, &self.header) == Ordering::Equal {
                    return Err(StoreError::Corrupt("duplicate key in unique AK".into()));
                }
            }
        }
        entries.insert(
            pos,
            Entry {
                key: key.to_vec(),
                record_id: record_id.to_vec(),
            },
        );

        let byte_len: usize = entries
            .iter()
            .map(|e| {
                crate::record::Record {
                    id: e.key.clone(),
                    payload: crate::record::Payload::Inline(e.record_id.clone()),
                }
                .encode()
                .len()
            })
            .sum();

        if byte_len + TERM_NODE_HEADER_SIZE <= DH_AK_NODE_SIZE {
            let (left, right) = match self.read_node(leaf_num)? {
                AkNode::Terminal { left, right, .. } => (left, right),
                _ => (0, 0),
            };
            self.write_node(
                leaf_num,
                &AkNode::Terminal {
                    left,
                    right,
                    entries,
                },
            )?;
            self.update_path_max_key(&path, leaf_num)?;
            return Ok(());
        }

        self.split_leaf(leaf_num, entries, path)
    }

    /// Splits an overflowing terminal node into two siblings, or a third
    /// if the combined entries (the original contents plus the newly
    /// inserted record) cannot be partitioned to fit into two nodes.
    fn split_leaf(
        &mut self,
        leaf_num: u32,
        entries: Vec<Entry>,
        path: Vec<(u32, usize)>,
    ) -> Result<()> {
        let capacity = DH_AK_NODE_SIZE - TERM_NODE_HEADER_SIZE;
        let chunks = partition_entries(&entries, capacity);
        let (old_left, old_right) = match self.read_node(leaf_num)? {
            AkNode::Terminal { left, right, .. } => (left, right),
            _ => (0, 0),
        };

        let mut node_nums = vec![leaf_num];
        for _ in 1..chunks.len() {
            node_nums.push(self.next_free_node()?);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let left = if i == 0 { old_left } else { node_nums[i - 1] };
            let right = if i + 1 < node_nums.len() {
                node_nums[i + 1]
            } else {
                old_right
            };
            self.write_node(
                node_nums[i],
                &AkNode::Terminal {
                    left,
                    right,
                    entries: chunk.clone(),
                },
            )?;
        }
        if old_right != 0 {
            if let AkNode::Terminal { right, entries, .. } = self.read_node(old_right)? {
                self.write_node(
                    old_right,
                    &AkNode::Terminal {
                        left: *node_nums.last().unwrap(),
                        right,
                        entries,
                    },
                )?;
            }
        }

        let siblings: Vec<(u32, Vec<u8>)> = node_nums
            .iter()
            .zip(chunks.iter())
            .filter_map(|(&n, c)| c.last().map(|e| (n, e.key.clone())))
            .collect();
        self.promote_siblings(path, siblings)
    }

    /// Replaces the single child at the end of `path` with `siblings`
    /// (node number, subtree max key), splitting the parent in turn if it
    /// overflows `MAX_CHILD`, and promoting a brand new root when node 1
    /// itself is among the nodes being replaced at the top of the tree.
    fn promote_siblings(
        &mut self,
        mut path: Vec<(u32, usize)>,
        siblings: Vec<(u32, Vec<u8>)>,
    ) -> Result<()> {
        if siblings.len() < 2 {
            return Ok(());
        }
        match path.pop() {
            None => {
                let (children, keys): (Vec<u32>, Vec<Vec<u8>>) = siblings.into_iter().unzip();
                // The current root occupies node 1 by invariant; if node 1
                // is among the new siblings, relocate its old contents and
                // make node 1 the new internal root.
                if children[0] == 1 {
                    let relocated = self.next_free_node()?;
                    let moved = self.read_node(1)?;
                    self.write_node(relocated, &moved)?;
                    let mut children = children;
                    children[0] = relocated;
                    return self.write_node(1, &AkNode::Internal { children, keys });
                }
                self.write_node(1, &AkNode::Internal { children, keys })
            }
            Some((parent_num, child_idx)) => {
                let (mut children, mut keys) = match self.read_node(parent_num)? {
                    AkNode::Internal { children, keys } => (children, keys),
                    _ => return Err(StoreError::Corrupt("expected internal node".into())),
                };
                children.remove(child_idx);
                keys.remove(child_idx);
                for (i, (node, key)) in siblings.into_iter().enumerate() {
                    children.insert(child_idx + i, node);
                    keys.insert(child_idx + i, key);
                }

                if children.len() <= layout::MAX_CHILD {
                    self.write_node(parent_num, &AkNode::Internal { children, keys })
                } else {
                    let mid = children.len() / 2;
                    let children_right = children.split_off(mid);
                    let keys_right = keys.split_off(mid);
                    let right_num = self.next_free_node()?;
                    let k1 = keys.last().cloned().unwrap();
                    let k2 = keys_right.last().cloned().unwrap();
                    self.write_node(
                        parent_num,
                        &AkNode::Internal {
                            children,
                            keys,
                        },
                    )?;
                    self.write_node(
                        right_num,
                        &AkNode::Internal {
                            children: children_right,
                            keys: keys_right,
                        },
                    )?;
                    self.promote_siblings(path, vec![(parent_num, k1), (right_num, k2)])
                }
            }
        }
    }

    fn update_path_max_key(&mut self, path: &[(u32, usize)], leaf_num: u32) -> Result<()> {
        let entries = match self.read_node(leaf_num)? {
            AkNode::Terminal { entries, .. } => entries,
            _ => return Ok(()),
        };
        let max_key = match entries.last() {
            Some(e) => e.key.clone(),
            None => return Ok(()),
        };
        for &(node_num, ci) in path.iter().rev() {
            let mut node = match self.read_node(node_num)? {
                AkNode::Internal { children, keys } => (children, keys),
                _ => return Ok(()),
            };
            node.1[ci] = max_key.clone();
            self.write_node(
                node_num,
                &AkNode::Internal {
                    children: node.0,
                    keys: node.1,
                },
            )?;
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8], record_id: &[u8]) -> Result<()> {
        let (path, leaf_num) = self.descend(key)?;
        let (left, right, mut entries) = match self.read_node(leaf_num)? {
            AkNode::Terminal {
                left,
                right,
                entries,
            } => (left, right, entries),
            _ => return Err(StoreError::Corrupt("expected terminal node".into())),
        };
        let pos = entries
            .iter()
            .position(|e| e.key == key && e.record_id == record_id)
            .ok_or(StoreError::NotFound)?;
        entries.remove(pos);

        if entries.is_empty() && leaf_num != 1 {
            // The terminal it was the only entry in is unlinked from its
            // siblings, freed, and its pointer removed from the parent.
            if left != 0 {
                if let AkNode::Terminal {
                    left: ll,
                    entries: le,
                    ..
                } = self.read_node(left)?
                {
                    self.write_node(
                        left,
                        &AkNode::Terminal {
                            left: ll,
                            right,
                            entries: le,
                        },
                    )?;
                }
            }
            if right != 0 {
                if let AkNode::Terminal {
                    right: rr,
                    entries: re,
                    ..
                } = self.read_node(right)?
                {
                    self.write_node(
                        right,
                        &AkNode::Terminal {
                            left,
                            right: rr,
                            entries: re,
                        },
                    )?;
                }
            }
            self.write_node(
                leaf_num,
                &AkNode::Free {
                    next: self.header.free_chain,
                },
            )?;
            self.header.free_chain = leaf_num;
            return self.remove_child_from_parent(&path, leaf_num);
        }

        self.write_node(
            leaf_num,
            &AkNode::Terminal {
                left,
                right,
                entries,
            },
        )?;
        // Open question (preserved, not "fixed"): the original leaves an
        // internal node that collapses to a single live child while its
        // parent is simultaneously being updated as an intentionally
        // absent optimisation. We do not attempt to detect or repair that
        // interleaving here either; removing a terminal's own pointer (just
        // above) is a separate, always-applied step the original's comment
        // does not flag as missing.
        self.update_path_max_key(&path, leaf_num)
    }

    /// Removes `child`'s entry from the deepest parent in `path` (via
    /// `update_internal_node`'s child-list shape) and, if that was the
    /// parent's last child, propagates its new max key upward. Per Open
    /// Question (b) this never collapses a parent down to its single
    /// remaining child.
    fn remove_child_from_parent(&mut self, path: &[(u32, usize)], child: u32) -> Result<()> {
        let Some(&(parent_num, child_idx)) = path.last() else {
            return Ok(());
        };
        let (mut children, mut keys) = match self.read_node(parent_num)? {
            AkNode::Internal { children, keys } => (children, keys),
            _ => return Err(StoreError::Corrupt("expected internal node".into())),
        };
        if children.get(child_idx) != Some(&child) {
            return Ok(());
        }
        let was_last = child_idx == children.len() - 1;
        children.remove(child_idx);
        keys.remove(child_idx);
        self.write_node(
            parent_num,
            &AkNode::Internal {
                children,
                keys: keys.clone(),
            },
        )?;
        if was_last {
            if let Some(new_max) = keys.last().cloned() {
                for &(node_num, ci) in path[..path.len() - 1].iter().rev() {
                    let mut node = match self.read_node(node_num)? {
                        AkNode::Internal { children, keys } => (children, keys),
                        _ => return Ok(()),
                    };
                    node.1[ci] = new_max.clone();
                    self.write_node(
                        node_num,
                        &AkNode::Internal {
                            children: node.0,
                            keys: node.1,
                        },
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Ordered forward scan starting from the smallest key >= `from`
    /// (or the very first entry if `from` is `None`), following terminal
    /// sibling links.
    pub fn scan_forward(&self, from: Option<&[u8]>) -> Result<Vec<Entry>> {
        let start_key = from.unwrap_or(&[]);
        let (_, mut node_num) = self.descend(start_key)?;
        let mut out = Vec::new();
        loop {
            match self.read_node(node_num)? {
                AkNode::Terminal {
                    right, entries, ..
                } => {
                    out.extend(entries);
                    if right == 0 {
                        break;
                    }
                    node_num = right;
                }
                _ => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{AK_ENABLED, AK_LSORT, AK_NOCASE};
    use std::sync::{Arc, Mutex};

    fn make_index(dir: &std::path::Path, flags: u16) -> AkIndex {
        std::fs::create_dir_all(dir).unwrap();
        let cache = Arc::new(Mutex::new(subfile_io::cache::FdsCache::new(16)));
        let sfs = SubfileSet::new(1, dir.to_str().unwrap(), DH_AK_NODE_SIZE as u32, layout::DH_VERSION, cache);
        let header = AkHeader {
            magic: layout::DH_INDEX,
            flags: flags | AK_ENABLED,
            fno: 1,
            free_chain: 0,
            itype_len: 0,
            itype: Vec::new(),
            ak_name: "TEST".into(),
            data_creation_timestamp: 0,
            collation_map_name: String::new(),
            collation_map: None,
        };
        AkIndex::create(0, header, sfs).unwrap()
    }

    #[test]
    fn preserves_total_order_case_insensitive() {
        let dir = std::env::temp_dir().join(format!("ak_test_order_{}", std::process::id()));
        let mut idx = make_index(&dir, AK_LSORT | AK_NOCASE);
        for (k, rid) in [
            ("charlie", "r1"),
            ("Alpha", "r2"),
            ("BRAVO", "r3"),
            ("alpha", "r4"),
            ("delta", "r5"),
        ] {
            idx.insert(k.as_bytes(), rid.as_bytes()).unwrap();
        }
        let scan = idx.scan_forward(None).unwrap();
        let keys: Vec<String> = scan
            .iter()
            .map(|e| String::from_utf8(e.key.clone()).unwrap())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort_by(|a, b| a.to_ascii_uppercase().cmp(&b.to_ascii_uppercase()));
        assert_eq!(keys, sorted);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn splits_and_shrinks_with_many_ids() {
        let dir = std::env::temp_dir().join(format!("ak_test_split_{}", std::process::id()));
        let mut idx = make_index(&dir, 0);
        for i in 0..300u32 {
            let id = format!("id{:03}", i);
            idx.insert(id.as_bytes(), id.as_bytes()).unwrap();
        }
        let before = idx.scan_forward(None).unwrap().len();
        assert_eq!(before, 300);
        for i in (0..300u32).step_by(2) {
            let id = format!("id{:03}", i);
            idx.delete(id.as_bytes(), id.as_bytes()).unwrap();
        }
        let after = idx.scan_forward(None).unwrap().len();
        assert_eq!(after, 150);
        std::fs::remove_dir_all(&dir).ok();
    }
}
