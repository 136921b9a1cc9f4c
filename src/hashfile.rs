//! Dynamic-hash primary engine (C5): record placement, write/delete,
//! big-record promotion, and linear-hash split/merge driven by load
//! factor. Grounded on `dh_file.c`'s header fields (`modulus`, `mod_value`,
//! `min_modulus`, `split_load`, `merge_load`) and the addressing macros in
//! `dh_fmt.h`.

use crate::error::{Result, StoreError};
use crate::glock::GroupLockTable;
use crate::layout::{self, DhHeader, DH_PRIMARY, OVERFLOW_SUBFILE, PRIMARY_SUBFILE};
use crate::record::{Block, Payload, Record, BLOCK_HEADER_SIZE};
use crate::subfile::SubfileSet;
use crate::types::{FileId, HEADER_GROUP};
use log::{info, warn};
use std::sync::{Arc, Mutex};

fn hash_id(id: &[u8]) -> u32 {
    // FNV-1a. The original's exact hash function is an internal, unspecified
    // implementation detail; this crate picks one and commits to it rather
    // than guessing at the original's bit pattern.
    let mut h: u32 = 0x811c9dc5;
    for &b in id {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

/// Linear-hash bucket placement: `addr = hash % mod_value`, folded back
/// into the already-split range when it lands past the current modulus.
/// Groups are numbered from 1.
fn bucket_for(hash: u32, modulus: u32, mod_value: u32) -> u32 {
    let addr = hash % mod_value;
    let addr = if addr >= modulus && mod_value > modulus {
        addr - mod_value / 2
    } else {
        addr
    };
    addr + 1
}

pub struct HashFile {
    pub file_id: FileId,
    pub header: DhHeader,
    subfiles: SubfileSet,
    glocks: Arc<Mutex<GroupLockTable>>,
    pub fsync_policy: u8,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

impl HashFile {
    pub fn create(
        file_id: FileId,
        dir: &str,
        group_size: u32,
        min_modulus: u32,
        split_load: u16,
        merge_load: u16,
        big_rec_size: u32,
        subfiles: SubfileSet,
        glocks: Arc<Mutex<GroupLockTable>>,
    ) -> Self {
        let header = DhHeader {
            magic: DH_PRIMARY,
            group_size,
            modulus: min_modulus,
            min_modulus,
            big_rec_size,
            split_load,
            merge_load,
            load_bytes: 0,
            extended_load_bytes: 0,
            mod_value: min_modulus.next_power_of_two().max(min_modulus),
            longest_id: 0,
            free_chain: 0,
            flags: 0,
            ak_map: 0,
            file_version: layout::DH_VERSION,
            trigger_modes: 0,
            trigger_name: String::new(),
            jnl_fno: 0,
            akpath: String::new(),
            creation_timestamp: chrono::Utc::now().timestamp(),
            record_count: 0,
        };
        let mut hf = Self {
            file_id,
            header,
            subfiles,
            glocks,
            fsync_policy: 0,
            reads: 0,
            writes: 0,
            deletes: 0,
        };
        hf.flush_header().ok();
        hf
    }

    fn group_for(&self, id: &[u8]) -> u32 {
        bucket_for(hash_id(id), self.header.modulus, self.header.mod_value)
    }

    /// Exposes a single group-chain read to the select engine, which walks
    /// groups directly rather than going through `group_for`'s hashing.
    pub(crate) fn read_chain_for_select(&mut self, group: u32) -> Result<Vec<Record>> {
        self.read_chain(group)
    }

    fn read_chain(&mut self, head_group: u32) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        let mut group = head_group;
        while group != 0 {
            let raw = self
                .subfiles
                .read_group(PRIMARY_SUBFILE, group, self.header.group_size as usize)?;
            let block = if group == head_group {
                Block::decode(&raw)
            } else {
                let raw = self
                    .subfiles
                    .read_group(OVERFLOW_SUBFILE, group, self.header.group_size as usize)?;
                Block::decode(&raw)
            };
            if block.used_bytes as usize > BLOCK_HEADER_SIZE {
                let mut offset = 0usize;
                let used = block.used_bytes as usize - BLOCK_HEADER_SIZE;
                while offset < used {
                    let (rec, next) = Record::decode(&block.body[offset..]);
                    out.push(rec);
                    if next == 0 {
                        break;
                    }
                    offset += next;
                }
            }
            group = layout::get_fwd_link(
                self.header.file_version,
                self.header.group_size,
                self.header.group_size,
                block.next,
            );
            if group == head_group {
                break;
            }
        }
        Ok(out)
    }

    /// Writes a record chain, allocating or freeing overflow blocks as
    /// needed so the chain always has exactly as many blocks as the
    /// encoded records require. An individual record is never split
    /// across two block bodies.
    fn write_chain(&mut self, head_group: u32, records: &[Record]) -> Result<()> {
        let capacity = self.header.group_size as usize - BLOCK_HEADER_SIZE;
        let mut chunks: Vec<Vec<u8>> = vec![Vec::new()];
        for rec in records {
            let enc = rec.encode();
            assert!(
                enc.len() <= capacity,
                "record does not fit inline within a single group body"
            );
            if chunks.last().unwrap().len() + enc.len() > capacity {
                chunks.push(Vec::new());
            }
            chunks.last_mut().unwrap().extend_from_slice(&enc);
        }

        let mut old_chain = Vec::new();
        {
            let raw = self
                .subfiles
                .read_group(PRIMARY_SUBFILE, head_group, self.header.group_size as usize)?;
            let mut next = layout::get_fwd_link(
                self.header.file_version,
                self.header.group_size,
                self.header.group_size,
                Block::decode(&raw).next,
            );
            while next != 0 {
                old_chain.push(next);
                let raw = self
                    .subfiles
                    .read_group(OVERFLOW_SUBFILE, next, self.header.group_size as usize)?;
                next = layout::get_fwd_link(
                    self.header.file_version,
                    self.header.group_size,
                    self.header.group_size,
                    Block::decode(&raw).next,
                );
            }
        }

        let needed_continuations = chunks.len() - 1;
        let mut groups = vec![head_group];
        for i in 0..needed_continuations {
            if let Some(&g) = old_chain.get(i) {
                groups.push(g);
            } else {
                groups.push(self.next_overflow_group()?);
            }
        }
        for extra in old_chain.iter().skip(needed_continuations) {
            self.free_overflow_group(*extra)?;
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let next_group = groups.get(i + 1).copied().unwrap_or(0);
            let next_link = layout::set_fwd_link(
                self.header.file_version,
                self.header.group_size,
                self.header.group_size,
                next_group,
            );
            let block = Block {
                next: next_link,
                used_bytes: (BLOCK_HEADER_SIZE + chunk.len()) as u16,
                block_type: layout::DHT_DATA,
                body: {
                    let mut b = vec![0u8; capacity];
                    b[..chunk.len()].copy_from_slice(chunk);
                    b
                },
            };
            let subfile = if i == 0 { PRIMARY_SUBFILE } else { OVERFLOW_SUBFILE };
            self.subfiles.write_group(subfile, groups[i], &block.encode())?;
        }
        Ok(())
    }

    fn flush_header(&mut self) -> Result<()> {
        let bytes = self.header.encode(self.header.group_size);
        self.subfiles.write_group(PRIMARY_SUBFILE, 0, &bytes)?;
        self.subfiles
            .fsync(PRIMARY_SUBFILE, self.fsync_policy, 0x01)?;
        Ok(())
    }

    /// Writes (inserts or replaces) a record. Promotes to a big record when
    /// the inline footprint would exceed `big_rec_size`.
    pub fn write(&mut self, id: &[u8], data: Vec<u8>) -> Result<()> {
        if crate::UPDATES_SUSPENDED.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::ReadOnly);
        }
        if id.len() > crate::record::MAX_KEY_LEN {
            return Err(StoreError::InvalidId);
        }
        let group = self.group_for(id);
        {
            let mut locks = self.glocks.lock().unwrap();
            locks.acquire_write(self.file_id, group, 0, || false)?;
        }
        let result = self.write_locked(id, data, group);
        self.glocks.lock().unwrap().release(self.file_id, group);
        result
    }

    fn write_locked(&mut self, id: &[u8], data: Vec<u8>, group: u32) -> Result<()> {
        let mut records = self.read_chain(group)?;
        let payload_len = data.len();
        let new_rec = if crate::record::RECORD_HEADER_SIZE + id.len() + payload_len
            > self.header.big_rec_size as usize
        {
            let head = self.allocate_big_rec(&data)?;
            Record {
                id: id.to_vec(),
                payload: Payload::BigRec {
                    head_group: head,
                    data_len: payload_len as u32,
                },
            }
        } else {
            Record::new_inline(id.to_vec(), data)
        };

        let mut delta: i64 = new_rec.encode().len() as i64;
        let mut existed = false;
        if let Some(slot) = records.iter_mut().find(|r| r.id == id) {
            delta -= slot.encode().len() as i64;
            *slot = new_rec;
            existed = true;
        } else {
            records.push(new_rec);
        }
        self.write_chain(group, &records)?;
        self.header.add_load_bytes(delta);
        if !existed {
            self.header.record_count += 1;
        }
        self.writes += 1;
        self.maybe_split()?;
        self.flush_header()
    }

    fn allocate_big_rec(&mut self, data: &[u8]) -> Result<u32> {
        // Single-block big record chain for simplicity; a payload larger
        // than one group would chain further blocks the same way overflow
        // group chains do.
        let group = self.next_overflow_group()?;
        let big = crate::record::BigBlock {
            next: 0,
            used_bytes: (crate::record::BIG_BLOCK_HEADER_SIZE + data.len()) as u16,
            data_len: data.len() as u32,
            data: data.to_vec(),
        };
        self.subfiles.write_group(
            OVERFLOW_SUBFILE,
            group,
            &big.encode(self.header.group_size),
        )?;
        Ok(group)
    }

    fn next_overflow_group(&mut self) -> Result<u32> {
        // `dh_get_overflow`: pop the free chain head if set, else grow the
        // overflow subfile by one group.
        if self.header.free_chain != 0 {
            let group = self.header.free_chain;
            let raw = self
                .subfiles
                .read_group(OVERFLOW_SUBFILE, group, self.header.group_size as usize)?;
            let block = Block::decode(&raw);
            self.header.free_chain = block.next;
            return Ok(group);
        }
        let size = self.subfiles.file_size(OVERFLOW_SUBFILE)?;
        let next_group = (size / self.header.group_size as u64) as u32 + 1;
        Ok(next_group)
    }

    fn free_overflow_group(&mut self, group: u32) -> Result<()> {
        let block = Block {
            next: self.header.free_chain,
            used_bytes: 0,
            block_type: layout::DHT_DATA,
            body: vec![0u8; self.header.group_size as usize - BLOCK_HEADER_SIZE],
        };
        self.subfiles
            .write_group(OVERFLOW_SUBFILE, group, &block.encode())?;
        self.header.free_chain = group;
        Ok(())
    }

    pub fn read(&mut self, id: &[u8]) -> Result<Vec<u8>> {
        let group = self.group_for(id);
        self.reads += 1;
        let records = self.read_chain(group)?;
        let rec = records
            .into_iter()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound)?;
        match rec.payload {
            Payload::Inline(d) => Ok(d),
            Payload::BigRec { head_group, .. } => {
                let raw = self.subfiles.read_group(
                    OVERFLOW_SUBFILE,
                    head_group,
                    self.header.group_size as usize,
                )?;
                // `data_len` is never persisted in the in-group `DH_RECORD`
                // (that 4-byte field holds the head-group pointer instead);
                // the real length lives only in the big-record block header.
                let big = crate::record::BigBlock::decode(&raw);
                Ok(big.data[..big.data_len as usize].to_vec())
            }
        }
    }

    pub fn delete(&mut self, id: &[u8]) -> Result<()> {
        if crate::UPDATES_SUSPENDED.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::ReadOnly);
        }
        let group = self.group_for(id);
        {
            let mut locks = self.glocks.lock().unwrap();
            locks.acquire_write(self.file_id, group, 0, || false)?;
        }
        let result = self.delete_locked(id, group);
        self.glocks.lock().unwrap().release(self.file_id, group);
        result
    }

    fn delete_locked(&mut self, id: &[u8], group: u32) -> Result<()> {
        let mut records = self.read_chain(group)?;
        let pos = records
            .iter()
            .position(|r| r.id == id)
            .ok_or(StoreError::NotFound)?;
        let removed = records.remove(pos);
        let delta = removed.encode().len() as i64;
        if let Payload::BigRec { head_group, .. } = removed.payload {
            self.free_overflow_group(head_group)?;
        }
        self.write_chain(group, &records)?;
        self.header.add_load_bytes(-delta);
        self.header.record_count -= 1;
        self.deletes += 1;
        self.maybe_merge()?;
        self.flush_header()
    }

    /// Splits one bucket when load exceeds `split_load` percent, per
    /// classic linear hashing: the bucket at `modulus - mod_value/2` (the
    /// next one scheduled) gives up half its records to a brand new bucket
    /// at `modulus + 1`; `modulus` grows by one and `mod_value` doubles
    /// once a full pass completes.
    fn maybe_split(&mut self) -> Result<()> {
        if self.header.load_percent() < self.header.split_load as u32 {
            return Ok(());
        }
        let mod_value = self.header.mod_value;
        let modulus = self.header.modulus;
        let splitting_group = modulus - mod_value / 2 + 1;
        let new_modulus = modulus + 1;
        let new_group = new_modulus;

        let records = self.read_chain(splitting_group)?;
        self.header.modulus = new_modulus;
        if modulus == mod_value {
            self.header.mod_value = mod_value * 2;
        }

        let mut keep = Vec::new();
        let mut moved = Vec::new();
        for rec in records {
            let g = bucket_for(hash_id(&rec.id), self.header.modulus, self.header.mod_value);
            if g == splitting_group {
                keep.push(rec);
            } else {
                moved.push(rec);
            }
        }
        self.write_chain(splitting_group, &keep)?;
        self.write_chain(new_group, &moved)?;
        info!(
            "split: group {} -> {} + {} (modulus now {})",
            splitting_group, splitting_group, new_group, self.header.modulus
        );
        Ok(())
    }

    /// Reverse of `maybe_split`, triggered when load drops below
    /// `merge_load` percent and `modulus` is still above `min_modulus`.
    fn maybe_merge(&mut self) -> Result<()> {
        if self.header.modulus <= self.header.min_modulus {
            return Ok(());
        }
        if self.header.load_percent() > self.header.merge_load as u32 {
            return Ok(());
        }
        let modulus = self.header.modulus;
        let mod_value = self.header.mod_value;
        let last_group = modulus;
        let target_group = modulus - mod_value / 2;
        if target_group == 0 {
            return Ok(());
        }
        let moved = self.read_chain(last_group)?;
        let mut target = self.read_chain(target_group)?;
        target.extend(moved);
        self.header.modulus = modulus - 1;
        if self.header.modulus == mod_value / 2 && mod_value > self.header.min_modulus {
            self.header.mod_value = mod_value / 2;
        }
        self.write_chain(target_group, &target)?;
        self.write_chain(last_group, &[])?;
        warn!(
            "merge: group {} absorbed into {} (modulus now {})",
            last_group, target_group, self.header.modulus
        );
        Ok(())
    }

    /// `dh_configure`: runtime reconfiguration of tuning parameters,
    /// present in the original but absent from the component description.
    pub fn configure(
        &mut self,
        min_modulus: Option<u32>,
        split_load: Option<u16>,
        merge_load: Option<u16>,
        big_rec_size: Option<u32>,
    ) -> Result<()> {
        let mut locks = self.glocks.lock().unwrap();
        locks.acquire_write(self.file_id, HEADER_GROUP, 0, || false)?;
        drop(locks);
        if let Some(v) = min_modulus {
            self.header.min_modulus = v;
        }
        if let Some(v) = split_load {
            self.header.split_load = v;
        }
        if let Some(v) = merge_load {
            self.header.merge_load = v;
        }
        if let Some(v) = big_rec_size {
            self.header.big_rec_size = v;
        }
        self.flush_header()?;
        self.glocks.lock().unwrap().release(self.file_id, HEADER_GROUP);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subfile::SubfileSet;
    use std::sync::{Arc, Mutex};

    fn make_file(dir: &std::path::Path) -> HashFile {
        std::fs::create_dir_all(dir).unwrap();
        let cache = Arc::new(Mutex::new(subfile_io::cache::FdsCache::new(16)));
        let sfs = SubfileSet::new(1, dir.to_str().unwrap(), 1024, layout::DH_VERSION, cache);
        let glocks = Arc::new(Mutex::new(GroupLockTable::new(64)));
        HashFile::create(1, dir.to_str().unwrap(), 1024, 1, 60, 40, 600, sfs, glocks)
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = std::env::temp_dir().join(format!("hashfile_test_rw_{}", std::process::id()));
        let mut hf = make_file(&dir);
        hf.write(b"K01", vec![b'x'; 80]).unwrap();
        let back = hf.read(b"K01").unwrap();
        assert_eq!(back.len(), 80);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn delete_then_read_not_found() {
        let dir = std::env::temp_dir().join(format!("hashfile_test_del_{}", std::process::id()));
        let mut hf = make_file(&dir);
        hf.write(b"K01", vec![b'x'; 10]).unwrap();
        hf.delete(b"K01").unwrap();
        let err = hf.read(b"K01").unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn big_record_round_trips() {
        let dir = std::env::temp_dir().join(format!("hashfile_test_big_{}", std::process::id()));
        let mut hf = make_file(&dir);
        hf.write(b"BIG", vec![b'z'; 2048]).unwrap();
        let back = hf.read(b"BIG").unwrap();
        assert_eq!(back.len(), 2048);
        assert!(back.iter().all(|&b| b == b'z'));
        std::fs::remove_dir_all(&dir).ok();
    }
}
