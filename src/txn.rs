//! Transaction cache (C8): per-process write/delete buffering keyed by
//! `(file, id)`, replayed in record order on commit and discarded on
//! rollback. Grounded on spec.md §4.8; there is no on-disk counterpart —
//! this is purely process-local state the way the original keeps its
//! transaction buffer in process memory, not on disk.

use crate::error::{Result, StoreError};
use crate::hashfile::HashFile;
use crate::types::{FileId, TxnId};
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Buffered {
    Write(Vec<u8>),
    Delete,
}

/// One file kept open across a `close()` called mid-transaction: the
/// file-var is retained rather than torn down so buffered references
/// issued before the close remain valid until commit or rollback.
pub struct RetainedFile {
    pub file_id: FileId,
}

#[derive(Default)]
pub struct Transaction {
    id: TxnId,
    active: bool,
    /// Buffered ops in the order they were recorded, replayed in that same
    /// order on commit.
    ops: Vec<(FileId, Vec<u8>, Buffered)>,
    /// Fast lookup for read-your-writes; the authoritative replay order
    /// still comes from `ops`.
    latest: HashMap<(FileId, Vec<u8>), usize>,
    retained: HashMap<FileId, RetainedFile>,
}

impl Transaction {
    pub fn begin(id: TxnId) -> Self {
        Self {
            id,
            active: true,
            ops: Vec::new(),
            latest: HashMap::new(),
            retained: HashMap::new(),
        }
    }

    /// Begins a transaction with a fresh, randomly chosen id rather than
    /// a caller-supplied one, for the common case where nothing else in
    /// the process needs to predict the id in advance.
    pub fn begin_new() -> Self {
        Self::begin(rand::random())
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn buffer_write(&mut self, file_id: FileId, id: &[u8], data: Vec<u8>) {
        let key = (file_id, id.to_vec());
        let idx = self.ops.len();
        self.ops.push((file_id, id.to_vec(), Buffered::Write(data)));
        self.latest.insert(key, idx);
    }

    pub fn buffer_delete(&mut self, file_id: FileId, id: &[u8]) {
        let key = (file_id, id.to_vec());
        let idx = self.ops.len();
        self.ops.push((file_id, id.to_vec(), Buffered::Delete));
        self.latest.insert(key, idx);
    }

    /// Consults the buffer first. `Ok(None)` means "not buffered, fall
    /// through to the underlying file"; `Err(NotFound)` models a buffered
    /// delete being read back before commit.
    pub fn read(&self, file_id: FileId, id: &[u8]) -> Option<Result<Vec<u8>>> {
        let key = (file_id, id.to_vec());
        let idx = *self.latest.get(&key)?;
        match &self.ops[idx].2 {
            Buffered::Write(data) => Some(Ok(data.clone())),
            Buffered::Delete => Some(Err(StoreError::NotFound)),
        }
    }

    pub fn retain_on_close(&mut self, file_id: FileId) {
        self.retained.insert(file_id, RetainedFile { file_id });
    }

    pub fn retained(&self, file_id: FileId) -> bool {
        self.retained.contains_key(&file_id)
    }

    /// Replays buffered operations in record order against `lookup`, which
    /// maps a file id to its open `HashFile`. Normal group/record locks are
    /// taken by `HashFile::write`/`delete` themselves, same as any other
    /// caller.
    pub fn commit(mut self, mut lookup: impl FnMut(FileId) -> Option<()>, mut apply: impl FnMut(FileId, &[u8], Option<Vec<u8>>) -> Result<()>) -> Result<()> {
        for (file_id, id, op) in self.ops.drain(..) {
            if lookup(file_id).is_none() {
                return Err(StoreError::NotFound);
            }
            match op {
                Buffered::Write(data) => apply(file_id, &id, Some(data))?,
                Buffered::Delete => apply(file_id, &id, None)?,
            }
        }
        self.active = false;
        Ok(())
    }

    pub fn rollback(mut self) {
        self.ops.clear();
        self.latest.clear();
        self.active = false;
    }
}

/// Applies a transaction's buffered ops directly against an owned
/// `HashFile`, for the common single-file case exercised by tests.
pub fn commit_single_file(txn: Transaction, file: &mut HashFile) -> Result<()> {
    for (_, id, op) in txn.ops {
        match op {
            Buffered::Write(data) => file.write(&id, data)?,
            Buffered::Delete => file.delete(&id)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glock::GroupLockTable;
    use crate::layout;
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
    fn read_after_buffered_write_hits_buffer() {
        let mut txn = Transaction::begin(1);
        txn.buffer_write(1, b"K01", vec![9, 9]);
        let got = txn.read(1, b"K01").unwrap().unwrap();
        assert_eq!(got, vec![9, 9]);
    }

    #[test]
    fn buffered_delete_reads_as_not_found() {
        let mut txn = Transaction::begin(1);
        txn.buffer_delete(1, b"K01");
        let got = txn.read(1, b"K01").unwrap();
        assert!(matches!(got, Err(StoreError::NotFound)));
    }

    #[test]
    fn commit_replays_in_order() {
        let dir = std::env::temp_dir().join(format!("txn_test_commit_{}", std::process::id()));
        let mut hf = make_file(&dir);
        let mut txn = Transaction::begin(1);
        txn.buffer_write(1, b"K01", vec![1]);
        txn.buffer_write(1, b"K01", vec![2]);
        commit_single_file(txn, &mut hf).unwrap();
        assert_eq!(hf.read(b"K01").unwrap(), vec![2]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rollback_discards_buffer() {
        let dir = std::env::temp_dir().join(format!("txn_test_rollback_{}", std::process::id()));
        let hf = make_file(&dir);
        let mut txn = Transaction::begin(1);
        txn.buffer_write(1, b"K01", vec![1]);
        txn.rollback();
        assert!(hf.header.record_count == 0);
        std::fs::remove_dir_all(&dir).ok();
    }
}
