//! Select engine (C7): a resumable group-by-group scan over a primary
//! file's bucket range, with self-correcting header statistics when a scan
//! completes without an interleaved update.

use crate::error::Result;
use crate::hashfile::HashFile;

/// Cursor over the groups `1..=modulus` of a file, stepped one group at a
/// time so the caller can interleave other operations between steps
/// (`selectleft`/`selectright` in the AK engine follow the same shape).
pub struct Select {
    next_group: u32,
    last_group: u32,
    /// Snapshot of the file's update counter taken at `start`; statistics
    /// are only trusted back into the header if this never changed.
    started_record_count: i64,
    emitted: u64,
    /// `inhibit_count`: bumped on the file while a select is outstanding so
    /// the file cannot be closed out from under a resumable scan.
    active: bool,
}

impl Select {
    pub fn start(file: &HashFile) -> Self {
        Self {
            next_group: 1,
            last_group: file.header.modulus,
            started_record_count: file.header.record_count,
            emitted: 0,
            active: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Advances one group, returning the ids found in it, or `None` once
    /// the scan has covered every group up to the modulus observed at
    /// `start`. Reading beyond `modulus` would double-count groups created
    /// by a split that happened mid-scan, so the original bound is fixed
    /// at `start` rather than re-read each step.
    pub fn step(&mut self, file: &mut HashFile) -> Result<Option<Vec<Vec<u8>>>> {
        if !self.active || self.next_group > self.last_group {
            self.finish(file);
            return Ok(None);
        }
        let group = self.next_group;
        self.next_group += 1;
        let records = file.read_chain_for_select(group)?;
        self.emitted += records.len() as u64;
        Ok(Some(records.into_iter().map(|r| r.id).collect()))
    }

    /// Marks the scan done. If the file's record count never moved during
    /// the scan, the observed totals are trusted back into the header;
    /// otherwise they're left untouched since a concurrent writer may have
    /// changed groups already scanned.
    fn finish(&mut self, file: &mut HashFile) {
        if self.active {
            self.active = false;
            if file.header.record_count == self.started_record_count {
                file.header.record_count = self.emitted as i64;
            }
        }
    }

    pub fn abandon(&mut self, file: &mut HashFile) {
        self.active = false;
        let _ = file;
    }
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
    fn scan_visits_every_group_once() {
        let dir = std::env::temp_dir().join(format!("select_test_{}", std::process::id()));
        let mut hf = make_file(&dir);
        hf.write(b"K01", vec![1]).unwrap();
        hf.write(b"K02", vec![2]).unwrap();

        let mut sel = Select::start(&hf);
        let mut total = 0usize;
        while let Some(ids) = sel.step(&mut hf).unwrap() {
            total += ids.len();
        }
        assert_eq!(total, 2);
        assert!(!sel.is_active());
        std::fs::remove_dir_all(&dir).ok();
    }
}
