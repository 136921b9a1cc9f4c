//! Group lock manager (C3): cyclic-hash table of group locks, ported from
//! `dh_get_group_lock`/`dh_free_group_lock` and the `GLOCK_ENTRY` layout in
//! `locks.h`. A "group" here is either a real group number in a primary/
//! overflow subfile or one of the pseudo-groups in spec.md §3/`types.rs`
//! (header, AK-subfile-scan, AK-record-update).

use crate::error::{Result, StoreError};
use crate::types::{FileId, Group, UserId};
use log::{debug, trace};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct GLockEntry {
    /// Home bucket index of the chain this cell belongs to; zero means the
    /// cell is free. This is the field the "cell free iff hash==0"
    /// invariant is stated against.
    hash: u32,
    owner: UserId,
    file_id: FileId,
    group: Group,
    /// +ve = shared (read) holder count, -ve = exclusive (write) holder.
    grp_count: i32,
}

impl GLockEntry {
    const FREE: Self = Self {
        hash: 0,
        owner: 0,
        file_id: 0,
        group: 0,
        grp_count: 0,
    };

    fn is_free(&self) -> bool {
        self.hash == 0
    }
}

pub struct GroupLockTable {
    cells: Vec<GLockEntry>,
    pub retries: u64,
    pub waits: u64,
}

/// `GLockHash(f,g) = ((f ^ g) % num_glocks) + 1`, cells numbered from 1.
fn glock_hash(file_id: FileId, group: Group, num_glocks: usize) -> usize {
    (((file_id as u32) ^ group) as usize % num_glocks) + 1
}

impl GroupLockTable {
    pub fn new(num_glocks: usize) -> Self {
        // cell 0 is unused (cyclic hash numbers cells from 1).
        Self {
            cells: vec![GLockEntry::FREE; num_glocks + 1],
            retries: 0,
            waits: 0,
        }
    }

    fn find_cell(&self, file_id: FileId, group: Group, home: usize) -> Option<usize> {
        let n = self.cells.len() - 1;
        for step in 0..n {
            let idx = 1 + (home - 1 + step) % n;
            let cell = &self.cells[idx];
            if cell.is_free() {
                return None;
            }
            if cell.file_id == file_id && cell.group == group {
                return Some(idx);
            }
        }
        None
    }

    fn find_free_cell(&self, home: usize) -> Option<usize> {
        let n = self.cells.len() - 1;
        for step in 0..n {
            let idx = 1 + (home - 1 + step) % n;
            if self.cells[idx].is_free() {
                return Some(idx);
            }
        }
        None
    }

    /// Acquires a read (shared) lock, busy-waiting with the spec's
    /// spin/yield/1ms-sleep backoff while another process holds a write
    /// lock on the same group.
    pub fn acquire_read(
        &mut self,
        file_id: FileId,
        group: Group,
        owner: UserId,
        cancelled: impl Fn() -> bool,
    ) -> Result<()> {
        let home = glock_hash(file_id, group, self.cells.len() - 1);
        loop {
            if let Some(idx) = self.find_cell(file_id, group, home) {
                let cell = &mut self.cells[idx];
                if cell.grp_count < 0 {
                    self.backoff(cancelled.as_ref())?;
                    continue;
                }
                cell.grp_count += 1;
                trace!("glock read {}:{} -> {}", file_id, group, cell.grp_count);
                return Ok(());
            }
            if let Some(idx) = self.find_free_cell(home) {
                self.cells[idx] = GLockEntry {
                    hash: home as u32,
                    owner,
                    file_id,
                    group,
                    grp_count: 1,
                };
                return Ok(());
            }
            return Err(StoreError::LockTableFull);
        }
    }

    /// Acquires an exclusive (write) lock, covering pseudo-group-0 header
    /// updates as well as ordinary data groups.
    pub fn acquire_write(
        &mut self,
        file_id: FileId,
        group: Group,
        owner: UserId,
        cancelled: impl Fn() -> bool,
    ) -> Result<()> {
        let home = glock_hash(file_id, group, self.cells.len() - 1);
        loop {
            if let Some(idx) = self.find_cell(file_id, group, home) {
                let cell = &mut self.cells[idx];
                if cell.grp_count != 0 {
                    self.backoff(cancelled.as_ref())?;
                    continue;
                }
                cell.grp_count = -1;
                cell.owner = owner;
                return Ok(());
            }
            if let Some(idx) = self.find_free_cell(home) {
                self.cells[idx] = GLockEntry {
                    hash: home as u32,
                    owner,
                    file_id,
                    group,
                    grp_count: -1,
                };
                return Ok(());
            }
            return Err(StoreError::LockTableFull);
        }
    }

    pub fn release(&mut self, file_id: FileId, group: Group) {
        let home = glock_hash(file_id, group, self.cells.len() - 1);
        if let Some(idx) = self.find_cell(file_id, group, home) {
            let cell = &mut self.cells[idx];
            if cell.grp_count > 0 {
                cell.grp_count -= 1;
            } else {
                cell.grp_count = 0;
            }
            if cell.grp_count == 0 {
                debug!("glock free {}:{}", file_id, group);
                self.cells[idx] = GLockEntry::FREE;
            }
        }
    }

    fn backoff(&mut self, cancelled: &impl Fn() -> bool) -> Result<()> {
        self.retries += 1;
        if self.retries % 100 < 50 {
            std::hint::spin_loop();
        } else if self.retries % 100 < 100 {
            thread::yield_now();
        } else {
            self.waits += 1;
            thread::sleep(Duration::from_millis(1));
        }
        if cancelled() {
            return Err(StoreError::Retry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_writers_exclude() {
        let mut t = GroupLockTable::new(16);
        t.acquire_read(1, 5, 10, || false).unwrap();
        t.acquire_read(1, 5, 11, || false).unwrap();
        let mut tries = 0;
        let res = t.acquire_write(1, 5, 12, || {
            tries += 1;
            tries > 2
        });
        assert!(res.is_err());
        t.release(1, 5);
        t.release(1, 5);
        t.acquire_write(1, 5, 12, || false).unwrap();
    }

    #[test]
    fn distinct_groups_do_not_collide() {
        let mut t = GroupLockTable::new(16);
        t.acquire_write(1, 5, 1, || false).unwrap();
        t.acquire_write(1, 6, 2, || false).unwrap();
    }
}
