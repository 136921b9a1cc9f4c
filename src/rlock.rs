//! Record lock manager (C4): cyclic-hash record locks keyed by
//! `(file_id, hash(id))`, shared/update modes, deadlock detection by
//! walking a waits-for graph to a configured depth, and a per-process
//! local lock table mirror so file close / non-id RELEASE forms don't
//! need to scan the shared table (`LLT_ENTRY` in `locks.h`).

use crate::error::{Result, StoreError};
use crate::types::{FileId, TxnId, UserId};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Update,
}

#[derive(Debug, Clone)]
struct RLockEntry {
    /// Home bucket index of the chain this cell belongs to, plus one so
    /// that 0 unambiguously means "free" (home cells are numbered from 1).
    hash: u32,
    file_id: FileId,
    id: Vec<u8>,
    owner: UserId,
    mode: LockMode,
    waiters: u32,
    txn_id: TxnId,
}

impl RLockEntry {
    fn is_free(&self) -> bool {
        self.hash == 0
    }
}

fn id_hash(id: &[u8]) -> u32 {
    id.iter().fold(0u32, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u32))
}

/// `RLockHash(f,h) = ((f ^ h) % numlocks) + 1`.
fn rlock_hash(file_id: FileId, hash: u32, numlocks: usize) -> usize {
    (((file_id as u32) ^ hash) as usize % numlocks) + 1
}

pub struct RecordLockTable {
    cells: Vec<RLockEntry>,
    /// waiter -> blocker, used for deadlock detection. A process can only
    /// be blocked on one lock at a time in this synchronous model.
    waits_for: HashMap<UserId, UserId>,
    deadlock_depth: u32,
}

impl RecordLockTable {
    pub fn new(numlocks: usize, deadlock_depth: u32) -> Self {
        let free = RLockEntry {
            hash: 0,
            file_id: 0,
            id: Vec::new(),
            owner: 0,
            mode: LockMode::Shared,
            waiters: 0,
            txn_id: 0,
        };
        Self {
            // cell 0 is unused (cyclic hash numbers cells from 1), matching
            // `GroupLockTable`'s layout.
            cells: vec![free; numlocks + 1],
            waits_for: HashMap::new(),
            deadlock_depth,
        }
    }

    /// Home cell this id would hash to; exposed for tests / stats only,
    /// the table itself probes from this cell on collision.
    pub fn home_cell(&self, file_id: FileId, id: &[u8]) -> usize {
        rlock_hash(file_id, id_hash(id), self.cells.len() - 1)
    }

    fn find_cell(&self, file_id: FileId, id: &[u8], home: usize) -> Option<usize> {
        let n = self.cells.len() - 1;
        for step in 0..n {
            let idx = 1 + (home - 1 + step) % n;
            let cell = &self.cells[idx];
            if cell.is_free() {
                return None;
            }
            if cell.file_id == file_id && cell.id == id {
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

    fn would_deadlock(&self, waiter: UserId, blocker: UserId) -> bool {
        let mut cur = blocker;
        for _ in 0..self.deadlock_depth {
            if cur == waiter {
                return true;
            }
            match self.waits_for.get(&cur) {
                Some(&next) => cur = next,
                None => return false,
            }
        }
        false
    }

    pub fn acquire(
        &mut self,
        file_id: FileId,
        id: &[u8],
        mode: LockMode,
        owner: UserId,
        txn_id: TxnId,
        cancelled: impl Fn() -> bool,
        llt: &mut LocalLockTable,
    ) -> Result<()> {
        let home = rlock_hash(file_id, id_hash(id), self.cells.len() - 1);
        loop {
            match self.find_cell(file_id, id, home) {
                None => {
                    if let Some(idx) = self.find_free_cell(home) {
                        self.cells[idx] = RLockEntry {
                            hash: home as u32,
                            file_id,
                            id: id.to_vec(),
                            owner,
                            mode,
                            waiters: 0,
                            txn_id,
                        };
                        self.waits_for.remove(&owner);
                        llt.record(file_id, id);
                        return Ok(());
                    }
                    return Err(StoreError::LockTableFull);
                }
                Some(idx) => {
                    let existing_mode = self.cells[idx].mode;
                    let existing_owner = self.cells[idx].owner;
                    let compatible =
                        existing_mode == LockMode::Shared && mode == LockMode::Shared
                            || existing_owner == owner;
                    if compatible {
                        self.waits_for.remove(&owner);
                        llt.record(file_id, id);
                        return Ok(());
                    }
                    if self.would_deadlock(owner, existing_owner) {
                        self.waits_for.remove(&owner);
                        return Err(StoreError::Deadlock);
                    }
                    self.waits_for.insert(owner, existing_owner);
                    self.cells[idx].waiters += 1;
                    if cancelled() {
                        return Err(StoreError::LockDenied(existing_owner));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    pub fn release(&mut self, file_id: FileId, id: &[u8]) {
        let home = rlock_hash(file_id, id_hash(id), self.cells.len() - 1);
        if let Some(idx) = self.find_cell(file_id, id, home) {
            self.cells[idx] = RLockEntry {
                hash: 0,
                file_id: 0,
                id: Vec::new(),
                owner: 0,
                mode: LockMode::Shared,
                waiters: 0,
                txn_id: 0,
            };
        }
    }

    pub fn release_all_for(&mut self, owner: UserId) {
        for cell in self.cells.iter_mut() {
            if !cell.is_free() && cell.owner == owner {
                *cell = RLockEntry {
                    hash: 0,
                    file_id: 0,
                    id: Vec::new(),
                    owner: 0,
                    mode: LockMode::Shared,
                    waiters: 0,
                    txn_id: 0,
                };
            }
        }
        self.waits_for.retain(|&w, &mut b| w != owner && b != owner);
    }

    pub fn is_locked(&self, file_id: FileId, id: &[u8]) -> bool {
        let home = rlock_hash(file_id, id_hash(id), self.cells.len() - 1);
        self.find_cell(file_id, id, home).is_some()
    }
}

/// Per-process mirror of the locks it holds, so closing a file or a
/// non-specific RELEASE doesn't require scanning the shared table.
#[derive(Default)]
pub struct LocalLockTable {
    held: Vec<(FileId, Vec<u8>)>,
}

impl LocalLockTable {
    fn record(&mut self, file_id: FileId, id: &[u8]) {
        self.held.push((file_id, id.to_vec()));
    }

    pub fn held_for_file(&self, file_id: FileId) -> impl Iterator<Item = &Vec<u8>> {
        self.held
            .iter()
            .filter(move |(f, _)| *f == file_id)
            .map(|(_, id)| id)
    }

    /// `EVT_REBUILD_LLT`: an administrator forcibly released locks owned by
    /// this process from another process. The local mirror must be thrown
    /// away rather than trusted, since it no longer reflects the shared
    /// table's truth.
    pub fn rebuild(&mut self) {
        self.held.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_are_compatible() {
        let mut t = RecordLockTable::new(64, 5);
        let mut llt = LocalLockTable::default();
        t.acquire(1, b"X", LockMode::Shared, 10, 0, || false, &mut llt)
            .unwrap();
        t.acquire(1, b"X", LockMode::Shared, 11, 0, || false, &mut llt)
            .unwrap();
    }

    #[test]
    fn update_lock_denies_other_owner() {
        let mut t = RecordLockTable::new(64, 5);
        let mut llt = LocalLockTable::default();
        t.acquire(1, b"X", LockMode::Update, 10, 0, || false, &mut llt)
            .unwrap();
        let mut tries = 0;
        let res = t.acquire(1, b"X", LockMode::Update, 11, 0, || {
            tries += 1;
            tries > 2
        }, &mut llt);
        assert!(res.is_err());
    }

    #[test]
    fn full_table_returns_lock_table_full() {
        let mut t = RecordLockTable::new(2, 5);
        let mut llt = LocalLockTable::default();
        t.acquire(1, b"A", LockMode::Update, 1, 0, || false, &mut llt)
            .unwrap();
        t.acquire(1, b"B", LockMode::Update, 2, 0, || false, &mut llt)
            .unwrap();
        let res = t.acquire(1, b"C", LockMode::Update, 3, 0, || false, &mut llt);
        assert!(matches!(res, Err(StoreError::LockTableFull)));
    }

    #[test]
    fn detects_two_cycle_deadlock() {
        let mut t = RecordLockTable::new(64, 5);
        let mut llt_a = LocalLockTable::default();
        let mut llt_b = LocalLockTable::default();
        t.acquire(1, b"X", LockMode::Update, 1, 0, || false, &mut llt_a)
            .unwrap();
        t.acquire(1, b"Y", LockMode::Update, 2, 0, || false, &mut llt_b)
            .unwrap();
        // process 1 now waits on Y (held by 2); process 2 waits on X (held by 1) -> cycle.
        let mut tries = 0;
        t.acquire(1, b"Y", LockMode::Update, 1, 0, || {
            tries += 1;
            tries > 50
        }, &mut llt_a)
            .ok();
        let res = t.acquire(1, b"X", LockMode::Update, 2, 0, || false, &mut llt_b);
        assert!(matches!(res, Err(StoreError::Deadlock)));
    }
}
