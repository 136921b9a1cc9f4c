//! Shared control region (C1): the process-wide resource every OS process
//! attaches to before touching locks or files. Grounded on REDESIGN FLAG 1
//! ("global mutable control region" -> "explicitly-initialised process-wide
//! resource with typed accessors and scoped semaphore guards") and FLAG 2
//! (raw pointer-indexed tables -> index-addressed arrays).
//!
//! Backed by a `memmap2`-mapped file so independent OS processes can
//! rendezvous on the same bytes; "named semaphores" are reimplemented as
//! atomics living inside the mapped region itself, since the region *is*
//! the named resource processes share.

use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

/// A spin -> yield -> millisecond-sleep backoff semaphore living at a fixed
/// byte offset inside the shared mapping. No absolute deadline: callers
/// that need to give up do so by checking a cancellation flag between
/// attempts, matching the "no timeouts, only cancellation events" model in
/// spec.md §5.
pub struct Semaphore<'a> {
    cell: &'a AtomicI32,
}

pub struct SemGuard<'a> {
    cell: &'a AtomicI32,
    released: bool,
}

impl<'a> Semaphore<'a> {
    /// # Safety
    /// `cell` must point at a valid, exclusively-owned-for-this-role
    /// `AtomicI32` inside the shared mapping.
    pub unsafe fn at(cell: &'a AtomicI32) -> Self {
        Self { cell }
    }

    /// Acquire, backing off the way `dh_get_group_lock` does: a few busy
    /// spins, then `thread::yield_now()`, then a 1ms sleep, repeated until
    /// the cell flips from 0 to 1 or `cancelled` reports true.
    pub fn acquire(&self, cancelled: impl Fn() -> bool) -> Option<SemGuard<'a>> {
        let mut spins = 0;
        loop {
            if self
                .cell
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(SemGuard {
                    cell: self.cell,
                    released: false,
                });
            }
            if cancelled() {
                return None;
            }
            spins += 1;
            if spins < 50 {
                std::hint::spin_loop();
            } else if spins < 100 {
                thread::yield_now();
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

impl<'a> SemGuard<'a> {
    /// Release early without waiting for drop, for call paths that must
    /// give up the lock before doing more work in the same scope.
    pub fn release(mut self) {
        self.cell.store(0, Ordering::Release);
        self.released = true;
    }
}

impl<'a> Drop for SemGuard<'a> {
    fn drop(&mut self) {
        if !self.released {
            self.cell.store(0, Ordering::Release);
        }
    }
}

/// Revision stamp bumped on every structural change to the shared tables,
/// so attaching processes can detect they raced a cleanup/rebuild.
pub struct ControlRegion {
    mmap: MmapMut,
}

const REVISION_OFFSET: usize = 0;
const FILE_TABLE_SEM_OFFSET: usize = 4;
const RECORD_LOCK_SEM_OFFSET: usize = 8;
const GROUP_LOCK_SEM_OFFSET: usize = 12;
const HEADER_RESERVED: usize = 64;

impl ControlRegion {
    /// Creates (or reopens) the region backing file at `path`, sized to
    /// hold `HEADER_RESERVED` bytes of control fields plus `extra_bytes`
    /// for the file/lock tables a caller lays out on top.
    pub fn open_or_create(path: &Path, extra_bytes: usize) -> std::io::Result<Self> {
        let total = HEADER_RESERVED + extra_bytes;
        let needs_init = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(total as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let region = Self { mmap };
        if needs_init {
            region.revision().store(0, Ordering::SeqCst);
            region.file_table_sem_cell().store(0, Ordering::SeqCst);
            region.record_lock_sem_cell().store(0, Ordering::SeqCst);
            region.group_lock_sem_cell().store(0, Ordering::SeqCst);
        }
        Ok(region)
    }

    fn atomic_at(&self, offset: usize) -> &AtomicI32 {
        unsafe { &*(self.mmap.as_ptr().add(offset) as *const AtomicI32) }
    }

    pub fn revision(&self) -> &AtomicI32 {
        self.atomic_at(REVISION_OFFSET)
    }

    fn file_table_sem_cell(&self) -> &AtomicI32 {
        self.atomic_at(FILE_TABLE_SEM_OFFSET)
    }
    fn record_lock_sem_cell(&self) -> &AtomicI32 {
        self.atomic_at(RECORD_LOCK_SEM_OFFSET)
    }
    fn group_lock_sem_cell(&self) -> &AtomicI32 {
        self.atomic_at(GROUP_LOCK_SEM_OFFSET)
    }

    pub fn file_table_sem(&self) -> Semaphore<'_> {
        unsafe { Semaphore::at(self.file_table_sem_cell()) }
    }
    pub fn record_lock_sem(&self) -> Semaphore<'_> {
        unsafe { Semaphore::at(self.record_lock_sem_cell()) }
    }
    pub fn group_lock_sem(&self) -> Semaphore<'_> {
        unsafe { Semaphore::at(self.group_lock_sem_cell()) }
    }

    /// Raw byte slice past the reserved header, for a caller-defined table
    /// layout (used by `glock`/`rlock` to lay out their cyclic-hash
    /// tables). Index-addressed, never handed out as a pointer.
    pub fn table_bytes(&self) -> &[u8] {
        &self.mmap[HEADER_RESERVED..]
    }

    pub fn table_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[HEADER_RESERVED..]
    }

    /// Cleanup-recovery path: on attach, a process may find the region left
    /// in an inconsistent state by a peer that died holding a semaphore
    /// (no OS-level "robust mutex" equivalent here). `force_clear_sems`
    /// unconditionally zeroes every semaphore cell; callers invoke it only
    /// from an administrative "rebuild locks" action, matching
    /// `EVT_REBUILD_LLT`'s "admin forced this" semantics, never silently.
    pub fn force_clear_sems(&self) {
        self.file_table_sem_cell().store(0, Ordering::SeqCst);
        self.record_lock_sem_cell().store(0, Ordering::SeqCst);
        self.group_lock_sem_cell().store(0, Ordering::SeqCst);
        self.revision().fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let dir = std::env::temp_dir().join(format!("control_region_test_{}", std::process::id()));
        let region = ControlRegion::open_or_create(&dir, 4096).unwrap();
        {
            let _guard = region.file_table_sem().acquire(|| false).unwrap();
            assert_eq!(region.file_table_sem_cell().load(Ordering::SeqCst), 1);
        }
        assert_eq!(region.file_table_sem_cell().load(Ordering::SeqCst), 0);
        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn second_acquire_blocks_until_release() {
        let dir = std::env::temp_dir().join(format!("control_region_test2_{}", std::process::id()));
        let region = ControlRegion::open_or_create(&dir, 4096).unwrap();
        let guard = region.group_lock_sem().acquire(|| false).unwrap();
        let mut tries = 0;
        let second = region.group_lock_sem().acquire(|| {
            tries += 1;
            tries > 3
        });
        assert!(second.is_none());
        drop(guard);
        let third = region.group_lock_sem().acquire(|| false);
        assert!(third.is_some());
        std::fs::remove_file(&dir).ok();
    }
}
