//! Positioned I/O over the numbered subfiles of a file (subfile 0 = primary,
//! 1 = overflow, 2..33 = AK indices), plus the FDS-style open-handle cache
//! that keeps the process's fd count under a configured ceiling.

use anyhow::Result;

pub mod cache;
pub mod file;

/// How a subfile is opened, mirroring the DIO_* open modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create, fail if it already exists.
    New,
    /// Create, truncating if it already exists.
    Replace,
    /// Open existing, read-only.
    Read,
    /// Open existing, read/write.
    Update,
    /// Open, creating if missing.
    Overwrite,
}

#[derive(Debug, Clone, Copy)]
pub enum SeekType {
    Set,
    Cur,
    End,
}

/// Abstract positioned-I/O handle over a single OS file. One instance per
/// open subfile.
pub trait SubfileDriver: Send {
    fn seek(&mut self, offset: i64, whence: SeekType) -> Result<u64>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn fsync(&mut self) -> Result<()>;
    fn file_size(&self) -> Result<u64>;
    fn set_file_size(&mut self, bytes: u64) -> Result<()>;
}

#[derive(Default, Debug, Clone, Copy)]
pub struct SubfileStats {
    pub read_cnt: u64,
    pub write_cnt: u64,
    pub seek_cnt: u64,
    pub opens: u64,
    pub evictions: u64,
}
