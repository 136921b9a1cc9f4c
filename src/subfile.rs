//! Subfile I/O (C2): positions reads/writes within a logical file's
//! numbered subfiles, on top of `subfile_io`'s FDS-style open-handle cache.
//! Grounded on `dh_read_group`/`dh_write_group`/`dh_get_overflow`/
//! `dh_free_overflow` in `dh_file.c`.

use crate::error::{Result, StoreError};
use crate::layout::{self, DH_AK_NODE_SIZE};
use crate::types::FileId;
use subfile_io::cache::FdsCache;
use subfile_io::{OpenMode, SeekType};

pub struct SubfileSet {
    file_id: FileId,
    dir: String,
    group_size: u32,
    header_bytes: u32,
    file_version: u8,
    ak_header_bytes: u32,
    cache: std::sync::Arc<std::sync::Mutex<FdsCache>>,
}

impl SubfileSet {
    pub fn new(
        file_id: FileId,
        dir: impl Into<String>,
        group_size: u32,
        file_version: u8,
        cache: std::sync::Arc<std::sync::Mutex<FdsCache>>,
    ) -> Self {
        Self {
            file_id,
            dir: dir.into(),
            group_size,
            header_bytes: group_size,
            file_version,
            ak_header_bytes: DH_AK_NODE_SIZE as u32,
            cache,
        }
    }

    fn path_for(&self, subfile: u16) -> String {
        format!("{}/~{}", self.dir, subfile)
    }

    fn open(&self, subfile: u16, mode: OpenMode) -> Result<()> {
        let path = self.path_for(subfile);
        let mut cache = self.cache.lock().unwrap();
        cache
            .open((self.file_id as u32, subfile), &path, mode)
            .map_err(StoreError::Driver)?;
        Ok(())
    }

    /// Reads `len` bytes of a primary/overflow group, or an AK node if
    /// `subfile >= AK_BASE_SUBFILE`. `group == 0` reads the subfile header.
    pub fn read_group(&self, subfile: u16, group: u32, len: usize) -> Result<Vec<u8>> {
        self.open(subfile, OpenMode::Update)?;
        let offset = if group == 0 {
            0
        } else if subfile < layout::AK_BASE_SUBFILE {
            layout::group_offset(group, self.group_size, self.header_bytes)
        } else {
            (group as u64 - 1) * DH_AK_NODE_SIZE as u64 + self.ak_header_bytes as u64
        };
        let mut cache = self.cache.lock().unwrap();
        let handle = cache
            .open((self.file_id as u32, subfile), &self.path_for(subfile), OpenMode::Update)
            .map_err(StoreError::Driver)?;
        handle
            .seek(offset as i64, SeekType::Set)
            .map_err(StoreError::Driver)?;
        let mut buf = vec![0u8; len];
        let n = handle.read(&mut buf).map_err(StoreError::Driver)?;
        if n < len {
            buf[n..].fill(0);
        }
        Ok(buf)
    }

    pub fn write_group(&self, subfile: u16, group: u32, data: &[u8]) -> Result<()> {
        self.open(subfile, OpenMode::Update)?;
        let offset = if group == 0 {
            0
        } else if subfile < layout::AK_BASE_SUBFILE {
            layout::group_offset(group, self.group_size, self.header_bytes)
        } else {
            (group as u64 - 1) * DH_AK_NODE_SIZE as u64 + self.ak_header_bytes as u64
        };
        let mut cache = self.cache.lock().unwrap();
        let handle = cache
            .open((self.file_id as u32, subfile), &self.path_for(subfile), OpenMode::Update)
            .map_err(StoreError::Driver)?;
        handle
            .seek(offset as i64, SeekType::Set)
            .map_err(StoreError::Driver)?;
        handle.write(data).map_err(StoreError::Driver)?;
        Ok(())
    }

    pub fn fsync(&self, subfile: u16, policy: u8, bit: u8) -> Result<()> {
        if policy & bit == 0 {
            return Ok(());
        }
        self.open(subfile, OpenMode::Update)?;
        let mut cache = self.cache.lock().unwrap();
        let handle = cache
            .open((self.file_id as u32, subfile), &self.path_for(subfile), OpenMode::Update)
            .map_err(StoreError::Driver)?;
        handle.fsync().map_err(StoreError::Driver)?;
        Ok(())
    }

    pub fn file_size(&self, subfile: u16) -> Result<u64> {
        self.open(subfile, OpenMode::Update)?;
        let mut cache = self.cache.lock().unwrap();
        let handle = cache
            .open((self.file_id as u32, subfile), &self.path_for(subfile), OpenMode::Update)
            .map_err(StoreError::Driver)?;
        handle.file_size().map_err(StoreError::Driver)
    }
}
