use crate::{OpenMode, SeekType, SubfileDriver};
use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

/// Real OS file backing one open subfile. `OpenFile()` in the original marks
/// the descriptor close-on-exec; we do the same via `libc` since `std::fs`
/// has no portable hook for it.
pub struct OsFileDriver {
    file: File,
}

impl OsFileDriver {
    pub fn open(path: &str, mode: OpenMode) -> Result<Self> {
        let mut opts = OpenOptions::new();
        match mode {
            OpenMode::New => {
                opts.read(true).write(true).create_new(true);
            }
            OpenMode::Replace => {
                opts.read(true).write(true).create(true).truncate(true);
            }
            OpenMode::Read => {
                opts.read(true);
            }
            OpenMode::Update => {
                opts.read(true).write(true);
            }
            OpenMode::Overwrite => {
                opts.read(true).write(true).create(true);
            }
        }
        let file = opts
            .open(path)
            .with_context(|| format!("dio_open: failed to open {}", path))?;
        mark_cloexec(&file)?;
        Ok(Self { file })
    }
}

#[cfg(unix)]
fn mark_cloexec(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(anyhow!("fcntl(F_GETFD) failed"));
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(anyhow!("fcntl(F_SETFD) failed"));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn mark_cloexec(_file: &File) -> Result<()> {
    Ok(())
}

impl SubfileDriver for OsFileDriver {
    fn seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        let pos = match whence {
            SeekType::Set => SeekFrom::Start(offset as u64),
            SeekType::Cur => SeekFrom::Current(offset),
            SeekType::End => SeekFrom::End(offset),
        };
        Ok(self.file.seek(pos)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.file.write(buf)?)
    }

    fn fsync(&mut self) -> Result<()> {
        Ok(self.file.sync_data()?)
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_file_size(&mut self, bytes: u64) -> Result<()> {
        Ok(self.file.set_len(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SeekType;

    #[test]
    fn round_trips_positioned_io() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("subfile_io_test_{}", std::process::id()));
        let path = dir.to_str().unwrap().to_string();
        let _ = std::fs::remove_file(&path);
        let mut f = OsFileDriver::open(&path, OpenMode::New)?;
        f.seek(0, SeekType::Set)?;
        f.write(b"hello")?;
        f.seek(0, SeekType::Set)?;
        let mut buf = [0u8; 5];
        f.read(&mut buf)?;
        assert_eq!(&buf, b"hello");
        std::fs::remove_file(&path).ok();
        Ok(())
    }
}
