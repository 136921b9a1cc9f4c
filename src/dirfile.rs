//! Directory-file fallback (C9): a file whose on-disk form is a plain
//! filesystem directory holding one file per record. Read/write/delete map
//! onto open/read/unlink with percent-encoding of characters the
//! filesystem can't carry literally, and an optional field-mark-to-newline
//! translation toggled per open.

use crate::error::{Result, StoreError};
use std::fs;
use std::path::{Path, PathBuf};

pub const FIELD_MARK: u8 = 0xFE;

/// Characters that map onto filesystem-unsafe bytes and must be
/// percent-encoded in the on-disk filename.
fn needs_encoding(b: u8) -> bool {
    matches!(b, b'/' | b'%' | 0..=0x1F | 0x7F)
}

pub fn encode_filename(id: &[u8]) -> String {
    let mut out = String::with_capacity(id.len());
    for &b in id {
        if needs_encoding(b) {
            out.push_str(&format!("%{:02X}", b));
        } else {
            out.push(b as char);
        }
    }
    out
}

pub fn decode_filename(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(&name[i + 1..i + 3], 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

pub struct DirFile {
    root: PathBuf,
    /// When set, field marks (0xFE) are translated to '\n' on write and
    /// back to 0xFE on read, matching text-editor-friendly directory files.
    pub newline_mode: bool,
}

impl DirFile {
    pub fn open(root: impl Into<PathBuf>, newline_mode: bool) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, newline_mode })
    }

    fn path_for(&self, id: &[u8]) -> PathBuf {
        self.root.join(encode_filename(id))
    }

    pub fn write(&self, id: &[u8], data: &[u8]) -> Result<()> {
        let body = if self.newline_mode {
            data.iter()
                .map(|&b| if b == FIELD_MARK { b'\n' } else { b })
                .collect::<Vec<u8>>()
        } else {
            data.to_vec()
        };
        fs::write(self.path_for(id), body)?;
        Ok(())
    }

    pub fn read(&self, id: &[u8]) -> Result<Vec<u8>> {
        let body = fs::read(self.path_for(id)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound
            } else {
                StoreError::Io(e)
            }
        })?;
        Ok(if self.newline_mode {
            body.into_iter()
                .map(|b| if b == b'\n' { FIELD_MARK } else { b })
                .collect()
        } else {
            body
        })
    }

    pub fn delete(&self, id: &[u8]) -> Result<()> {
        fs::remove_file(self.path_for(id)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound
            } else {
                StoreError::Io(e)
            }
        })
    }

    pub fn list_ids(&self) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                out.push(decode_filename(&entry.file_name().to_string_lossy()));
            }
        }
        Ok(out)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restricted_characters_round_trip_through_filename() {
        let id = b"a/b%c\x01d";
        let encoded = encode_filename(id);
        assert!(!encoded.contains('/'));
        assert_eq!(decode_filename(&encoded), id);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = std::env::temp_dir().join(format!("dirfile_test_{}", std::process::id()));
        let df = DirFile::open(&dir, false).unwrap();
        df.write(b"K01", b"hello").unwrap();
        assert_eq!(df.read(b"K01").unwrap(), b"hello");
        df.delete(b"K01").unwrap();
        assert!(matches!(df.read(b"K01").unwrap_err(), StoreError::NotFound));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn newline_mode_translates_field_marks() {
        let dir = std::env::temp_dir().join(format!("dirfile_test_nl_{}", std::process::id()));
        let df = DirFile::open(&dir, true).unwrap();
        df.write(b"K01", &[b'a', FIELD_MARK, b'b']).unwrap();
        let on_disk = std::fs::read(dir.join("K01")).unwrap();
        assert_eq!(on_disk, vec![b'a', b'\n', b'b']);
        assert_eq!(df.read(b"K01").unwrap(), vec![b'a', FIELD_MARK, b'b']);
        std::fs::remove_dir_all(&dir).ok();
    }
}
