//! Block storage.
//!
//! The engine reads and writes torrent data through the narrow [`Storage`]
//! trait: positioned block I/O over the torrent's concatenated byte space
//! plus on-demand piece verification. Implementations must be safe for
//! concurrent non-overlapping operations; the coordinator writes blocks,
//! peer sessions read blocks to serve uploads, and the hasher reads whole
//! pieces.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::metainfo::Info;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read or write past the end of the torrent")]
    OutOfRange,
}

/// Positioned block I/O plus piece verification.
///
/// Offsets are global: byte positions within the torrent's concatenated
/// content, so `piece * piece_length + begin` addresses a block.
pub trait Storage: Send + Sync {
    /// Fills `buf` from the given offset. Short reads are an error.
    fn read_block(&self, buf: &mut [u8], offset: u64) -> Result<(), StorageError>;

    /// Writes `buf` at the given offset.
    fn write_block(&self, buf: &[u8], offset: u64) -> Result<(), StorageError>;

    /// Reads piece `index` back and checks it against its known SHA-1.
    fn hash_piece(&self, index: u32, length: u32) -> bool;
}

/// Opens storage for a torrent under `base_dir`. The flag reports whether a
/// complete, verified copy was already on disk (seed-on-start).
pub type OpenStorage =
    fn(&Info, &Path) -> Result<(Arc<dyn Storage>, bool), StorageError>;

/// The default [`OpenStorage`]: file-backed storage laid out per the
/// torrent's file table.
pub fn open_file_storage(
    info: &Info,
    base_dir: &Path,
) -> Result<(Arc<dyn Storage>, bool), StorageError> {
    let storage = FileStorage::open(info, base_dir)?;
    let complete = storage.verify_all(info);
    Ok((Arc::new(storage), complete))
}

struct FileSlot {
    file: Mutex<fs::File>,
    offset: u64,
    length: u64,
}

/// File-backed storage. Each torrent file is opened read-write once; block
/// operations are split across the files they span.
pub struct FileStorage {
    slots: Vec<FileSlot>,
    piece_hashes: Vec<[u8; 20]>,
    piece_length: u64,
    total_length: u64,
}

impl FileStorage {
    pub fn open(info: &Info, base_dir: &Path) -> Result<Self, StorageError> {
        let mut slots = Vec::with_capacity(info.files.len());
        for entry in &info.files {
            let path: PathBuf = base_dir.join(&entry.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            slots.push(FileSlot {
                file: Mutex::new(file),
                offset: entry.offset,
                length: entry.length,
            });
        }
        Ok(Self {
            slots,
            piece_hashes: info.pieces.clone(),
            piece_length: info.piece_length,
            total_length: info.total_length,
        })
    }

    /// True if every file has its full length on disk and every piece
    /// verifies.
    fn verify_all(&self, info: &Info) -> bool {
        for slot in &self.slots {
            let len = match slot.file.lock().metadata() {
                Ok(md) => md.len(),
                Err(_) => return false,
            };
            if len < slot.length {
                return false;
            }
        }
        (0..info.num_pieces()).all(|i| self.hash_piece(i, info.piece_len(i)))
    }

    /// Splits a global range into per-file spans and applies `op`.
    fn each_span(
        &self,
        mut offset: u64,
        mut remaining: u64,
        mut op: impl FnMut(&FileSlot, u64, u64) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        if offset + remaining > self.total_length {
            return Err(StorageError::OutOfRange);
        }
        for slot in &self.slots {
            if remaining == 0 {
                break;
            }
            let end = slot.offset + slot.length;
            if offset >= end || slot.length == 0 {
                continue;
            }
            let in_file = offset - slot.offset;
            let take = (slot.length - in_file).min(remaining);
            op(slot, in_file, take)?;
            offset += take;
            remaining -= take;
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read_block(&self, buf: &mut [u8], offset: u64) -> Result<(), StorageError> {
        let mut pos = 0usize;
        self.each_span(offset, buf.len() as u64, |slot, in_file, take| {
            let mut file = slot.file.lock();
            file.seek(SeekFrom::Start(in_file))?;
            file.read_exact(&mut buf[pos..pos + take as usize])?;
            pos += take as usize;
            Ok(())
        })
    }

    fn write_block(&self, buf: &[u8], offset: u64) -> Result<(), StorageError> {
        let mut pos = 0usize;
        self.each_span(offset, buf.len() as u64, |slot, in_file, take| {
            let mut file = slot.file.lock();
            file.seek(SeekFrom::Start(in_file))?;
            file.write_all(&buf[pos..pos + take as usize])?;
            pos += take as usize;
            Ok(())
        })
    }

    fn hash_piece(&self, index: u32, length: u32) -> bool {
        let Some(expected) = self.piece_hashes.get(index as usize) else {
            return false;
        };
        let mut data = vec![0u8; length as usize];
        if self
            .read_block(&mut data, index as u64 * self.piece_length)
            .is_err()
        {
            return false;
        }
        let mut hasher = Sha1::new();
        hasher.update(&data);
        *expected == <[u8; 20]>::from(hasher.finalize())
    }
}

/// In-memory storage over a single byte buffer. Useful in tests and for
/// fault injection; opening it with content already in place reports a
/// complete copy.
pub struct MemoryStorage {
    data: Mutex<Vec<u8>>,
    piece_hashes: Vec<[u8; 20]>,
    piece_length: u64,
}

impl MemoryStorage {
    /// Empty storage sized for the torrent.
    pub fn empty(info: &Info) -> Self {
        Self {
            data: Mutex::new(vec![0u8; info.total_length as usize]),
            piece_hashes: info.pieces.clone(),
            piece_length: info.piece_length,
        }
    }

    /// Storage pre-filled with `content` (a seeder).
    pub fn seeded(info: &Info, content: Vec<u8>) -> Self {
        assert_eq!(content.len() as u64, info.total_length);
        Self {
            data: Mutex::new(content),
            piece_hashes: info.pieces.clone(),
            piece_length: info.piece_length,
        }
    }
}

impl Storage for MemoryStorage {
    fn read_block(&self, buf: &mut [u8], offset: u64) -> Result<(), StorageError> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(StorageError::OutOfRange);
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_block(&self, buf: &[u8], offset: u64) -> Result<(), StorageError> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(StorageError::OutOfRange);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn hash_piece(&self, index: u32, length: u32) -> bool {
        let Some(expected) = self.piece_hashes.get(index as usize) else {
            return false;
        };
        let data = self.data.lock();
        let start = (index as u64 * self.piece_length) as usize;
        let end = start + length as usize;
        if end > data.len() {
            return false;
        }
        let mut hasher = Sha1::new();
        hasher.update(&data[start..end]);
        *expected == <[u8; 20]>::from(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Builder;

    #[test]
    fn file_storage_round_trip() {
        let (mi, content) = Builder::new("multi", 8)
            .file("a.bin", vec![1u8; 10])
            .file("b.bin", vec![2u8; 10])
            .build();
        let dir = tempfile::tempdir().unwrap();
        let (storage, complete) = open_file_storage(&mi.info, dir.path()).unwrap();
        assert!(!complete);

        storage.write_block(&content, 0).unwrap();
        // a read spanning the file boundary
        let mut buf = vec![0u8; 6];
        storage.read_block(&mut buf, 7).unwrap();
        assert_eq!(buf, &content[7..13]);

        for i in 0..mi.info.num_pieces() {
            assert!(storage.hash_piece(i, mi.info.piece_len(i)));
        }
    }

    #[test]
    fn file_storage_detects_existing_copy() {
        let (mi, content) = Builder::new("seeded.bin", 16)
            .file("seeded.bin", vec![9u8; 40])
            .build();
        let dir = tempfile::tempdir().unwrap();
        {
            let (storage, complete) = open_file_storage(&mi.info, dir.path()).unwrap();
            assert!(!complete);
            storage.write_block(&content, 0).unwrap();
        }
        let (_, complete) = open_file_storage(&mi.info, dir.path()).unwrap();
        assert!(complete);
    }

    #[test]
    fn out_of_range_rejected() {
        let (mi, _) = Builder::new("x", 8).file("x", vec![0u8; 8]).build();
        let storage = MemoryStorage::empty(&mi.info);
        let mut buf = [0u8; 4];
        assert!(storage.read_block(&mut buf, 6).is_err());
        assert!(storage.write_block(&buf, 6).is_err());
    }

    #[test]
    fn memory_storage_hash_piece() {
        let (mi, content) = Builder::new("x", 8).file("x", vec![3u8; 20]).build();
        let storage = MemoryStorage::seeded(&mi.info, content);
        assert!(storage.hash_piece(0, 8));
        assert!(storage.hash_piece(2, 4));

        storage.write_block(&[0xff], 0).unwrap();
        assert!(!storage.hash_piece(0, 8));
    }
}
