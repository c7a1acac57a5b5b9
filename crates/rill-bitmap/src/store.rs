//! Block storage backends.
//!
//! [`BlockStore`] is the seam between the allocator and durable storage:
//! fixed-size metadata blocks addressed by index, plus online extension
//! for resize. [`MemBlockStore`] backs tests and scratch groups;
//! [`FileBlockStore`] maps blocks onto a file with pread/pwrite.

use parking_lot::Mutex;
use rill_error::{Result, RillError};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Fixed-size block storage for one metadata file.
pub trait BlockStore: Send + Sync {
    /// Block size in bytes.
    fn block_size(&self) -> u32;

    /// Current number of blocks.
    fn block_count(&self) -> u64;

    /// Read one block. Out-of-range reads are an error, never
    /// zero-filled: the caller's geometry says how many blocks exist.
    fn read_block(&self, block: u64) -> Result<Vec<u8>>;

    /// Write one block. `data` must be exactly one block long.
    fn write_block(&self, block: u64, data: &[u8]) -> Result<()>;

    /// Grow to `new_block_count` blocks, zero-filling the new space.
    /// Shrinking is rejected.
    fn extend(&self, new_block_count: u64) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn bounds_error(block: u64, count: u64) -> RillError {
    RillError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("block {block} out of range (have {count})"),
    ))
}

// ── In-memory store ─────────────────────────────────────────────────────────

/// Heap-backed block store.
pub struct MemBlockStore {
    block_size: u32,
    blocks: Mutex<Vec<Vec<u8>>>,
}

impl MemBlockStore {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        let blocks = (0..block_count)
            .map(|_| vec![0u8; block_size as usize])
            .collect();
        Self {
            block_size,
            blocks: Mutex::new(blocks),
        }
    }
}

impl BlockStore for MemBlockStore {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.blocks.lock().len() as u64
    }

    fn read_block(&self, block: u64) -> Result<Vec<u8>> {
        let blocks = self.blocks.lock();
        let idx = usize::try_from(block).map_err(|_| bounds_error(block, blocks.len() as u64))?;
        blocks
            .get(idx)
            .cloned()
            .ok_or_else(|| bounds_error(block, blocks.len() as u64))
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let count = blocks.len() as u64;
        let idx = usize::try_from(block).map_err(|_| bounds_error(block, count))?;
        let slot = blocks.get_mut(idx).ok_or_else(|| bounds_error(block, count))?;
        if data.len() != self.block_size as usize {
            return Err(RillError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("short block write: {} of {}", data.len(), self.block_size),
            )));
        }
        slot.copy_from_slice(data);
        Ok(())
    }

    fn extend(&self, new_block_count: u64) -> Result<()> {
        let mut blocks = self.blocks.lock();
        if new_block_count < blocks.len() as u64 {
            return Err(RillError::InvalidRequest(format!(
                "store shrink: {} -> {new_block_count} blocks",
                blocks.len()
            )));
        }
        while (blocks.len() as u64) < new_block_count {
            blocks.push(vec![0u8; self.block_size as usize]);
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── File-backed store ───────────────────────────────────────────────────────

/// File-backed block store using positioned I/O.
///
/// Thread-safe without a shared seek position (`FileExt`). Extension
/// zero-fills via `set_len`.
pub struct FileBlockStore {
    file: Arc<File>,
    block_size: u32,
    block_count: Mutex<u64>,
}

impl FileBlockStore {
    /// Open (or create) a store at `path` with `block_count` blocks.
    pub fn create(path: impl AsRef<Path>, block_size: u32, block_count: u64) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(block_count * u64::from(block_size))?;
        Ok(Self {
            file: Arc::new(file),
            block_size,
            block_count: Mutex::new(block_count),
        })
    }

    /// Open an existing store, deriving the block count from the file
    /// length (which must be block-aligned).
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % u64::from(block_size) != 0 {
            return Err(RillError::InvalidGeometry(format!(
                "store length {len} is not a multiple of block size {block_size}"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            block_size,
            block_count: Mutex::new(len / u64::from(block_size)),
        })
    }
}

impl BlockStore for FileBlockStore {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        *self.block_count.lock()
    }

    fn read_block(&self, block: u64) -> Result<Vec<u8>> {
        let count = *self.block_count.lock();
        if block >= count {
            return Err(bounds_error(block, count));
        }
        let mut buf = vec![0u8; self.block_size as usize];
        self.file
            .read_exact_at(&mut buf, block * u64::from(self.block_size))?;
        Ok(buf)
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        let count = *self.block_count.lock();
        if block >= count {
            return Err(bounds_error(block, count));
        }
        if data.len() != self.block_size as usize {
            return Err(RillError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("short block write: {} of {}", data.len(), self.block_size),
            )));
        }
        self.file
            .write_all_at(data, block * u64::from(self.block_size))?;
        Ok(())
    }

    fn extend(&self, new_block_count: u64) -> Result<()> {
        let mut count = self.block_count.lock();
        if new_block_count < *count {
            return Err(RillError::InvalidRequest(format!(
                "store shrink: {count} -> {new_block_count} blocks"
            )));
        }
        self.file
            .set_len(new_block_count * u64::from(self.block_size))?;
        *count = new_block_count;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_round_trip() {
        let store = MemBlockStore::new(512, 4);
        assert_eq!(store.block_count(), 4);
        assert_eq!(store.read_block(0).unwrap(), vec![0u8; 512]);

        let data = vec![0xAB; 512];
        store.write_block(2, &data).unwrap();
        assert_eq!(store.read_block(2).unwrap(), data);

        assert!(store.read_block(4).is_err());
        assert!(store.write_block(4, &data).is_err());
        assert!(store.write_block(0, &[0u8; 100]).is_err());
    }

    #[test]
    fn mem_store_extend_zero_fills() {
        let store = MemBlockStore::new(512, 1);
        store.write_block(0, &vec![0xFF; 512]).unwrap();
        store.extend(3).unwrap();
        assert_eq!(store.block_count(), 3);
        assert_eq!(store.read_block(1).unwrap(), vec![0u8; 512]);
        assert_eq!(store.read_block(0).unwrap(), vec![0xFF; 512]);
        assert!(store.extend(2).is_err());
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bitmap.img");
        let store = FileBlockStore::create(&path, 512, 2).unwrap();

        let data = vec![0x5A; 512];
        store.write_block(1, &data).unwrap();
        assert_eq!(store.read_block(1).unwrap(), data);
        assert_eq!(store.read_block(0).unwrap(), vec![0u8; 512]);
        assert!(store.read_block(2).is_err());

        store.extend(4).unwrap();
        assert_eq!(store.block_count(), 4);
        assert_eq!(store.read_block(3).unwrap(), vec![0u8; 512]);
        store.sync().unwrap();
    }
}
