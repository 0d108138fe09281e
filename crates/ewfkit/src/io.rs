//! Byte-addressable segment stores and the bounded file pool
//!
//! Every structure in a container reads and writes through [`SegmentStore`],
//! a random-access byte store. Real containers use [`FileStore`] over the
//! segment files on disk, with [`FilePool`] keeping at most a configured
//! number of them open at once. [`MemoryStore`] backs synthetic containers
//! and tests.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use tracing::trace;

use crate::{Error, ErrorKind, Result};

/// Default bound on concurrently open segment files
pub const DEFAULT_MAX_OPEN_FILES: usize = 16;

/// Random-access byte store backing one segment file
pub trait SegmentStore: Send {
    /// Read exactly `buf.len()` bytes starting at `offset`
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` starting at `offset`, extending the store as
    /// needed
    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current store length in bytes
    fn len(&mut self) -> Result<u64>;

    /// Whether the store holds no bytes
    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncate or extend the store to `len` bytes
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Flush buffered writes to the backing medium
    fn flush(&mut self) -> Result<()>;
}

/// Segment store over a file on disk
#[derive(Debug)]
pub struct FileStore {
    file: File,
}

impl FileStore {
    /// Open an existing file read-only
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }

    /// Open an existing file for reading and writing
    pub fn open_rw(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Create a new file, failing if it already exists
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self { file })
    }
}

impl SegmentStore for FileStore {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// In-memory segment store for synthetic containers and tests
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    data: Vec<u8>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing bytes
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Borrow the stored bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Take the stored bytes
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl SegmentStore for MemoryStore {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::argument(format!("offset {offset} exceeds memory store")))?;
        let end = start.checked_add(buf.len()).ok_or_else(|| {
            Error::argument(format!("read of {} bytes at {offset} overflows", buf.len()))
        })?;
        if end > self.data.len() {
            return Err(ErrorKind::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of memory store",
            ))
            .into());
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::argument(format!("offset {offset} exceeds memory store")))?;
        let end = start.checked_add(data.len()).ok_or_else(|| {
            Error::argument(format!("write of {} bytes at {offset} overflows", data.len()))
        })?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| Error::argument(format!("length {len} exceeds memory store")))?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Bounded pool of open segment files
///
/// Segment numbers are registered with their paths up front; the backing
/// files open lazily on first access and the least recently used one closes
/// (after a flush) when the bound is reached. A closed file reopens
/// transparently on the next access.
pub struct FilePool {
    open: LruCache<u16, FileStore>,
    paths: HashMap<u16, PathBuf>,
    writable: bool,
}

impl FilePool {
    /// Create a pool holding at most `max_open` files open
    pub fn new(max_open: usize, writable: bool) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_open)
            .ok_or_else(|| Error::argument("pool must allow at least one open file"))?;
        Ok(Self {
            open: LruCache::new(capacity),
            paths: HashMap::new(),
            writable,
        })
    }

    /// Whether stores open writable
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Register an existing file under a segment number
    pub fn register(&mut self, number: u16, path: PathBuf) {
        self.paths.insert(number, path);
    }

    /// Registered path of a segment number
    pub fn path(&self, number: u16) -> Option<&Path> {
        self.paths.get(&number).map(PathBuf::as_path)
    }

    /// Create a new file, register it and return its open store
    ///
    /// Fails if the path already exists or the pool is read-only.
    pub fn create(&mut self, number: u16, path: PathBuf) -> Result<&mut FileStore> {
        if !self.writable {
            return Err(Error::runtime("cannot create files in a read-only pool"));
        }
        let store = FileStore::create(&path)?;
        trace!("created segment file {number} ({})", path.display());
        self.paths.insert(number, path);
        self.cache(number, store)
    }

    /// Open store for a registered segment number
    pub fn store(&mut self, number: u16) -> Result<&mut FileStore> {
        if self.open.contains(&number) {
            return match self.open.get_mut(&number) {
                Some(store) => Ok(store),
                None => Err(Error::runtime("pool entry vanished")),
            };
        }

        let path = self
            .paths
            .get(&number)
            .ok_or(ErrorKind::MissingSegment(number))?;
        let store = if self.writable {
            FileStore::open_rw(path)?
        } else {
            FileStore::open(path)?
        };
        trace!("opened segment file {number} ({})", path.display());
        self.cache(number, store)
    }

    /// Drop a segment number from the pool, closing its open store
    pub fn forget(&mut self, number: u16) {
        if self.open.pop(&number).is_some() {
            trace!("closing segment file {number} (forgotten)");
        }
        self.paths.remove(&number);
    }

    /// Flush every open file
    pub fn flush_all(&mut self) -> Result<()> {
        for (_, store) in self.open.iter_mut() {
            store.flush()?;
        }
        Ok(())
    }

    fn cache(&mut self, number: u16, store: FileStore) -> Result<&mut FileStore> {
        if let Some((evicted, mut old)) = self.open.push(number, store) {
            if evicted != number {
                trace!("closing segment file {evicted} (pool bound reached)");
                old.flush()?;
            }
        }
        match self.open.get_mut(&number) {
            Some(store) => Ok(store),
            None => Err(Error::runtime("pool entry vanished")),
        }
    }
}

impl std::fmt::Debug for FilePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePool")
            .field("registered", &self.paths.len())
            .field("open", &self.open.len())
            .field("writable", &self.writable)
            .finish()
    }
}
