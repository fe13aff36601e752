//! Cached buffers for materialised entries
//!
//! A [`CachedBuffer`] holds a fixed number of bytes either in one heap
//! allocation or in pages of a [`PagedMemory`] facility. Both tiers clip
//! accesses to the buffer size; the paged tier splits every access into
//! per-page map/copy/unmap steps.

mod paging;

pub use paging::{BlockHandle, PagePool, PagedMemory, PagingApi, RangeHandle};

use crate::config::CacheConfig;
use crate::error::{Errno, RelayError, Result};
use parking_lot::Mutex;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, trace};

/// Where new buffers are allocated
#[derive(Clone, Default)]
pub struct CachePolicy {
    paged: Option<Arc<PagedMemory>>,
    paged_threshold: u64,
    heap_limit: Option<u64>,
}

impl CachePolicy {
    /// Heap only
    pub fn heap() -> Self {
        Self::default()
    }

    /// Paged tier for buffers above `threshold`, heap otherwise
    pub fn paged(memory: Arc<PagedMemory>, threshold: u64) -> Self {
        Self {
            paged: Some(memory),
            paged_threshold: threshold,
            heap_limit: None,
        }
    }

    /// Build from configuration; a zero pool size disables paging
    pub fn from_config(config: &CacheConfig) -> Self {
        if config.page_pool_bytes == 0 {
            return Self::heap();
        }
        let pool = PagePool::new(config.page_size, config.page_pool_bytes);
        let memory = PagedMemory::new(Arc::new(pool), config.map_retries);
        Self::paged(Arc::new(memory), config.paged_threshold)
    }

    /// Refuse heap allocations above `limit` bytes
    pub fn with_heap_limit(mut self, limit: u64) -> Self {
        self.heap_limit = Some(limit);
        self
    }

    pub fn paged_memory(&self) -> Option<&Arc<PagedMemory>> {
        self.paged.as_ref()
    }
}

/// Pages allocated for one buffer
struct PagedStorage {
    memory: Arc<PagedMemory>,
    block: BlockHandle,
    range: RangeHandle,
    page_size: usize,
}

impl PagedStorage {
    fn allocate(memory: &Arc<PagedMemory>, size: u64) -> Option<Self> {
        let page_size = memory.page_size();
        if page_size == 0 {
            return None;
        }
        let pages = usize::try_from(size.div_ceil(page_size as u64)).ok()?.max(1);
        let block = memory.api().alloc(pages)?;
        let Some(range) = memory.acquire_range() else {
            memory.api().free(block);
            return None;
        };
        Some(Self {
            memory: memory.clone(),
            block,
            range,
            page_size,
        })
    }
}

impl Drop for PagedStorage {
    fn drop(&mut self) {
        self.memory.api().free(self.block);
        self.memory.release_range();
    }
}

enum Storage {
    Heap(Vec<u8>),
    Paged(PagedStorage),
}

/// Direction of one transfer through the page loop
enum Transfer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Transfer<'_> {
    fn len(&self) -> usize {
        match self {
            Transfer::Read(buf) => buf.len(),
            Transfer::Write(data) => data.len(),
        }
    }

    /// Copy `n` bytes between `window[at..]` and the caller's buffer at `done`
    fn copy(&mut self, window: &mut [u8], at: usize, done: usize, n: usize) {
        match self {
            Transfer::Read(buf) => buf[done..done + n].copy_from_slice(&window[at..at + n]),
            Transfer::Write(data) => window[at..at + n].copy_from_slice(&data[done..done + n]),
        }
    }
}

/// Fixed-size byte store on the heap or the paged tier
pub struct CachedBuffer {
    size: u64,
    storage: Storage,
    dirty: bool,
}

impl CachedBuffer {
    /// Allocate `size` zeroed bytes according to `policy`.
    ///
    /// Large buffers try the paged tier first; a failed heap allocation
    /// falls back to the paged tier and a failed paged allocation falls back
    /// to the heap.
    pub fn allocate(size: u64, policy: &CachePolicy) -> Result<Self> {
        let prefer_paged = policy.paged.is_some() && size > policy.paged_threshold;

        if prefer_paged {
            if let Some(buffer) = Self::try_paged(size, policy) {
                return Ok(buffer);
            }
            debug!(size, "paged allocation failed, using heap");
        }

        if let Some(buffer) = Self::try_heap(size, policy) {
            return Ok(buffer);
        }

        if !prefer_paged {
            if let Some(buffer) = Self::try_paged(size, policy) {
                debug!(size, "heap allocation failed, using paged tier");
                return Ok(buffer);
            }
        }

        Err(RelayError::OutOfMemory { requested: size })
    }

    /// Heap-only buffer
    pub fn heap(size: u64) -> Result<Self> {
        Self::try_heap(size, &CachePolicy::heap()).ok_or(RelayError::OutOfMemory { requested: size })
    }

    /// Allocate and fill from `reader`; a short read frees the buffer
    pub fn from_reader<R: Read>(size: u64, policy: &CachePolicy, reader: R) -> Result<Self> {
        let mut buffer = Self::allocate(size, policy)?;
        buffer.load_from(reader)?;
        Ok(buffer)
    }

    fn try_heap(size: u64, policy: &CachePolicy) -> Option<Self> {
        if policy.heap_limit.is_some_and(|limit| size > limit) {
            return None;
        }
        let len = usize::try_from(size).ok()?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).ok()?;
        data.resize(len, 0);
        Some(Self {
            size,
            storage: Storage::Heap(data),
            dirty: false,
        })
    }

    fn try_paged(size: u64, policy: &CachePolicy) -> Option<Self> {
        let memory = policy.paged.as_ref()?;
        let storage = PagedStorage::allocate(memory, size)?;
        Some(Self {
            size,
            storage: Storage::Paged(storage),
            dirty: false,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_paged(&self) -> bool {
        matches!(self.storage, Storage::Paged(_))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Copy up to `buf.len()` bytes from `offset`; returns bytes copied
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let count = self.clip(offset, buf.len());
        if count == 0 {
            return Ok(0);
        }
        let buf = &mut buf[..count];
        match &self.storage {
            Storage::Heap(data) => {
                let start = offset as usize;
                buf.copy_from_slice(&data[start..start + count]);
                Ok(count)
            }
            Storage::Paged(paged) => Self::page_loop(paged, offset, Transfer::Read(buf)),
        }
    }

    /// Copy `data` to `offset`, clipped at the buffer end; returns bytes copied
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        let count = self.clip(offset, data.len());
        if count == 0 {
            return Ok(0);
        }
        let written = self.store(offset, &data[..count])?;
        self.dirty = true;
        Ok(written)
    }

    /// Fill the whole buffer from `reader`
    pub fn load_from<R: Read>(&mut self, mut reader: R) -> Result<()> {
        let chunk_len = match &self.storage {
            Storage::Paged(paged) => paged.page_size,
            Storage::Heap(_) => 8192,
        };
        let mut chunk = vec![0u8; chunk_len.min(self.size as usize).max(1)];
        let mut filled = 0u64;

        while filled < self.size {
            let want = chunk.len().min((self.size - filled) as usize);
            let n = match reader.read(&mut chunk[..want]) {
                Ok(0) => {
                    return Err(RelayError::errno(
                        Errno::EIO,
                        format!("short read: {} of {} bytes", filled, self.size),
                    ))
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.store(filled, &chunk[..n])?;
            filled += n as u64;
        }

        self.dirty = false;
        trace!(size = self.size, paged = self.is_paged(), "buffer loaded");
        Ok(())
    }

    /// Copy the whole content out
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size as usize];
        self.read(0, &mut out)?;
        Ok(out)
    }

    fn clip(&self, offset: u64, len: usize) -> usize {
        if offset >= self.size {
            return 0;
        }
        (self.size - offset).min(len as u64) as usize
    }

    /// Copy `data` in at `offset`; the caller has clipped it to the buffer
    fn store(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        match &mut self.storage {
            Storage::Heap(heap) => {
                let start = offset as usize;
                heap[start..start + data.len()].copy_from_slice(data);
                Ok(data.len())
            }
            Storage::Paged(paged) => Self::page_loop(paged, offset, Transfer::Write(data)),
        }
    }

    /// Walk the pages covered by `[offset, offset + len)`: map each page,
    /// copy the slice that falls inside it, unmap, advance.
    fn page_loop(paged: &PagedStorage, offset: u64, mut transfer: Transfer<'_>) -> Result<usize> {
        let len = transfer.len();
        let page_size = paged.page_size as u64;
        let mut done = 0usize;

        while done < len {
            let pos = offset + done as u64;
            let page = (pos / page_size) as usize;
            let at = (pos % page_size) as usize;
            let n = (len - done).min(paged.page_size - at);

            let mapped = paged.memory.map_page(paged.range, paged.block, page, &mut |window| {
                transfer.copy(window, at, done, n)
            });
            if !mapped {
                return Err(RelayError::errno(
                    Errno::EIO,
                    format!("unable to map page {}", page),
                ));
            }
            done += n;
        }

        Ok(done)
    }
}

impl std::fmt::Debug for CachedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedBuffer")
            .field("size", &self.size)
            .field("paged", &self.is_paged())
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// A named buffer shared between streams and cached on a session
pub struct CachedFile {
    name: String,
    buffer: Mutex<CachedBuffer>,
}

impl CachedFile {
    pub fn new(name: impl Into<String>, buffer: CachedBuffer) -> Self {
        Self {
            name: name.into(),
            buffer: Mutex::new(buffer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.buffer.lock().size()
    }

    pub fn is_paged(&self) -> bool {
        self.buffer.lock().is_paged()
    }

    pub fn is_dirty(&self) -> bool {
        self.buffer.lock().is_dirty()
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.buffer.lock().read(offset, buf)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.buffer.lock().write(offset, data)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.buffer.lock().to_vec()
    }
}

impl std::fmt::Debug for CachedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedFile").field("name", &self.name).finish()
    }
}
