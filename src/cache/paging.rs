//! Paged "far memory" tier
//!
//! Some platforms expose more memory than they can address at once. Such
//! memory is allocated in blocks of fixed-size pages and accessed by mapping
//! one page at a time into a small address window (the *range*). This module
//! defines the platform interface and a shared, reference-counted range.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Handle to a block of pages allocated from a paging facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle(pub u64);

/// Handle to a mapping window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RangeHandle(pub u64);

/// Platform paging primitives
pub trait PagingApi: Send + Sync {
    /// Bytes per page
    fn page_size(&self) -> usize;

    /// Allocate `pages` contiguous pages
    fn alloc(&self, pages: usize) -> Option<BlockHandle>;

    fn free(&self, block: BlockHandle);

    /// Reserve a mapping window
    fn alloc_range(&self) -> Option<RangeHandle>;

    fn free_range(&self, range: RangeHandle);

    /// Map `page` of `block` into `range`, hand the window to `access`, then
    /// unmap. Returns false when the mapping failed and `access` did not run.
    fn map(
        &self,
        range: RangeHandle,
        block: BlockHandle,
        page: usize,
        access: &mut dyn FnMut(&mut [u8]),
    ) -> bool;
}

#[derive(Default)]
struct RangeSlot {
    handle: Option<RangeHandle>,
    users: usize,
}

/// A paging facility plus the mapping range shared by all its buffers
///
/// The range is created when the first paged buffer needs it and freed when
/// the last one releases it.
pub struct PagedMemory {
    api: Arc<dyn PagingApi>,
    range: Mutex<RangeSlot>,
    map_retries: u32,
}

impl PagedMemory {
    pub fn new(api: Arc<dyn PagingApi>, map_retries: u32) -> Self {
        Self {
            api,
            range: Mutex::new(RangeSlot::default()),
            map_retries: map_retries.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.api.page_size()
    }

    pub fn api(&self) -> &Arc<dyn PagingApi> {
        &self.api
    }

    /// Buffers currently holding the range
    pub fn range_users(&self) -> usize {
        self.range.lock().users
    }

    pub fn has_range(&self) -> bool {
        self.range.lock().handle.is_some()
    }

    pub(crate) fn acquire_range(&self) -> Option<RangeHandle> {
        let mut slot = self.range.lock();
        let handle = match slot.handle {
            Some(handle) => handle,
            None => {
                let handle = self.api.alloc_range()?;
                debug!("paging range created");
                slot.handle = Some(handle);
                handle
            }
        };
        slot.users += 1;
        Some(handle)
    }

    pub(crate) fn release_range(&self) {
        let mut slot = self.range.lock();
        slot.users = slot.users.saturating_sub(1);
        if slot.users == 0 {
            if let Some(handle) = slot.handle.take() {
                self.api.free_range(handle);
                debug!("paging range released");
            }
        }
    }

    /// Map with bounded retries
    pub(crate) fn map_page(
        &self,
        range: RangeHandle,
        block: BlockHandle,
        page: usize,
        access: &mut dyn FnMut(&mut [u8]),
    ) -> bool {
        for attempt in 0..self.map_retries {
            if self.api.map(range, block, page, access) {
                return true;
            }
            trace!(page, attempt, "page map failed");
        }
        false
    }
}

/// Fixed-capacity page pool backed by ordinary memory
///
/// Serves as the paging facility on hosts without a hardware one and keeps
/// counters for inspection.
pub struct PagePool {
    page_size: usize,
    capacity_pages: usize,
    used_pages: AtomicUsize,
    next_handle: AtomicU64,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    ranges: Mutex<Vec<u64>>,
    max_ranges: usize,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
    failing_maps: AtomicU32,
}

impl PagePool {
    pub fn new(page_size: usize, capacity_bytes: u64) -> Self {
        let capacity_pages = if page_size == 0 {
            0
        } else {
            (capacity_bytes / page_size as u64) as usize
        };
        Self {
            page_size,
            capacity_pages,
            used_pages: AtomicUsize::new(0),
            next_handle: AtomicU64::new(1),
            blocks: Mutex::new(HashMap::new()),
            ranges: Mutex::new(Vec::new()),
            max_ranges: 1,
            maps: AtomicUsize::new(0),
            unmaps: AtomicUsize::new(0),
            failing_maps: AtomicU32::new(0),
        }
    }

    pub fn capacity_pages(&self) -> usize {
        self.capacity_pages
    }

    pub fn used_pages(&self) -> usize {
        self.used_pages.load(Ordering::Acquire)
    }

    pub fn live_ranges(&self) -> usize {
        self.ranges.lock().len()
    }

    pub fn map_count(&self) -> usize {
        self.maps.load(Ordering::Acquire)
    }

    pub fn unmap_count(&self) -> usize {
        self.unmaps.load(Ordering::Acquire)
    }

    /// Make the next `count` map calls fail
    pub fn fail_next_maps(&self, count: u32) {
        self.failing_maps.store(count, Ordering::Release);
    }
}

impl PagingApi for PagePool {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn alloc(&self, pages: usize) -> Option<BlockHandle> {
        if pages == 0 {
            return None;
        }
        let reserved = self
            .used_pages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let total = used.checked_add(pages)?;
                (total <= self.capacity_pages).then_some(total)
            });
        if reserved.is_err() {
            return None;
        }

        let mut storage = Vec::new();
        if storage.try_reserve_exact(pages * self.page_size).is_err() {
            self.used_pages.fetch_sub(pages, Ordering::AcqRel);
            return None;
        }
        storage.resize(pages * self.page_size, 0);

        let id = self.next_handle.fetch_add(1, Ordering::AcqRel);
        self.blocks.lock().insert(id, storage);
        Some(BlockHandle(id))
    }

    fn free(&self, block: BlockHandle) {
        if let Some(storage) = self.blocks.lock().remove(&block.0) {
            self.used_pages
                .fetch_sub(storage.len() / self.page_size, Ordering::AcqRel);
        }
    }

    fn alloc_range(&self) -> Option<RangeHandle> {
        let mut ranges = self.ranges.lock();
        if ranges.len() >= self.max_ranges {
            return None;
        }
        let id = self.next_handle.fetch_add(1, Ordering::AcqRel);
        ranges.push(id);
        Some(RangeHandle(id))
    }

    fn free_range(&self, range: RangeHandle) {
        self.ranges.lock().retain(|id| *id != range.0);
    }

    fn map(
        &self,
        range: RangeHandle,
        block: BlockHandle,
        page: usize,
        access: &mut dyn FnMut(&mut [u8]),
    ) -> bool {
        let failing = self
            .failing_maps
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if failing.is_ok() {
            return false;
        }
        if !self.ranges.lock().contains(&range.0) {
            return false;
        }

        let mut blocks = self.blocks.lock();
        let Some(storage) = blocks.get_mut(&block.0) else {
            return false;
        };
        let start = page * self.page_size;
        if start + self.page_size > storage.len() {
            return false;
        }

        self.maps.fetch_add(1, Ordering::AcqRel);
        access(&mut storage[start..start + self.page_size]);
        self.unmaps.fetch_add(1, Ordering::AcqRel);
        true
    }
}
