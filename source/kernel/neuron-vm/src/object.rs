// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: File-backed memory objects (page cache)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/object_cache.rs (concurrent fetch)
//! PUBLIC API: FileServer, MemObject::{lookup, fetch}, ObjectCache::{get, put, stats}
//! DEPENDS_ON: mm::Frames, nexus_sync::WaitQueue
//! INVARIANTS: At most one backing read per (object, page) while the page
//!   stays cached; objects leave the registry only when the registry holds
//!   the last reference
//!
//! Each page slot moves Absent -> Loading -> Resident. The faulter that flips
//! a slot to Loading performs the read with no VM lock held; everybody else
//! sleeps on the object's wait queue and re-checks.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use nexus_sync::WaitQueue;

use crate::error::{IoError, VmError, VmResult};
use crate::mm::{pages_for, Frames, PageBlock, PageOwner, PAGE_SIZE};
use crate::types::FileId;

/// File server reached over IPC. Every call may block.
pub trait FileServer: Send + Sync {
    fn size(&self, file: FileId) -> Result<u64, IoError>;

    /// Reads up to `buf.len()` bytes at `offset`; returns the bytes read.
    fn read(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<usize, IoError>;

    /// Drops the kernel's reference to `file`.
    fn release(&self, file: FileId);
}

enum PageSlot {
    Absent,
    Loading,
    Resident(PageBlock),
}

/// Page cache of one open file.
pub struct MemObject {
    file: FileId,
    size: u64,
    pages: spin::Mutex<Vec<PageSlot>>,
    loaded: WaitQueue,
    reads: AtomicU64,
}

impl MemObject {
    fn new(file: FileId, size: u64) -> VmResult<Self> {
        let bytes = usize::try_from(size).map_err(|_| VmError::InvalidArgument)?;
        let mut pages = Vec::new();
        pages.resize_with(pages_for(bytes), || PageSlot::Absent);
        Ok(Self {
            file,
            size,
            pages: spin::Mutex::new(pages),
            loaded: WaitQueue::new(),
            reads: AtomicU64::new(0),
        })
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    /// File size in bytes at creation.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Pages covering the file, cached or not.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Cached pages.
    pub fn resident(&self) -> usize {
        self.pages.lock().iter().filter(|p| matches!(p, PageSlot::Resident(_))).count()
    }

    /// Backing-store reads issued so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Physical address of page `index` if it is cached.
    pub fn lookup(&self, index: usize) -> Option<usize> {
        match self.pages.lock().get(index)? {
            PageSlot::Resident(block) => Some(block.pa()),
            PageSlot::Absent | PageSlot::Loading => None,
        }
    }

    /// Makes page `index` resident, reading it from `server` if nobody else
    /// is. Blocks; callers must not hold any map lock.
    pub fn fetch(&self, index: usize, frames: &Frames, server: &dyn FileServer) -> VmResult<usize> {
        loop {
            let mut pages = self.pages.lock();
            let Some(slot) = pages.get_mut(index) else {
                log::debug!(
                    target: "object",
                    "object: {} page {} beyond end of file",
                    self.file,
                    index
                );
                return Err(VmError::FetchFailed);
            };
            let loading = match slot {
                PageSlot::Resident(block) => return Ok(block.pa()),
                PageSlot::Loading => true,
                PageSlot::Absent => {
                    *slot = PageSlot::Loading;
                    false
                }
            };
            if !loading {
                break;
            }
            let seen = self.loaded.prepare();
            drop(pages);
            self.loaded.wait(seen);
        }

        let result = self.load(index, frames, server);
        {
            let mut pages = self.pages.lock();
            pages[index] = match result {
                Ok(block) => PageSlot::Resident(block),
                Err(_) => PageSlot::Absent,
            };
        }
        self.loaded.notify_all();
        result.map(|block| block.pa())
    }

    fn load(&self, index: usize, frames: &Frames, server: &dyn FileServer) -> VmResult<PageBlock> {
        if frames.failpoints().take_fetch() {
            log::debug!(target: "object", "object: injected fetch failure");
            return Err(VmError::FetchFailed);
        }
        let block = frames.alloc_zeroed(PageOwner::OBJECT)?;
        let mut buf = [0u8; PAGE_SIZE];
        let offset = (index * PAGE_SIZE) as u64;
        self.reads.fetch_add(1, Ordering::Relaxed);
        match server.read(self.file, offset, &mut buf) {
            Ok(read) => {
                // The page came zeroed, which covers a short read's tail.
                frames.write(block.pa(), 0, &buf[..read.min(PAGE_SIZE)]);
                log::trace!(
                    target: "object",
                    "object: {} page {} <- {} bytes",
                    self.file,
                    index,
                    read
                );
                Ok(block)
            }
            Err(err) => {
                frames.free(block);
                log::warn!(
                    target: "object",
                    "object: {} read at {:#x} failed: {}",
                    self.file,
                    offset,
                    err
                );
                Err(VmError::FetchFailed)
            }
        }
    }

    fn teardown(self, frames: &Frames) -> usize {
        let mut freed = 0;
        for slot in self.pages.into_inner() {
            if let PageSlot::Resident(block) = slot {
                frames.free(block);
                freed += 1;
            }
        }
        freed
    }
}

/// Registry-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectStats {
    pub objects: usize,
    pub resident_pages: usize,
    pub reads: u64,
}

/// Registry of live memory objects, keyed by file.
pub struct ObjectCache {
    objects: spin::Mutex<BTreeMap<FileId, Arc<MemObject>>>,
    server: Arc<dyn FileServer>,
}

impl ObjectCache {
    /// Empty registry reading through `server`.
    pub fn new(server: Arc<dyn FileServer>) -> Self {
        Self { objects: spin::Mutex::new(BTreeMap::new()), server }
    }

    /// The file server backing every object.
    pub fn server(&self) -> &dyn FileServer {
        &*self.server
    }

    /// Returns the object for `file`, creating it on first use. Every
    /// successful call must be balanced by [`ObjectCache::put`].
    pub fn get(&self, file: FileId) -> VmResult<Arc<MemObject>> {
        if let Some(obj) = self.objects.lock().get(&file) {
            return Ok(Arc::clone(obj));
        }
        // The size query is an IPC round-trip; never under the registry lock.
        let size = self.server.size(file).map_err(|err| {
            log::warn!(target: "object", "object: size of {} unavailable: {}", file, err);
            VmError::from(err)
        })?;
        let fresh = Arc::new(MemObject::new(file, size)?);
        let mut objects = self.objects.lock();
        let obj = objects.entry(file).or_insert_with(|| {
            log::debug!(target: "object", "object: {} created, {} bytes", file, size);
            fresh
        });
        Ok(Arc::clone(obj))
    }

    /// Drops one reference; the last one frees every cached page and
    /// releases the file.
    pub fn put(&self, obj: Arc<MemObject>, frames: &Frames) {
        let file = obj.file();
        let mut objects = self.objects.lock();
        let registered = objects.get(&file).is_some_and(|reg| Arc::ptr_eq(reg, &obj));
        if !registered || Arc::strong_count(&obj) != 2 {
            // Decrement only under the registry lock.
            drop(obj);
            return;
        }
        let entry = objects.remove(&file);
        drop(objects);
        drop(entry);
        if let Some(inner) = Arc::into_inner(obj) {
            let freed = inner.teardown(frames);
            self.server.release(file);
            log::debug!(target: "object", "object: {} torn down, {} pages freed", file, freed);
        }
    }

    /// Looks up a live object without taking a reference.
    pub fn contains(&self, file: FileId) -> bool {
        self.objects.lock().contains_key(&file)
    }

    /// Live objects, their cached pages and the reads they issued.
    pub fn stats(&self) -> ObjectStats {
        let objects = self.objects.lock();
        ObjectStats {
            objects: objects.len(),
            resident_pages: objects.values().map(|o| o.resident()).sum(),
            reads: objects.values().map(|o| o.reads()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{SimFiles, SimMachine};
    use crate::hal::PhysWindow;
    use crate::mm::PhysAllocator;

    fn setup() -> (Frames, Arc<SimFiles>, ObjectCache) {
        let machine = SimMachine::new(32);
        let pool = PhysAllocator::new(&[machine.region()], &[]).expect("pool");
        let frames = Frames::new(pool, machine as Arc<dyn PhysWindow>);
        let files = SimFiles::new();
        let cache = ObjectCache::new(Arc::clone(&files) as Arc<dyn FileServer>);
        (frames, files, cache)
    }

    #[test]
    fn get_shares_one_object_per_file() {
        let (frames, files, cache) = setup();
        files.insert(FileId(7), vec![1; 3 * PAGE_SIZE]);
        let a = cache.get(FileId(7)).expect("a");
        let b = cache.get(FileId(7)).expect("b");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.page_count(), 3);
        cache.put(a, &frames);
        assert!(cache.contains(FileId(7)));
        cache.put(b, &frames);
        assert!(!cache.contains(FileId(7)));
        assert_eq!(files.releases(FileId(7)), 1);
    }

    #[test]
    fn unknown_file_fails_to_open() {
        let (_, _, cache) = setup();
        assert!(matches!(cache.get(FileId(99)), Err(VmError::FetchFailed)));
    }

    #[test]
    fn fetch_reads_once_and_zero_fills_tail() {
        let (frames, files, cache) = setup();
        let mut data = vec![0xaa; PAGE_SIZE];
        data.extend_from_slice(b"tail");
        files.insert(FileId(1), data);
        let obj = cache.get(FileId(1)).expect("obj");
        assert_eq!(obj.lookup(1), None);
        let pa = obj.fetch(1, &frames, cache.server()).expect("fetch");
        assert_eq!(obj.fetch(1, &frames, cache.server()), Ok(pa));
        assert_eq!(obj.lookup(1), Some(pa));
        assert_eq!(files.reads(FileId(1)), 1);

        let mut page = vec![0xff; PAGE_SIZE];
        frames.read(pa, 0, &mut page);
        assert_eq!(&page[..4], b"tail");
        assert!(page[4..].iter().all(|b| *b == 0));

        assert_eq!(obj.fetch(2, &frames, cache.server()), Err(VmError::FetchFailed));
        let used = frames.stats().free_pages;
        cache.put(obj, &frames);
        assert_eq!(frames.stats().free_pages, used + 1);
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn failed_fetch_leaves_slot_retryable() {
        let (frames, files, cache) = setup();
        files.insert(FileId(3), vec![5; PAGE_SIZE]);
        let obj = cache.get(FileId(3)).expect("obj");
        let free = frames.stats().free_pages;
        frames.failpoints().fail_next_fetch();
        assert_eq!(obj.fetch(0, &frames, cache.server()), Err(VmError::FetchFailed));
        assert_eq!(frames.stats().free_pages, free);
        assert!(obj.fetch(0, &frames, cache.server()).is_ok());
        assert_eq!(obj.reads(), 1);
        cache.put(obj, &frames);
    }

    #[test]
    fn stats_sum_over_objects() {
        let (frames, files, cache) = setup();
        files.insert(FileId(1), vec![1; PAGE_SIZE]);
        files.insert(FileId(2), vec![2; 2 * PAGE_SIZE]);
        let a = cache.get(FileId(1)).expect("a");
        let b = cache.get(FileId(2)).expect("b");
        a.fetch(0, &frames, cache.server()).expect("a0");
        b.fetch(1, &frames, cache.server()).expect("b1");
        assert_eq!(cache.stats(), ObjectStats { objects: 2, resident_pages: 2, reads: 2 });
        cache.put(a, &frames);
        cache.put(b, &frames);
        assert_eq!(cache.stats(), ObjectStats::default());
    }
}
