// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::AtomicBool;

use super::*;
use crate::config::VmConfig;
use crate::hal::sim::{SimFiles, SimMachine};
use crate::error::IoError;
use crate::info::BackingKind;
use crate::object::FileServer;
use crate::types::FileId;

const RW: Prot = Prot::READ.union(Prot::WRITE);
const BASE: usize = 0x40_0000;

fn boot() -> (Arc<SimFiles>, VmContext) {
    let machine = SimMachine::new(128);
    let files = SimFiles::new();
    let ctx = VmContext::boot(
        VmConfig::default(),
        &machine.boot_info(4),
        machine.clone(),
        machine,
        files.clone(),
    )
    .expect("boot");
    (files, ctx)
}

fn anon(map: &VmMap, ctx: &VmContext, va: usize, pages: usize, prot: Prot) -> VmResult<usize> {
    map.map(ctx, va, pages * PAGE_SIZE, prot, Backing::Anonymous, 0, MapFlags::FIXED)
}

#[test]
fn adjacent_anonymous_maps_merge() {
    let (_, ctx) = boot();
    let map = ctx.create_map(Some(true)).expect("map");
    anon(&map, &ctx, BASE, 1, RW).expect("first");
    anon(&map, &ctx, BASE + PAGE_SIZE, 1, RW).expect("second");
    let dump = map.dump();
    assert_eq!(dump.len(), 1);
    assert_eq!((dump[0].start, dump[0].end), (BASE, BASE + 2 * PAGE_SIZE));
    assert_eq!(map.verify(), Ok(()));
}

#[test]
fn differing_protection_never_merges() {
    let (_, ctx) = boot();
    let map = ctx.create_map(Some(true)).expect("map");
    anon(&map, &ctx, BASE, 1, RW).expect("rw");
    anon(&map, &ctx, BASE + PAGE_SIZE, 1, Prot::READ).expect("ro");
    assert_eq!(map.dump().len(), 2);
}

#[test]
fn filling_a_hole_joins_both_neighbours() {
    let (_, ctx) = boot();
    let map = ctx.create_map(Some(true)).expect("map");
    anon(&map, &ctx, BASE, 2, RW).expect("left");
    anon(&map, &ctx, BASE + 3 * PAGE_SIZE, 1, RW).expect("right");
    assert_eq!(map.dump().len(), 2);
    anon(&map, &ctx, BASE + 2 * PAGE_SIZE, 1, RW).expect("middle");
    let dump = map.dump();
    assert_eq!(dump.len(), 1);
    assert_eq!(dump[0].len(), 4 * PAGE_SIZE);
    assert_eq!(map.verify(), Ok(()));
}

#[test]
fn populated_entry_extends_into_unused_slots() {
    let (_, ctx) = boot();
    let map = ctx.create_map(Some(true)).expect("map");
    anon(&map, &ctx, BASE, 1, RW).expect("first");
    fault::write_bytes(&ctx, &map, BASE, b"left").expect("write");
    anon(&map, &ctx, BASE + PAGE_SIZE, 1, RW).expect("second");
    let dump = map.dump();
    assert_eq!(dump.len(), 1);
    assert_eq!(dump[0].amap_slot, Some(0));

    fault::write_bytes(&ctx, &map, BASE + PAGE_SIZE, b"right").expect("write");
    let mut buf = [0u8; 4];
    fault::read_bytes(&ctx, &map, BASE, &mut buf).expect("read");
    assert_eq!(&buf, b"left");
    assert_eq!(map.dump()[0].anons, 2);
}

#[test]
fn unmap_trims_and_splits() {
    let (_, ctx) = boot();
    let map = ctx.create_map(Some(true)).expect("map");
    anon(&map, &ctx, BASE, 6, RW).expect("map");

    map.unmap(&ctx, BASE + 2 * PAGE_SIZE, PAGE_SIZE).expect("split");
    let dump = map.dump();
    assert_eq!(dump.len(), 2);
    assert_eq!(dump[0].end, BASE + 2 * PAGE_SIZE);
    assert_eq!(dump[1].start, BASE + 3 * PAGE_SIZE);

    map.unmap(&ctx, BASE, PAGE_SIZE).expect("trim head");
    map.unmap(&ctx, BASE + 5 * PAGE_SIZE, PAGE_SIZE).expect("trim tail");
    let spans: Vec<_> = map.dump().iter().map(|e| (e.start, e.end)).collect();
    assert_eq!(
        spans,
        vec![(BASE + PAGE_SIZE, BASE + 2 * PAGE_SIZE), (BASE + 3 * PAGE_SIZE, BASE + 5 * PAGE_SIZE)]
    );

    map.unmap(&ctx, BASE + 0x10_0000, PAGE_SIZE).expect("hole");
    map.unmap(&ctx, BASE, 8 * PAGE_SIZE).expect("everything");
    assert!(map.dump().is_empty());
    assert_eq!(map.verify(), Ok(()));
}

#[test]
fn split_halves_keep_their_private_pages() {
    let (_, ctx) = boot();
    let map = ctx.create_map(Some(true)).expect("map");
    anon(&map, &ctx, BASE, 3, RW).expect("map");
    for i in 0..3u8 {
        fault::write_bytes(&ctx, &map, BASE + i as usize * PAGE_SIZE, &[i + 1]).expect("write");
    }
    let free = ctx.page_stats().free_pages;
    map.unmap(&ctx, BASE + PAGE_SIZE, PAGE_SIZE).expect("split");
    assert_eq!(ctx.page_stats().free_pages, free + 1);

    let mut byte = [0u8];
    fault::read_bytes(&ctx, &map, BASE + 2 * PAGE_SIZE, &mut byte).expect("read");
    assert_eq!(byte, [3]);
    assert_eq!(map.lookup(BASE + 2 * PAGE_SIZE).and_then(|e| e.amap_slot), Some(2));
}

#[test]
fn fixed_requests_are_checked() {
    let (_, ctx) = boot();
    let map = ctx.create_map(Some(true)).expect("map");
    anon(&map, &ctx, BASE, 2, RW).expect("map");
    assert_eq!(anon(&map, &ctx, BASE + PAGE_SIZE, 1, RW), Err(VmError::Overlap));
    assert_eq!(anon(&map, &ctx, 0, 1, RW), Err(VmError::OutOfBounds));
    assert_eq!(anon(&map, &ctx, BASE + 1, 1, RW), Err(VmError::Misaligned));
    assert_eq!(anon(&map, &ctx, BASE + 0x10_0000, 1, Prot::all()), Err(VmError::PermissionDenied));
    assert_eq!(
        map.map(&ctx, BASE, 0, RW, Backing::Anonymous, 0, MapFlags::empty()),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(
        map.map(&ctx, 0, PAGE_SIZE, RW, Backing::Physical, 0, MapFlags::NEEDS_COPY),
        Err(VmError::InvalidArgument)
    );
}

#[test]
fn hint_is_a_preference() {
    let (_, ctx) = boot();
    let map = ctx.create_map(Some(true)).expect("map");
    anon(&map, &ctx, BASE, 4, RW).expect("map");
    let hint = BASE + PAGE_SIZE;
    let va = map
        .map(&ctx, hint, PAGE_SIZE, Prot::READ, Backing::Anonymous, 0, MapFlags::empty())
        .expect("hinted");
    assert_eq!(va, BASE + 4 * PAGE_SIZE);

    let top = map.bounds().end - PAGE_SIZE;
    anon(&map, &ctx, top, 1, Prot::READ).expect("top");
    let va = map
        .map(&ctx, top, 2 * PAGE_SIZE, Prot::READ, Backing::Anonymous, 0, MapFlags::empty())
        .expect("wraps to the bottom");
    assert_eq!(va, map.bounds().start);

    let huge = map.bounds().len();
    assert_eq!(
        map.map(&ctx, 0, huge, Prot::READ, Backing::Anonymous, 0, MapFlags::empty()),
        Err(VmError::NoVirtualSpace)
    );
}

#[test]
fn object_views_merge_on_contiguous_offsets() {
    let (files, ctx) = boot();
    let file = FileId(7);
    files.insert(file, vec![0x5a; 4 * PAGE_SIZE]);
    let map = ctx.create_map(Some(true)).expect("map");

    let obj = ctx.get_object(file).expect("object");
    map.map(&ctx, BASE, PAGE_SIZE, Prot::READ, Backing::Object(obj), 0, MapFlags::FIXED)
        .expect("first");
    let obj = ctx.get_object(file).expect("object");
    let (va, offset) = (BASE + PAGE_SIZE, PAGE_SIZE as u64);
    map.map(&ctx, va, PAGE_SIZE, Prot::READ, Backing::Object(obj), offset, MapFlags::FIXED)
        .expect("second");
    let obj = ctx.get_object(file).expect("object");
    let va = BASE + 3 * PAGE_SIZE;
    map.map(&ctx, va, PAGE_SIZE, Prot::READ, Backing::Object(obj), 0, MapFlags::FIXED)
        .expect("gap");

    let dump = map.dump();
    assert_eq!(dump.len(), 2);
    assert_eq!(dump[0].backing, BackingKind::Object(file));
    assert_eq!(dump[0].len(), 2 * PAGE_SIZE);

    map.destroy(&ctx);
    assert!(!ctx.objects().contains(file));
    assert_eq!(files.releases(file), 1);
}

#[test]
fn failed_map_drops_the_object_reference() {
    let (files, ctx) = boot();
    let file = FileId(1);
    files.insert(file, vec![1; PAGE_SIZE]);
    let map = ctx.create_map(Some(true)).expect("map");
    anon(&map, &ctx, BASE, 1, RW).expect("map");
    let obj = ctx.get_object(file).expect("object");
    assert_eq!(
        map.map(&ctx, BASE, PAGE_SIZE, Prot::READ, Backing::Object(obj), 0, MapFlags::FIXED),
        Err(VmError::Overlap)
    );
    assert!(!ctx.objects().contains(file));
}

#[test]
fn every_change_bumps_the_generation() {
    let (_, ctx) = boot();
    let map = ctx.create_map(Some(true)).expect("map");
    let g0 = map.generation();
    anon(&map, &ctx, BASE, 1, RW).expect("map");
    let g1 = map.generation();
    map.unmap(&ctx, BASE, PAGE_SIZE).expect("unmap");
    assert!(g0 < g1 && g1 < map.generation());
}

#[test]
fn kernel_image_is_mapped_at_boot() {
    let (_, ctx) = boot();
    let kernel = ctx.kernel_map();
    assert!(kernel.is_kernel());
    let dump = kernel.dump();
    assert_eq!(dump.len(), 2);
    assert_eq!(dump[0].prot, Prot::READ | Prot::EXEC);
    let (pa, attrs) = kernel.translate(&ctx, dump[1].start + 8).expect("translated");
    assert_eq!(pa, dump[1].offset as usize + 8);
    assert!(!attrs.user);
}

/// File server that records whether the releasing map was still locked.
#[derive(Default)]
struct WatchedFiles {
    files: SimFiles,
    map: spin::Mutex<Option<Arc<VmMap>>>,
    released_under_lock: AtomicBool,
    releases: AtomicU64,
}

impl FileServer for WatchedFiles {
    fn size(&self, file: FileId) -> Result<u64, IoError> {
        self.files.size(file)
    }

    fn read(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
        self.files.read(file, offset, buf)
    }

    fn release(&self, file: FileId) {
        if let Some(map) = self.map.lock().as_ref() {
            let locked = map.inner.is_locked();
            self.released_under_lock.fetch_or(locked, Ordering::SeqCst);
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.files.release(file);
    }
}

#[test]
fn objects_are_released_after_the_map_lock() {
    let machine = SimMachine::new(128);
    let files = Arc::new(WatchedFiles::default());
    let ctx = VmContext::boot(
        VmConfig::default(),
        &machine.boot_info(4),
        machine.clone(),
        machine,
        files.clone(),
    )
    .expect("boot");
    let file = FileId(3);
    files.files.insert(file, vec![7; 2 * PAGE_SIZE]);

    let map = Arc::new(ctx.create_map(Some(true)).expect("map"));
    *files.map.lock() = Some(Arc::clone(&map));
    for page in 0..2 {
        let obj = ctx.get_object(file).expect("object");
        let va = BASE + page * PAGE_SIZE;
        let offset = (page * PAGE_SIZE) as u64;
        map.map(&ctx, va, PAGE_SIZE, Prot::READ, Backing::Object(obj), offset, MapFlags::FIXED)
            .expect("map");
    }
    assert_eq!(map.dump().len(), 1);
    map.unmap(&ctx, BASE, 2 * PAGE_SIZE).expect("unmap");

    assert_eq!(files.releases.load(Ordering::SeqCst), 1);
    assert!(!files.released_under_lock.load(Ordering::SeqCst));
    assert!(!ctx.objects().contains(file));
    files.map.lock().take();
}
