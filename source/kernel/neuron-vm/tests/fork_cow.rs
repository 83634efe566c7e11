// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space copy (fork) and copy-on-write
//! OWNERS: @kernel-mm-team
//!
//! TEST_SCENARIOS:
//!   - fork_then_child_write(): byte 7 shared read-only, child writes 9 privately
//!   - parent_write_after_fork(): parent copy stays private in both directions
//!   - grandchild_shares_single_pages(): three generations, independent writes
//!   - pages_return_after_both_destroyed(): anon/amap refcounts reach zero
//!   - no_inherit_entries_stay_behind(): NO_INHERIT entries are skipped
//!   - eager_child_is_populated(): non-lazy destination is pre-faulted read-only
//!   - racing_writers_keep_sides_apart(): 8 threads, parent and child, same slots
//!   - failed_prefault_unwinds_the_copy(): injected allocation failure, child emptied

mod common;

use std::thread;

use common::{boot, BASE, PAGE, RW};
use neuron_vm::fault::{read_bytes, write_bytes};
use neuron_vm::map::Backing;
use neuron_vm::{MapFlags, Prot, VmError};

fn byte_at(h: &common::Harness, map: &neuron_vm::VmMap, va: usize) -> u8 {
    let mut b = [0u8];
    read_bytes(&h.ctx, map, va, &mut b).expect("read");
    b[0]
}

#[test]
fn fork_then_child_write() {
    let h = boot(128);
    let parent = h.ctx.create_map(Some(false)).expect("parent");
    parent.map(&h.ctx, BASE, PAGE, RW, Backing::Anonymous, 0, MapFlags::FIXED).expect("map");
    write_bytes(&h.ctx, &parent, BASE, &[7]).expect("write");

    let child = h.ctx.create_map(Some(true)).expect("child");
    child.copy_from(&h.ctx, &parent).expect("fork");
    assert_eq!(byte_at(&h, &child, BASE), 7);

    let (ppa, pattrs) = parent.translate(&h.ctx, BASE).expect("parent translated");
    let (cpa, cattrs) = child.translate(&h.ctx, BASE).expect("child translated");
    assert_eq!(ppa, cpa);
    assert!(!pattrs.prot.contains(Prot::WRITE));
    assert!(!cattrs.prot.contains(Prot::WRITE));
    assert!(parent.lookup(BASE).expect("entry").flags.contains(MapFlags::NEEDS_COPY));

    write_bytes(&h.ctx, &child, BASE, &[9]).expect("child write");
    assert_eq!(byte_at(&h, &parent, BASE), 7);
    assert_eq!(byte_at(&h, &child, BASE), 9);
    let (cpa, cattrs) = child.translate(&h.ctx, BASE).expect("child translated");
    assert_ne!(cpa, ppa);
    assert!(cattrs.prot.contains(Prot::WRITE));
    assert_eq!(child.stats(&h.ctx).cow_copies, 1);
}

#[test]
fn parent_write_after_fork() {
    let h = boot(128);
    let parent = h.ctx.create_map(Some(true)).expect("parent");
    parent.map(&h.ctx, BASE, 2 * PAGE, RW, Backing::Anonymous, 0, MapFlags::FIXED).expect("map");
    write_bytes(&h.ctx, &parent, BASE, b"one").expect("write");
    write_bytes(&h.ctx, &parent, BASE + PAGE, b"two").expect("write");

    let child = h.ctx.create_map(Some(true)).expect("child");
    child.copy_from(&h.ctx, &parent).expect("fork");
    write_bytes(&h.ctx, &parent, BASE, b"ONE").expect("parent write");

    let mut buf = [0u8; 3];
    read_bytes(&h.ctx, &child, BASE, &mut buf).expect("read");
    assert_eq!(&buf, b"one");
    read_bytes(&h.ctx, &child, BASE + PAGE, &mut buf).expect("read");
    assert_eq!(&buf, b"two");
    read_bytes(&h.ctx, &parent, BASE, &mut buf).expect("read");
    assert_eq!(&buf, b"ONE");

    // Page two is still shared with the parent's private copy.
    write_bytes(&h.ctx, &child, BASE + PAGE, b"TWO").expect("child write");
    read_bytes(&h.ctx, &parent, BASE + PAGE, &mut buf).expect("read");
    assert_eq!(&buf, b"two");
}

#[test]
fn grandchild_shares_single_pages() {
    let h = boot(128);
    let a = h.ctx.create_map(Some(true)).expect("a");
    a.map(&h.ctx, BASE, PAGE, RW, Backing::Anonymous, 0, MapFlags::FIXED).expect("map");
    write_bytes(&h.ctx, &a, BASE, &[1]).expect("write");
    let b = h.ctx.create_map(Some(true)).expect("b");
    b.copy_from(&h.ctx, &a).expect("fork a->b");
    let c = h.ctx.create_map(Some(true)).expect("c");
    c.copy_from(&h.ctx, &b).expect("fork b->c");

    write_bytes(&h.ctx, &b, BASE, &[2]).expect("write b");
    write_bytes(&h.ctx, &c, BASE, &[3]).expect("write c");
    assert_eq!(byte_at(&h, &a, BASE), 1);
    assert_eq!(byte_at(&h, &b, BASE), 2);
    assert_eq!(byte_at(&h, &c, BASE), 3);
}

#[test]
fn pages_return_after_both_destroyed() {
    let h = boot(128);
    let free = h.ctx.page_stats().free_pages;
    let parent = h.ctx.create_map(Some(true)).expect("parent");
    parent.map(&h.ctx, BASE, 4 * PAGE, RW, Backing::Anonymous, 0, MapFlags::FIXED).expect("map");
    for i in 0..4 {
        write_bytes(&h.ctx, &parent, BASE + i * PAGE, &[i as u8]).expect("write");
    }
    let child = h.ctx.create_map(Some(true)).expect("child");
    child.copy_from(&h.ctx, &parent).expect("fork");
    write_bytes(&h.ctx, &child, BASE, &[42]).expect("cow");
    child.unmap(&h.ctx, BASE + 2 * PAGE, PAGE).expect("partial unmap");
    assert_eq!(h.ctx.page_stats().free_pages, free - 5);

    parent.destroy(&h.ctx);
    assert!(h.ctx.page_stats().free_pages < free);
    assert_eq!(byte_at(&h, &child, BASE + 3 * PAGE), 3);
    child.destroy(&h.ctx);
    assert_eq!(h.ctx.page_stats().free_pages, free);
    assert_eq!(h.ctx.frames().with_pool(|p| p.verify()), Ok(()));
}

#[test]
fn no_inherit_entries_stay_behind() {
    let h = boot(64);
    let parent = h.ctx.create_map(Some(true)).expect("parent");
    parent.map(&h.ctx, BASE, PAGE, RW, Backing::Anonymous, 0, MapFlags::FIXED).expect("map");
    let flags = MapFlags::FIXED | MapFlags::NO_INHERIT;
    parent.map(&h.ctx, BASE + 4 * PAGE, PAGE, RW, Backing::Anonymous, 0, flags).expect("map");
    let child = h.ctx.create_map(Some(true)).expect("child");
    child.copy_from(&h.ctx, &parent).expect("fork");
    assert_eq!(child.dump().len(), 1);
    assert_eq!(read_bytes(&h.ctx, &child, BASE + 4 * PAGE, &mut [0u8]), Err(VmError::NotMapped));
    assert_eq!(child.copy_from(&h.ctx, &parent), Err(VmError::Overlap));
}

#[test]
fn eager_child_is_populated() {
    let h = boot(64);
    let parent = h.ctx.create_map(Some(true)).expect("parent");
    parent.map(&h.ctx, BASE, 2 * PAGE, RW, Backing::Anonymous, 0, MapFlags::FIXED).expect("map");
    write_bytes(&h.ctx, &parent, BASE, &[5]).expect("write");
    let child = h.ctx.create_map(Some(false)).expect("child");
    child.copy_from(&h.ctx, &parent).expect("fork");
    for va in [BASE, BASE + PAGE] {
        let (_, attrs) = child.translate(&h.ctx, va).expect("pre-faulted");
        assert_eq!(attrs.prot, Prot::READ);
    }
    let child_pa = child.translate(&h.ctx, BASE).map(|t| t.0);
    assert_eq!(child_pa, parent.translate(&h.ctx, BASE).map(|t| t.0));
}

const SEED: u8 = 0xee;
const WRITERS: usize = 8;

#[test]
fn racing_writers_keep_sides_apart() {
    let h = boot(128);
    let free = h.ctx.page_stats().free_pages;
    for _round in 0..16 {
        let parent = h.ctx.create_map(Some(true)).expect("parent");
        parent
            .map(&h.ctx, BASE, 4 * PAGE, RW, Backing::Anonymous, 0, MapFlags::FIXED)
            .expect("map");
        for i in 0..4 {
            write_bytes(&h.ctx, &parent, BASE + i * PAGE, &[SEED; WRITERS]).expect("seed");
        }
        let child = h.ctx.create_map(Some(true)).expect("child");
        child.copy_from(&h.ctx, &parent).expect("fork");

        thread::scope(|s| {
            for t in 0..WRITERS {
                let map = if t % 2 == 0 { &parent } else { &child };
                let ctx = &h.ctx;
                s.spawn(move || {
                    for i in 0..4 {
                        write_bytes(ctx, map, BASE + i * PAGE + t, &[t as u8 + 1]).expect("write");
                    }
                });
            }
        });

        for i in 0..4 {
            let (mut p, mut c) = ([0u8; WRITERS], [0u8; WRITERS]);
            read_bytes(&h.ctx, &parent, BASE + i * PAGE, &mut p).expect("read parent");
            read_bytes(&h.ctx, &child, BASE + i * PAGE, &mut c).expect("read child");
            for t in 0..WRITERS {
                let (own, other) = if t % 2 == 0 { (p[t], c[t]) } else { (c[t], p[t]) };
                assert_eq!(own, t as u8 + 1, "page {} byte {}", i, t);
                assert_eq!(other, SEED, "page {} byte {}", i, t);
            }
        }
        // One page per side per slot; copies that lost a race are gone.
        assert_eq!(h.ctx.page_stats().free_pages, free - 8);
        assert_eq!(parent.verify(), Ok(()));
        assert_eq!(child.verify(), Ok(()));
        parent.destroy(&h.ctx);
        child.destroy(&h.ctx);
        assert_eq!(h.ctx.page_stats().free_pages, free);
    }
    assert_eq!(h.ctx.frames().with_pool(|p| p.verify()), Ok(()));
}

#[cfg(feature = "failpoints")]
#[test]
fn failed_prefault_unwinds_the_copy() {
    let h = boot(64);
    let parent = h.ctx.create_map(Some(true)).expect("parent");
    parent.map(&h.ctx, BASE, PAGE, RW, Backing::Anonymous, 0, MapFlags::FIXED).expect("map");
    parent
        .map(&h.ctx, BASE + 4 * PAGE, 2 * PAGE, RW, Backing::Anonymous, 0, MapFlags::FIXED)
        .expect("map");
    write_bytes(&h.ctx, &parent, BASE, &[5]).expect("write");
    let free = h.ctx.page_stats().free_pages;

    // The first entry is pre-faulted from the parent's page; the second one
    // needs a fresh page and fails.
    let child = h.ctx.create_map(Some(false)).expect("child");
    h.ctx.frames().failpoints().fail_next_alloc();
    assert_eq!(child.copy_from(&h.ctx, &parent), Err(VmError::OutOfMemory));
    assert!(child.dump().is_empty());
    assert!(child.translate(&h.ctx, BASE).is_none());
    assert_eq!(h.ctx.page_stats().free_pages, free);

    write_bytes(&h.ctx, &parent, BASE, &[6]).expect("parent write");
    assert_eq!(byte_at(&h, &parent, BASE), 6);
    assert_eq!(h.ctx.page_stats().free_pages, free);
    assert_eq!(parent.stats(&h.ctx).cow_copies, 0);
}
