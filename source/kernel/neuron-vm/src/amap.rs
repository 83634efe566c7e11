// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Anonymous copy-on-write memory: amaps and anons
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! PUBLIC API: Amap, AmapSlots, Anon
//! INVARIANTS: A slot's entry count equals the number of map entries whose
//!   range covers it; a slot holds an anon only while that count is non-zero
//!   (or while the amap is being torn down)
//!
//! Two sharing layers, each refcounted on its own: `Arc<Amap>` counts the map
//! entries holding the array, `Arc<Anon>` counts the amaps holding a page.
//! Partially unmapping an entry drops only the per-slot counts of the
//! unmapped sub-range, so an anon goes away as soon as no entry covers it
//! even while the amap itself lives on.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;

use crate::error::VmResult;
use crate::mm::{Frames, PageBlock, PageOwner};

/// One private physical page.
#[derive(Debug)]
pub struct Anon {
    page: PageBlock,
}

impl Anon {
    /// Fresh anon over a zero-filled page.
    pub fn zeroed(frames: &Frames) -> VmResult<Arc<Self>> {
        let page = frames.alloc_zeroed(PageOwner::ANON)?;
        Ok(Arc::new(Self { page }))
    }

    /// Fresh anon holding a copy of the page at `src`.
    pub fn copy_of(frames: &Frames, src: usize) -> VmResult<Arc<Self>> {
        let page = frames.alloc_copy(src, PageOwner::ANON)?;
        Ok(Arc::new(Self { page }))
    }

    /// Physical address of the page.
    pub fn pa(&self) -> usize {
        self.page.pa()
    }

    /// Drops one handle, freeing the page with the last one.
    pub fn release(frames: &Frames, anon: Arc<Anon>) {
        if let Some(last) = Arc::into_inner(anon) {
            log::trace!(target: "amap", "amap: anon {:#x} freed", last.page.pa());
            frames.free(last.page);
        }
    }
}

#[derive(Default)]
struct Slot {
    anon: Option<Arc<Anon>>,
    refs: u32,
}

/// Slot array of an amap; reached through [`Amap::lock`].
#[derive(Default)]
pub struct AmapSlots {
    slots: Vec<Slot>,
}

impl AmapSlots {
    /// Slots allocated so far; the array grows on demand.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Anon stored in `slot`, if any.
    pub fn anon(&self, slot: usize) -> Option<&Arc<Anon>> {
        self.slots.get(slot)?.anon.as_ref()
    }

    /// Number of map entries covering `slot`.
    pub fn refs(&self, slot: usize) -> u32 {
        self.slots.get(slot).map_or(0, |s| s.refs)
    }

    /// Stores `anon` in `slot`, returning the anon it displaced.
    pub fn install(&mut self, slot: usize, anon: Arc<Anon>) -> Option<Arc<Anon>> {
        self.grow(slot + 1);
        self.slots[slot].anon.replace(anon)
    }

    /// One more entry covers `range`; grows the array as needed.
    pub fn add_refs(&mut self, range: Range<usize>) {
        self.grow(range.end);
        for slot in &mut self.slots[range] {
            slot.refs += 1;
        }
    }

    /// One entry stopped covering `range`. Returns the anons of slots nobody
    /// covers any more; the caller releases them outside the amap lock.
    #[must_use]
    pub fn drop_refs(&mut self, range: Range<usize>) -> Vec<Arc<Anon>> {
        let mut released = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate().skip(range.start).take(range.len()) {
            if slot.refs == 0 {
                log::error!(
                    target: "amap",
                    "amap: slot {} released more often than referenced",
                    index
                );
                panic!("amap: slot {} reference underflow", index);
            }
            slot.refs -= 1;
            if slot.refs == 0 {
                released.extend(slot.anon.take());
            }
        }
        released
    }

    /// No entry covers any slot of `range` and none holds a page.
    pub fn is_unused(&self, range: Range<usize>) -> bool {
        range
            .into_iter()
            .all(|i| self.slots.get(i).map_or(true, |s| s.refs == 0 && s.anon.is_none()))
    }

    /// Slots populated with an anon.
    pub fn resident(&self) -> usize {
        self.slots.iter().filter(|s| s.anon.is_some()).count()
    }

    /// Private copy of `range` for a single entry: anons are shared (one more
    /// handle each), every slot is covered once.
    pub fn copy_range(&self, range: Range<usize>) -> AmapSlots {
        let slots = range
            .map(|i| Slot { anon: self.anon(i).map(Arc::clone), refs: 1 })
            .collect();
        AmapSlots { slots }
    }

    fn grow(&mut self, len: usize) {
        if self.slots.len() < len {
            self.slots.resize_with(len, Slot::default);
        }
    }
}

/// Array of anon slots shared by one or more map entries.
#[derive(Default)]
pub struct Amap {
    slots: spin::Mutex<AmapSlots>,
}

impl Amap {
    /// New amap with `slots` empty, unreferenced slots.
    pub fn new(slots: usize) -> Arc<Self> {
        let mut inner = AmapSlots::default();
        inner.grow(slots);
        Arc::new(Self { slots: spin::Mutex::new(inner) })
    }

    /// Wraps a slot array built by [`AmapSlots::copy_range`].
    pub fn from_slots(slots: AmapSlots) -> Arc<Self> {
        Arc::new(Self { slots: spin::Mutex::new(slots) })
    }

    /// Locks the slot array. Taken after the map lock, before the allocator.
    pub fn lock(&self) -> spin::MutexGuard<'_, AmapSlots> {
        self.slots.lock()
    }

    /// Drops one entry's handle; the last handle releases every remaining
    /// anon.
    pub fn release(frames: &Frames, amap: Arc<Amap>) {
        let Some(last) = Arc::into_inner(amap) else { return };
        let slots = last.slots.into_inner().slots;
        let mut freed = 0;
        for anon in slots.into_iter().filter_map(|s| s.anon) {
            Anon::release(frames, anon);
            freed += 1;
        }
        log::trace!(target: "amap", "amap: destroyed, {} anons dropped", freed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimMachine;
    use crate::hal::PhysWindow;
    use crate::mm::PhysAllocator;

    fn frames() -> Frames {
        let machine = SimMachine::new(16);
        let pool = PhysAllocator::new(&[machine.region()], &[]).expect("pool");
        Frames::new(pool, machine as Arc<dyn PhysWindow>)
    }

    #[test]
    fn partial_release_frees_only_uncovered_anons() {
        let frames = frames();
        let start = frames.stats().free_pages;
        let amap = Amap::new(4);
        {
            let mut slots = amap.lock();
            // Two entries: one over slots 0..4, one over 2..4.
            slots.add_refs(0..4);
            slots.add_refs(2..4);
            for i in 0..4 {
                assert!(slots.install(i, Anon::zeroed(&frames).expect("anon")).is_none());
            }
        }
        assert_eq!(frames.stats().free_pages, start - 4);

        let released = amap.lock().drop_refs(0..4);
        assert_eq!(released.len(), 2);
        for anon in released {
            Anon::release(&frames, anon);
        }
        assert_eq!(frames.stats().free_pages, start - 2);
        assert_eq!(amap.lock().resident(), 2);

        Amap::release(&frames, amap);
        assert_eq!(frames.stats().free_pages, start);
    }

    #[test]
    fn copied_slots_share_anons_until_released() {
        let frames = frames();
        let amap = Amap::new(2);
        let anon = Anon::zeroed(&frames).expect("anon");
        frames.write(anon.pa(), 0, b"cow");
        {
            let mut slots = amap.lock();
            slots.add_refs(0..2);
            assert!(slots.install(1, Arc::clone(&anon)).is_none());
        }
        let copy = Amap::from_slots(amap.lock().copy_range(1..2));
        assert_eq!(Arc::strong_count(&anon), 3);
        assert_eq!(copy.lock().refs(0), 1);
        assert!(copy.lock().anon(0).is_some_and(|a| Arc::ptr_eq(a, &anon)));

        Amap::release(&frames, amap);
        Amap::release(&frames, copy);
        let pa = anon.pa();
        let mut buf = [0u8; 3];
        frames.read(pa, 0, &mut buf);
        assert_eq!(&buf, b"cow");
        Anon::release(&frames, anon);
        assert!(frames.lookup(pa).is_some_and(|p| p.free));
    }

    #[test]
    fn unused_ranges_extend_past_the_array() {
        let amap = Amap::new(1);
        let mut slots = amap.lock();
        assert!(slots.is_unused(0..8));
        slots.add_refs(0..1);
        assert!(!slots.is_unused(0..1));
        assert!(slots.is_unused(1..8));
        assert_eq!(slots.len(), 1);
        slots.add_refs(3..5);
        assert_eq!(slots.len(), 5);
        assert_eq!(slots.refs(4), 1);
        assert_eq!(slots.refs(2), 0);
    }

    #[test]
    #[should_panic(expected = "reference underflow")]
    fn over_release_is_fatal() {
        let amap = Amap::new(1);
        let _ = amap.lock().drop_refs(0..1);
    }
}
