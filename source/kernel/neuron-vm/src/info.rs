// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Introspection records behind the memory-info system call and debug dumps.
//! The layout is a diagnostics contract, not a stable ABI.

use core::fmt;

use crate::context::VmContext;
use crate::map::{Backing, MapEntry, VmMap};
use crate::mm::pmm::PmmStats;
use crate::object::ObjectStats;
use crate::types::{FileId, MapFlags, Prot};

/// Backing store of an entry, without the reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingKind {
    Anonymous,
    Physical,
    Object(FileId),
}

/// Snapshot of one map entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    pub start: usize,
    pub end: usize,
    pub prot: Prot,
    pub flags: MapFlags,
    pub backing: BackingKind,
    pub offset: u64,
    /// First amap slot, if the entry has private pages.
    pub amap_slot: Option<usize>,
    /// Private pages present in the entry's slot range.
    pub anons: usize,
}

impl EntryInfo {
    pub(crate) fn of(entry: &MapEntry) -> Self {
        let backing = match &entry.backing {
            Backing::Anonymous => BackingKind::Anonymous,
            Backing::Physical => BackingKind::Physical,
            Backing::Object(obj) => BackingKind::Object(obj.file()),
        };
        let anons = entry.amap.as_ref().map_or(0, |aref| {
            let slots = aref.amap.lock();
            (aref.slot..aref.slot + entry.pages()).filter(|i| slots.anon(*i).is_some()).count()
        });
        Self {
            start: entry.start,
            end: entry.end,
            prot: entry.prot,
            flags: entry.flags,
            backing,
            offset: entry.offset,
            amap_slot: entry.amap.as_ref().map(|a| a.slot),
            anons,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for EntryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014x}-{:#014x} {} ", self.start, self.end, self.prot)?;
        match self.backing {
            BackingKind::Anonymous => f.write_str("anon")?,
            BackingKind::Physical => write!(f, "phys@{:#x}", self.offset)?,
            BackingKind::Object(file) => write!(f, "{}+{:#x}", file, self.offset)?,
        }
        if self.flags.contains(MapFlags::NEEDS_COPY) {
            f.write_str(" cow")?;
        }
        if self.flags.contains(MapFlags::DEVICE) {
            f.write_str(" dev")?;
        } else if self.flags.contains(MapFlags::UNCACHED) {
            f.write_str(" nc")?;
        }
        if let Some(slot) = self.amap_slot {
            write!(f, " amap[{}] {} anons", slot, self.anons)?;
        }
        Ok(())
    }
}

/// Per-map counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapStats {
    pub entries: usize,
    pub mapped_bytes: usize,
    /// Pages with a live translation.
    pub resident_pages: usize,
    pub faults: u64,
    pub zero_fills: u64,
    pub cow_copies: u64,
    pub fetches: u64,
    pub generation: u64,
}

/// Record returned by the memory-info system call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub pages: PmmStats,
    pub map: MapStats,
    pub objects: ObjectStats,
}

impl MemInfo {
    /// Snapshot of the allocator, `map` and the object cache.
    pub fn collect(ctx: &VmContext, map: &VmMap) -> Self {
        Self { pages: ctx.page_stats(), map: map.stats(ctx), objects: ctx.objects.stats() }
    }
}
