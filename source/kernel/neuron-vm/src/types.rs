// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Small value types shared across the VM core.

use core::fmt;

use bitflags::bitflags;

bitflags! {
    /// Access protection of a mapping, and the access kind of a fault.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Prot: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// Per-entry flags. `FIXED` is only meaningful on a map request and is
    /// never stored in an entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MapFlags: u8 {
        /// Private copy-on-write view: the next write fault copies.
        const NEEDS_COPY = 1 << 0;
        /// Skipped when the address space is copied.
        const NO_INHERIT = 1 << 1;
        /// Installed with the non-cacheable memory type.
        const UNCACHED = 1 << 2;
        /// Device memory; never copy-on-write.
        const DEVICE = 1 << 3;
        /// Place the mapping exactly at the hint.
        const FIXED = 1 << 4;
    }
}

impl MapFlags {
    /// Flags kept on a stored entry.
    pub const STORED: Self = Self::NEEDS_COPY
        .union(Self::NO_INHERIT)
        .union(Self::UNCACHED)
        .union(Self::DEVICE);
}

impl fmt::Display for Prot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |flag: Prot, c: char| if self.contains(flag) { c } else { '-' };
        write!(f, "{}{}{}", bit(Prot::READ, 'r'), bit(Prot::WRITE, 'w'), bit(Prot::EXEC, 'x'))
    }
}

/// Identity of an open file at the file server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file:{}", self.0)
    }
}

/// Process identifier handed to the reaper.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

/// Identity of a [`crate::VmMap`]; orders dual-map locking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(pub u64);
