// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical memory management for the VM core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PAGE_SIZE, page helpers, pmm::PhysAllocator, Frames, Failpoints
//! DEPENDS_ON: hal::PhysWindow (page contents), spin::Mutex (allocator lock)

pub mod frames;
pub mod pmm;

pub use frames::{Failpoints, Frames};
pub use pmm::{PageBlock, PageOwner, PhysAllocator};

use static_assertions::const_assert;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// Returns `true` when `value` sits on a page boundary.
pub const fn is_page_aligned(value: usize) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Rounds `value` down to its page.
pub const fn page_align_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

/// Rounds `value` up to the next page boundary, `None` on overflow.
pub const fn page_align_up(value: usize) -> Option<usize> {
    match value.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// Number of pages needed to hold `bytes`.
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(page_align_down(0x1fff), 0x1000);
        assert_eq!(page_align_up(0x1001), Some(0x2000));
        assert_eq!(page_align_up(0x2000), Some(0x2000));
        assert_eq!(page_align_up(usize::MAX), None);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(3 * PAGE_SIZE), 3);
        assert!(is_page_aligned(0) && !is_page_aligned(8));
    }
}
