// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot-time tunables for the VM core.

use crate::error::{VmError, VmResult};
use crate::mm::{is_page_aligned, pmm::NR_ORDERS};

/// Lowest user address; page zero stays unmapped.
pub const USER_BASE: usize = 0x1000;
/// End of the positive Sv39 half.
pub const USER_LIMIT: usize = 1 << 38;
/// Start of the negative Sv39 half.
pub const KERNEL_BASE: usize = !((1usize << 38) - 1);
/// Last page of the address space stays unmapped.
pub const KERNEL_LIMIT: usize = usize::MAX - 0xfff;

/// VM configuration handed to [`crate::VmContext::boot`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    pub user_base: usize,
    pub user_limit: usize,
    pub kernel_base: usize,
    pub kernel_limit: usize,
    /// New user maps defer population to the fault handler.
    pub lazy_user_maps: bool,
    /// Largest block order the page allocator hands out or coalesces to.
    pub max_order: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_base: USER_BASE,
            user_limit: USER_LIMIT,
            kernel_base: KERNEL_BASE,
            kernel_limit: KERNEL_LIMIT,
            lazy_user_maps: true,
            max_order: NR_ORDERS - 1,
        }
    }
}

impl VmConfig {
    /// Rejects inverted, unaligned or overlapping bounds and orders outside
    /// the allocator's classes.
    pub fn validate(&self) -> VmResult<()> {
        let bounds = [self.user_base, self.user_limit, self.kernel_base, self.kernel_limit];
        if bounds.iter().any(|b| !is_page_aligned(*b)) {
            return Err(VmError::Misaligned);
        }
        if self.user_base >= self.user_limit || self.kernel_base >= self.kernel_limit {
            return Err(VmError::InvalidArgument);
        }
        if self.user_limit > self.kernel_base {
            return Err(VmError::InvalidArgument);
        }
        if self.max_order >= NR_ORDERS {
            return Err(VmError::InvalidArgument);
        }
        Ok(())
    }
}
