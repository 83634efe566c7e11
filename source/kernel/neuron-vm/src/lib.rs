// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: NEURON virtual-memory core
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + integration tests under tests/
//! PUBLIC API: VmContext, VmMap, PhysAllocator, Amap/Anon, MemObject/ObjectCache,
//!   fault::{force, handle_fault}, abi::{sys_map, sys_unmap, sys_meminfo}
//! DEPENDS_ON: nexus-augtree (entry tree), nexus-sync (map lock, wait queue),
//!   spin (structural locks), log, thiserror
//! INVARIANTS: Entries in one map never overlap; free-list classes hold only
//!   maximal aligned blocks; lock nesting is map -> amap -> allocator, object
//!   locks are never taken around a map lock
//!
//! Layering, leaves first: `mm` (buddy page allocator) -> `object` (file page
//! cache) and `amap` (copy-on-write slots) -> `map` (per-address-space
//! interval tree) -> `fault` (resolver installing translations through
//! `hal::Pmap`). `context::VmContext` owns the boot-once shared state.

#![cfg_attr(not(test), no_std)]
#![deny(clippy::unwrap_used)]

extern crate alloc;

pub mod abi;
pub mod amap;
pub mod arch;
pub mod config;
pub mod context;
pub mod error;
pub mod fault;
pub mod hal;
pub mod info;
pub mod map;
pub mod mm;
pub mod object;
pub mod types;

pub use config::VmConfig;
pub use context::VmContext;
pub use error::{IoError, VmError, VmResult};
pub use map::VmMap;
pub use types::{FileId, MapFlags, Pid, Prot};
