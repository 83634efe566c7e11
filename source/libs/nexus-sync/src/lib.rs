// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Blocking synchronisation primitives for kernel subsystems
//! OWNERS: @kernel-sync-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/sleep.rs (threaded)
//! PUBLIC API: SleepLock, WaitQueue, lock_pair, set_block_hook
//! DEPENDS_ON: spin::RwLock (hook slot)
//! INVARIANTS: Waiters never spin without calling the block hook; lock_pair
//!   always acquires in ascending key order

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

fn relax() {
    core::hint::spin_loop();
}

static BLOCK_HOOK: spin::RwLock<fn()> = spin::RwLock::new(relax);

/// Installs the scheduler routine used to park a waiting thread.
///
/// The hook must return once the caller may re-check its condition (a yield is
/// sufficient). Until a hook is installed, waiting degrades to a spin-relax.
pub fn set_block_hook(hook: fn()) {
    *BLOCK_HOOK.write() = hook;
}

/// Parks the current thread once through the installed block hook.
pub fn block() {
    let hook = *BLOCK_HOOK.read();
    hook();
}

/// Lock whose contenders block through the scheduler instead of burning CPU.
pub struct SleepLock<T: ?Sized> {
    locked: AtomicBool,
    waiters: AtomicUsize,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SleepLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// Acquires the lock, parking through the block hook while contended.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            self.waiters.fetch_add(1, Ordering::Relaxed);
            while self.locked.load(Ordering::Relaxed) {
                block();
            }
            self.waiters.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SleepLockGuard { lock: self })
    }

    /// Number of threads currently parked on this lock.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Snapshot of the lock state; stale as soon as it returns.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Epoch-based wait queue: sleepers park until the epoch moves past the value
/// they observed before releasing their own locks.
pub struct WaitQueue {
    epoch: AtomicU64,
    sleepers: AtomicUsize,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self { epoch: AtomicU64::new(0), sleepers: AtomicUsize::new(0) }
    }

    /// Snapshot to pass to [`WaitQueue::wait`]; take it while the condition
    /// is still protected by the caller's lock.
    pub fn prepare(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Parks until [`WaitQueue::notify_all`] runs after `seen` was taken.
    pub fn wait(&self, seen: u64) {
        self.sleepers.fetch_add(1, Ordering::Relaxed);
        while self.epoch.load(Ordering::Acquire) == seen {
            block();
        }
        self.sleepers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Wakes every sleeper.
    pub fn notify_all(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Threads currently parked in [`WaitQueue::wait`].
    pub fn sleepers(&self) -> usize {
        self.sleepers.load(Ordering::Relaxed)
    }
}

/// Locks two unrelated sleep locks without deadlocking against a caller that
/// names them in the opposite order.
///
/// The lock with the smaller `key` is taken first; the second is only
/// try-locked, and on failure both are dropped and the attempt retried after
/// parking once. Guards come back in argument order.
pub fn lock_pair<'a, A: ?Sized, B: ?Sized>(
    a: &'a SleepLock<A>,
    a_key: u64,
    b: &'a SleepLock<B>,
    b_key: u64,
) -> (SleepLockGuard<'a, A>, SleepLockGuard<'a, B>) {
    assert_ne!(a_key, b_key, "lock_pair: both locks share key {}", a_key);
    loop {
        if a_key < b_key {
            let ga = a.lock();
            if let Some(gb) = b.try_lock() {
                return (ga, gb);
            }
        } else {
            let gb = b.lock();
            if let Some(ga) = a.try_lock() {
                return (ga, gb);
            }
        }
        block();
    }
}

#[cfg(test)]
mod tests {
    use super::{lock_pair, SleepLock, WaitQueue};

    #[test]
    fn guard_provides_mut_access() {
        let lock = SleepLock::new(1_u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 2);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SleepLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn lock_pair_returns_argument_order() {
        let a = SleepLock::new('a');
        let b = SleepLock::new('b');
        let (ga, gb) = lock_pair(&a, 9, &b, 3);
        assert_eq!((*ga, *gb), ('a', 'b'));
        assert!(a.is_locked() && b.is_locked());
    }

    #[test]
    fn notify_moves_epoch() {
        let queue = WaitQueue::new();
        let seen = queue.prepare();
        queue.notify_all();
        // Returns immediately: the epoch already moved.
        queue.wait(seen);
        assert_ne!(queue.prepare(), seen);
    }
}
