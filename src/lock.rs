// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware lock arbitration.
//!
//! A single word arbitrates exclusive device access between the in-kernel
//! scheduler and user contexts. The scheduler context is a reserved
//! sentinel id that acquires opportunistically and never queues; everyone
//! else loops on [`HardwareLock::try_acquire`] with the blocking protocol
//! provided by the device context.

use std::sync::atomic::{AtomicU32, Ordering};

use log::error;

use crate::error::{Error, Result};

/// Reserved context id for the in-kernel scheduler.
pub const KERNEL_CONTEXT: u32 = 0;

const LOCK_HELD: u32 = 1 << 31;
const LOCK_CONTENDED: u32 = 1 << 30;
const CONTEXT_MASK: u32 = LOCK_CONTENDED - 1;

/// One-word mutual exclusion token for the device.
pub struct HardwareLock {
    word: AtomicU32,
}

impl HardwareLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    /// Try to take the lock for `context` with a single compare-and-swap.
    ///
    /// Non-blocking. On contention the CONTENDED bit is recorded so the
    /// eventual release knows to wake queued waiters.
    pub fn try_acquire(&self, context: u32) -> bool {
        loop {
            let old = self.word.load(Ordering::Relaxed);
            let new = if old & LOCK_HELD != 0 {
                old | LOCK_CONTENDED
            } else {
                LOCK_HELD | (context & CONTEXT_MASK)
            };
            match self
                .word
                .compare_exchange_weak(old, new, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return old & LOCK_HELD == 0,
                Err(_) => continue,
            }
        }
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<u32> {
        let word = self.word.load(Ordering::Acquire);
        if word & LOCK_HELD != 0 {
            Some(word & CONTEXT_MASK)
        } else {
            None
        }
    }

    pub fn is_contended(&self) -> bool {
        self.word.load(Ordering::Acquire) & LOCK_CONTENDED != 0
    }

    /// Release the lock held by `context`, exactly once per successful
    /// acquire. Returns whether contention was recorded while held, so the
    /// caller can wake lock waiters.
    ///
    /// Double release and release by a non-holder are internal-consistency
    /// errors: logged, reported, and the lock left untouched.
    pub fn release(&self, context: u32) -> Result<bool> {
        loop {
            let old = self.word.load(Ordering::Relaxed);
            if old & LOCK_HELD == 0 {
                error!("hardware lock released while not held (context {context})");
                return Err(Error::ProtocolViolation);
            }
            if old & CONTEXT_MASK != context & CONTEXT_MASK {
                error!(
                    "hardware lock held by context {} released by context {context}",
                    old & CONTEXT_MASK
                );
                return Err(Error::ProtocolViolation);
            }
            if self
                .word
                .compare_exchange_weak(old, 0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(old & LOCK_CONTENDED != 0);
            }
        }
    }
}

impl Default for HardwareLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_acquire_release_cycle() {
        let lock = HardwareLock::new();
        assert_eq!(lock.holder(), None);
        assert!(lock.try_acquire(3));
        assert_eq!(lock.holder(), Some(3));
        assert!(!lock.is_contended());
        assert_eq!(lock.release(3), Ok(false));
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn test_contention_is_recorded() {
        let lock = HardwareLock::new();
        assert!(lock.try_acquire(1));
        assert!(!lock.try_acquire(2));
        assert!(lock.is_contended());
        assert_eq!(lock.release(1), Ok(true));
        assert!(lock.try_acquire(2));
    }

    #[test]
    fn test_kernel_context_acquires_opportunistically() {
        let lock = HardwareLock::new();
        assert!(lock.try_acquire(KERNEL_CONTEXT));
        assert_eq!(lock.holder(), Some(KERNEL_CONTEXT));
        assert_eq!(lock.release(KERNEL_CONTEXT), Ok(false));
    }

    #[test]
    fn test_double_release_is_violation() {
        let lock = HardwareLock::new();
        assert!(lock.try_acquire(5));
        assert_eq!(lock.release(5), Ok(false));
        assert_eq!(lock.release(5), Err(Error::ProtocolViolation));
    }

    #[test]
    fn test_foreign_release_leaves_lock_held() {
        let lock = HardwareLock::new();
        assert!(lock.try_acquire(5));
        assert_eq!(lock.release(9), Err(Error::ProtocolViolation));
        assert_eq!(lock.holder(), Some(5));
        assert_eq!(lock.release(5), Ok(false));
    }

    #[test]
    fn test_at_most_one_holder_under_contention() {
        let lock = Arc::new(HardwareLock::new());
        let acquired = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for ctx in 1..=8u32 {
            let lock = lock.clone();
            let acquired = acquired.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    if lock.try_acquire(ctx) {
                        let n = acquired.fetch_add(1, Ordering::AcqRel);
                        assert_eq!(n, 0, "two holders at once");
                        acquired.fetch_sub(1, Ordering::AcqRel);
                        lock.release(ctx).unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.holder(), None);
    }
}
