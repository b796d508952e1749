// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Concurrency primitives shared by the scheduler: sleep/wakeup queues with
//! a cancellation contract, and lock-free bit-flag words.
//!
//! Every blocking point in the core follows the same protocol: set a status
//! flag, loop running a scheduler pass and sleeping on a [`WaitQueue`], and
//! on cancellation clear the flag before propagating `Interrupted`, so a
//! cancelled waiter never leaves the scheduler believing a pass is pending
//! on its behalf.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use bitflags::Flags;
use parking_lot::{Condvar, Mutex};

/// Outcome of a blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The queue was woken while we slept.
    Woken,
    /// The recheck timeout elapsed; the caller re-evaluates its condition.
    TimedOut,
    /// The caller-visible cancellation signal fired.
    Cancelled,
}

/// Caller-visible cancellation signal for blocking waits.
///
/// Cloning yields another handle to the same signal.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Wakeup epoch sampled before the caller re-checks its wait condition.
///
/// Sampling first closes the window where a wakeup between the condition
/// check and the sleep would otherwise be lost.
#[derive(Debug, Clone, Copy)]
pub struct WaitToken(u64);

/// A wake-all sleep queue: an epoch counter under a mutex plus a condvar.
pub struct WaitQueue {
    epoch: Mutex<u64>,
    cv: Condvar,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Sample the current epoch. Must be taken before re-checking the
    /// condition the caller intends to sleep on.
    pub fn prepare(&self) -> WaitToken {
        WaitToken(*self.epoch.lock())
    }

    /// Wake every sleeper.
    pub fn wake_all(&self) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        drop(epoch);
        self.cv.notify_all();
    }

    /// Sleep until the epoch advances past `token`, the recheck timeout
    /// elapses, or `cancel` fires.
    pub fn wait(
        &self,
        token: WaitToken,
        cancel: &CancelToken,
        recheck: Option<Duration>,
    ) -> WaitOutcome {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        let mut epoch = self.epoch.lock();
        while *epoch == token.0 {
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            match recheck {
                Some(timeout) => {
                    if self.cv.wait_for(&mut epoch, timeout).timed_out() {
                        return if cancel.is_cancelled() {
                            WaitOutcome::Cancelled
                        } else if *epoch != token.0 {
                            WaitOutcome::Woken
                        } else {
                            WaitOutcome::TimedOut
                        };
                    }
                }
                None => self.cv.wait(&mut epoch),
            }
        }
        WaitOutcome::Woken
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A `bitflags` word mutated with atomic bit operations, permitting
/// lock-free fast-path reads even while another thread holds the hardware
/// lock for an unrelated reason.
pub struct AtomicFlags<F> {
    bits: AtomicU32,
    _marker: PhantomData<F>,
}

impl<F: Flags<Bits = u32>> AtomicFlags<F> {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
            _marker: PhantomData,
        }
    }

    pub fn load(&self) -> F {
        F::from_bits_retain(self.bits.load(Ordering::Acquire))
    }

    pub fn contains(&self, flags: F) -> bool {
        self.load().contains(flags)
    }

    pub fn intersects(&self, flags: F) -> bool {
        self.load().intersects(flags)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.load(Ordering::Acquire) == 0
    }

    pub fn insert(&self, flags: F) {
        self.bits.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Set `flags`, returning whether they were all already set.
    pub fn test_and_set(&self, flags: F) -> bool {
        let prev = self.bits.fetch_or(flags.bits(), Ordering::AcqRel);
        prev & flags.bits() == flags.bits()
    }

    pub fn remove(&self, flags: F) {
        self.bits.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

impl<F: Flags<Bits = u32>> Default for AtomicFlags<F> {
    fn default() -> Self {
        Self::new()
    }
}
