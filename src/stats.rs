// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Submission-path statistics.
//!
//! Plain relaxed counters bumped from hot paths and the interrupt handler;
//! [`DmaStats::snapshot`] produces a coherent-enough copy for logging and
//! the stats query surface.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct DmaStats {
    submissions: AtomicU64,
    checkouts: AtomicU64,
    checkout_retries: AtomicU64,
    checkout_blocks: AtomicU64,
    discards: AtomicU64,
    fires: AtomicU64,
    fires_forced: AtomicU64,
    fires_for_waiter: AtomicU64,
    fires_for_swap: AtomicU64,
    fires_eager: AtomicU64,
    fires_batched: AtomicU64,
    secondaries_dispatched: AtomicU64,
    flushes: AtomicU64,
    overflows: AtomicU64,
    generation_wraps: AtomicU64,
    interrupts: AtomicU64,
    deferred_passes: AtomicU64,
    missed_passes: AtomicU64,
    lockups: AtomicU64,
    protocol_violations: AtomicU64,
}

/// Point-in-time copy of [`DmaStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub submissions: u64,
    pub checkouts: u64,
    pub checkout_retries: u64,
    pub checkout_blocks: u64,
    pub discards: u64,
    pub fires: u64,
    /// Fire decisions by heuristic arm; counted when the decision is
    /// made, so an aborted fire still shows up here.
    pub fires_forced: u64,
    pub fires_for_waiter: u64,
    pub fires_for_swap: u64,
    pub fires_eager: u64,
    pub fires_batched: u64,
    pub secondaries_dispatched: u64,
    pub flushes: u64,
    pub overflows: u64,
    pub generation_wraps: u64,
    pub interrupts: u64,
    pub deferred_passes: u64,
    pub missed_passes: u64,
    pub lockups: u64,
    pub protocol_violations: u64,
}

impl DmaStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submission(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkout(&self) {
        self.checkouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkout_retry(&self) {
        self.checkout_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkout_block(&self) {
        self.checkout_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fire(&self, secondaries: usize) {
        self.fires.fetch_add(1, Ordering::Relaxed);
        self.secondaries_dispatched
            .fetch_add(secondaries as u64, Ordering::Relaxed);
    }

    pub fn record_fire_forced(&self) {
        self.fires_forced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fire_for_waiter(&self) {
        self.fires_for_waiter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fire_for_swap(&self) {
        self.fires_for_swap.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fire_eager(&self) {
        self.fires_eager.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fire_batched(&self) {
        self.fires_batched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_generation_wrap(&self) {
        self.generation_wraps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred_pass(&self) {
        self.deferred_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_missed_pass(&self) {
        self.missed_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lockup(&self) {
        self.lockups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submissions: self.submissions.load(Ordering::Relaxed),
            checkouts: self.checkouts.load(Ordering::Relaxed),
            checkout_retries: self.checkout_retries.load(Ordering::Relaxed),
            checkout_blocks: self.checkout_blocks.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            fires: self.fires.load(Ordering::Relaxed),
            fires_forced: self.fires_forced.load(Ordering::Relaxed),
            fires_for_waiter: self.fires_for_waiter.load(Ordering::Relaxed),
            fires_for_swap: self.fires_for_swap.load(Ordering::Relaxed),
            fires_eager: self.fires_eager.load(Ordering::Relaxed),
            fires_batched: self.fires_batched.load(Ordering::Relaxed),
            secondaries_dispatched: self.secondaries_dispatched.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            generation_wraps: self.generation_wraps.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            deferred_passes: self.deferred_passes.load(Ordering::Relaxed),
            missed_passes: self.missed_passes.load(Ordering::Relaxed),
            lockups: self.lockups.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
        }
    }
}
