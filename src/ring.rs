// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Primary command buffer ring.
//!
//! The device consumes one primary buffer at a time. Submitters fold
//! client-built secondary buffers into the current primary as chain word
//! pairs; the scheduler seals a buffer with a trailer and fires it to the
//! DMA engine. Two cursors run around the ring: the fill cursor (`current`)
//! where submitters append, and the fire cursor trailing it, pointing at
//! the oldest buffer not yet handed to hardware.
//!
//! A buffer's IN_USE flag is claimed when it becomes the fill target and
//! is released only by the completion path, so claiming a slot doubles as
//! the wait-for-retirement point. Per-buffer lifecycle state lives in an
//! atomic flag word so fast paths can observe it without taking the
//! content lock; the word stream sits under a short spin lock because it
//! is only touched for a handful of stores at a time.

use spin::Mutex;

use crate::hw::DmaHandle;
use crate::wait::AtomicFlags;

/// Words reserved at the end of every primary buffer for the trailer.
pub const TAIL_MARGIN: usize = 5;

/// No-op filler word.
pub const WORD_PAD: u32 = 0x5555_5555;
/// End-of-stream marker; the device raises the completion interrupt and
/// writes the retirement generation when it executes one.
pub const WORD_END: u32 = 0xaaaa_aaaa;
/// Chain opcode. Low bits carry the secondary base address shifted right
/// by two; the following word carries the word count.
pub const WORD_CHAIN: u32 = 0x8000_0000;

bitflags::bitflags! {
    /// Lifecycle state of one primary buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufStatus: u32 {
        /// Claimed as the fill target or executing on the hardware.
        /// Cleared only when the completion path retires the buffer.
        const IN_USE = 1 << 0;
        /// Fire on the next pass even if the heuristics say otherwise.
        const FORCE_FIRE = 1 << 1;
        /// Fired while still the fill target; submitters must claim the
        /// following slot before appending more work.
        const NEEDS_OVERFLOW = 1 << 2;
        /// Contains a frame swap; fired eagerly to keep present latency
        /// low.
        const SWAP_PENDING = 1 << 3;
    }
}

/// Physical extent of a sealed primary buffer, everything the fire path
/// needs after the content lock is dropped.
#[derive(Debug, Clone, Copy)]
pub struct Sealed {
    pub start: u64,
    pub end: u64,
    pub generation: u32,
}

struct Slot {
    words: Vec<u32>,
    sec_used: usize,
    generation: u32,
}

/// One entry of the ring.
pub struct PrimaryBuffer {
    handle: DmaHandle,
    capacity_words: usize,
    pub status: AtomicFlags<BufStatus>,
    slot: Mutex<Slot>,
}

impl PrimaryBuffer {
    fn new(handle: DmaHandle, size: usize) -> Self {
        let capacity_words = size / 4;
        Self {
            handle,
            capacity_words,
            status: AtomicFlags::new(),
            slot: Mutex::new(Slot {
                words: Vec::with_capacity(capacity_words),
                sec_used: 0,
                generation: 0,
            }),
        }
    }

    pub fn handle(&self) -> DmaHandle {
        self.handle
    }

    pub fn capacity_words(&self) -> usize {
        self.capacity_words
    }

    pub fn used_words(&self) -> usize {
        self.slot.lock().words.len()
    }

    /// Secondary buffers folded in since the last reset.
    pub fn sec_used(&self) -> usize {
        self.slot.lock().sec_used
    }

    pub fn is_empty(&self) -> bool {
        self.used_words() == 0
    }

    pub fn generation(&self) -> u32 {
        self.slot.lock().generation
    }

    /// Stamp the dispatch generation this buffer's content will carry.
    pub fn set_generation(&self, generation: u32) {
        self.slot.lock().generation = generation;
    }

    /// Append the chain pair referencing a client-filled secondary buffer.
    /// Returns false, changing nothing, when the trailer margin would be
    /// violated.
    pub fn fold_in(&self, backing: DmaHandle, words: usize) -> bool {
        let mut slot = self.slot.lock();
        if slot.words.len() + 2 > self.capacity_words - TAIL_MARGIN {
            return false;
        }
        slot.words.push(WORD_CHAIN | (backing.phys >> 2) as u32);
        slot.words.push(words as u32);
        slot.sec_used += 1;
        true
    }

    /// Terminate the stream with the pad/end trailer and hand the extent
    /// to the fire path. The margin guarantees the trailer always fits.
    pub fn seal(&self, generation: u32) -> Sealed {
        let mut slot = self.slot.lock();
        slot.words.push(WORD_PAD);
        slot.words.push(WORD_PAD);
        slot.words.push(WORD_PAD);
        slot.words.push(WORD_END);
        slot.generation = generation;
        Sealed {
            start: self.handle.phys,
            end: self.handle.phys + (slot.words.len() * 4) as u64,
            generation,
        }
    }

    /// Forget the word stream and fold count. The backing memory still
    /// holds the commands after a fire; only the host cursor resets.
    pub fn clear_content(&self) {
        let mut slot = self.slot.lock();
        slot.words.clear();
        slot.sec_used = 0;
    }

    /// Fresh build state for a newly claimed slot. IN_USE is the claim
    /// itself and is deliberately left alone.
    pub fn reset(&self) {
        self.clear_content();
        self.status
            .remove(BufStatus::FORCE_FIRE | BufStatus::NEEDS_OVERFLOW | BufStatus::SWAP_PENDING);
    }

    /// Snapshot of the word stream, for tests and dump diagnostics.
    pub fn words(&self) -> Vec<u32> {
        self.slot.lock().words.clone()
    }
}

/// The ring of primary buffers plus the fill and fire cursors.
pub struct PrimaryRing {
    bufs: Vec<PrimaryBuffer>,
    current: usize,
    fire: usize,
}

impl PrimaryRing {
    /// Build the ring. Buffer `i` starts with generation `i + 1` (the
    /// value is replaced the first time the slot is claimed); slot 0 is
    /// pre-claimed as the initial fill target.
    pub fn new(blocks: Vec<(DmaHandle, usize)>) -> Self {
        let bufs = blocks
            .into_iter()
            .map(|(handle, size)| PrimaryBuffer::new(handle, size))
            .collect::<Vec<_>>();
        for (i, buf) in bufs.iter().enumerate() {
            buf.set_generation(i as u32 + 1);
        }
        bufs[0].status.insert(BufStatus::IN_USE);
        Self {
            bufs,
            current: 0,
            fire: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    pub fn get(&self, index: usize) -> &PrimaryBuffer {
        &self.bufs[index]
    }

    /// The buffer submitters append to.
    pub fn current(&self) -> &PrimaryBuffer {
        &self.bufs[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// The oldest buffer not yet handed to hardware.
    pub fn fire_target(&self) -> &PrimaryBuffer {
        &self.bufs[self.fire]
    }

    pub fn fire_index(&self) -> usize {
        self.fire
    }

    /// Slot a submitter must claim when the current buffer is full.
    pub fn next_fill_index(&self) -> usize {
        (self.current + 1) % self.bufs.len()
    }

    /// Move filling into a freshly claimed slot.
    pub fn set_current(&mut self, index: usize) {
        self.current = index;
    }

    /// Step the fire cursor past a just-fired buffer.
    pub fn advance_fire(&mut self) {
        self.fire = (self.fire + 1) % self.bufs.len();
    }

    /// Buffers currently claimed or executing.
    pub fn busy_count(&self) -> usize {
        self.bufs
            .iter()
            .filter(|b| b.status.contains(BufStatus::IN_USE))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PrimaryBuffer> {
        self.bufs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(count: usize, size: usize) -> PrimaryRing {
        let blocks = (0..count)
            .map(|i| (DmaHandle { phys: 0x10_0000 + (i as u64) * 0x1_0000 }, size))
            .collect();
        PrimaryRing::new(blocks)
    }

    #[test]
    fn test_init_claims_first_slot() {
        let ring = ring(2, 0x100);
        assert!(ring.get(0).status.contains(BufStatus::IN_USE));
        assert!(!ring.get(1).status.contains(BufStatus::IN_USE));
        assert_eq!(ring.get(0).generation(), 1);
        assert_eq!(ring.get(1).generation(), 2);
        assert_eq!(ring.current_index(), 0);
        assert_eq!(ring.fire_index(), 0);
    }

    #[test]
    fn test_fold_in_appends_chain_pair() {
        let ring = ring(2, 0x100);
        let buf = ring.current();
        assert!(buf.fold_in(DmaHandle { phys: 0x8000 }, 16));
        let words = buf.words();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], WORD_CHAIN | (0x8000u32 >> 2));
        assert_eq!(words[1], 16);
        assert_eq!(buf.sec_used(), 1);
    }

    #[test]
    fn test_fold_in_respects_tail_margin() {
        // 8 words capacity, 5 reserved: a chain pair no longer fits once
        // one is in place.
        let ring = ring(2, 8 * 4);
        let buf = ring.current();
        let backing = DmaHandle { phys: 0x8000 };
        assert!(buf.fold_in(backing, 4));
        assert!(!buf.fold_in(backing, 4));
        assert_eq!(buf.used_words(), 2);
    }

    #[test]
    fn test_seal_appends_trailer() {
        let ring = ring(2, 0x100);
        let buf = ring.current();
        buf.fold_in(DmaHandle { phys: 0x8000 }, 8);
        let sealed = buf.seal(5);
        assert_eq!(sealed.generation, 5);
        let words = buf.words();
        assert_eq!(words.len(), 6);
        assert_eq!(&words[2..], &[WORD_PAD, WORD_PAD, WORD_PAD, WORD_END]);
        assert_eq!(sealed.start, buf.handle().phys);
        assert_eq!(sealed.end, buf.handle().phys + 6 * 4);
        assert_eq!(buf.generation(), 5);
    }

    #[test]
    fn test_reset_clears_content_but_not_claim() {
        let ring = ring(2, 0x100);
        let buf = ring.current();
        buf.fold_in(DmaHandle { phys: 0x8000 }, 8);
        buf.status
            .insert(BufStatus::SWAP_PENDING | BufStatus::FORCE_FIRE | BufStatus::NEEDS_OVERFLOW);
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.sec_used(), 0);
        assert_eq!(buf.status.load(), BufStatus::IN_USE);
    }

    #[test]
    fn test_cursors_advance_independently() {
        let mut ring = ring(3, 0x100);
        assert_eq!(ring.next_fill_index(), 1);
        ring.set_current(1);
        assert_eq!(ring.current_index(), 1);
        assert_eq!(ring.fire_index(), 0);
        ring.advance_fire();
        assert_eq!(ring.fire_index(), 1);
        ring.set_current(2);
        assert_eq!(ring.next_fill_index(), 0);
    }

    #[test]
    fn test_busy_count_tracks_claims() {
        let ring = ring(3, 0x100);
        assert_eq!(ring.busy_count(), 1);
        ring.get(2).status.insert(BufStatus::IN_USE);
        assert_eq!(ring.busy_count(), 2);
    }
}
