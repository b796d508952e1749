// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware collaborator seams.
//!
//! The core never touches device registers or DMA memory directly; it
//! consumes the platform through the [`RegisterIo`] and [`DmaMemory`]
//! traits. Register offsets and status bits below are the generic shape
//! shared across the supported device family; the per-chip register files
//! live with the chip drivers, not here.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::error::Result;

/// Generic register map consumed by the scheduler.
pub mod regs {
    /// Engine status word, read-only.
    pub const STATUS: u32 = 0x00;
    /// Physical base address of the primary buffer being fired.
    pub const PRIM_ADDRESS: u32 = 0x04;
    /// Physical end address of the primary buffer; writing this starts DMA.
    pub const PRIM_END: u32 = 0x08;
    /// Completion interrupt enable.
    pub const IRQ_ENABLE: u32 = 0x0c;
    /// Completion interrupt acknowledge.
    pub const IRQ_ACK: u32 = 0x10;
    /// Physical address of the shared status page.
    pub const STATUS_PAGE: u32 = 0x14;
}

/// A completion interrupt is pending.
pub const STATUS_IRQ_PENDING: u32 = 1 << 0;
/// The drawing engine is executing commands.
pub const STATUS_ENGINE_ACTIVE: u32 = 1 << 16;
/// The DMA engine can accept a new primary buffer.
pub const STATUS_DMA_READY: u32 = 1 << 17;

/// Ready for another fire: DMA ready, no unacknowledged interrupt.
pub const SOFT_READY_MASK: u32 = STATUS_DMA_READY | STATUS_IRQ_PENDING;
/// Fully quiescent: additionally the drawing engine has drained.
pub const FULL_IDLE_MASK: u32 = STATUS_DMA_READY | STATUS_ENGINE_ACTIVE | STATUS_IRQ_PENDING;
/// Expected value under either mask when the condition holds.
pub const READY_VALUE: u32 = STATUS_DMA_READY;

/// Opaque reference to a DMA-capable memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaHandle {
    /// Device-visible physical base address.
    pub phys: u64,
}

/// Device register access.
pub trait RegisterIo: Send + Sync {
    fn read_register(&self, offset: u32) -> u32;
    fn write_register(&self, offset: u32, value: u32);
}

/// DMA-capable memory provider.
///
/// Blocks are allocated zeroed once at device init and freed only at
/// teardown; the core never allocates on the submission path.
pub trait DmaMemory: Send + Sync {
    /// Allocate a zeroed, physically contiguous block.
    fn allocate_zeroed_block(&self, size: usize) -> Result<DmaHandle>;
    /// Map a window of device memory at `offset` into the DMA space.
    fn map_device_memory(&self, offset: u64, size: usize) -> Result<DmaHandle>;
    /// Return a block obtained from either call above.
    fn free_block(&self, handle: DmaHandle, size: usize);
}

/// Everything the core consumes from the platform.
pub trait HwInterface: RegisterIo + DmaMemory {}

impl<T: RegisterIo + DmaMemory> HwInterface for T {}

bitflags! {
    /// Dirty bits in the shared status page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirtyFlags: u32 {
        /// The next fire must wait for full engine idle, not just DMA-ready.
        const FULL_FLUSH = 1 << 0;
    }
}

/// Host mirror of the fixed-size status page shared with the device.
///
/// The device updates the retirement side on every buffer retirement and
/// trailing marker; software writes it only at initialization, plus the
/// dispatch generation recorded at fire time.
pub struct StatusPage {
    handle: DmaHandle,
    last_dispatched: AtomicU32,
    last_retired: AtomicU32,
    dirty: AtomicU32,
}

/// Status page allocation size.
pub const STATUS_PAGE_SIZE: usize = 4096;

impl StatusPage {
    pub fn new(handle: DmaHandle) -> Self {
        Self {
            handle,
            last_dispatched: AtomicU32::new(0),
            last_retired: AtomicU32::new(0),
            dirty: AtomicU32::new(0),
        }
    }

    pub fn handle(&self) -> DmaHandle {
        self.handle
    }

    pub fn record_dispatch(&self, generation: u32) {
        self.last_dispatched.store(generation, Ordering::Release);
    }

    pub fn record_retire(&self, generation: u32) {
        self.last_retired.store(generation, Ordering::Release);
    }

    pub fn last_dispatched(&self) -> u32 {
        self.last_dispatched.load(Ordering::Acquire)
    }

    pub fn last_retired(&self) -> u32 {
        self.last_retired.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, flags: DirtyFlags) {
        self.dirty.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_dirty(&self, flags: DirtyFlags) {
        self.dirty.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn dirty(&self) -> DirtyFlags {
        DirtyFlags::from_bits_retain(self.dirty.load(Ordering::Acquire))
    }
}
