// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Simulated device backend.
//!
//! Implements the register and DMA-memory seams over plain host memory,
//! with knobs for the states real hardware gets itself into: an engine
//! that never reaches ready, allocation failure mid bring-up, and
//! instant completion of every fired buffer. Used by the test suite and
//! for bring-up work on machines without the device.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::hw::{DmaHandle, DmaMemory, RegisterIo, STATUS_DMA_READY, STATUS_IRQ_PENDING, regs};

/// Device-memory window mapped by [`DmaMemory::map_device_memory`].
const DEVICE_WINDOW_BASE: u64 = 0x4000_0000;

pub struct SimHardware {
    status: AtomicU32,
    irq_enable: AtomicU32,
    status_page: AtomicU32,
    prim_address: AtomicU32,
    prim_end: AtomicU32,
    fired: Mutex<Vec<(u32, u32)>>,
    auto_complete: AtomicBool,
    allocated: AtomicUsize,
    freed: AtomicUsize,
    fail_after: AtomicUsize,
    next_phys: AtomicU64,
}

impl SimHardware {
    pub fn new() -> Self {
        Self {
            status: AtomicU32::new(STATUS_DMA_READY),
            irq_enable: AtomicU32::new(0),
            status_page: AtomicU32::new(0),
            prim_address: AtomicU32::new(0),
            prim_end: AtomicU32::new(0),
            fired: Mutex::new(Vec::new()),
            auto_complete: AtomicBool::new(false),
            allocated: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            fail_after: AtomicUsize::new(usize::MAX),
            next_phys: AtomicU64::new(0x10_0000),
        }
    }

    /// Overwrite the status register wholesale, e.g. `0` for a hung
    /// engine.
    pub fn set_status(&self, value: u32) {
        self.status.store(value, Ordering::Release);
    }

    /// Assert the completion interrupt, as the device does when it
    /// executes an end-of-stream marker.
    pub fn raise_completion(&self) {
        self.status.fetch_or(STATUS_IRQ_PENDING, Ordering::AcqRel);
    }

    /// Complete every fired buffer immediately.
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::Release);
    }

    /// Extents handed to the DMA engine, in fire order.
    pub fn fired(&self) -> Vec<(u32, u32)> {
        self.fired.lock().clone()
    }

    /// Fail every allocation or mapping after the first `count`.
    pub fn fail_allocations_after(&self, count: usize) {
        self.fail_after.store(count, Ordering::Release);
    }

    pub fn blocks_allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Blocks allocated or mapped and not yet freed.
    pub fn blocks_outstanding(&self) -> usize {
        self.allocated.load(Ordering::Acquire) - self.freed.load(Ordering::Acquire)
    }

    fn take_allocation(&self) -> Result<()> {
        if self.allocated.load(Ordering::Acquire) >= self.fail_after.load(Ordering::Acquire) {
            return Err(Error::ResourceExhausted);
        }
        self.allocated.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl Default for SimHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterIo for SimHardware {
    fn read_register(&self, offset: u32) -> u32 {
        match offset {
            regs::STATUS => self.status.load(Ordering::Acquire),
            regs::PRIM_ADDRESS => self.prim_address.load(Ordering::Acquire),
            regs::PRIM_END => self.prim_end.load(Ordering::Acquire),
            regs::IRQ_ENABLE => self.irq_enable.load(Ordering::Acquire),
            regs::STATUS_PAGE => self.status_page.load(Ordering::Acquire),
            _ => 0,
        }
    }

    fn write_register(&self, offset: u32, value: u32) {
        match offset {
            regs::PRIM_ADDRESS => self.prim_address.store(value, Ordering::Release),
            regs::PRIM_END => {
                // writing the end address starts the transfer
                self.prim_end.store(value, Ordering::Release);
                let start = self.prim_address.load(Ordering::Acquire);
                self.fired.lock().push((start, value));
                if self.auto_complete.load(Ordering::Acquire) {
                    self.raise_completion();
                }
            }
            regs::IRQ_ACK => {
                if value & STATUS_IRQ_PENDING != 0 {
                    self.status.fetch_and(!STATUS_IRQ_PENDING, Ordering::AcqRel);
                }
            }
            regs::IRQ_ENABLE => self.irq_enable.store(value, Ordering::Release),
            regs::STATUS_PAGE => self.status_page.store(value, Ordering::Release),
            _ => {}
        }
    }
}

impl DmaMemory for SimHardware {
    fn allocate_zeroed_block(&self, size: usize) -> Result<DmaHandle> {
        self.take_allocation()?;
        let size = size.max(1) as u64;
        let phys = self.next_phys.fetch_add(size.next_multiple_of(4096), Ordering::AcqRel);
        Ok(DmaHandle { phys })
    }

    fn map_device_memory(&self, offset: u64, _size: usize) -> Result<DmaHandle> {
        self.take_allocation()?;
        Ok(DmaHandle {
            phys: DEVICE_WINDOW_BASE + offset,
        })
    }

    fn free_block(&self, _handle: DmaHandle, _size: usize) {
        self.freed.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_is_latched_in_order() {
        let hw = SimHardware::new();
        hw.write_register(regs::PRIM_ADDRESS, 0x1000);
        hw.write_register(regs::PRIM_END, 0x1020);
        hw.write_register(regs::PRIM_ADDRESS, 0x2000);
        hw.write_register(regs::PRIM_END, 0x2040);
        assert_eq!(hw.fired(), vec![(0x1000, 0x1020), (0x2000, 0x2040)]);
    }

    #[test]
    fn test_ack_clears_completion() {
        let hw = SimHardware::new();
        hw.raise_completion();
        assert_ne!(hw.read_register(regs::STATUS) & STATUS_IRQ_PENDING, 0);
        hw.write_register(regs::IRQ_ACK, STATUS_IRQ_PENDING);
        assert_eq!(hw.read_register(regs::STATUS) & STATUS_IRQ_PENDING, 0);
    }

    #[test]
    fn test_allocation_failure_knob() {
        let hw = SimHardware::new();
        hw.fail_allocations_after(2);
        assert!(hw.allocate_zeroed_block(4096).is_ok());
        assert!(hw.map_device_memory(0, 4096).is_ok());
        assert_eq!(
            hw.allocate_zeroed_block(4096).unwrap_err(),
            Error::ResourceExhausted
        );
        assert_eq!(hw.blocks_allocated(), 2);
    }

    #[test]
    fn test_auto_complete_raises_interrupt() {
        let hw = SimHardware::new();
        hw.set_auto_complete(true);
        hw.write_register(regs::PRIM_ADDRESS, 0x1000);
        hw.write_register(regs::PRIM_END, 0x1020);
        assert_ne!(hw.read_register(regs::STATUS) & STATUS_IRQ_PENDING, 0);
    }
}
