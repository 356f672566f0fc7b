//! Register offsets and bit definitions of the AR816x/AR817x memory-mapped register space,
//! and the [`RegisterBlock`] through which the driver accesses them.
//!
//! Unlike the e1000, the alx register space is sparse and a few registers are 16 bits wide,
//! so registers are accessed by offset rather than through an overlay struct.

use core::mem::size_of;
use volatile::Volatile;
use nic_queues::{RxQueueRegisters, TxQueueRegisters};

/// Interrupt status. Write 1 to a cause bit to acknowledge it.
pub const ALX_ISR:                  u32 = 0x1600;
/// Interrupt mask. A set bit enables the corresponding cause.
pub const ALX_IMR:                  u32 = 0x1604;

pub const ALX_ISR_SMB:              u32 = 1 << 0;
pub const ALX_ISR_TIMER:            u32 = 1 << 1;
pub const ALX_ISR_MANU:             u32 = 1 << 2;
pub const ALX_ISR_DMAR:             u32 = 1 << 8;
pub const ALX_ISR_DMAW:             u32 = 1 << 9;
pub const ALX_ISR_PCIE_LNKDOWN:     u32 = 1 << 12;
/// PHY link status changed.
pub const ALX_ISR_PHY:              u32 = 1 << 16;
/// Transmit queue 0 completed descriptors.
pub const ALX_ISR_TX_Q0:            u32 = 1 << 21;
/// Receive queue 0 returned descriptors.
pub const ALX_ISR_RX_Q0:            u32 = 1 << 26;
/// Interrupts are globally disabled.
pub const ALX_ISR_DIS:              u32 = 1 << 31;

/// Causes that are always enabled once interrupts are on.
pub const ALX_ISR_MISC: u32 = ALX_ISR_PCIE_LNKDOWN
    | ALX_ISR_DMAW
    | ALX_ISR_DMAR
    | ALX_ISR_SMB
    | ALX_ISR_MANU
    | ALX_ISR_TIMER;

/// Causes handled by the I/O deferred task.
pub const ALX_ISR_IO: u32 = ALX_ISR_TX_Q0 | ALX_ISR_RX_Q0;

/// Upper 32 bits of both receive rings' bus address.
pub const ALX_RX_BASE_ADDR_HI:      u32 = 0x1540;
/// Upper 32 bits of the transmit rings' bus address.
pub const ALX_TX_BASE_ADDR_HI:      u32 = 0x1544;
pub const ALX_RFD_ADDR_LO:          u32 = 0x1550;
pub const ALX_RFD_RING_SZ:          u32 = 0x1560;
pub const ALX_RFD_BUF_SZ:           u32 = 0x1564;
pub const ALX_RRD_ADDR_LO:          u32 = 0x1568;
pub const ALX_RRD_RING_SZ:          u32 = 0x1578;
pub const ALX_TPD_PRI0_ADDR_LO:     u32 = 0x152C;
pub const ALX_TPD_RING_SZ:          u32 = 0x1548;

/// Tells the DMA engine to latch the ring addresses and sizes written above.
pub const ALX_SRAM9:                u32 = 0x1534;
pub const ALX_SRAM_LOAD_PTR:        u32 = 1 << 0;

/// 16-bit producer/consumer index registers.
pub const ALX_RFD_PIDX:             u32 = 0x15E0;
pub const ALX_TPD_PRI0_PIDX:        u32 = 0x15F2;
pub const ALX_TPD_PRI0_CIDX:        u32 = 0x15F6;
pub const ALX_RFD_CIDX:             u32 = 0x15F8;

/// Reading any register forces earlier posted writes out to the device.
pub const ALX_FLUSH_REG:            u32 = 0x0;


/// Access to the device's memory-mapped registers.
///
/// Shared between the interrupt handler and everything else, so all methods take `&self`
/// and implementations must not block.
pub trait RegisterBlock: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
    fn read16(&self, offset: u32) -> u16;
    fn write16(&self, offset: u32, value: u16);

    /// Waits until every earlier write has reached the device.
    fn flush(&self) {
        let _ = self.read32(ALX_FLUSH_REG);
    }
}


/// A [`RegisterBlock`] backed by the device's mapped BAR0 region.
pub struct MmioRegisters {
    base: *mut u8,
    size_in_bytes: usize,
}

// The register region is device memory, accessed only through `Volatile` cells.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Wraps a mapped register region.
    ///
    /// # Safety
    /// `base` must point to `size_in_bytes` bytes of uncached, device-mapped memory
    /// that stays mapped for the lifetime of the returned object.
    pub unsafe fn new(base: *mut u8, size_in_bytes: usize) -> MmioRegisters {
        MmioRegisters { base, size_in_bytes }
    }

    /// The register of type `T` at `offset`, or `None` if it isn't aligned and inside the region.
    fn register<T: Copy>(&self, offset: u32) -> Option<*mut Volatile<T>> {
        let width = size_of::<T>();
        if (offset as usize) % width != 0 || offset as usize + width > self.size_in_bytes {
            error!("alx: register access at {:#X} (width {}) is outside the mapped region", offset, width);
            return None;
        }
        // in bounds of the mapping, which `new()`'s caller guarantees is valid
        Some(unsafe { self.base.add(offset as usize) } as *mut Volatile<T>)
    }
}

impl RegisterBlock for MmioRegisters {
    fn read32(&self, offset: u32) -> u32 {
        match self.register::<u32>(offset) {
            Some(reg) => unsafe { (*reg).read() },
            None => 0,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        if let Some(reg) = self.register::<u32>(offset) {
            unsafe { (*reg).write(value) }
        }
    }

    fn read16(&self, offset: u32) -> u16 {
        match self.register::<u16>(offset) {
            Some(reg) => unsafe { (*reg).read() },
            None => 0,
        }
    }

    fn write16(&self, offset: u32, value: u16) {
        if let Some(reg) = self.register::<u16>(offset) {
            unsafe { (*reg).write(value) }
        }
    }
}


/// The per-queue view of the alx registers used by the generic ring setup code.
pub struct QueueRegisters<'r, R: RegisterBlock>(pub &'r R);

impl<'r, R: RegisterBlock> TxQueueRegisters for QueueRegisters<'r, R> {
    fn set_tx_base_lo(&self, value: u32) {
        self.0.write32(ALX_TPD_PRI0_ADDR_LO, value);
    }
    fn set_tx_base_hi(&self, value: u32) {
        self.0.write32(ALX_TX_BASE_ADDR_HI, value);
    }
    fn set_tx_ring_size(&self, value: u16) {
        self.0.write32(ALX_TPD_RING_SZ, value.into());
    }
    fn set_tx_producer_index(&self, value: u16) {
        self.0.write16(ALX_TPD_PRI0_PIDX, value);
    }
    fn tx_consumer_index(&self) -> u16 {
        self.0.read16(ALX_TPD_PRI0_CIDX)
    }
}

impl<'r, R: RegisterBlock> RxQueueRegisters for QueueRegisters<'r, R> {
    fn set_rx_free_base_lo(&self, value: u32) {
        self.0.write32(ALX_RFD_ADDR_LO, value);
    }
    fn set_rx_return_base_lo(&self, value: u32) {
        self.0.write32(ALX_RRD_ADDR_LO, value);
    }
    fn set_rx_base_hi(&self, value: u32) {
        self.0.write32(ALX_RX_BASE_ADDR_HI, value);
    }
    fn set_rx_free_ring_size(&self, value: u16) {
        self.0.write32(ALX_RFD_RING_SZ, value.into());
    }
    fn set_rx_return_ring_size(&self, value: u16) {
        self.0.write32(ALX_RRD_RING_SZ, value.into());
    }
    fn set_rx_buffer_size(&self, value: u16) {
        self.0.write32(ALX_RFD_BUF_SZ, value.into());
    }
    fn set_rx_free_producer_index(&self, value: u16) {
        self.0.write16(ALX_RFD_PIDX, value);
    }
}
