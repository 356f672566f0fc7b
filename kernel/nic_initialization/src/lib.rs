//! Functions that are used in a NIC initialization procedure.
//!
//! They include allocating descriptor rings and per-slot DMA mappings,
//! and programming a ring's bus address and size into the device's registers.
//! Every allocating function releases whatever it acquired before returning an error,
//! so a failed initialization never leaves a half-built ring behind.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;


use core::fmt;
use alloc::vec::Vec;
use atheros_ethernet::descriptors::{RxFreeDescriptor, RxReturnDescriptor, TxDescriptor};
use kernel_config::memory::DESCRIPTOR_RING_ALIGNMENT;
use nic_buffers::{BufferPool, DmaEngine, DmaError, DmaTag};
use nic_queues::{DescriptorRing, RingError, RxQueueRegisters, TxQueueRegisters};
use zerocopy::{AsBytes, FromBytes};


/// The errors that may occur while setting up a ring or buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    Dma(DmaError),
    Ring(RingError),
}

impl From<DmaError> for InitError {
    fn from(e: DmaError) -> InitError {
        InitError::Dma(e)
    }
}

impl From<RingError> for InitError {
    fn from(e: RingError) -> InitError {
        InitError::Ring(e)
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InitError::Dma(e) => write!(f, "DMA allocation failed: {}", e),
            InitError::Ring(e) => write!(f, "invalid ring: {}", e),
        }
    }
}


/// Allocates coherent memory for a ring of `capacity` descriptors and wraps it in a [`DescriptorRing`].
///
/// # Arguments
/// * `dma`: the platform DMA engine to allocate from.
/// * `capacity`: the number of descriptors in the ring.
/// * `reserved`: the number of slots the ring never reports as free.
pub fn alloc_descriptor_ring<D, E>(dma: &mut E, capacity: u16, reserved: u16)
    -> Result<DescriptorRing<D, E::Memory>, InitError>
    where D: FromBytes + AsBytes,
          E: DmaEngine,
{
    DescriptorRing::<D, E::Memory>::check_geometry(capacity, reserved)?;

    let size_in_bytes = capacity as usize * core::mem::size_of::<D>();
    // the hardware accepts exactly one segment per ring, which coherent allocations guarantee
    let region = dma.alloc_coherent(size_in_bytes, DESCRIPTOR_RING_ALIGNMENT)
        .map_err(|e| {
            error!("nic_initialization: couldn't allocate {} bytes for a {}-slot ring: {}", size_in_bytes, capacity, e);
            e
        })?;
    if let Err(e) = DescriptorRing::<D, E::Memory>::check_region(&region, capacity) {
        error!("nic_initialization: DMA engine returned an unusable ring region: {}", e);
        dma.free_coherent(region);
        return Err(e.into());
    }
    let ring = DescriptorRing::new(region, capacity, reserved)?;
    debug!("nic_initialization: allocated {:?}", ring);
    Ok(ring)
}

/// Returns a ring's memory to the DMA engine.
pub fn free_descriptor_ring<D, E>(dma: &mut E, ring: DescriptorRing<D, E::Memory>)
    where D: FromBytes + AsBytes,
          E: DmaEngine,
{
    dma.free_coherent(ring.into_region());
}

/// Creates a buffer pool with one freshly-created DMA mapping per ring slot.
///
/// # Arguments
/// * `dma`: the platform DMA engine to create mappings with.
/// * `num_slots`: the number of slots in the ring this pool serves.
/// * `tag`: the constraints every mapping must obey.
pub fn create_buffer_pool<E: DmaEngine>(dma: &mut E, num_slots: usize, tag: &DmaTag)
    -> Result<BufferPool<E::Map>, InitError>
{
    let mut maps = Vec::new();
    maps.try_reserve_exact(num_slots).map_err(|_| DmaError::OutOfMemory)?;
    for i in 0..num_slots {
        match dma.create_map(tag) {
            Ok(map) => maps.push(map),
            Err(e) => {
                error!("nic_initialization: couldn't create DMA map {} of {}: {}", i, num_slots, e);
                for map in maps.drain(..) {
                    dma.destroy_map(map);
                }
                return Err(e.into());
            }
        }
    }
    Ok(BufferPool::new(maps))
}

/// Resets a transmit ring and publishes its location and size to the device.
///
/// # Arguments
/// * `ring`: the transmit ring, whose descriptors and indices are reset.
/// * `txq_regs`: registers needed to set up a transmit ring.
pub fn program_tx_ring<D, M, R>(ring: &mut DescriptorRing<D, M>, txq_regs: &R)
    where D: TxDescriptor + FromBytes + AsBytes,
          M: core::ops::DerefMut<Target = [u8]>,
          R: TxQueueRegisters,
{
    ring.reset();
    for td in ring.descriptors_mut() {
        td.init();
    }

    let base = ring.base_address();
    txq_regs.set_tx_base_lo(base as u32);
    txq_regs.set_tx_base_hi((base >> 32) as u32);
    txq_regs.set_tx_ring_size(ring.capacity());
    txq_regs.set_tx_producer_index(0);
}

/// Resets a receive ring pair and publishes their locations, sizes and the buffer size to the device.
///
/// Both rings must share the same upper 32 bits of bus address, since the device has only one register for it.
///
/// # Arguments
/// * `free_ring`: the ring software fills with empty buffers.
/// * `return_ring`: the ring hardware fills with completion records.
/// * `buffer_size`: the size in bytes of every buffer posted to `free_ring`.
/// * `rxq_regs`: registers needed to set up a receive ring pair.
pub fn program_rx_rings<F, T, M, R>(
    free_ring: &mut DescriptorRing<F, M>,
    return_ring: &mut DescriptorRing<T, M>,
    buffer_size: u16,
    rxq_regs: &R,
)
    where F: RxFreeDescriptor + FromBytes + AsBytes,
          T: RxReturnDescriptor + FromBytes + AsBytes,
          M: core::ops::DerefMut<Target = [u8]>,
          R: RxQueueRegisters,
{
    free_ring.reset();
    return_ring.reset();

    let free_base = free_ring.base_address();
    let return_base = return_ring.base_address();
    if free_base >> 32 != return_base >> 32 {
        warn!("nic_initialization: rx rings at {:#X} and {:#X} don't share the upper address bits", free_base, return_base);
    }
    rxq_regs.set_rx_free_base_lo(free_base as u32);
    rxq_regs.set_rx_return_base_lo(return_base as u32);
    rxq_regs.set_rx_base_hi((free_base >> 32) as u32);
    rxq_regs.set_rx_return_ring_size(return_ring.capacity());
    rxq_regs.set_rx_free_ring_size(free_ring.capacity());
    rxq_regs.set_rx_buffer_size(buffer_size);
}
