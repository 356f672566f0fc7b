//! Descriptor rings: fixed-capacity circular arrays of hardware-visible descriptors
//! plus the software shadow of the ring's producer and consumer indices.
//!
//! The same [`DescriptorRing`] type serves every ring role a NIC has:
//! transmit rings (software produces, hardware consumes),
//! receive-free rings (software publishes empty buffers),
//! and receive-return rings (hardware produces completion records).

#![cfg_attr(not(test), no_std)]

#[macro_use] extern crate log;


use core::fmt;
use core::marker::PhantomData;
use core::mem::size_of;
use core::ops::DerefMut;
use nic_buffers::DmaRegion;
use zerocopy::{AsBytes, FromBytes};


/// Errors from constructing or indexing a [`DescriptorRing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// A ring must have at least two slots.
    CapacityTooSmall(u16),
    /// The reserved margin must leave at least one usable slot.
    InvalidReservedSlots { capacity: u16, reserved: u16 },
    /// The backing memory is too small, or misaligned, for `capacity` descriptors.
    RegionMismatch { needed: usize, available: usize },
    /// An index reported by hardware lies outside the ring.
    IndexOutOfRange { index: u16, capacity: u16 },
    /// A consumer index reported by hardware is past the producer index.
    IndexPastProducer { index: u16, producer: u16 },
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RingError::CapacityTooSmall(c) => write!(f, "ring capacity {} is too small", c),
            RingError::InvalidReservedSlots { capacity, reserved } =>
                write!(f, "can't reserve {} slots of a {}-slot ring", reserved, capacity),
            RingError::RegionMismatch { needed, available } =>
                write!(f, "ring needs {} bytes of aligned memory, region has {}", needed, available),
            RingError::IndexOutOfRange { index, capacity } =>
                write!(f, "index {} is outside a ring of {} slots", index, capacity),
            RingError::IndexPastProducer { index, producer } =>
                write!(f, "consumer index {} is past the producer index {}", index, producer),
        }
    }
}


/// A circular array of descriptors of type `D`, living in DMA-coherent memory `M`.
///
/// `producer` and `consumer` are always in `[0, capacity)`.
/// The slots in `[consumer, producer)` (modulo `capacity`) are owned by the other side;
/// the rest may be written by the producer, minus `reserved` slots that are
/// never handed out so that a full ring can be told apart from an empty one.
pub struct DescriptorRing<D, M> {
    region: DmaRegion<M>,
    capacity: u16,
    producer: u16,
    consumer: u16,
    reserved: u16,
    _descriptor: PhantomData<D>,
}

impl<D, M> DescriptorRing<D, M>
    where D: FromBytes + AsBytes,
          M: DerefMut<Target = [u8]>,
{
    /// Creates a ring of `capacity` descriptors over `region`, with both indices at zero.
    ///
    /// # Arguments
    /// * `region`: physically-contiguous memory of at least `capacity * size_of::<D>()` bytes.
    /// * `capacity`: number of descriptors, fixed for the lifetime of the ring.
    /// * `reserved`: slots that [`DescriptorRing::free_slots()`] never reports as free.
    pub fn new(region: DmaRegion<M>, capacity: u16, reserved: u16) -> Result<DescriptorRing<D, M>, RingError> {
        Self::check_geometry(capacity, reserved)?;
        Self::check_region(&region, capacity)?;
        Ok(DescriptorRing {
            region,
            capacity,
            producer: 0,
            consumer: 0,
            reserved,
            _descriptor: PhantomData,
        })
    }

    /// Checks that a ring of `capacity` slots with `reserved` held back has at least one usable slot.
    pub fn check_geometry(capacity: u16, reserved: u16) -> Result<(), RingError> {
        if capacity < 2 {
            return Err(RingError::CapacityTooSmall(capacity));
        }
        if reserved >= capacity {
            return Err(RingError::InvalidReservedSlots { capacity, reserved });
        }
        Ok(())
    }

    /// Checks that `region` is large enough, and suitably aligned, to hold `capacity` descriptors.
    pub fn check_region(region: &DmaRegion<M>, capacity: u16) -> Result<(), RingError> {
        let needed = capacity as usize * size_of::<D>();
        let available = region.size_in_bytes();
        if available < needed || D::slice_from(&region[..needed]).is_none() {
            return Err(RingError::RegionMismatch { needed, available });
        }
        Ok(())
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn producer_index(&self) -> u16 {
        self.producer
    }

    pub fn consumer_index(&self) -> u16 {
        self.consumer
    }

    pub fn reserved_slots(&self) -> u16 {
        self.reserved
    }

    /// The number of slots between the consumer and the producer.
    pub fn in_use(&self) -> u16 {
        ((self.producer as u32 + self.capacity as u32 - self.consumer as u32) % self.capacity as u32) as u16
    }

    /// The number of slots the producer may still fill, after the reserved margin.
    pub fn free_slots(&self) -> u16 {
        self.capacity
            .saturating_sub(self.in_use())
            .saturating_sub(self.reserved)
    }

    /// Returns true if `count` more descriptors can be published without overrunning the consumer.
    pub fn has_room_for(&self, count: usize) -> bool {
        count <= self.free_slots() as usize
    }

    /// Returns true if there is nothing between the consumer and the producer.
    pub fn is_empty(&self) -> bool {
        self.producer == self.consumer
    }

    /// Returns the slot after `index`, wrapping at the end of the ring.
    pub fn next_index(&self, index: u16) -> u16 {
        if index + 1 >= self.capacity { 0 } else { index + 1 }
    }

    /// Moves the producer forward by `count` slots, after `count` descriptors have been written.
    pub fn advance_producer(&mut self, count: u16) {
        self.producer = ((self.producer as u32 + count as u32) % self.capacity as u32) as u16;
    }

    /// Moves the consumer forward by `count` slots.
    pub fn advance_consumer(&mut self, count: u16) {
        self.consumer = ((self.consumer as u32 + count as u32) % self.capacity as u32) as u16;
    }

    /// The number of slots the hardware has completed, given the consumer index
    /// it reports in its completion register. Does not move the consumer index.
    pub fn completed_until(&self, index: u16) -> Result<u16, RingError> {
        if index >= self.capacity {
            return Err(RingError::IndexOutOfRange { index, capacity: self.capacity });
        }
        let completed = ((index as u32 + self.capacity as u32 - self.consumer as u32) % self.capacity as u32) as u16;
        if completed > self.in_use() {
            return Err(RingError::IndexPastProducer { index, producer: self.producer });
        }
        Ok(completed)
    }

    /// The descriptor array, as the hardware sees it.
    pub fn descriptors(&self) -> &[D] {
        let len = self.size_in_bytes();
        D::slice_from(&self.region[..len]).unwrap_or(&[])
    }

    pub fn descriptors_mut(&mut self) -> &mut [D] {
        let len = self.size_in_bytes();
        D::mut_slice_from(&mut self.region[..len]).unwrap_or(&mut [])
    }

    pub fn descriptor(&self, index: u16) -> Option<&D> {
        self.descriptors().get(index as usize)
    }

    pub fn descriptor_mut(&mut self, index: u16) -> Option<&mut D> {
        self.descriptors_mut().get_mut(index as usize)
    }

    /// The bus address of descriptor 0, which is programmed into the ring's base-address registers.
    pub fn base_address(&self) -> u64 {
        self.region.bus_addr()
    }

    /// Size in bytes of the whole descriptor array.
    pub fn size_in_bytes(&self) -> usize {
        self.capacity as usize * size_of::<D>()
    }

    pub fn region(&self) -> &DmaRegion<M> {
        &self.region
    }

    /// Zeroes every descriptor and both indices.
    pub fn reset(&mut self) {
        let len = self.size_in_bytes();
        self.region[..len].fill(0);
        self.producer = 0;
        self.consumer = 0;
        trace!("DescriptorRing::reset(): {} descriptors at {:#X}", self.capacity, self.region.bus_addr());
    }

    /// Consumes the ring, returning its memory so it can be freed.
    pub fn into_region(self) -> DmaRegion<M> {
        self.region
    }
}

impl<D, M: DerefMut<Target = [u8]>> fmt::Debug for DescriptorRing<D, M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DescriptorRing {{ base: {:#X}, capacity: {}, producer: {}, consumer: {}, reserved: {} }}",
            self.region.bus_addr(), self.capacity, self.producer, self.consumer, self.reserved)
    }
}


/// Registers needed to set up and drive one transmit ring.
///
/// Implemented by the register block of a NIC, which performs MMIO through `&self`.
pub trait TxQueueRegisters {
    /// Sets the lower 32 bits of the transmit descriptor ring's bus address.
    fn set_tx_base_lo(&self, value: u32);
    /// Sets the upper 32 bits of the descriptor rings' bus address.
    fn set_tx_base_hi(&self, value: u32);
    /// Sets the number of descriptors in the transmit ring.
    fn set_tx_ring_size(&self, value: u16);
    /// Writes the transmit doorbell: the index one past the last published descriptor.
    fn set_tx_producer_index(&self, value: u16);
    /// Reads the index of the next descriptor the hardware will process.
    fn tx_consumer_index(&self) -> u16;
}

/// Registers needed to set up and drive one receive ring pair (free ring and return ring).
pub trait RxQueueRegisters {
    /// Sets the lower 32 bits of the receive-free ring's bus address.
    fn set_rx_free_base_lo(&self, value: u32);
    /// Sets the lower 32 bits of the receive-return ring's bus address.
    fn set_rx_return_base_lo(&self, value: u32);
    /// Sets the upper 32 bits of the receive rings' bus address.
    fn set_rx_base_hi(&self, value: u32);
    fn set_rx_free_ring_size(&self, value: u16);
    fn set_rx_return_ring_size(&self, value: u16);
    /// Sets the size in bytes of every buffer published on the free ring.
    fn set_rx_buffer_size(&self, value: u16);
    /// Tells hardware that free-ring slots up to (not including) `value` hold fresh buffers.
    fn set_rx_free_producer_index(&self, value: u16);
}
