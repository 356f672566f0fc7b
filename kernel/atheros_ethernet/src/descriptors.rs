//! The three descriptor formats used by the alx DMA engine.
//!
//! * [`TpdDesc`]: transmit packet descriptor, one per outbound buffer segment.
//! * [`RfdDesc`]: receive free descriptor, one per empty buffer handed to hardware.
//! * [`RrdDesc`]: receive return descriptor, written by hardware for each received frame.

use core::fmt;
use bit_field::BitField;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};
use zerocopy::byteorder::{LittleEndian, U32, U64};

type Le32 = U32<LittleEndian>;
type Le64 = U64<LittleEndian>;

/// TPD word0: buffer length of this segment.
pub const TPD_BUFLEN_SHIFT: usize = 0;
pub const TPD_BUFLEN_BITS: usize = 16;
/// TPD word0: VLAN tag to insert (unused, VLAN offload is not enabled).
pub const TPD_VLTAG_SHIFT: usize = 16;
/// TPD word1: this segment is the last one of the packet.
pub const TPD_EOP_SHIFT: usize = 31;

/// RRD word0: index of the first RFD holding this frame.
pub const RRD_SI_SHIFT: usize = 16;
pub const RRD_SI_BITS: usize = 12;
/// RRD word0: number of RFDs holding this frame.
pub const RRD_NOR_SHIFT: usize = 28;
pub const RRD_NOR_BITS: usize = 4;
/// RRD word3: length of the received frame in bytes.
pub const RRD_PKTLEN_SHIFT: usize = 0;
pub const RRD_PKTLEN_BITS: usize = 14;
/// RRD word3: error bits.
pub const RRD_ERR_RES_SHIFT: usize = 20;
pub const RRD_ERR_FCS_SHIFT: usize = 21;
pub const RRD_ERR_FAE_SHIFT: usize = 22;
pub const RRD_ERR_TRUNC_SHIFT: usize = 23;
pub const RRD_ERR_RUNT_SHIFT: usize = 24;
pub const RRD_ERR_ICMP_SHIFT: usize = 25;
pub const RRD_ERR_LEN_SHIFT: usize = 29;
/// RRD word3: set by hardware once the descriptor has been written back.
pub const RRD_UPDATED_SHIFT: usize = 31;

/// Error bits that make a received frame unusable.
const RRD_ERR_MASK: u32 = (1 << RRD_ERR_RES_SHIFT)
    | (1 << RRD_ERR_FCS_SHIFT)
    | (1 << RRD_ERR_FAE_SHIFT)
    | (1 << RRD_ERR_TRUNC_SHIFT)
    | (1 << RRD_ERR_RUNT_SHIFT)
    | (1 << RRD_ERR_LEN_SHIFT);


/// A trait for functionalities that all transmit descriptors must support.
pub trait TxDescriptor {
    /// Initializes a transmit descriptor by clearing all of its values.
    fn init(&mut self);

    /// Points this descriptor at one DMA segment of an outbound frame.
    /// Any previously set end-of-packet marker is cleared.
    ///
    /// # Arguments
    /// * `buffer_addr`: bus address of the segment.
    /// * `buffer_length`: length of the segment in bytes.
    fn set_buffer(&mut self, buffer_addr: u64, buffer_length: u16);

    /// Marks this descriptor as holding the final segment of a frame.
    fn set_end_of_packet(&mut self);

    /// Returns true if this descriptor holds the final segment of a frame.
    fn end_of_packet(&self) -> bool;

    fn buffer_address(&self) -> u64;

    fn buffer_length(&self) -> u16;
}

/// A trait for descriptors that hand empty receive buffers to hardware.
pub trait RxFreeDescriptor {
    /// Initializes a free descriptor with the bus address of an empty receive buffer.
    fn init(&mut self, buffer_addr: u64);

    fn buffer_address(&self) -> u64;
}

/// A trait for descriptors in which hardware reports received frames.
pub trait RxReturnDescriptor {
    /// Returns true once hardware has written this descriptor back.
    fn updated(&self) -> bool;

    /// Index of the first free-ring slot that holds the frame.
    fn start_index(&self) -> u16;

    /// Number of free-ring slots that hold the frame.
    fn descriptor_count(&self) -> u8;

    /// The length of the received frame in bytes.
    fn packet_length(&self) -> u16;

    /// Returns true if hardware flagged the frame as bad.
    fn has_errors(&self) -> bool;

    /// Hands this descriptor back to hardware by clearing it.
    fn reset(&mut self);
}


/// Transmit Packet Descriptor.
/// There is one instance of this struct per DMA segment of an outbound frame.
#[derive(Clone, Copy, Default, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct TpdDesc {
    /// Buffer length (bits 0-15) and VLAN tag (bits 16-31).
    pub word0: Le32,
    /// Offload command bits and the end-of-packet flag (bit 31).
    pub word1: Le32,
    /// Bus address of the segment.
    pub addr:  Le64,
}
assert_eq_size!(TpdDesc, [u8; 16]);

impl TxDescriptor for TpdDesc {
    fn init(&mut self) {
        self.word0.set(0);
        self.word1.set(0);
        self.addr.set(0);
    }

    fn set_buffer(&mut self, buffer_addr: u64, buffer_length: u16) {
        self.addr.set(buffer_addr);
        let mut word0 = self.word0.get();
        word0.set_bits(TPD_BUFLEN_SHIFT..TPD_BUFLEN_SHIFT + TPD_BUFLEN_BITS, u32::from(buffer_length));
        self.word0.set(word0);
        self.word1.set(0);
    }

    fn set_end_of_packet(&mut self) {
        let mut word1 = self.word1.get();
        word1.set_bit(TPD_EOP_SHIFT, true);
        self.word1.set(word1);
    }

    fn end_of_packet(&self) -> bool {
        self.word1.get().get_bit(TPD_EOP_SHIFT)
    }

    fn buffer_address(&self) -> u64 {
        self.addr.get()
    }

    fn buffer_length(&self) -> u16 {
        self.word0.get().get_bits(TPD_BUFLEN_SHIFT..TPD_BUFLEN_SHIFT + TPD_BUFLEN_BITS) as u16
    }
}

impl fmt::Debug for TpdDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{addr: {:#X}, length: {}, eop: {}, word0: {:#X}, word1: {:#X}}}",
            self.buffer_address(), self.buffer_length(), self.end_of_packet(), self.word0.get(), self.word1.get())
    }
}


/// Receive Free Descriptor.
/// There is one instance of this struct per empty receive buffer.
#[derive(Clone, Copy, Default, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct RfdDesc {
    /// Bus address of the receive buffer.
    pub addr: Le64,
}
assert_eq_size!(RfdDesc, [u8; 8]);

impl RxFreeDescriptor for RfdDesc {
    fn init(&mut self, buffer_addr: u64) {
        self.addr.set(buffer_addr);
    }

    fn buffer_address(&self) -> u64 {
        self.addr.get()
    }
}

impl fmt::Debug for RfdDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{addr: {:#X}}}", self.addr.get())
    }
}


/// Receive Return Descriptor, written back by hardware for each received frame.
#[derive(Clone, Copy, Default, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct RrdDesc {
    /// Checksum, start index and RFD count.
    pub word0: Le32,
    /// RSS hash.
    pub word1: Le32,
    /// VLAN tag and protocol flags.
    pub word2: Le32,
    /// Packet length, error bits and the updated flag.
    pub word3: Le32,
}
assert_eq_size!(RrdDesc, [u8; 16]);

impl RrdDesc {
    /// Builds the descriptor that hardware writes back for a frame of `packet_length` bytes
    /// stored in `descriptor_count` free-ring slots starting at `start_index`.
    pub fn written_back(start_index: u16, descriptor_count: u8, packet_length: u16) -> RrdDesc {
        let mut word0 = 0u32;
        word0.set_bits(RRD_SI_SHIFT..RRD_SI_SHIFT + RRD_SI_BITS, u32::from(start_index));
        word0.set_bits(RRD_NOR_SHIFT..RRD_NOR_SHIFT + RRD_NOR_BITS, u32::from(descriptor_count));
        let mut word3 = 0u32;
        word3.set_bits(RRD_PKTLEN_SHIFT..RRD_PKTLEN_SHIFT + RRD_PKTLEN_BITS, u32::from(packet_length));
        word3.set_bit(RRD_UPDATED_SHIFT, true);
        RrdDesc {
            word0: Le32::new(word0),
            word1: Le32::new(0),
            word2: Le32::new(0),
            word3: Le32::new(word3),
        }
    }
}

impl RxReturnDescriptor for RrdDesc {
    fn updated(&self) -> bool {
        self.word3.get().get_bit(RRD_UPDATED_SHIFT)
    }

    fn start_index(&self) -> u16 {
        self.word0.get().get_bits(RRD_SI_SHIFT..RRD_SI_SHIFT + RRD_SI_BITS) as u16
    }

    fn descriptor_count(&self) -> u8 {
        self.word0.get().get_bits(RRD_NOR_SHIFT..RRD_NOR_SHIFT + RRD_NOR_BITS) as u8
    }

    fn packet_length(&self) -> u16 {
        self.word3.get().get_bits(RRD_PKTLEN_SHIFT..RRD_PKTLEN_SHIFT + RRD_PKTLEN_BITS) as u16
    }

    fn has_errors(&self) -> bool {
        self.word3.get() & RRD_ERR_MASK != 0
    }

    fn reset(&mut self) {
        self.word0.set(0);
        self.word1.set(0);
        self.word2.set(0);
        self.word3.set(0);
    }
}

impl fmt::Debug for RrdDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{start: {}, count: {}, length: {}, updated: {}, errors: {}}}",
            self.start_index(), self.descriptor_count(), self.packet_length(), self.updated(), self.has_errors())
    }
}
