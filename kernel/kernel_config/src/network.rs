//! Default tunables for the gigabit Ethernet driver.

/// Number of transmit packet descriptors (TPDs) in the transmit ring.
pub const CONFIG_TX_RING_SIZE: u16 = 256;
/// Number of receive free descriptors (RFDs), which is also the
/// number of receive return descriptors (RRDs).
pub const CONFIG_RX_RING_SIZE: u16 = 512;

/// Slots of the transmit ring that are never handed to hardware.
///
/// A producer index equal to the consumer index means "empty", so at least
/// one slot must stay unused to tell a full ring apart from an empty one.
pub const CONFIG_TX_RESERVED_SLOTS: u16 = 2;
/// Slots of the receive free ring that never hold a posted buffer.
pub const CONFIG_RX_RESERVED_SLOTS: u16 = 1;

/// Maximum number of DMA segments a single outbound frame may map to.
/// The transmit buffer DMA tag of this chip generation accepts one.
pub const CONFIG_TX_MAX_SEGMENTS: usize = 1;

/// The smallest and largest descriptor ring we allow.
/// The RRD start-index field is 12 bits wide.
pub const MIN_RING_SIZE: u16 = 8;
pub const MAX_RING_SIZE: u16 = 4095;

/// Default MTU, in bytes.
pub const CONFIG_MTU: u16 = 1500;
pub const ETH_MIN_MTU: u16 = 68;
/// Largest MTU the MAC accepts (jumbo frames up to 9KiB of raw frame).
pub const ALX_MAX_MTU: u16 = 9 * 1024 - ETH_OVERHEAD;

/// Ethernet header + FCS + one VLAN tag.
pub const ETH_OVERHEAD: u16 = 14 + 4 + 4;

/// Interrupt moderation timer, in units of 2 microseconds.
pub const CONFIG_INTERRUPT_MODERATION: u16 = 200;

/// Size of the RSS indirection table, even though only one queue is used.
pub const CONFIG_RSS_TABLE_SIZE: u16 = 128;
/// The RSS table index programmed by `configure_rss` in single-queue mode.
pub const CONFIG_RSS_TABLE_INDEX: u32 = 0;

/// Upper bound on distinct deferred interrupt tasks per device.
pub const CONFIG_MAX_DEFERRED_TASKS: usize = 32;
