//! Per-device configuration, validated at attach time.

use core::fmt;
use atheros_ethernet::types::{
    Advertised, ChipFeatures, FlowControl, MacControl, SleepControl,
    MAC_CTRL_PRMBLEN_SHIFT, RSS_HASH_TYPE_ALL, WRR_PRI_RESTRICT_NONE,
};
use kernel_config::network::*;


/// The default RSS hash key.
pub const DEFAULT_RSS_KEY: [u8; 40] = [
    0xE2, 0x91, 0xD7, 0x3D, 0x18, 0x05, 0xEC, 0x6C,
    0x2A, 0x94, 0xB3, 0x0D, 0xA5, 0x4F, 0x2B, 0xEC,
    0xEA, 0x49, 0xAF, 0x7C, 0xE2, 0x14, 0xAD, 0x3D,
    0xB8, 0x55, 0xAA, 0xBE, 0x6A, 0x3E, 0x67, 0xEA,
    0x14, 0x36, 0x4D, 0x17, 0x3B, 0xED, 0x20, 0x0D,
];

/// Idle time, in units of 2 microseconds, before the MAC reports its statistics.
const SMB_TIMER: u32 = 400;
/// Preamble length, in bytes.
const PREAMBLE_LENGTH: u32 = 7;


/// Why an [`AlxConfig`] was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    RingSize(u16),
    /// The transmit ring must keep at least one slot, and hand out at least one.
    ReservedSlots { ring_size: u16, reserved: u16 },
    MaxSegments(usize),
    Mtu(u16),
    RssTableSize(u16),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::RingSize(n) =>
                write!(f, "ring size {} outside [{}, {}]", n, MIN_RING_SIZE, MAX_RING_SIZE),
            ConfigError::ReservedSlots { ring_size, reserved } =>
                write!(f, "can't reserve {} slots of a {}-slot transmit ring", reserved, ring_size),
            ConfigError::MaxSegments(n) => write!(f, "invalid transmit segment limit {}", n),
            ConfigError::Mtu(mtu) => write!(f, "MTU {} outside [{}, {}]", mtu, ETH_MIN_MTU, ALX_MAX_MTU),
            ConfigError::RssTableSize(n) => write!(f, "invalid RSS indirection table size {}", n),
        }
    }
}


/// Settings of one alx device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlxConfig {
    pub tx_ring_size: u16,
    /// Used for the receive free ring and the receive return ring alike.
    pub rx_ring_size: u16,
    pub tx_reserved_slots: u16,
    /// The most DMA segments one outbound frame may use before it gets coalesced.
    pub max_tx_segments: usize,
    pub mtu: u16,
    /// Interrupt moderation timer, in units of 2 microseconds.
    pub interrupt_moderation: u16,
    pub rss_table_size: u16,
    pub rss_table_index: u32,
    /// Overrides the permanent MAC address read from the device.
    pub mac_address: Option<[u8; 6]>,
}

impl Default for AlxConfig {
    fn default() -> AlxConfig {
        AlxConfig {
            tx_ring_size: CONFIG_TX_RING_SIZE,
            rx_ring_size: CONFIG_RX_RING_SIZE,
            tx_reserved_slots: CONFIG_TX_RESERVED_SLOTS,
            max_tx_segments: CONFIG_TX_MAX_SEGMENTS,
            mtu: CONFIG_MTU,
            interrupt_moderation: CONFIG_INTERRUPT_MODERATION,
            rss_table_size: CONFIG_RSS_TABLE_SIZE,
            rss_table_index: CONFIG_RSS_TABLE_INDEX,
            mac_address: None,
        }
    }
}

impl AlxConfig {
    pub fn with_tx_ring_size(mut self, size: u16) -> AlxConfig {
        self.tx_ring_size = size;
        self
    }

    pub fn with_rx_ring_size(mut self, size: u16) -> AlxConfig {
        self.rx_ring_size = size;
        self
    }

    pub fn with_tx_reserved_slots(mut self, reserved: u16) -> AlxConfig {
        self.tx_reserved_slots = reserved;
        self
    }

    pub fn with_max_tx_segments(mut self, segments: usize) -> AlxConfig {
        self.max_tx_segments = segments;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> AlxConfig {
        self.mtu = mtu;
        self
    }

    pub fn with_mac_address(mut self, mac_address: [u8; 6]) -> AlxConfig {
        self.mac_address = Some(mac_address);
        self
    }

    /// Checks every setting against what the hardware supports.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for size in [self.tx_ring_size, self.rx_ring_size] {
            if !(MIN_RING_SIZE..=MAX_RING_SIZE).contains(&size) {
                return Err(ConfigError::RingSize(size));
            }
        }
        if self.tx_reserved_slots == 0 || self.tx_reserved_slots >= self.tx_ring_size {
            return Err(ConfigError::ReservedSlots {
                ring_size: self.tx_ring_size,
                reserved: self.tx_reserved_slots,
            });
        }
        if self.max_tx_segments == 0 || self.max_tx_segments >= self.tx_ring_size as usize {
            return Err(ConfigError::MaxSegments(self.max_tx_segments));
        }
        if !(ETH_MIN_MTU..=ALX_MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::Mtu(self.mtu));
        }
        if self.rss_table_size == 0 || self.rss_table_index >= u32::from(self.rss_table_size) {
            return Err(ConfigError::RssTableSize(self.rss_table_size));
        }
        Ok(())
    }

    /// The size of every receive buffer: a full frame at this MTU, rounded up to 8 bytes.
    pub fn rx_buffer_size(&self) -> u16 {
        (self.mtu + ETH_OVERHEAD + 7) & !7
    }

    /// The largest frame the transmit path will map.
    pub fn max_frame_size(&self) -> usize {
        usize::from(self.mtu + ETH_OVERHEAD)
    }
}


/// The MAC and PHY settings handed to the hardware layer before its first reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwSettings {
    pub mtu: u16,
    pub rss_key: [u8; 40],
    pub rss_table_size: u16,
    pub rss_hash_type: u8,
    pub smb_timer: u32,
    pub interrupt_moderation: u16,
    /// Pending transmit descriptors that trigger an interrupt.
    pub tx_interrupt_threshold: u16,
    pub dma_channels: u8,
    pub sleep_control: SleepControl,
    pub advertised: Advertised,
    pub flow_control: FlowControl,
    pub wrr_control: u32,
    /// Weights of the four transmit priorities.
    pub wrr: [u32; 4],
    pub rx_control: MacControl,
}

impl HwSettings {
    pub fn new(config: &AlxConfig, features: &ChipFeatures) -> HwSettings {
        HwSettings {
            mtu: config.mtu,
            rss_key: DEFAULT_RSS_KEY,
            rss_table_size: config.rss_table_size,
            rss_hash_type: RSS_HASH_TYPE_ALL,
            smb_timer: SMB_TIMER,
            interrupt_moderation: config.interrupt_moderation,
            tx_interrupt_threshold: config.tx_ring_size / 3,
            dma_channels: features.max_dma_channels,
            sleep_control: SleepControl::WOL_MAGIC | SleepControl::WOL_PHY,
            advertised: Advertised::AUTONEG
                | Advertised::BASE10_HALF
                | Advertised::BASE10_FULL
                | Advertised::BASE100_HALF
                | Advertised::BASE100_FULL
                | Advertised::BASE1000_FULL,
            flow_control: FlowControl::ANEG | FlowControl::RX | FlowControl::TX,
            wrr_control: WRR_PRI_RESTRICT_NONE,
            wrr: [4; 4],
            rx_control: MacControl::WOLSPED_SWEN
                | MacControl::MHASH_ALG_HI5B
                | MacControl::BRD_EN
                | MacControl::PCRCE
                | MacControl::CRCE
                | MacControl::RXFC_EN
                | MacControl::TXFC_EN
                | MacControl::from_bits_retain(PREAMBLE_LENGTH << MAC_CTRL_PRMBLEN_SHIFT),
        }
    }
}
