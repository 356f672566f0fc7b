//! Link, duplex and chip-capability types shared between the driver and its hardware layer.

use core::fmt;
use bitflags::bitflags;

/// PCI vendor ID of Qualcomm Atheros.
pub const ALX_VENDOR_ID:        u16 = 0x1969;
pub const ALX_DEV_ID_AR8161:    u16 = 0x1091;
pub const ALX_DEV_ID_AR8162:    u16 = 0x1090;
pub const ALX_DEV_ID_AR8171:    u16 = 0x10A1;
pub const ALX_DEV_ID_AR8172:    u16 = 0x10A0;

/// The chip revision lives in the upper 5 bits of the PCI revision ID.
pub const ALX_PCI_REVID_SHIFT:  u8 = 3;
pub const ALX_REV_A0:           u8 = 0;
pub const ALX_REV_A1:           u8 = 1;
pub const ALX_REV_B0:           u8 = 2;
pub const ALX_REV_C0:           u8 = 3;

pub const SPEED_0:              u16 = 0;
pub const SPEED_10:             u16 = 10;
pub const SPEED_100:            u16 = 100;
pub const SPEED_1000:           u16 = 1000;

pub const DUPLEX_UNKNOWN:       u8 = 0;
pub const HALF_DUPLEX:          u8 = 1;
pub const FULL_DUPLEX:          u8 = 2;

bitflags! {
    /// Optional hardware features of a particular chip and revision.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// 1000BASE-T capable.
        const GIGA = 1 << 0;
        const PTP  = 1 << 1;
        /// Energy-efficient Ethernet (802.3az).
        const AZ   = 1 << 2;
        /// ASPM L0s entry.
        const L0S  = 1 << 3;
        /// ASPM L1 entry.
        const L1   = 1 << 4;
        const SWOI = 1 << 5;
        const RSS  = 1 << 6;
        const MSIX = 1 << 7;
        /// Multiple transmit queues.
        const MTQ  = 1 << 8;
        /// Multiple receive queues.
        const MRQ  = 1 << 9;
    }
}

/// Identification data read from the device's PCI configuration space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipInfo {
    pub device_id: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    /// The raw PCI revision ID register.
    pub revision_id: u8,
}

/// Chip features derived from a [`ChipInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipFeatures {
    pub capabilities: Capabilities,
    pub max_dma_channels: u8,
}

impl ChipInfo {
    /// The chip revision, e.g., [`ALX_REV_B0`].
    pub fn revision(&self) -> u8 {
        self.revision_id >> ALX_PCI_REVID_SHIFT
    }

    /// Returns true if this is one of the supported AR816x/AR817x devices.
    pub fn is_supported(&self) -> bool {
        matches!(
            self.device_id,
            ALX_DEV_ID_AR8161 | ALX_DEV_ID_AR8162 | ALX_DEV_ID_AR8171 | ALX_DEV_ID_AR8172
        )
    }

    /// Determines the features of this chip.
    /// Returns `None` for unsupported devices.
    ///
    /// Revisions newer than C0 are accepted but get no optional features,
    /// since nothing is known about them.
    pub fn features(&self) -> Option<ChipFeatures> {
        if !self.is_supported() {
            return None;
        }
        let rev = self.revision();
        let mut features = ChipFeatures {
            capabilities: Capabilities::empty(),
            max_dma_channels: 0,
        };
        if rev <= ALX_REV_C0 {
            features.capabilities |= Capabilities::L0S
                | Capabilities::L1
                | Capabilities::MTQ
                | Capabilities::RSS
                | Capabilities::MSIX
                | Capabilities::SWOI;
            features.max_dma_channels = if rev >= ALX_REV_B0 { 4 } else { 2 };
        }
        // gigabit-capable chips have an odd device ID
        if self.device_id & 1 == 1 {
            features.capabilities |= Capabilities::GIGA;
        }
        Some(features)
    }
}

/// The state of the Ethernet link, as last observed from the PHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Down,
    /// `speed` is in Mbps, `duplex` is [`HALF_DUPLEX`] or [`FULL_DUPLEX`].
    Up { speed: u16, duplex: u8 },
}

impl LinkState {
    /// Decodes the combined speed code reported by the PHY,
    /// in which the last decimal digit is the duplex mode, e.g., 1002 is 1000 Mbps full duplex.
    pub fn from_speed_code(speed_code: u16) -> LinkState {
        let duplex = (speed_code % 10) as u8;
        LinkState::Up {
            speed: speed_code - u16::from(duplex),
            duplex,
        }
    }

    /// The combined speed code of this state, or 0 if the link is down.
    pub fn speed_code(&self) -> u16 {
        match *self {
            LinkState::Down => 0,
            LinkState::Up { speed, duplex } => speed + u16::from(duplex),
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, LinkState::Up { .. })
    }

    pub fn speed(&self) -> u16 {
        match *self {
            LinkState::Down => SPEED_0,
            LinkState::Up { speed, .. } => speed,
        }
    }

    pub fn duplex(&self) -> u8 {
        match *self {
            LinkState::Down => DUPLEX_UNKNOWN,
            LinkState::Up { duplex, .. } => duplex,
        }
    }
}

/// The physical medium a link is running on, as reported to the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    Base10T,
    Base100Tx,
    Base1000T,
}

impl LinkState {
    /// The medium of an up link, or `None` if the link is down or its speed is unrecognized.
    pub fn media(&self) -> Option<Media> {
        match self.speed() {
            SPEED_10 => Some(Media::Base10T),
            SPEED_100 => Some(Media::Base100Tx),
            SPEED_1000 => Some(Media::Base1000T),
            _ => None,
        }
    }

    /// Returns `Some(true)` for full duplex, `Some(false)` for half duplex,
    /// and `None` if the link is down or the duplex mode is unrecognized.
    pub fn full_duplex(&self) -> Option<bool> {
        match self.duplex() {
            FULL_DUPLEX => Some(true),
            HALF_DUPLEX => Some(false),
            _ => None,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LinkState::Down => write!(f, "down"),
            LinkState::Up { speed, duplex: FULL_DUPLEX } => write!(f, "up {} Mbps full-duplex", speed),
            LinkState::Up { speed, duplex: HALF_DUPLEX } => write!(f, "up {} Mbps half-duplex", speed),
            LinkState::Up { speed, duplex } => write!(f, "up {} Mbps (duplex {})", speed, duplex),
        }
    }
}


bitflags! {
    /// Link modes advertised during autonegotiation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Advertised: u32 {
        const BASE10_HALF   = 1 << 0;
        const BASE10_FULL   = 1 << 1;
        const BASE100_HALF  = 1 << 2;
        const BASE100_FULL  = 1 << 3;
        const BASE1000_FULL = 1 << 5;
        const AUTONEG       = 1 << 6;
    }
}

bitflags! {
    /// Pause-frame flow control settings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlowControl: u8 {
        const RX    = 1 << 0;
        const TX    = 1 << 1;
        /// Negotiate flow control with the link partner.
        const ANEG  = 1 << 2;
    }
}

bitflags! {
    /// Wake-on-LAN sources armed while the device sleeps.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SleepControl: u32 {
        const WOL_MAGIC = 1 << 0;
        const WOL_PHY   = 1 << 1;
    }
}

bitflags! {
    /// Bits of the MAC control register that the driver chooses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MacControl: u32 {
        const TXFC_EN          = 1 << 4;
        const RXFC_EN          = 1 << 5;
        /// Strip the CRC of received frames.
        const PCRCE            = 1 << 7;
        const CRCE             = 1 << 17;
        const BRD_EN           = 1 << 26;
        const MHASH_ALG_HI5B   = 1 << 29;
        const WOLSPED_SWEN     = 1 << 30;
        /// Preamble length field, bits 10-13.
        const PRMBLEN          = 0xF << 10;
    }
}

/// The preamble length field of [`MacControl`].
pub const MAC_CTRL_PRMBLEN_SHIFT: u32 = 10;

/// Weighted round-robin restriction between transmit priorities.
pub const WRR_PRI_RESTRICT_NONE: u32 = 3;

/// Hash inputs for receive-side scaling.
pub const RSS_HASH_TYPE_ALL: u8 = 0xF;
