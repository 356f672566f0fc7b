//! The MAC/PHY control layer beneath the driver.
//!
//! Everything that needs the chip's reset sequences, MDIO access to the PHY,
//! or knowledge of the MAC configuration registers lives behind [`AlxHardware`].
//! The driver itself only touches the interrupt and ring registers directly.

use core::fmt;
use atheros_ethernet::types::{Advertised, ChipInfo, FlowControl};
use crate::config::HwSettings;


/// A failure reported by the hardware layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwError {
    /// The chip did not complete an operation in time.
    Timeout,
    /// An MDIO access to the PHY failed.
    PhyAccess,
    /// The chip returned an address that can't be used as a unicast MAC address.
    InvalidMacAddress,
    /// The requested mode is not supported by this chip.
    Unsupported,
}

impl fmt::Display for HwError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HwError::Timeout => write!(f, "hardware timed out"),
            HwError::PhyAccess => write!(f, "PHY access failed"),
            HwError::InvalidMacAddress => write!(f, "invalid MAC address"),
            HwError::Unsupported => write!(f, "unsupported by this chip"),
        }
    }
}


/// MAC, PHY and PCIe control operations of one AR816x/AR817x chip.
///
/// Only ever called with the device lock held, never from the interrupt handler.
pub trait AlxHardware: Send {
    /// Reads the chip's identification from PCI configuration space.
    fn identify(&mut self) -> ChipInfo;

    /// Stores the MAC/PHY settings that later resets and configuration calls apply.
    fn load_settings(&mut self, settings: &HwSettings);

    fn reset_pcie(&mut self);

    /// Returns true if firmware or a previous driver already configured the PHY.
    fn phy_configured(&mut self) -> bool;

    fn reset_phy(&mut self);

    fn reset_mac(&mut self) -> Result<(), HwError>;

    /// Programs the link modes to advertise and starts autonegotiation.
    fn setup_speed_duplex(&mut self, advertised: Advertised, flow_control: FlowControl) -> Result<(), HwError>;

    /// Reads the factory-assigned MAC address.
    fn permanent_mac_address(&mut self) -> Result<[u8; 6], HwError>;

    fn set_mac_address(&mut self, mac_address: &[u8; 6]);

    /// Identifies the PHY and reads its capabilities.
    fn identify_phy(&mut self) -> Result<(), HwError>;

    /// Polls the PHY for `(link_up, speed_code)`, where the speed code
    /// is the speed in Mbps plus the duplex mode.
    fn get_link(&mut self) -> Result<(bool, u16), HwError>;

    /// Acknowledges the PHY's link-change interrupt.
    fn clear_phy_interrupt(&mut self) -> Result<(), HwError>;

    /// Applies PHY settings that depend on the negotiated speed (0 when the link is down).
    fn post_link_configure(&mut self, speed: u16, energy_efficient: bool);

    /// Enables the MAC's transmitter and receiver for the current link.
    fn start_mac(&mut self);

    /// Programs the MAC, DMA and interrupt-moderation registers from the loaded settings.
    fn configure_basic(&mut self);

    /// Programs the RSS key and points every indirection table entry at `table_index`.
    fn configure_rss(&mut self, table_index: u32);

    /// Enables or disables the ASPM L0s and L1 link power states.
    fn enable_aspm(&mut self, l0s: bool, l1: bool);
}
