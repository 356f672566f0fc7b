//! Hardware-defined structures for Qualcomm Atheros AR816x/AR817x ("alx") Ethernet controllers.
//!
//! The descriptor layouts in [`descriptors`] are read and written by the NIC's DMA engine,
//! so they are bit-exact little-endian images of the datasheet formats.
//! [`types`] holds the link and capability types that the driver and its
//! hardware-abstraction layer exchange.

#![cfg_attr(not(test), no_std)]

pub mod descriptors;
pub mod types;
