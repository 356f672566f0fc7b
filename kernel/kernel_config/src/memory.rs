//! Memory geometry assumed by DMA mappings.

/// Alignment, in bytes, required for every descriptor ring's base address.
pub const DESCRIPTOR_RING_ALIGNMENT: usize = 8;
