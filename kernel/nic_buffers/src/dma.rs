//! The interface between NIC drivers and the platform's DMA mapping facility.
//!
//! A driver never translates addresses itself. It asks a [`DmaEngine`] for
//! coherent memory (descriptor rings) and for per-slot mapping objects that
//! can be loaded with a [`Frame`] to obtain the bus addresses of its segments.

use core::fmt;
use core::ops::{Deref, DerefMut};
use alloc::vec::Vec;
use crate::Frame;

/// One physically-contiguous piece of a mapped buffer, as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    /// Bus address of the first byte.
    pub addr: u64,
    /// Length in bytes.
    pub len: u32,
}

/// Cache/bus synchronization points around a device access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    /// Before the device reads memory the CPU has written.
    PreWrite,
    /// After the device has read memory the CPU wrote.
    PostWrite,
    /// Before the device writes memory the CPU will read.
    PreRead,
    /// After the device has written memory, before the CPU reads it.
    PostRead,
}

/// Constraints that every mapping created against this tag must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTag {
    pub alignment: usize,
    /// Largest total size of one mapping.
    pub max_size: usize,
    /// Largest number of segments one mapping may be split into.
    pub max_segments: usize,
}

/// Errors from allocating DMA resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// No memory was available for the allocation.
    OutOfMemory,
    /// The platform could not create a mapping object.
    MapCreation,
    /// The requested size or alignment is not supported by the platform.
    Unsupported,
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DmaError::OutOfMemory => write!(f, "out of DMA-able memory"),
            DmaError::MapCreation => write!(f, "couldn't create DMA map"),
            DmaError::Unsupported => write!(f, "unsupported DMA size or alignment"),
        }
    }
}

/// Errors from loading a frame into a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// The frame needs more segments than the mapping's tag allows.
    /// Coalescing the frame may help.
    TooManyFragments,
    /// Temporarily out of mapping resources. The same frame may succeed later.
    NoResources,
    /// The frame can never be mapped.
    Unmappable,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadError::TooManyFragments => write!(f, "frame has too many fragments"),
            LoadError::NoResources => write!(f, "out of mapping resources"),
            LoadError::Unmappable => write!(f, "frame can't be mapped"),
        }
    }
}

/// A physically-contiguous, device-visible memory region, mapped as one DMA segment.
pub struct DmaRegion<M> {
    mem: M,
    bus_addr: u64,
}

impl<M: DerefMut<Target = [u8]>> DmaRegion<M> {
    /// Wraps memory that the platform has already made visible to the device at `bus_addr`.
    pub fn new(mem: M, bus_addr: u64) -> DmaRegion<M> {
        DmaRegion { mem, bus_addr }
    }

    /// The bus address of the first byte of this region.
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    pub fn size_in_bytes(&self) -> usize {
        self.mem.len()
    }

    /// Returns the backing memory, consuming this region.
    pub fn into_inner(self) -> M {
        self.mem
    }
}

impl<M: DerefMut<Target = [u8]>> Deref for DmaRegion<M> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.mem
    }
}

impl<M: DerefMut<Target = [u8]>> DerefMut for DmaRegion<M> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }
}

/// The platform's DMA mapping facility.
///
/// All methods are called with the owning device's lock held,
/// never from interrupt context.
pub trait DmaEngine {
    /// A reusable per-slot mapping object. Creating one does not map anything.
    type Map;
    /// Backing memory of coherent allocations.
    type Memory: DerefMut<Target = [u8]>;

    /// Allocates zeroed, coherent memory that the device sees as exactly one segment.
    fn alloc_coherent(&mut self, size: usize, alignment: usize) -> Result<DmaRegion<Self::Memory>, DmaError>;

    fn free_coherent(&mut self, region: DmaRegion<Self::Memory>);

    /// Makes CPU writes to (or device writes from) a coherent region visible to the other side.
    fn sync_coherent(&mut self, region: &DmaRegion<Self::Memory>, op: SyncOp);

    /// Creates a mapping object whose loads obey the given `tag`.
    fn create_map(&mut self, tag: &DmaTag) -> Result<Self::Map, DmaError>;

    fn destroy_map(&mut self, map: Self::Map);

    /// Maps the memory of `frame` through `map`, writing one entry per segment into `segments`.
    ///
    /// On success `segments` holds at least one entry unless the frame is empty.
    /// On failure nothing remains loaded.
    fn load(&mut self, map: &mut Self::Map, frame: &Frame, segments: &mut Vec<DmaSegment>) -> Result<(), LoadError>;

    /// Undoes a previous [`DmaEngine::load`].
    fn unload(&mut self, map: &mut Self::Map);

    /// Synchronizes the memory currently loaded into `map`.
    fn sync(&mut self, map: &Self::Map, op: SyncOp);
}
