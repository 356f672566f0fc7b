//! Defines the buffers that NIC drivers send and receive frames through,
//! and the pool that pairs each ring slot with its DMA mapping.
//!
//! A [`BufferPool`] has exactly one entry per descriptor slot of a ring.
//! Each entry always owns exactly one [`MappingSlot`] and, while the hardware
//! is working on it, the [`Frame`] whose memory that mapping covers.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod dma;

pub use dma::*;

use core::fmt;
use alloc::vec::Vec;
use log::{error, trace};


/// Coalescing a frame failed because no contiguous buffer could be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollapseError;

impl fmt::Display for CollapseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "couldn't allocate a contiguous buffer to coalesce frame")
    }
}

/// A network frame held in host memory as a chain of fragments.
///
/// Outbound frames may be scattered over several fragments, like a chain of
/// packet headers and payload built by different protocol layers.
/// Received frames hold one fragment per receive buffer they arrived in.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Frame {
    fragments: Vec<Vec<u8>>,
}

impl Frame {
    /// Creates a frame from one contiguous buffer.
    pub fn new(data: Vec<u8>) -> Frame {
        let mut fragments = Vec::with_capacity(1);
        fragments.push(data);
        Frame { fragments }
    }

    /// Creates a frame from a chain of fragments, in order.
    pub fn from_fragments(fragments: Vec<Vec<u8>>) -> Frame {
        Frame { fragments }
    }

    /// Allocates a zero-filled, single-fragment frame of `len` bytes,
    /// returning an error instead of aborting if memory is exhausted.
    pub fn try_zeroed(len: usize) -> Result<Frame, CollapseError> {
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| CollapseError)?;
        data.resize(len, 0);
        Ok(Frame::new(data))
    }

    /// Total length of the frame in bytes.
    pub fn len(&self) -> usize {
        self.fragments.iter().map(|f| f.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn fragments(&self) -> &[Vec<u8>] {
        &self.fragments
    }

    pub fn fragments_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.fragments
    }

    /// Copies every fragment into a single contiguous buffer.
    ///
    /// The original fragments are dropped whether or not this succeeds,
    /// matching how a failed collapse leaves the caller nothing to retry with.
    pub fn coalesce(self) -> Result<Frame, CollapseError> {
        if self.fragments.len() <= 1 {
            return Ok(self);
        }
        let mut data = Vec::new();
        data.try_reserve_exact(self.len()).map_err(|_| CollapseError)?;
        for fragment in &self.fragments {
            data.extend_from_slice(fragment);
        }
        Ok(Frame::new(data))
    }

    /// Shortens the frame to `len` bytes, dropping whole trailing fragments as needed.
    pub fn truncate(&mut self, len: usize) {
        let mut remaining = len;
        let mut keep = 0;
        for fragment in self.fragments.iter_mut() {
            if remaining == 0 {
                break;
            }
            if fragment.len() > remaining {
                fragment.truncate(remaining);
            }
            remaining -= fragment.len();
            keep += 1;
        }
        self.fragments.truncate(keep);
    }

    /// Appends the fragments of `other` to the end of this frame.
    pub fn append(&mut self, mut other: Frame) {
        self.fragments.append(&mut other.fragments);
    }

    /// Copies the frame's contents into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.len());
        for fragment in &self.fragments {
            data.extend_from_slice(fragment);
        }
        data
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Frame {{ len: {}, fragments: {} }}", self.len(), self.fragment_count())
    }
}


/// A per-slot DMA mapping object together with the ring slot that currently owns it.
///
/// Mappings are created once per slot and are moved between slots rather than copied:
/// the transmit path loads a frame through the mapping of the first slot it uses,
/// then hands that loaded mapping to the slot holding the end-of-packet descriptor,
/// since that is the slot that is recycled when hardware reports completion.
pub struct MappingSlot<M> {
    map: M,
    owner: usize,
    loaded: bool,
}

impl<M> MappingSlot<M> {
    fn new(map: M, owner: usize) -> MappingSlot<M> {
        MappingSlot { map, owner, loaded: false }
    }

    /// The index of the ring slot this mapping currently belongs to.
    pub fn owner(&self) -> usize {
        self.owner
    }

    /// Returns true if a frame is currently loaded into this mapping.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn map(&self) -> &M {
        &self.map
    }

    /// Records that this mapping now belongs to `new_slot`.
    fn reassign_owner(&mut self, new_slot: usize) {
        self.owner = new_slot;
    }
}

struct PoolEntry<M> {
    payload: Option<Frame>,
    mapping: MappingSlot<M>,
}

/// The buffers currently owned by the hardware side of one descriptor ring,
/// index-aligned with the ring's descriptor array.
pub struct BufferPool<M> {
    entries: Vec<PoolEntry<M>>,
}

impl<M> BufferPool<M> {
    /// Creates a pool with one entry per given mapping; entry `i` owns `maps[i]`.
    pub fn new(maps: Vec<M>) -> BufferPool<M> {
        let entries = maps.into_iter()
            .enumerate()
            .map(|(i, map)| PoolEntry { payload: None, mapping: MappingSlot::new(map, i) })
            .collect();
        BufferPool { entries }
    }

    /// The number of slots in this pool.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if `slot` currently holds a frame.
    pub fn is_bound(&self, slot: usize) -> bool {
        self.entries.get(slot).map_or(false, |e| e.payload.is_some())
    }

    /// The number of slots currently holding a frame.
    pub fn bound_count(&self) -> usize {
        self.entries.iter().filter(|e| e.payload.is_some()).count()
    }

    pub fn mapping(&self, slot: usize) -> Option<&MappingSlot<M>> {
        self.entries.get(slot).map(|e| &e.mapping)
    }

    /// Returns a reference to the frame bound to `slot`, if any.
    pub fn payload(&self, slot: usize) -> Option<&Frame> {
        self.entries.get(slot).and_then(|e| e.payload.as_ref())
    }

    /// Returns a mutable reference to the frame bound to `slot`, if any.
    pub fn payload_mut(&mut self, slot: usize) -> Option<&mut Frame> {
        self.entries.get_mut(slot).and_then(|e| e.payload.as_mut())
    }

    /// Loads `frame` through the mapping currently owned by `slot`.
    /// The frame itself is not stored; see [`BufferPool::bind()`].
    pub fn load<D: DmaEngine<Map = M>>(
        &mut self,
        slot: usize,
        frame: &Frame,
        dma: &mut D,
        segments: &mut Vec<DmaSegment>,
    ) -> Result<(), LoadError> {
        let entry = self.entries.get_mut(slot).ok_or(LoadError::Unmappable)?;
        if entry.mapping.loaded {
            error!("BufferPool::load(): slot {} already has a loaded mapping", slot);
            return Err(LoadError::NoResources);
        }
        segments.clear();
        dma.load(&mut entry.mapping.map, frame, segments)?;
        entry.mapping.loaded = true;
        Ok(())
    }

    /// Undoes a [`BufferPool::load()`] of a frame that will not be bound after all.
    pub fn unload<D: DmaEngine<Map = M>>(&mut self, slot: usize, dma: &mut D) {
        if let Some(entry) = self.entries.get_mut(slot) {
            if entry.mapping.loaded {
                dma.unload(&mut entry.mapping.map);
                entry.mapping.loaded = false;
            }
        }
    }

    /// Hands the mapping owned by `from` to `to`, and `to`'s mapping to `from`,
    /// so that every slot still owns exactly one mapping.
    pub fn reassign_mapping(&mut self, from: usize, to: usize) {
        if from == to || from >= self.entries.len() || to >= self.entries.len() {
            return;
        }
        let (lo, hi) = if from < to { (from, to) } else { (to, from) };
        let (left, right) = self.entries.split_at_mut(hi);
        core::mem::swap(&mut left[lo].mapping, &mut right[0].mapping);
        left[lo].mapping.reassign_owner(lo);
        right[0].mapping.reassign_owner(hi);
    }

    /// Installs `frame` into `slot`, whose mapping must already hold it,
    /// and synchronizes that mapping for the direction given by `op`.
    ///
    /// Returns the frame back if the slot is already occupied.
    pub fn bind<D: DmaEngine<Map = M>>(
        &mut self,
        slot: usize,
        frame: Frame,
        dma: &mut D,
        op: SyncOp,
    ) -> Result<(), Frame> {
        let entry = match self.entries.get_mut(slot) {
            Some(e) if e.payload.is_none() => e,
            _ => return Err(frame),
        };
        dma.sync(&entry.mapping.map, op);
        trace!("BufferPool::bind(): slot {} <- {:?}", slot, frame);
        entry.payload = Some(frame);
        Ok(())
    }

    /// Takes the frame out of `slot` once hardware is done with it,
    /// synchronizing and unloading its mapping.
    /// Returns `None` if the slot was empty.
    pub fn release<D: DmaEngine<Map = M>>(&mut self, slot: usize, dma: &mut D, op: SyncOp) -> Option<Frame> {
        let entry = self.entries.get_mut(slot)?;
        let frame = entry.payload.take()?;
        if entry.mapping.loaded {
            dma.sync(&entry.mapping.map, op);
            dma.unload(&mut entry.mapping.map);
            entry.mapping.loaded = false;
        }
        Some(frame)
    }

    /// Releases every bound frame, dropping them.
    /// Returns how many frames were released.
    pub fn release_all<D: DmaEngine<Map = M>>(&mut self, dma: &mut D, op: SyncOp) -> usize {
        let mut released = 0;
        for slot in 0..self.entries.len() {
            if self.release(slot, dma, op).is_some() {
                released += 1;
            }
            // a mapping may be loaded without a payload if a caller never bound it
            self.unload(slot, dma);
        }
        released
    }

    /// Releases every frame and destroys every mapping, consuming the pool.
    pub fn teardown<D: DmaEngine<Map = M>>(mut self, dma: &mut D) {
        self.release_all(dma, SyncOp::PostWrite);
        for entry in self.entries.drain(..) {
            dma.destroy_map(entry.mapping.map);
        }
    }
}
