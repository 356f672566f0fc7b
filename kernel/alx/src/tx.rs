//! The transmit path: mapping outbound frames, publishing TPDs, and reclaiming them.

use core::fmt;
use alloc::vec::Vec;
use atheros_ethernet::descriptors::{TpdDesc, TxDescriptor};
use nic_buffers::{BufferPool, DmaEngine, DmaSegment, DmaTag, Frame, LoadError, SyncOp};
use nic_initialization::{alloc_descriptor_ring, create_buffer_pool, free_descriptor_ring, program_tx_ring, InitError};
use nic_queues::{DescriptorRing, TxQueueRegisters};
use crate::config::AlxConfig;


/// Why a frame could not be queued right now. The caller keeps the frame and may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureReason {
    /// Not enough free descriptors; retry after completions are reclaimed.
    RingFull,
    LinkDown,
    NotRunning,
    /// The DMA engine is temporarily out of mapping resources.
    MapResources,
}

/// Why a frame was dropped. Retrying the same frame cannot succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxFault {
    /// The frame still needs too many segments after being coalesced.
    TooManyFragments,
    /// No contiguous buffer could be allocated to coalesce the frame into.
    CoalesceFailed,
    /// The frame mapped to zero segments.
    NoSegments,
    Unmappable,
}

/// The failure outcomes of sending a frame.
#[derive(Debug)]
pub enum TxError {
    /// The frame was not queued and is handed back to the caller.
    Backpressure { frame: Frame, reason: BackpressureReason },
    /// The frame was dropped.
    Fatal(TxFault),
}

impl TxError {
    pub fn is_backpressure(&self) -> bool {
        matches!(self, TxError::Backpressure { .. })
    }
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TxError::Backpressure { frame, reason } => write!(f, "can't queue {:?} now: {:?}", frame, reason),
            TxError::Fatal(fault) => write!(f, "dropped frame: {:?}", fault),
        }
    }
}


/// The transmit ring together with the frames and mappings of its in-flight descriptors.
pub(crate) struct TxRing<D: DmaEngine> {
    pub(crate) ring: DescriptorRing<TpdDesc, D::Memory>,
    pub(crate) pool: BufferPool<D::Map>,
    /// Scratch space for the segments of the frame being mapped.
    segments: Vec<DmaSegment>,
}

impl<D: DmaEngine> TxRing<D> {
    /// Allocates the ring and one mapping per slot, releasing both on failure.
    pub(crate) fn new(dma: &mut D, config: &AlxConfig) -> Result<TxRing<D>, InitError> {
        let ring = alloc_descriptor_ring::<TpdDesc, D>(dma, config.tx_ring_size, config.tx_reserved_slots)?;
        let tag = DmaTag {
            alignment: 1,
            max_size: config.max_frame_size(),
            max_segments: config.max_tx_segments,
        };
        let pool = match create_buffer_pool(dma, config.tx_ring_size.into(), &tag) {
            Ok(pool) => pool,
            Err(e) => {
                free_descriptor_ring(dma, ring);
                return Err(e);
            }
        };
        Ok(TxRing { ring, pool, segments: Vec::with_capacity(config.max_tx_segments) })
    }

    /// Drops every frame still on the ring, then zeroes the ring and programs it into the device.
    pub(crate) fn init<R: TxQueueRegisters>(&mut self, dma: &mut D, regs: &R) {
        let stale = self.pool.release_all(dma, SyncOp::PostWrite);
        if stale > 0 {
            debug!("alx: dropped {} stale transmit buffers", stale);
        }
        program_tx_ring(&mut self.ring, regs);
    }

    /// Releases every frame and mapping, and frees the ring.
    pub(crate) fn destroy(self, dma: &mut D) {
        self.pool.teardown(dma);
        free_descriptor_ring(dma, self.ring);
    }

    /// Places `frame` on the ring and rings the doorbell.
    ///
    /// A frame that needs too many segments is coalesced and mapped once more;
    /// if that fails too, the frame is dropped.
    pub(crate) fn xmit<R: TxQueueRegisters>(&mut self, dma: &mut D, regs: &R, frame: Frame) -> Result<(), TxError> {
        let hw_cidx = regs.tx_consumer_index();
        let first = self.ring.producer_index();
        let slot = usize::from(first);

        let frame = match self.pool.load(slot, &frame, dma, &mut self.segments) {
            Ok(()) => frame,
            Err(LoadError::TooManyFragments) => {
                let fragments = frame.fragment_count();
                let frame = frame.coalesce().map_err(|_e| {
                    warn!("alx: couldn't coalesce {}-fragment frame, dropping it", fragments);
                    TxError::Fatal(TxFault::CoalesceFailed)
                })?;
                match self.pool.load(slot, &frame, dma, &mut self.segments) {
                    Ok(()) => frame,
                    Err(e) => return Err(load_failure(e, frame)),
                }
            }
            Err(e) => return Err(load_failure(e, frame)),
        };

        let nsegs = self.segments.len();
        if nsegs == 0 {
            self.pool.unload(slot, dma);
            warn!("alx: frame {:?} mapped to no segments, dropping it", frame);
            return Err(TxError::Fatal(TxFault::NoSegments));
        }
        if self.segments.iter().any(|s| s.len > u32::from(u16::MAX)) {
            self.pool.unload(slot, dma);
            warn!("alx: frame {:?} has a segment too long for a TPD, dropping it", frame);
            return Err(TxError::Fatal(TxFault::Unmappable));
        }
        if !self.ring.has_room_for(nsegs) || !self.slots_are_free(first, nsegs) {
            self.pool.unload(slot, dma);
            return Err(TxError::Backpressure { frame, reason: BackpressureReason::RingFull });
        }

        let mut index = first;
        let mut last = first;
        for seg in &self.segments {
            if let Some(tpd) = self.ring.descriptor_mut(index) {
                tpd.set_buffer(seg.addr, seg.len as u16);
            }
            last = index;
            index = self.ring.next_index(index);
        }
        if let Some(tpd) = self.ring.descriptor_mut(last) {
            tpd.set_end_of_packet();
        }
        self.ring.advance_producer(nsegs as u16);

        // the loaded map travels with the frame to the slot that completes last
        self.pool.reassign_mapping(slot, usize::from(last));
        trace!("alx: xmit {:?} in TPDs {}..={}, hardware at {}", frame, first, last, hw_cidx);
        let _bound = self.pool.bind(usize::from(last), frame, dma, SyncOp::PreWrite);
        // slots_are_free() checked every slot of this frame
        debug_assert!(_bound.is_ok(), "TPD {} still holds a frame", last);

        dma.sync_coherent(self.ring.region(), SyncOp::PreWrite);
        regs.set_tx_producer_index(self.ring.producer_index());
        Ok(())
    }

    fn slots_are_free(&self, first: u16, count: usize) -> bool {
        let mut index = first;
        for _ in 0..count {
            if self.pool.is_bound(usize::from(index)) {
                return false;
            }
            index = self.ring.next_index(index);
        }
        true
    }

    /// Releases every frame the hardware has finished sending and advances the consumer index.
    /// Returns the number of frames released.
    pub(crate) fn reclaim<R: TxQueueRegisters>(&mut self, dma: &mut D, regs: &R) -> usize {
        let hw_cidx = regs.tx_consumer_index();
        let completed = match self.ring.completed_until(hw_cidx) {
            Ok(completed) => completed,
            Err(e) => {
                warn!("alx: ignoring TPD consumer index: {}", e);
                return 0;
            }
        };
        let consumer = self.ring.consumer_index();

        dma.sync_coherent(self.ring.region(), SyncOp::PostWrite);
        let mut released = 0;
        let mut index = consumer;
        while index != hw_cidx {
            if self.pool.release(usize::from(index), dma, SyncOp::PostWrite).is_some() {
                released += 1;
            }
            index = self.ring.next_index(index);
        }
        self.ring.advance_consumer(completed);
        released
    }
}

fn load_failure(error: LoadError, frame: Frame) -> TxError {
    match error {
        LoadError::NoResources => TxError::Backpressure { frame, reason: BackpressureReason::MapResources },
        LoadError::TooManyFragments => {
            warn!("alx: coalesced frame {:?} still has too many segments, dropping it", frame);
            TxError::Fatal(TxFault::TooManyFragments)
        }
        LoadError::Unmappable => {
            warn!("alx: couldn't map frame {:?}, dropping it", frame);
            TxError::Fatal(TxFault::Unmappable)
        }
    }
}
