//! The receive path: the free ring of empty buffers and the return ring of completed frames.
//!
//! Software posts an empty buffer in every free-ring slot it can, then advances the
//! free-ring producer index. For each received frame the hardware writes one RRD,
//! naming the run of free-ring slots (start index and count) that hold the frame's data.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use atheros_ethernet::descriptors::{RfdDesc, RrdDesc, RxFreeDescriptor, RxReturnDescriptor};
use kernel_config::network::CONFIG_RX_RESERVED_SLOTS;
use nic_buffers::{BufferPool, DmaEngine, DmaSegment, DmaTag, Frame, SyncOp};
use nic_initialization::{alloc_descriptor_ring, create_buffer_pool, free_descriptor_ring, program_rx_rings, InitError};
use nic_queues::{DescriptorRing, RxQueueRegisters};
use crate::config::AlxConfig;

/// The packet length in an RRD includes the frame check sequence.
const ETH_FCS_LEN: u16 = 4;


/// Counters updated by the receive path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RxCounts {
    pub(crate) frames: u64,
    pub(crate) errors: u64,
    pub(crate) refill_failures: u64,
}


pub(crate) struct RxRings<D: DmaEngine> {
    pub(crate) free: DescriptorRing<RfdDesc, D::Memory>,
    pub(crate) ret: DescriptorRing<RrdDesc, D::Memory>,
    pub(crate) pool: BufferPool<D::Map>,
    buffer_size: u16,
    segments: Vec<DmaSegment>,
}

impl<D: DmaEngine> RxRings<D> {
    /// Allocates both rings and one mapping per free-ring slot, releasing everything on failure.
    pub(crate) fn new(dma: &mut D, config: &AlxConfig) -> Result<RxRings<D>, InitError> {
        let buffer_size = config.rx_buffer_size();
        let free = alloc_descriptor_ring::<RfdDesc, D>(dma, config.rx_ring_size, CONFIG_RX_RESERVED_SLOTS)?;
        let ret = match alloc_descriptor_ring::<RrdDesc, D>(dma, config.rx_ring_size, 0) {
            Ok(ret) => ret,
            Err(e) => {
                free_descriptor_ring(dma, free);
                return Err(e);
            }
        };
        let tag = DmaTag {
            alignment: 8,
            max_size: buffer_size.into(),
            max_segments: 1,
        };
        let pool = match create_buffer_pool(dma, config.rx_ring_size.into(), &tag) {
            Ok(pool) => pool,
            Err(e) => {
                free_descriptor_ring(dma, ret);
                free_descriptor_ring(dma, free);
                return Err(e);
            }
        };
        Ok(RxRings { free, ret, pool, buffer_size, segments: Vec::with_capacity(1) })
    }

    pub(crate) fn buffer_size(&self) -> u16 {
        self.buffer_size
    }

    /// Drops every posted buffer, zeroes both rings and programs them into the device.
    /// The free ring is refilled separately.
    pub(crate) fn init<R: RxQueueRegisters>(&mut self, dma: &mut D, regs: &R) {
        let stale = self.pool.release_all(dma, SyncOp::PostRead);
        if stale > 0 {
            debug!("alx: dropped {} stale receive buffers", stale);
        }
        program_rx_rings(&mut self.free, &mut self.ret, self.buffer_size, regs);
    }

    pub(crate) fn destroy(self, dma: &mut D) {
        self.pool.teardown(dma);
        free_descriptor_ring(dma, self.ret);
        free_descriptor_ring(dma, self.free);
    }

    /// Posts a fresh buffer in every free slot of the free ring, then tells the hardware.
    ///
    /// Stops at the first slot whose buffer can't be allocated or mapped, leaving that slot
    /// and every later one unposted: the producer index never covers a slot without a buffer.
    /// Returns the number of buffers posted.
    pub(crate) fn refill<R: RxQueueRegisters>(&mut self, dma: &mut D, regs: &R, counts: &mut RxCounts) -> usize {
        let mut posted = 0;
        while self.free.has_room_for(1) {
            let index = self.free.producer_index();
            let slot = usize::from(index);
            if self.pool.is_bound(slot) {
                error!("BUG: alx: RFD {} still holds a buffer", index);
                break;
            }
            let frame = match Frame::try_zeroed(self.buffer_size.into()) {
                Ok(frame) => frame,
                Err(_e) => {
                    warn!("alx: couldn't allocate a receive buffer for RFD {}", index);
                    counts.refill_failures += 1;
                    break;
                }
            };
            if let Err(e) = self.pool.load(slot, &frame, dma, &mut self.segments) {
                warn!("alx: couldn't map a receive buffer for RFD {}: {}", index, e);
                counts.refill_failures += 1;
                break;
            }
            let addr = match self.segments.as_slice() {
                [seg] => seg.addr,
                _ => {
                    self.pool.unload(slot, dma);
                    warn!("alx: receive buffer for RFD {} mapped to {} segments", index, self.segments.len());
                    counts.refill_failures += 1;
                    break;
                }
            };
            if let Some(rfd) = self.free.descriptor_mut(index) {
                rfd.init(addr);
            }
            if self.pool.bind(slot, frame, dma, SyncOp::PreRead).is_err() {
                self.pool.unload(slot, dma);
                break;
            }
            self.free.advance_producer(1);
            posted += 1;
        }

        if posted > 0 {
            dma.sync_coherent(self.free.region(), SyncOp::PreWrite);
            regs.set_rx_free_producer_index(self.free.producer_index());
        }
        posted
    }

    /// Consumes every RRD the hardware has written back, moving good frames onto `received`.
    /// Returns the number of frames received.
    pub(crate) fn process(&mut self, dma: &mut D, received: &mut VecDeque<Frame>, counts: &mut RxCounts) -> usize {
        dma.sync_coherent(self.ret.region(), SyncOp::PostRead);
        let mut frames = 0;
        loop {
            let index = self.ret.consumer_index();
            let rrd = match self.ret.descriptor(index) {
                Some(rrd) if rrd.updated() => *rrd,
                _ => break,
            };
            let start = rrd.start_index();
            let count = u16::from(rrd.descriptor_count());
            if let Some(rrd) = self.ret.descriptor_mut(index) {
                rrd.reset();
            }
            self.ret.advance_consumer(1);

            // a descriptor that doesn't name the next posted RFDs is dropped without touching the free ring
            if start != self.free.consumer_index() || count == 0 || count > self.free.in_use() {
                warn!("alx: RRD {} names RFDs {}+{}, expected {} of {} posted RFDs",
                    index, start, count, self.free.consumer_index(), self.free.in_use());
                counts.errors += 1;
                continue;
            }

            let mut frame: Option<Frame> = None;
            let mut complete = true;
            let mut slot = start;
            for _ in 0..count {
                match self.pool.release(usize::from(slot), dma, SyncOp::PostRead) {
                    Some(piece) => match frame.as_mut() {
                        Some(f) => f.append(piece),
                        None => frame = Some(piece),
                    },
                    None => complete = false,
                }
                slot = self.free.next_index(slot);
            }
            self.free.advance_consumer(count);

            match frame {
                Some(mut frame) if complete && !rrd.has_errors() => {
                    frame.truncate(rrd.packet_length().saturating_sub(ETH_FCS_LEN).into());
                    trace!("alx: received {:?} in RFDs {}+{}", frame, start, count);
                    received.push_back(frame);
                    counts.frames += 1;
                    frames += 1;
                }
                _ => {
                    debug!("alx: dropping bad frame {:?}", rrd);
                    counts.errors += 1;
                }
            }
        }
        frames
    }
}
