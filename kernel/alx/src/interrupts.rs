//! The interrupt mask protocol shared between the interrupt handler and everything else.
//!
//! `imask` is the software copy of the interrupt mask register. It is written without the
//! device lock by two parties, who never contend on the same bit:
//! the interrupt handler only clears cause bits it has just observed asserted,
//! and the deferred task handling those causes only sets back the bits the handler cleared.
//!
//! `irq_sem` counts nested disables. Interrupts start disabled (`irq_sem == 1`);
//! [`InterruptController::enable()`] only unmasks the hardware on the 1 to 0 transition,
//! while [`InterruptController::disable()`] always masks it immediately.

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use alloc::sync::Arc;
use deferred_interrupt_tasks::{DeferredTaskQueue, TaskId};
use crate::regs::*;

/// Handles link changes: [`ALX_ISR_PHY`].
pub const LINK_TASK: TaskId = TaskId(0);
/// Handles transmit completions and received frames: [`ALX_ISR_IO`].
pub const IO_TASK: TaskId = TaskId(1);


/// The outcome of [`InterruptController::handle_interrupt()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqResult {
    /// The interrupt was raised by this device and has been acknowledged.
    Handled,
    /// This device did not raise the interrupt; another device sharing the line may have.
    NotMine,
}


pub struct InterruptController<R: RegisterBlock> {
    regs: Arc<R>,
    imask: AtomicU32,
    irq_sem: AtomicI32,
    /// I/O causes cleared from `imask` by the handler and not yet restored by the I/O task.
    deferred_io: AtomicU32,
    handled: AtomicU64,
    not_mine: AtomicU64,
}

impl<R: RegisterBlock> InterruptController<R> {
    /// Creates a controller with only the miscellaneous causes in its mask, and interrupts disabled.
    pub fn new(regs: Arc<R>) -> InterruptController<R> {
        InterruptController {
            regs,
            imask: AtomicU32::new(ALX_ISR_MISC),
            irq_sem: AtomicI32::new(1),
            deferred_io: AtomicU32::new(0),
            handled: AtomicU64::new(0),
            not_mine: AtomicU64::new(0),
        }
    }

    /// The current software interrupt mask.
    pub fn mask(&self) -> u32 {
        self.imask.load(Ordering::SeqCst)
    }

    /// The current disable nesting depth; 0 means interrupts are enabled.
    pub fn disable_depth(&self) -> i32 {
        self.irq_sem.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.disable_depth() == 0
    }

    /// Undoes one [`InterruptController::disable()`]. Unmasks interrupts in hardware
    /// only when this is the outermost enable.
    pub fn enable(&self) {
        if self.irq_sem.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        // level-1 interrupt switch
        self.regs.write32(ALX_ISR, 0);
        self.write_mask(self.mask());
        self.regs.flush();
    }

    /// Masks every interrupt in hardware immediately, however deeply nested.
    pub fn disable(&self) {
        self.irq_sem.fetch_add(1, Ordering::SeqCst);
        self.regs.write32(ALX_ISR, ALX_ISR_DIS);
        self.regs.write32(ALX_IMR, 0);
        self.regs.flush();
    }

    /// Adds causes to the software mask. They take effect at the next hardware unmask.
    pub fn add_causes(&self, causes: u32) {
        self.imask.fetch_or(causes, Ordering::SeqCst);
    }

    /// Sets back causes that the interrupt handler cleared before deferring them,
    /// unmasking them in hardware right away if interrupts are enabled.
    pub fn restore_causes(&self, causes: u32) {
        let mask = self.imask.fetch_or(causes, Ordering::SeqCst) | causes;
        if self.is_enabled() {
            self.write_mask(mask);
        }
    }

    /// Writes `mask` to the hardware, then again for as long as `imask` moved
    /// underneath the write, so the register ends up matching the latest software mask.
    fn write_mask(&self, mut mask: u32) {
        loop {
            self.regs.write32(ALX_IMR, mask);
            let current = self.mask();
            if current == mask {
                break;
            }
            mask = current;
        }
    }

    /// Takes the I/O causes the handler deferred since the last call.
    pub fn take_deferred_io(&self) -> u32 {
        self.deferred_io.swap(0, Ordering::SeqCst)
    }

    /// The number of interrupts handled and ignored, respectively.
    pub fn counts(&self) -> (u64, u64) {
        (self.handled.load(Ordering::Relaxed), self.not_mine.load(Ordering::Relaxed))
    }

    /// The interrupt handler: acknowledges this device's interrupt,
    /// masks the causes that need deferred work, and queues that work.
    ///
    /// Runs in interrupt context: no locks, no allocation, no blocking.
    pub fn handle_interrupt(&self, tasks: &DeferredTaskQueue) -> IrqResult {
        let status = self.regs.read32(ALX_ISR);
        let mask = self.mask();
        if status & ALX_ISR_DIS != 0 || status & mask == 0 {
            self.not_mine.fetch_add(1, Ordering::Relaxed);
            return IrqResult::NotMine;
        }

        // acknowledge and disable interrupts
        self.regs.write32(ALX_ISR, status | ALX_ISR_DIS);
        let causes = status & mask;
        trace!("alx: interrupt status {:#X}, causes {:#X}", status, causes);

        if causes & ALX_ISR_PHY != 0 {
            self.defer(ALX_ISR_PHY, LINK_TASK, tasks);
        }
        let io = causes & ALX_ISR_IO;
        if io != 0 {
            self.deferred_io.fetch_or(io, Ordering::SeqCst);
            self.defer(io, IO_TASK, tasks);
        }

        self.regs.write32(ALX_ISR, 0);
        self.handled.fetch_add(1, Ordering::Relaxed);
        IrqResult::Handled
    }

    /// Masks `causes` so they can't fire again before `task` has handled them.
    fn defer(&self, causes: u32, task: TaskId, tasks: &DeferredTaskQueue) {
        let mask = self.imask.fetch_and(!causes, Ordering::SeqCst) & !causes;
        self.write_mask(mask);
        if let Err(_e) = tasks.enqueue(task) {
            // shutting down: the causes stay masked
            trace!("alx: couldn't queue deferred task {:?}: {}", task, _e);
        }
    }
}
