//! Abstractions for deferred interrupt tasks, a companion to regular interrupt handlers.
//!
//! Deferred interrupt tasks are similar to the concept of "top half" and "bottom half"
//! interrupt handlers in other OSes, in which the top half is the short, latency-sensitive
//! function that runs immediately when the interrupt request is serviced,
//! while the bottom half is the more complex function that runs in a deferred manner
//! to handle longer operations.
//! We do not use the "top half" or "bottom half" terminology
//! because it is confusing and difficult to remember which is which.
//! Instead, we refer to the first latency-sensitive part as the
//! *interrupt handler* and the second later part as the *deferred task*.
//!
//! An interrupt handler should do the minimum amount of work possible:
//!  * Masks the causes it observed so they cannot re-fire,
//!  * Enqueues the deferred task that will handle those causes,
//!  * Acknowledges the interrupt such that the hardware knows it was handled.
//!
//! A [`DeferredTaskQueue`] is the hand-off point between the two.
//! [`DeferredTaskQueue::enqueue()`] touches nothing but atomics, so it may be called
//! from an interrupt handler, which must never block or take a lock.
//! A single consumer runs queued tasks in the order they were first enqueued;
//! enqueuing a task that is already pending does not queue it twice,
//! because one run handles every cause that accumulated since it was queued.
//!
//! Teardown publishes a "shutting down" flag, after which no new task is accepted,
//! and then drains the queue until it is empty and no task is in flight.
//! Only then may the state that tasks refer to be released.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;
#[macro_use] extern crate log;


use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use alloc::boxed::Box;
use kernel_config::network::CONFIG_MAX_DEFERRED_TASKS;
use spin::Once;


/// Identifies one kind of deferred work.
/// Each id is pending at most once at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u8);

/// The errors that may occur in [`DeferredTaskQueue::enqueue()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is being drained for teardown and accepts no new work.
    ShuttingDown,
    /// The task id is beyond the number of tasks this queue can track.
    InvalidTask(TaskId),
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EnqueueError::ShuttingDown => write!(f, "deferred task queue is shutting down"),
            EnqueueError::InvalidTask(id) => write!(f, "invalid deferred task id {}", id.0),
        }
    }
}

/// Wakes up whatever execution context consumes a [`DeferredTaskQueue`].
///
/// Called from interrupt context, so implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self);
}


/// A bounded queue of deferred tasks with a single consumer at a time.
pub struct DeferredTaskQueue {
    /// Bit `n` is set while `TaskId(n)` is queued.
    pending: AtomicU32,
    /// The order in which each pending task was enqueued.
    stamps: [AtomicU64; CONFIG_MAX_DEFERRED_TASKS],
    next_stamp: AtomicU64,
    shutting_down: AtomicBool,
    /// Set while a consumer is running tasks.
    in_flight: AtomicBool,
    notifier: Once<Box<dyn Notifier>>,
}

const _: () = assert!(CONFIG_MAX_DEFERRED_TASKS <= u32::BITS as usize);

impl DeferredTaskQueue {
    pub fn new() -> DeferredTaskQueue {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        DeferredTaskQueue {
            pending: AtomicU32::new(0),
            stamps: [ZERO; CONFIG_MAX_DEFERRED_TASKS],
            next_stamp: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            notifier: Once::new(),
        }
    }

    /// Installs the notifier that [`DeferredTaskQueue::enqueue()`] wakes up.
    /// Returns false if a notifier was already installed, in which case `notifier` is dropped.
    pub fn set_notifier(&self, notifier: Box<dyn Notifier>) -> bool {
        let mut installed = false;
        self.notifier.call_once(|| {
            installed = true;
            notifier
        });
        installed
    }

    pub fn has_notifier(&self) -> bool {
        self.notifier.is_completed()
    }

    /// Queues `task` to run on the deferred-work context.
    ///
    /// Safe to call from an interrupt handler: no locks, no allocation.
    /// Enqueuing a task that is already pending succeeds without queuing it again.
    pub fn enqueue(&self, task: TaskId) -> Result<(), EnqueueError> {
        let index = task.0 as usize;
        if index >= CONFIG_MAX_DEFERRED_TASKS {
            return Err(EnqueueError::InvalidTask(task));
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EnqueueError::ShuttingDown);
        }
        let bit = 1u32 << index;
        if self.pending.load(Ordering::SeqCst) & bit == 0 {
            let stamp = self.next_stamp.fetch_add(1, Ordering::Relaxed);
            self.stamps[index].store(stamp, Ordering::Relaxed);
            self.pending.fetch_or(bit, Ordering::SeqCst);
        }
        if let Some(notifier) = self.notifier.get() {
            notifier.notify();
        }
        Ok(())
    }

    /// Returns true if `task` is queued and has not started running yet.
    pub fn is_pending(&self, task: TaskId) -> bool {
        (task.0 as usize) < CONFIG_MAX_DEFERRED_TASKS
            && self.pending.load(Ordering::SeqCst) & (1 << task.0) != 0
    }

    /// The number of tasks queued and not yet started.
    pub fn pending_count(&self) -> u32 {
        self.pending.load(Ordering::SeqCst).count_ones()
    }

    /// Returns true once [`DeferredTaskQueue::drain()`] has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Returns true if nothing is queued and no consumer is running a task.
    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && !self.in_flight.load(Ordering::SeqCst)
    }

    /// Runs every pending task, oldest first, by invoking `handler` for each,
    /// until the queue is empty. Tasks enqueued while this runs are run too.
    ///
    /// Only one consumer runs at a time; if another consumer is already running,
    /// this returns immediately. Returns the number of tasks run.
    pub fn run_pending<F: FnMut(TaskId)>(&self, mut handler: F) -> usize {
        if self.in_flight.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return 0;
        }
        let mut ran = 0;
        while let Some(task) = self.take_oldest() {
            handler(task);
            ran += 1;
        }
        self.in_flight.store(false, Ordering::SeqCst);
        ran
    }

    /// Removes and returns the pending task that was enqueued first.
    fn take_oldest(&self) -> Option<TaskId> {
        let pending = self.pending.load(Ordering::SeqCst);
        if pending == 0 {
            return None;
        }
        let mut oldest: Option<(usize, u64)> = None;
        let mut bits = pending;
        while bits != 0 {
            let index = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            let stamp = self.stamps[index].load(Ordering::Relaxed);
            if oldest.map_or(true, |(_, s)| stamp < s) {
                oldest = Some((index, stamp));
            }
        }
        let (index, _) = oldest?;
        // cleared before the task runs, so a cause raised while it runs queues it again
        self.pending.fetch_and(!(1u32 << index), Ordering::SeqCst);
        Some(TaskId(index as u8))
    }

    /// Stops accepting new tasks without waiting for queued or running ones.
    ///
    /// A task that tears down the queue's owner calls this instead of [`DeferredTaskQueue::drain()`],
    /// which would wait forever on the task itself.
    pub fn close(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(notifier) = self.notifier.get() {
            notifier.notify();
        }
    }

    /// Stops accepting new tasks, then runs or waits for every queued task
    /// until the queue is empty and no task is in flight.
    ///
    /// `handler` runs any task that no other consumer has picked up.
    pub fn drain<F: FnMut(TaskId)>(&self, mut handler: F) {
        self.close();
        loop {
            let ran = self.run_pending(&mut handler);
            if ran > 0 {
                debug!("DeferredTaskQueue::drain(): ran {} leftover tasks", ran);
            }
            if self.is_idle() {
                break;
            }
            core::hint::spin_loop();
        }
        // lets a parked worker observe the idle, shut-down queue and exit
        if let Some(notifier) = self.notifier.get() {
            notifier.notify();
        }
    }
}

impl Default for DeferredTaskQueue {
    fn default() -> Self {
        DeferredTaskQueue::new()
    }
}

impl fmt::Debug for DeferredTaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeferredTaskQueue {{ pending: {:#X}, in_flight: {}, shutting_down: {} }}",
            self.pending.load(Ordering::SeqCst),
            self.in_flight.load(Ordering::SeqCst),
            self.shutting_down.load(Ordering::SeqCst),
        )
    }
}


#[cfg(any(test, feature = "std"))]
pub use worker::spawn_worker;

#[cfg(any(test, feature = "std"))]
mod worker {
    use super::*;
    use alloc::sync::Arc;
    use std::thread::{self, JoinHandle, Thread};

    struct ThreadNotifier(Thread);

    impl Notifier for ThreadNotifier {
        fn notify(&self) {
            self.0.unpark();
        }
    }

    /// Spawns the deferred task loop on its own thread.
    ///
    /// The thread runs every queued task via `handler`, then parks itself until
    /// the queue's notifier wakes it. It exits once the queue is shutting down and idle.
    ///
    /// # Return
    /// * `Ok(JoinHandle)` if the thread was spawned and installed as the queue's notifier.
    /// * `Err` if the queue already has a notifier or the thread couldn't be spawned.
    pub fn spawn_worker<F>(queue: Arc<DeferredTaskQueue>, name: &str, mut handler: F)
        -> Result<JoinHandle<()>, &'static str>
        where F: FnMut(TaskId) + Send + 'static,
    {
        if queue.has_notifier() {
            return Err("deferred task queue already has a worker");
        }
        let worker_queue = Arc::clone(&queue);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                // wait until the notifier is installed so no wakeup is missed
                thread::park();
                loop {
                    worker_queue.run_pending(&mut handler);
                    if worker_queue.is_shutting_down() && worker_queue.is_idle() {
                        break;
                    }
                    thread::park();
                }
                trace!("deferred task worker exiting");
            })
            .map_err(|_e| "couldn't spawn deferred task worker thread")?;

        if !queue.set_notifier(Box::new(ThreadNotifier(handle.thread().clone()))) {
            error!("spawn_worker(): queue already has a notifier");
            return Err("deferred task queue already has a worker");
        }
        handle.thread().unpark();
        Ok(handle)
    }
}
