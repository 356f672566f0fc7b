//! A driver for the Qualcomm Atheros AR816x/AR817x ("alx") gigabit Ethernet controllers.
//!
//! The device has one transmit ring of TPDs and one receive ring pair
//! (free RFDs and returned RRDs), all driven through a single interrupt line.
//!
//! Work is split between three execution contexts:
//! * The interrupt handler, [`AlxNic::handle_interrupt()`], which never takes the device lock.
//!   It acknowledges the interrupt, masks the causes it saw, and queues a deferred task.
//! * The deferred tasks, run by [`AlxNic::run_deferred_tasks()`] or a worker thread,
//!   which handle link changes and ring maintenance under the device lock
//!   and then unmask the causes they handled.
//! * Callers of the [`NetworkInterfaceCard`] interface: the network stack sending frames
//!   and taking received ones, and the administrative start/stop path.
//!
//! The hardware is reached through three collaborators supplied at attach time:
//! a [`RegisterBlock`] for the interrupt and ring registers, an [`AlxHardware`]
//! implementation for MAC/PHY control, and a [`DmaEngine`] for DMA memory and mappings.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

pub mod config;
pub mod hw;
pub mod interrupts;
mod link;
pub mod regs;
mod rx;
mod tx;

#[cfg(test)]
mod test;

pub use atheros_ethernet::types::LinkState;
pub use config::{AlxConfig, ConfigError, HwSettings};
pub use hw::{AlxHardware, HwError};
pub use interrupts::{IrqResult, IO_TASK, LINK_TASK};
pub use regs::{MmioRegisters, RegisterBlock};
pub use tx::{BackpressureReason, TxError, TxFault};

use core::fmt;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use atheros_ethernet::types::{Capabilities, ChipInfo};
use deferred_interrupt_tasks::{DeferredTaskQueue, TaskId};
use network_interface_card::NetworkInterfaceCard;
use nic_buffers::{DmaEngine, Frame};
use nic_initialization::InitError;
use spin::Mutex;
use interrupts::InterruptController;
use regs::*;
use rx::{RxCounts, RxRings};
use tx::TxRing;


/// A callback invoked with every published link state.
/// Runs without the device lock held, on the deferred-work or administrative context.
pub type LinkObserver = Arc<dyn Fn(LinkState) + Send + Sync>;

/// A snapshot of the driver's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AlxStats {
    pub tx_frames: u64,
    /// Frames dropped by the transmit path.
    pub tx_dropped: u64,
    /// Frames handed back to the caller to retry later.
    pub tx_backpressure: u64,
    pub tx_completions: u64,
    pub rx_frames: u64,
    /// Received frames dropped because hardware flagged them or their buffers were missing.
    pub rx_errors: u64,
    pub rx_refill_failures: u64,
    pub interrupts_handled: u64,
    pub interrupts_not_mine: u64,
}


/// The errors that may occur in [`AlxNic::attach()`]. The device is unusable after any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    InvalidConfig(ConfigError),
    UnsupportedChip { device_id: u16, revision_id: u8 },
    MacReset(HwError),
    SpeedDuplex(HwError),
    MacAddress(HwError),
    InvalidMacAddress([u8; 6]),
    PhyIdentification(HwError),
    Dma(InitError),
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AttachError::InvalidConfig(e) => write!(f, "invalid configuration: {}", e),
            AttachError::UnsupportedChip { device_id, revision_id } =>
                write!(f, "unrecognized chip {:#06X} rev {:#04X}", device_id, revision_id),
            AttachError::MacReset(e) => write!(f, "failed to reset MAC: {}", e),
            AttachError::SpeedDuplex(e) => write!(f, "failed to configure speed/duplex: {}", e),
            AttachError::MacAddress(e) => write!(f, "failed to read MAC address: {}", e),
            AttachError::InvalidMacAddress(mac) => write!(f, "invalid MAC address {:02x?}", mac),
            AttachError::PhyIdentification(e) => write!(f, "failed to identify PHY: {}", e),
            AttachError::Dma(e) => write!(f, "failed to allocate DMA resources: {}", e),
        }
    }
}

/// The errors that may occur in [`AlxNic::start()`]. The device stays stopped after any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    Detached,
    MacReset(HwError),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StartError::Detached => write!(f, "device was detached"),
            StartError::MacReset(e) => write!(f, "failed to reset MAC: {}", e),
        }
    }
}


/// Everything guarded by the device lock.
struct AlxState<H, D: DmaEngine> {
    hw: H,
    dma: D,
    config: AlxConfig,
    chip: ChipInfo,
    capabilities: Capabilities,
    /// `None` once detached.
    tx: Option<TxRing<D>>,
    rx: Option<RxRings<D>>,
    link: LinkState,
    running: bool,
    detached: bool,
    mac_address: [u8; 6],
    perm_address: [u8; 6],
    received_frames: VecDeque<Frame>,
    stats: AlxStats,
    rx_counts: RxCounts,
    link_observer: Option<LinkObserver>,
}

/// One AR816x/AR817x device.
pub struct AlxNic<R, H, D>
    where R: RegisterBlock,
          H: AlxHardware,
          D: DmaEngine,
{
    regs: Arc<R>,
    interrupts: InterruptController<R>,
    tasks: Arc<DeferredTaskQueue>,
    state: Mutex<AlxState<H, D>>,
}

fn is_valid_unicast(mac: &[u8; 6]) -> bool {
    mac.iter().any(|b| *b != 0) && mac[0] & 0x01 == 0
}

impl<R, H, D> AlxNic<R, H, D>
    where R: RegisterBlock,
          H: AlxHardware,
          D: DmaEngine,
{
    /// Identifies and resets the chip, reads its MAC address,
    /// and allocates its rings, buffer pools and DMA mappings.
    ///
    /// The returned device is stopped, with interrupts disabled; call [`AlxNic::start()`] to bring it up.
    /// On failure every DMA resource acquired so far has been released.
    ///
    /// # Arguments
    /// * `regs`: the device's memory-mapped registers.
    /// * `hw`: MAC/PHY control of the same device.
    /// * `dma`: the platform DMA engine.
    /// * `config`: the per-device settings, validated here.
    pub fn attach(regs: Arc<R>, mut hw: H, mut dma: D, config: AlxConfig) -> Result<Arc<AlxNic<R, H, D>>, AttachError> {
        config.validate().map_err(AttachError::InvalidConfig)?;

        let chip = hw.identify();
        let features = chip.features().ok_or_else(|| {
            error!("alx: unrecognized chip {:#06X}, aborting", chip.device_id);
            AttachError::UnsupportedChip { device_id: chip.device_id, revision_id: chip.revision_id }
        })?;
        let settings = HwSettings::new(&config, &features);
        hw.load_settings(&settings);

        hw.reset_pcie();
        let phy_configured = hw.phy_configured();
        if !phy_configured {
            hw.reset_phy();
        }
        hw.reset_mac().map_err(|e| {
            error!("alx: MAC reset failed: {}", e);
            AttachError::MacReset(e)
        })?;
        if !phy_configured {
            hw.setup_speed_duplex(settings.advertised, settings.flow_control).map_err(|e| {
                error!("alx: failed to configure speed/duplex: {}", e);
                AttachError::SpeedDuplex(e)
            })?;
        }
        let perm_address = hw.permanent_mac_address().map_err(|e| {
            error!("alx: failed to get permanent MAC address: {}", e);
            AttachError::MacAddress(e)
        })?;
        if !is_valid_unicast(&perm_address) {
            error!("alx: invalid permanent MAC address {:02x?}", perm_address);
            return Err(AttachError::InvalidMacAddress(perm_address));
        }
        let mac_address = config.mac_address.unwrap_or(perm_address);
        if !is_valid_unicast(&mac_address) {
            return Err(AttachError::InvalidMacAddress(mac_address));
        }
        hw.identify_phy().map_err(|e| {
            error!("alx: failed to identify PHY: {}", e);
            AttachError::PhyIdentification(e)
        })?;

        let tx = TxRing::new(&mut dma, &config).map_err(|e| {
            error!("alx: failed to allocate the transmit ring: {}", e);
            AttachError::Dma(e)
        })?;
        let rx = match RxRings::new(&mut dma, &config) {
            Ok(rx) => rx,
            Err(e) => {
                error!("alx: failed to allocate the receive rings: {}", e);
                tx.destroy(&mut dma);
                return Err(AttachError::Dma(e));
            }
        };

        info!("alx: attached chip {:#06X} rev {}, MAC {:02x?}, capabilities {:?}",
            chip.device_id, chip.revision(), mac_address, features.capabilities);

        let interrupts = InterruptController::new(Arc::clone(&regs));
        Ok(Arc::new(AlxNic {
            regs,
            interrupts,
            tasks: Arc::new(DeferredTaskQueue::new()),
            state: Mutex::new(AlxState {
                hw,
                dma,
                config,
                chip,
                capabilities: features.capabilities,
                tx: Some(tx),
                rx: Some(rx),
                link: LinkState::Down,
                running: false,
                detached: false,
                mac_address,
                perm_address,
                received_frames: VecDeque::new(),
                stats: AlxStats::default(),
                rx_counts: RxCounts::default(),
                link_observer: None,
            }),
        }))
    }

    /// Brings the interface up: resets the MAC, programs both rings, fills the receive ring,
    /// polls the link and enables interrupts. Does nothing if already running.
    pub fn start(&self) -> Result<(), StartError> {
        let event = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.detached {
                return Err(StartError::Detached);
            }
            if state.running {
                return Ok(());
            }
            self.stop_locked(state);
            Self::reset(state)?;
            // the MAC reset took down whatever link the MAC was running
            let previous_link = core::mem::take(&mut state.link);
            state.hw.set_mac_address(&state.mac_address);

            let queue_regs = QueueRegisters(&*self.regs);
            if let Some(rx) = state.rx.as_mut() {
                self.interrupts.add_causes(ALX_ISR_RX_Q0);
                rx.init(&mut state.dma, &queue_regs);
                let posted = rx.refill(&mut state.dma, &queue_regs, &mut state.rx_counts);
                debug!("alx: posted {} receive buffers of {} bytes", posted, rx.buffer_size());
            }
            if let Some(tx) = state.tx.as_mut() {
                self.interrupts.add_causes(ALX_ISR_TX_Q0);
                tx.init(&mut state.dma, &queue_regs);
            }
            self.interrupts.add_causes(ALX_ISR_PHY);

            // load the ring pointers into the DMA engine
            self.regs.write32(ALX_SRAM9, ALX_SRAM_LOAD_PTR);

            state.hw.configure_basic();
            state.hw.configure_rss(state.config.rss_table_index);

            state.running = true;
            let event = match self.update_link(state) {
                None if previous_link.is_up() => Some(Self::link_event(state)),
                event => event,
            };

            self.regs.write32(ALX_ISR, !ALX_ISR_DIS);
            self.interrupts.enable();
            event
        };
        if let Some(event) = event {
            event.publish();
        }
        Ok(())
    }

    fn reset(state: &mut AlxState<H, D>) -> Result<(), StartError> {
        state.hw.reset_pcie();
        if !state.hw.phy_configured() {
            state.hw.reset_phy();
        }
        state.hw.reset_mac().map_err(|e| {
            error!("alx: failed to reset MAC: {}", e);
            StartError::MacReset(e)
        })
    }

    /// Takes the interface down and masks its interrupts.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        self.stop_locked(&mut state);
    }

    fn stop_locked(&self, state: &mut AlxState<H, D>) {
        // interrupts are only enabled while running, which keeps disable/enable balanced
        if state.running {
            state.running = false;
            self.interrupts.disable();
            debug!("alx: stopped");
        }
    }

    /// Stops the interface and quiesces the PHY's interrupt, for system shutdown.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        self.stop_locked(&mut state);
        if let Err(e) = state.hw.clear_phy_interrupt() {
            warn!("alx: failed to clear PHY interrupt at shutdown: {}", e);
        }
    }

    /// Stops the device for good: restores its permanent MAC address,
    /// waits for every deferred task to finish, then releases every ring, mapping and buffer.
    pub fn detach(&self) {
        if !self.begin_detach() {
            return;
        }
        // must not hold the lock here: the tasks take it
        self.tasks.drain(|task| self.run_task(task));
        self.release_resources();
    }

    /// Detaches from inside a deferred task, when that task held the last reference.
    /// The task's own run is the one still in flight, so this must not wait for the queue.
    #[cfg(any(test, feature = "std"))]
    fn detach_from_task(&self) {
        if !self.begin_detach() {
            return;
        }
        self.tasks.close();
        self.release_resources();
    }

    /// Stops the device and marks it detached. Returns false if it already was.
    fn begin_detach(&self) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.detached {
            return false;
        }
        self.stop_locked(state);
        state.detached = true;
        state.hw.set_mac_address(&state.perm_address);
        true
    }

    fn release_resources(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(tx) = state.tx.take() {
            tx.destroy(&mut state.dma);
        }
        if let Some(rx) = state.rx.take() {
            rx.destroy(&mut state.dma);
        }
        state.received_frames.clear();
        debug!("alx: detached");
    }

    /// Sends one frame. Never blocks.
    ///
    /// On [`TxError::Backpressure`] the frame is handed back and should be retried
    /// once completions have been reclaimed; on [`TxError::Fatal`] it has been dropped.
    pub fn send(&self, frame: Frame) -> Result<(), TxError> {
        let mut guard = self.state.lock();
        self.send_locked(&mut guard, frame)
    }

    fn send_locked(&self, state: &mut AlxState<H, D>, frame: Frame) -> Result<(), TxError> {
        let reason = if !state.running {
            Some(BackpressureReason::NotRunning)
        } else if !state.link.is_up() {
            Some(BackpressureReason::LinkDown)
        } else {
            None
        };
        let result = match (reason, state.tx.as_mut()) {
            (None, Some(tx)) => tx.xmit(&mut state.dma, &QueueRegisters(&*self.regs), frame),
            (Some(reason), _) => Err(TxError::Backpressure { frame, reason }),
            (None, None) => Err(TxError::Backpressure { frame, reason: BackpressureReason::NotRunning }),
        };
        match &result {
            Ok(()) => state.stats.tx_frames += 1,
            Err(TxError::Backpressure { .. }) => state.stats.tx_backpressure += 1,
            Err(TxError::Fatal(_)) => state.stats.tx_dropped += 1,
        }
        result
    }

    /// Sends frames from the front of `queue` while the interface is running and the link is up.
    /// Frames that are dropped leave the queue; a frame hit by backpressure is put back at the front.
    ///
    /// Returns the number of frames that left `queue`.
    pub fn transmit_queue(&self, queue: &mut VecDeque<Frame>) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.running || !state.link.is_up() {
            return 0;
        }
        let mut dequeued = 0;
        while let Some(frame) = queue.pop_front() {
            match self.send_locked(state, frame) {
                Ok(()) | Err(TxError::Fatal(_)) => dequeued += 1,
                Err(TxError::Backpressure { frame, .. }) => {
                    queue.push_front(frame);
                    break;
                }
            }
        }
        dequeued
    }

    /// Returns the earliest received frame, if any.
    pub fn get_received_frame(&self) -> Option<Frame> {
        self.state.lock().received_frames.pop_front()
    }

    /// Reclaims completed transmit buffers and collects received frames without waiting for an interrupt.
    /// Returns the number of newly-received frames.
    pub fn poll_receive(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.running {
            return 0;
        }
        self.service_rings(state)
    }

    /// Reclaims the transmit ring, then drains the return ring and refills the free ring.
    fn service_rings(&self, state: &mut AlxState<H, D>) -> usize {
        let queue_regs = QueueRegisters(&*self.regs);
        if let Some(tx) = state.tx.as_mut() {
            state.stats.tx_completions += tx.reclaim(&mut state.dma, &queue_regs) as u64;
        }
        let mut received = 0;
        if let Some(rx) = state.rx.as_mut() {
            received = rx.process(&mut state.dma, &mut state.received_frames, &mut state.rx_counts);
            rx.refill(&mut state.dma, &queue_regs, &mut state.rx_counts);
        }
        received
    }

    /// The most recently published link state.
    pub fn link_status(&self) -> LinkState {
        self.state.lock().link
    }

    /// Registers a callback for every published link change, replacing any previous one.
    pub fn set_link_observer(&self, observer: LinkObserver) {
        self.state.lock().link_observer = Some(observer);
    }

    pub fn mac_address(&self) -> [u8; 6] {
        self.state.lock().mac_address
    }

    pub fn chip_info(&self) -> ChipInfo {
        self.state.lock().chip
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn stats(&self) -> AlxStats {
        let (handled, not_mine) = self.interrupts.counts();
        let state = self.state.lock();
        AlxStats {
            rx_frames: state.rx_counts.frames,
            rx_errors: state.rx_counts.errors,
            rx_refill_failures: state.rx_counts.refill_failures,
            interrupts_handled: handled,
            interrupts_not_mine: not_mine,
            ..state.stats
        }
    }

    /// The interrupt handler. Call it whenever the device's interrupt line fires.
    ///
    /// Takes no locks and never blocks; all real work is queued as deferred tasks.
    pub fn handle_interrupt(&self) -> IrqResult {
        self.interrupts.handle_interrupt(&self.tasks)
    }

    /// Runs every queued deferred task on the calling thread.
    /// Returns the number of tasks run.
    pub fn run_deferred_tasks(&self) -> usize {
        self.tasks.run_pending(|task| self.run_task(task))
    }

    fn run_task(&self, task: TaskId) {
        match task {
            LINK_TASK => self.link_task(),
            IO_TASK => self.io_task(),
            other => warn!("alx: unknown deferred task {:?}", other),
        }
    }

    /// Handles the transmit and receive causes deferred by the interrupt handler,
    /// then unmasks exactly those causes.
    fn io_task(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let causes = self.interrupts.take_deferred_io();
        if state.running {
            let received = self.service_rings(state);
            trace!("alx: I/O task for causes {:#X} received {} frames", causes, received);
        }
        self.interrupts.restore_causes(causes);
    }
}

#[cfg(any(test, feature = "std"))]
impl<R, H, D> AlxNic<R, H, D>
    where R: RegisterBlock + 'static,
          H: AlxHardware + 'static,
          D: DmaEngine + Send + 'static,
          D::Map: Send,
          D::Memory: Send,
{
    /// Spawns a thread that runs this device's deferred tasks as soon as they are queued.
    /// The thread exits when the device is detached.
    pub fn spawn_deferred_worker(self: &Arc<Self>) -> Result<std::thread::JoinHandle<()>, &'static str> {
        let nic = Arc::downgrade(self);
        deferred_interrupt_tasks::spawn_worker(Arc::clone(&self.tasks), "alx_deferred", move |task| {
            let Some(nic) = nic.upgrade() else { return };
            nic.run_task(task);
            // the last reference was dropped while this task ran
            if let Some(nic) = Arc::into_inner(nic) {
                nic.detach_from_task();
            }
        })
    }
}

impl<R, H, D> Drop for AlxNic<R, H, D>
    where R: RegisterBlock,
          H: AlxHardware,
          D: DmaEngine,
{
    fn drop(&mut self) {
        self.detach();
    }
}

impl<R, H, D> NetworkInterfaceCard for AlxNic<R, H, D>
    where R: RegisterBlock,
          H: AlxHardware,
          D: DmaEngine,
{
    type SendError = TxError;
    type LinkStatus = LinkState;
    type StartError = StartError;

    fn send_frame(&self, frame: Frame) -> Result<(), TxError> {
        self.send(frame)
    }

    fn transmit_queue(&self, queue: &mut VecDeque<Frame>) -> usize {
        AlxNic::transmit_queue(self, queue)
    }

    fn get_received_frame(&self) -> Option<Frame> {
        AlxNic::get_received_frame(self)
    }

    fn poll_receive(&self) -> usize {
        AlxNic::poll_receive(self)
    }

    fn link_status(&self) -> LinkState {
        AlxNic::link_status(self)
    }

    fn mac_address(&self) -> [u8; 6] {
        AlxNic::mac_address(self)
    }

    fn start(&self) -> Result<(), StartError> {
        AlxNic::start(self)
    }

    fn stop(&self) {
        AlxNic::stop(self)
    }
}
