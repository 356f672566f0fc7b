extern crate std;

use super::*;
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use std::vec;
use std::vec::Vec;
use atheros_ethernet::descriptors::{RrdDesc, RxReturnDescriptor, TxDescriptor, RRD_ERR_FCS_SHIFT};
use nic_buffers::{DmaError, LoadError};

use mock::*;

type TestNic = AlxNic<MockRegisters, MockHardware, MockDma>;

const LINK_DOWN: (bool, u16) = (false, 0);
const LINK_1000_FULL: (bool, u16) = (true, 1002);

struct Harness {
    nic: Arc<TestNic>,
    regs: Arc<MockRegisters>,
    hw: Arc<Mutex<HwLog>>,
    dma: Arc<Mutex<DmaLog>>,
}

fn small_config() -> AlxConfig {
    AlxConfig::default()
        .with_tx_ring_size(8)
        .with_rx_ring_size(8)
}

fn try_attach(config: AlxConfig, hw: HwLog, dma: DmaLog)
    -> (Result<Arc<TestNic>, AttachError>, Arc<Mutex<HwLog>>, Arc<Mutex<DmaLog>>)
{
    let regs = Arc::new(MockRegisters::default());
    let hw = Arc::new(Mutex::new(hw));
    let dma = Arc::new(Mutex::new(dma));
    let result = AlxNic::attach(regs, MockHardware::new(Arc::clone(&hw)), MockDma::new(Arc::clone(&dma)), config);
    (result, hw, dma)
}

fn attach(config: AlxConfig) -> Harness {
    let regs = Arc::new(MockRegisters::default());
    let hw = Arc::new(Mutex::new(HwLog::default()));
    let dma = Arc::new(Mutex::new(DmaLog::default()));
    let nic = AlxNic::attach(
        Arc::clone(&regs),
        MockHardware::new(Arc::clone(&hw)),
        MockDma::new(Arc::clone(&dma)),
        config,
    ).expect("attach failed");
    Harness { nic, regs, hw, dma }
}

fn started(config: AlxConfig, link: (bool, u16)) -> Harness {
    let h = attach(config);
    h.hw.lock().unwrap().link = link;
    h.nic.start().expect("start failed");
    h
}

fn frame(tag: u8) -> Frame {
    Frame::new(vec![tag; 60])
}

fn raise(h: &Harness, status: u32) -> IrqResult {
    h.regs.set(ALX_ISR, status);
    h.nic.handle_interrupt()
}

fn tx_snapshot(nic: &TestNic) -> Vec<(u64, u16, bool)> {
    let state = nic.state.lock();
    state.tx.as_ref().unwrap().ring.descriptors().iter()
        .map(|d| (d.buffer_address(), d.buffer_length(), d.end_of_packet()))
        .collect()
}


#[test]
fn config_defaults_are_valid() {
    let config = AlxConfig::default();
    assert_eq!(config.validate(), Ok(()));
    assert_eq!(config.rx_buffer_size(), 1528);
    assert_eq!(config.max_frame_size(), 1522);
}

#[test]
fn config_rejects_bad_geometry() {
    assert_eq!(AlxConfig::default().with_tx_ring_size(4).validate(), Err(ConfigError::RingSize(4)));
    assert_eq!(
        small_config().with_tx_reserved_slots(8).validate(),
        Err(ConfigError::ReservedSlots { ring_size: 8, reserved: 8 }),
    );
    assert_eq!(small_config().with_max_tx_segments(0).validate(), Err(ConfigError::MaxSegments(0)));
    assert_eq!(small_config().with_max_tx_segments(8).validate(), Err(ConfigError::MaxSegments(8)));
    assert_eq!(small_config().with_mtu(20).validate(), Err(ConfigError::Mtu(20)));
}

#[test]
fn mmio_registers_stay_in_bounds() {
    let mut mem = vec![0u32; 0x1700 / 4];
    let regs = unsafe { MmioRegisters::new(mem.as_mut_ptr() as *mut u8, mem.len() * 4) };
    regs.write32(ALX_IMR, 0xDEAD_BEEF);
    assert_eq!(regs.read32(ALX_IMR), 0xDEAD_BEEF);
    regs.write16(ALX_TPD_PRI0_PIDX, 0x1234);
    assert_eq!(regs.read16(ALX_TPD_PRI0_PIDX), 0x1234);
    assert_eq!(regs.read32(0x1700), 0);
    regs.write32(0x1700, 1);
    assert_eq!(regs.read32(ALX_IMR + 1), 0);
    drop(regs);
    assert_eq!(mem[ALX_IMR as usize / 4], 0xDEAD_BEEF);
}


#[test]
fn attach_leaves_device_stopped() {
    let h = attach(small_config());
    assert!(!h.nic.is_running());
    assert_eq!(h.nic.link_status(), LinkState::Down);
    assert_eq!(h.nic.interrupts.disable_depth(), 1);
    assert_eq!(h.nic.interrupts.mask(), ALX_ISR_MISC);
    assert_eq!(h.nic.mac_address(), HwLog::default().perm_address);

    let hw = h.hw.lock().unwrap();
    assert_eq!(hw.calls, vec![
        "identify", "load_settings", "reset_pcie", "reset_phy", "reset_mac",
        "setup_speed_duplex", "permanent_mac_address", "identify_phy",
    ]);
    let settings = hw.settings.as_ref().unwrap();
    assert_eq!(settings.mtu, 1500);
    assert_eq!(settings.tx_interrupt_threshold, 8 / 3);
    assert_eq!(settings.dma_channels, 4);

    let dma = h.dma.lock().unwrap();
    assert_eq!(dma.allocs, 3);
    assert_eq!(dma.maps_created, 16);
}

#[test]
fn attach_skips_phy_setup_when_already_configured() {
    let hw = HwLog { phy_configured: true, ..HwLog::default() };
    let (result, hw, _dma) = try_attach(small_config(), hw, DmaLog::default());
    assert!(result.is_ok());
    let hw = hw.lock().unwrap();
    assert_eq!(hw.count("reset_phy"), 0);
    assert_eq!(hw.count("setup_speed_duplex"), 0);
}

#[test]
fn attach_rejects_unsupported_chip() {
    let mut hw = HwLog::default();
    hw.chip.device_id = 0x1234;
    let (result, hw, dma) = try_attach(small_config(), hw, DmaLog::default());
    assert_eq!(result.err(), Some(AttachError::UnsupportedChip { device_id: 0x1234, revision_id: 0x10 }));
    assert_eq!(hw.lock().unwrap().count("reset_mac"), 0);
    assert_eq!(dma.lock().unwrap().allocs, 0);
}

#[test]
fn attach_rejects_invalid_config() {
    let (result, hw, _dma) = try_attach(small_config().with_rx_ring_size(5000), HwLog::default(), DmaLog::default());
    assert_eq!(result.err(), Some(AttachError::InvalidConfig(ConfigError::RingSize(5000))));
    assert!(hw.lock().unwrap().calls.is_empty());
}

#[test]
fn attach_fails_when_mac_reset_fails() {
    let hw = HwLog { fail: Some("reset_mac"), ..HwLog::default() };
    let (result, _hw, dma) = try_attach(small_config(), hw, DmaLog::default());
    assert_eq!(result.err(), Some(AttachError::MacReset(HwError::Timeout)));
    assert_eq!(dma.lock().unwrap().allocs, 0);
}

#[test]
fn attach_fails_when_phy_is_unidentified() {
    let hw = HwLog { fail: Some("identify_phy"), ..HwLog::default() };
    let (result, _hw, _dma) = try_attach(small_config(), hw, DmaLog::default());
    assert_eq!(result.err(), Some(AttachError::PhyIdentification(HwError::Timeout)));
}

#[test]
fn attach_rejects_unusable_mac_addresses() {
    for mac in [[0u8; 6], [0x01, 0x00, 0x5E, 0x00, 0x00, 0x01]] {
        let hw = HwLog { perm_address: mac, ..HwLog::default() };
        let (result, _hw, _dma) = try_attach(small_config(), hw, DmaLog::default());
        assert_eq!(result.err(), Some(AttachError::InvalidMacAddress(mac)));
    }
    let (result, _hw, _dma) = try_attach(
        small_config().with_mac_address([0xFF; 6]),
        HwLog::default(),
        DmaLog::default(),
    );
    assert_eq!(result.err(), Some(AttachError::InvalidMacAddress([0xFF; 6])));
}

#[test]
fn attach_releases_dma_resources_on_failure() {
    // allocation 0 is the TPD ring, allocation 1 the RFD ring
    let dma = DmaLog { fail_alloc_at: Some(1), ..DmaLog::default() };
    let (result, _hw, dma) = try_attach(small_config(), HwLog::default(), dma);
    assert_eq!(result.err(), Some(AttachError::Dma(InitError::Dma(DmaError::OutOfMemory))));
    let dma = dma.lock().unwrap();
    assert_eq!(dma.allocs, 1);
    assert_eq!(dma.frees, 1);
    assert_eq!(dma.maps_created, 8);
    assert_eq!(dma.maps_destroyed, 8);
}

#[test]
fn configured_mac_address_overrides_permanent_one() {
    let mac = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    let h = started(small_config().with_mac_address(mac), LINK_DOWN);
    assert_eq!(h.nic.mac_address(), mac);
    assert_eq!(h.hw.lock().unwrap().mac_address, mac);
    h.nic.detach();
    assert_eq!(h.hw.lock().unwrap().mac_address, HwLog::default().perm_address);
}


#[test]
fn start_programs_rings_and_unmasks_interrupts() {
    let h = started(small_config(), LINK_DOWN);
    assert!(h.nic.is_running());
    assert!(h.nic.interrupts.is_enabled());
    let mask = ALX_ISR_MISC | ALX_ISR_PHY | ALX_ISR_IO;
    assert_eq!(h.nic.interrupts.mask(), mask);
    assert_eq!(h.regs.value(ALX_IMR), mask);
    assert_eq!(h.regs.writes_to(ALX_SRAM9), vec![ALX_SRAM_LOAD_PTR]);
    assert_eq!(h.regs.value(ALX_TPD_RING_SZ), 8);
    assert_eq!(h.regs.value(ALX_RFD_RING_SZ), 8);
    assert_eq!(h.regs.value(ALX_RFD_BUF_SZ), 1528);
    // one free-ring slot stays empty
    assert_eq!(h.regs.writes_to(ALX_RFD_PIDX), vec![7]);

    let hw = h.hw.lock().unwrap();
    assert_eq!(hw.count("configure_basic"), 1);
    assert_eq!(hw.rss_table_index, Some(0));
    assert_eq!(hw.count("start_mac"), 0);
}

#[test]
fn start_twice_is_a_no_op() {
    let h = started(small_config(), LINK_DOWN);
    let writes = h.regs.write_count();
    h.nic.start().unwrap();
    assert_eq!(h.regs.write_count(), writes);
    assert_eq!(h.nic.interrupts.disable_depth(), 0);
}

#[test]
fn stop_and_restart_keep_interrupts_balanced() {
    let h = started(small_config(), LINK_1000_FULL);
    h.nic.send(frame(1)).unwrap();
    h.nic.stop();
    h.nic.stop();
    assert!(!h.nic.is_running());
    assert_eq!(h.nic.interrupts.disable_depth(), 1);
    assert_eq!(h.regs.value(ALX_IMR), 0);
    assert_eq!(h.regs.value(ALX_ISR), ALX_ISR_DIS);

    h.nic.start().unwrap();
    assert_eq!(h.nic.interrupts.disable_depth(), 0);
    // the MAC reset on restart means the MAC has to be started again for the same link
    assert_eq!(h.hw.lock().unwrap().count("start_mac"), 2);
    let state = h.nic.state.lock();
    let tx = state.tx.as_ref().unwrap();
    assert_eq!(tx.ring.producer_index(), 0);
    assert_eq!(tx.pool.bound_count(), 0);
}

#[test]
fn link_lost_while_stopped_is_published_on_restart() {
    let h = started(small_config(), LINK_1000_FULL);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    h.nic.set_link_observer(Arc::new(move |link: LinkState| sink.lock().unwrap().push(link)));
    h.nic.stop();
    h.hw.lock().unwrap().link = LINK_DOWN;
    h.nic.start().unwrap();
    assert_eq!(h.nic.link_status(), LinkState::Down);
    assert_eq!(*events.lock().unwrap(), vec![LinkState::Down]);
}

#[test]
fn start_fails_when_mac_reset_fails() {
    let h = attach(small_config());
    h.hw.lock().unwrap().fail = Some("reset_mac");
    assert_eq!(h.nic.start(), Err(StartError::MacReset(HwError::Timeout)));
    assert!(!h.nic.is_running());
    assert_eq!(h.nic.interrupts.disable_depth(), 1);
}

#[test]
fn shutdown_quiesces_phy() {
    let h = started(small_config(), LINK_1000_FULL);
    h.nic.shutdown();
    assert!(!h.nic.is_running());
    assert_eq!(h.hw.lock().unwrap().count("clear_phy_interrupt"), 1);
}


#[test]
fn interrupt_enable_nests() {
    let regs = Arc::new(MockRegisters::default());
    let irq = InterruptController::new(Arc::clone(&regs));
    assert_eq!(irq.disable_depth(), 1);
    assert!(!irq.is_enabled());

    irq.add_causes(ALX_ISR_PHY);
    irq.enable();
    assert!(irq.is_enabled());
    assert_eq!(regs.writes_to(ALX_IMR), vec![ALX_ISR_MISC | ALX_ISR_PHY]);

    irq.disable();
    irq.disable();
    assert_eq!(irq.disable_depth(), 2);
    assert_eq!(regs.value(ALX_IMR), 0);

    irq.enable();
    assert!(!irq.is_enabled());
    assert_eq!(regs.value(ALX_IMR), 0);
    // restoring while disabled only touches the software mask
    irq.restore_causes(ALX_ISR_TX_Q0);
    assert_eq!(regs.value(ALX_IMR), 0);

    irq.enable();
    assert_eq!(regs.value(ALX_IMR), ALX_ISR_MISC | ALX_ISR_PHY | ALX_ISR_TX_Q0);
}

#[test]
fn mask_restore_racing_the_handler_leaves_hardware_in_sync() {
    let regs = Arc::new(MockRegisters::default());
    let irq = Arc::new(InterruptController::new(Arc::clone(&regs)));
    let tasks = Arc::new(DeferredTaskQueue::new());
    irq.add_causes(ALX_ISR_PHY | ALX_ISR_IO);
    irq.enable();
    regs.set(ALX_ISR, ALX_ISR_TX_Q0);
    assert_eq!(irq.handle_interrupt(&tasks), IrqResult::Handled);
    assert_eq!(irq.mask() & ALX_ISR_TX_Q0, 0);

    // a link change arrives after the I/O task updated imask but before its IMR write lands
    let (isr_irq, isr_tasks, isr_regs) = (Arc::clone(&irq), Arc::clone(&tasks), Arc::clone(&regs));
    regs.before_next_write(ALX_IMR, Box::new(move || {
        isr_regs.set(ALX_ISR, ALX_ISR_PHY);
        assert_eq!(isr_irq.handle_interrupt(&isr_tasks), IrqResult::Handled);
    }));
    irq.restore_causes(ALX_ISR_TX_Q0);

    assert_eq!(irq.mask(), ALX_ISR_MISC | ALX_ISR_IO);
    assert_eq!(regs.value(ALX_IMR), ALX_ISR_MISC | ALX_ISR_IO);
    assert!(tasks.is_pending(LINK_TASK));
    assert!(tasks.is_pending(IO_TASK));
}

#[test]
fn phy_interrupt_masks_cause_and_defers_link_task() {
    let h = started(small_config(), LINK_DOWN);
    let imr_writes = h.regs.writes_to(ALX_IMR).len();

    assert_eq!(raise(&h, 0x0001_0000), IrqResult::Handled);
    assert_eq!(h.nic.interrupts.mask() & ALX_ISR_PHY, 0);
    assert_eq!(h.nic.tasks.pending_count(), 1);
    assert!(h.nic.tasks.is_pending(LINK_TASK));
    let imr = h.regs.writes_to(ALX_IMR);
    assert_eq!(imr.len(), imr_writes + 1);
    assert_eq!(imr[imr_writes] & ALX_ISR_PHY, 0);
    let isr = h.regs.writes_to(ALX_ISR);
    assert_eq!(isr[isr.len() - 2..], [ALX_ISR_PHY | ALX_ISR_DIS, 0]);

    assert_eq!(h.nic.run_deferred_tasks(), 1);
    assert_ne!(h.nic.interrupts.mask() & ALX_ISR_PHY, 0);
    assert_ne!(h.regs.value(ALX_IMR) & ALX_ISR_PHY, 0);
    assert_eq!(h.hw.lock().unwrap().count("clear_phy_interrupt"), 1);
}

#[test]
fn foreign_interrupts_are_not_mine() {
    let h = started(small_config(), LINK_DOWN);
    assert_eq!(raise(&h, ALX_ISR_DIS | ALX_ISR_PHY), IrqResult::NotMine);
    assert_eq!(raise(&h, 1 << 3), IrqResult::NotMine);
    assert_eq!(raise(&h, 0), IrqResult::NotMine);
    assert_eq!(h.nic.tasks.pending_count(), 0);
    assert_eq!(h.nic.interrupts.mask(), ALX_ISR_MISC | ALX_ISR_PHY | ALX_ISR_IO);

    assert_eq!(raise(&h, ALX_ISR_TIMER), IrqResult::Handled);
    assert_eq!(h.nic.tasks.pending_count(), 0);

    let stats = h.nic.stats();
    assert_eq!(stats.interrupts_not_mine, 3);
    assert_eq!(stats.interrupts_handled, 1);
}

#[test]
fn stopped_device_ignores_interrupts() {
    let h = started(small_config(), LINK_DOWN);
    h.nic.stop();
    // stopping leaves the disable bit set in the status register
    assert_eq!(h.nic.handle_interrupt(), IrqResult::NotMine);
}


#[test]
fn link_up_starts_mac_once() {
    let h = started(small_config(), (true, 1003));
    assert_eq!(h.nic.link_status(), LinkState::Up { speed: 1000, duplex: 3 });
    let hw = h.hw.lock().unwrap();
    assert_eq!(hw.count("start_mac"), 1);
    assert_eq!(hw.count("enable_aspm"), 1);
    assert_eq!(hw.post_link_speed, Some(1000));
    assert_eq!(hw.aspm, Some((true, true)));
}

#[test]
fn unchanged_link_is_not_republished() {
    let h = started(small_config(), LINK_1000_FULL);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    h.nic.set_link_observer(Arc::new(move |link: LinkState| sink.lock().unwrap().push(link)));
    let calls = h.hw.lock().unwrap().calls.len();

    assert_eq!(raise(&h, ALX_ISR_PHY), IrqResult::Handled);
    h.nic.run_deferred_tasks();

    assert_eq!(h.nic.link_status(), LinkState::Up { speed: 1000, duplex: 2 });
    assert_eq!(h.hw.lock().unwrap().calls[calls..], ["clear_phy_interrupt", "get_link"]);

    // polling the same link again touches no register at all
    let writes = h.regs.write_count();
    let event = {
        let mut state = h.nic.state.lock();
        h.nic.update_link(&mut state)
    };
    assert!(event.is_none());
    assert_eq!(h.regs.write_count(), writes);
    assert_eq!(h.hw.lock().unwrap().calls[calls..], ["clear_phy_interrupt", "get_link", "get_link"]);
    assert_eq!(h.nic.link_status(), LinkState::Up { speed: 1000, duplex: 2 });
    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn link_changes_are_published_to_observer() {
    let h = started(small_config(), LINK_1000_FULL);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    h.nic.set_link_observer(Arc::new(move |link: LinkState| sink.lock().unwrap().push(link)));
    let resets = h.hw.lock().unwrap().count("reset_mac");

    h.hw.lock().unwrap().link = LINK_DOWN;
    raise(&h, ALX_ISR_PHY);
    h.nic.run_deferred_tasks();
    assert_eq!(h.nic.link_status(), LinkState::Down);
    {
        let hw = h.hw.lock().unwrap();
        assert_eq!(hw.count("reset_mac"), resets + 1);
        assert_eq!(hw.count("configure_basic"), 2);
        assert_eq!(hw.post_link_speed, Some(0));
        assert_eq!(hw.aspm, Some((false, true)));
    }
    assert_eq!(h.nic.interrupts.disable_depth(), 0);
    assert_eq!(h.regs.value(ALX_IMR), ALX_ISR_MISC | ALX_ISR_PHY | ALX_ISR_IO);

    h.hw.lock().unwrap().link = (true, 101);
    raise(&h, ALX_ISR_PHY);
    h.nic.run_deferred_tasks();

    assert_eq!(*events.lock().unwrap(), vec![LinkState::Down, LinkState::Up { speed: 100, duplex: 1 }]);
}

#[test]
fn link_down_with_failed_mac_reset_is_not_published() {
    let h = started(small_config(), LINK_1000_FULL);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    h.nic.set_link_observer(Arc::new(move |link: LinkState| sink.lock().unwrap().push(link)));
    {
        let mut hw = h.hw.lock().unwrap();
        hw.link = LINK_DOWN;
        hw.fail = Some("reset_mac");
    }
    raise(&h, ALX_ISR_PHY);
    h.nic.run_deferred_tasks();
    assert_eq!(h.nic.link_status(), LinkState::Down);
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(h.nic.interrupts.disable_depth(), 0);
}


#[test]
fn tx_ring_keeps_reserved_margin() {
    let h = started(small_config().with_tx_reserved_slots(2), LINK_1000_FULL);
    for i in 0..5 {
        h.nic.send(frame(i)).unwrap();
    }
    {
        let state = h.nic.state.lock();
        let tx = state.tx.as_ref().unwrap();
        assert_eq!(tx.ring.free_slots(), 1);
        assert_eq!(tx.ring.producer_index(), 5);
        assert_eq!(tx.pool.bound_count(), 5);
    }
    assert_eq!(h.regs.value(ALX_TPD_PRI0_PIDX), 5);

    h.nic.send(frame(5)).unwrap();
    match h.nic.send(frame(6)) {
        Err(TxError::Backpressure { frame, reason: BackpressureReason::RingFull }) => assert_eq!(frame.to_vec(), vec![6; 60]),
        other => panic!("expected backpressure, got {:?}", other),
    }
    assert_eq!(h.regs.value(ALX_TPD_PRI0_PIDX), 6);
}

#[test]
fn oversized_frame_gets_backpressure_without_touching_ring() {
    let h = started(small_config().with_max_tx_segments(4), LINK_1000_FULL);
    for i in 0..4 {
        h.nic.send(frame(i)).unwrap();
    }
    let before = tx_snapshot(&h.nic);
    let (loads, unloads) = {
        let dma = h.dma.lock().unwrap();
        (dma.loads, dma.unloads)
    };

    let three = Frame::from_fragments(vec![vec![1; 20], vec![2; 20], vec![3; 20]]);
    match h.nic.send(three) {
        Err(TxError::Backpressure { frame, reason: BackpressureReason::RingFull }) => assert_eq!(frame.fragment_count(), 3),
        other => panic!("expected backpressure, got {:?}", other),
    }

    assert_eq!(tx_snapshot(&h.nic), before);
    let state = h.nic.state.lock();
    let tx = state.tx.as_ref().unwrap();
    assert_eq!(tx.ring.producer_index(), 4);
    assert_eq!(tx.ring.free_slots(), 2);
    assert_eq!(tx.pool.bound_count(), 4);
    assert!(!tx.pool.mapping(4).unwrap().is_loaded());
    let dma = h.dma.lock().unwrap();
    assert_eq!(dma.loads - loads, 1);
    assert_eq!(dma.unloads - unloads, 1);
    drop(dma);
    assert_eq!(h.regs.value(ALX_TPD_PRI0_PIDX), 4);
}

#[test]
fn multi_segment_frame_uses_one_tpd_per_segment() {
    let h = started(small_config().with_max_tx_segments(4), LINK_1000_FULL);
    h.nic.send(Frame::from_fragments(vec![vec![1; 14], vec![2; 100], vec![3; 40]])).unwrap();
    let tpds = tx_snapshot(&h.nic);
    assert_eq!(tpds[0].1, 14);
    assert_eq!(tpds[1].1, 100);
    assert_eq!(tpds[2].1, 40);
    assert_eq!([tpds[0].2, tpds[1].2, tpds[2].2], [false, false, true]);

    // the frame and its loaded map live at the last TPD
    let state = h.nic.state.lock();
    let tx = state.tx.as_ref().unwrap();
    assert!(tx.pool.payload(0).is_none());
    assert_eq!(tx.pool.payload(2).unwrap().len(), 154);
    assert!(tx.pool.mapping(2).unwrap().is_loaded());
    assert_eq!(tx.pool.mapping(2).unwrap().owner(), 2);
    assert!(!tx.pool.mapping(0).unwrap().is_loaded());
}

#[test]
fn fragmented_frame_is_coalesced_once() {
    let h = started(small_config(), LINK_1000_FULL);
    let calls = h.dma.lock().unwrap().load_calls;
    h.nic.send(Frame::from_fragments(vec![vec![1; 10], vec![2; 10], vec![3; 10]])).unwrap();
    assert_eq!(h.dma.lock().unwrap().load_calls - calls, 2);

    let tpds = tx_snapshot(&h.nic);
    assert_eq!((tpds[0].1, tpds[0].2), (30, true));
    let state = h.nic.state.lock();
    let sent = state.tx.as_ref().unwrap().pool.payload(0).unwrap();
    assert_eq!(sent.fragment_count(), 1);
    assert_eq!(sent.to_vec()[9..11], [1, 2]);
}

#[test]
fn coalesce_that_still_does_not_fit_drops_frame() {
    let h = started(small_config(), LINK_1000_FULL);
    h.dma.lock().unwrap().always_too_many = true;
    let calls = h.dma.lock().unwrap().load_calls;

    let result = h.nic.send(Frame::from_fragments(vec![vec![0xAA; 30], vec![0xBB; 30]]));
    assert!(matches!(result, Err(TxError::Fatal(TxFault::TooManyFragments))));
    assert_eq!(h.dma.lock().unwrap().load_calls - calls, 2);
    assert_eq!(h.regs.writes_to(ALX_TPD_PRI0_PIDX), vec![0]);
    assert_eq!(h.nic.stats().tx_dropped, 1);
}

#[test]
fn map_exhaustion_is_backpressure() {
    let h = started(small_config(), LINK_1000_FULL);
    h.dma.lock().unwrap().fail_load = Some(LoadError::NoResources);
    assert!(matches!(
        h.nic.send(frame(1)),
        Err(TxError::Backpressure { reason: BackpressureReason::MapResources, .. })
    ));
    h.dma.lock().unwrap().fail_load = Some(LoadError::Unmappable);
    assert!(matches!(h.nic.send(frame(2)), Err(TxError::Fatal(TxFault::Unmappable))));
}

#[test]
fn send_needs_running_device_and_link() {
    let h = attach(small_config());
    assert!(matches!(
        h.nic.send(frame(1)),
        Err(TxError::Backpressure { reason: BackpressureReason::NotRunning, .. })
    ));
    h.nic.start().unwrap();
    match h.nic.send(frame(2)) {
        Err(e @ TxError::Backpressure { reason: BackpressureReason::LinkDown, .. }) => assert!(e.is_backpressure()),
        other => panic!("expected link-down backpressure, got {:?}", other),
    }
    assert_eq!(h.nic.stats().tx_backpressure, 2);
    assert_eq!(h.dma.lock().unwrap().loads, 7);
}

#[test]
fn transmit_queue_stops_at_backpressure_in_order() {
    let h = started(small_config(), LINK_1000_FULL);
    let mut queue: VecDeque<Frame> = (0..8).map(frame).collect();
    assert_eq!(h.nic.transmit_queue(&mut queue), 6);
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].to_vec()[0], 6);
    assert_eq!(queue[1].to_vec()[0], 7);
    let stats = h.nic.stats();
    assert_eq!(stats.tx_frames, 6);
    assert_eq!(stats.tx_backpressure, 1);
}

#[test]
fn transmit_queue_skips_dropped_frames() {
    let h = started(small_config(), LINK_1000_FULL);
    h.dma.lock().unwrap().always_too_many = true;
    let mut queue: VecDeque<Frame> = (0..3).map(frame).collect();
    assert_eq!(h.nic.transmit_queue(&mut queue), 3);
    assert!(queue.is_empty());
    assert_eq!(h.nic.stats().tx_dropped, 3);
}

#[test]
fn transmit_queue_waits_for_link() {
    let h = started(small_config(), LINK_DOWN);
    let mut queue: VecDeque<Frame> = (0..3).map(frame).collect();
    assert_eq!(NetworkInterfaceCard::transmit_queue(&*h.nic, &mut queue), 0);
    assert_eq!(queue.len(), 3);
}

#[test]
fn completed_frames_are_reclaimed() {
    let h = started(small_config(), LINK_1000_FULL);
    for i in 0..3 {
        h.nic.send(frame(i)).unwrap();
    }
    h.regs.set(ALX_TPD_PRI0_CIDX, 2);
    assert_eq!(h.nic.poll_receive(), 0);
    assert_eq!(h.nic.stats().tx_completions, 2);
    let state = h.nic.state.lock();
    let tx = state.tx.as_ref().unwrap();
    assert_eq!(tx.ring.consumer_index(), 2);
    assert_eq!(tx.ring.in_use(), 1);
    assert_eq!(tx.pool.bound_count(), 1);
}

#[test]
fn bogus_consumer_index_is_ignored() {
    let h = started(small_config(), LINK_1000_FULL);
    h.nic.send(frame(1)).unwrap();
    h.regs.set(ALX_TPD_PRI0_CIDX, 5);
    h.nic.poll_receive();
    h.regs.set(ALX_TPD_PRI0_CIDX, 100);
    h.nic.poll_receive();
    assert_eq!(h.nic.stats().tx_completions, 0);
    assert_eq!(h.nic.state.lock().tx.as_ref().unwrap().ring.in_use(), 1);
}

#[test]
fn io_interrupt_reclaims_and_restores_mask() {
    let h = started(small_config(), LINK_1000_FULL);
    h.nic.send(frame(1)).unwrap();
    h.regs.set(ALX_TPD_PRI0_CIDX, 1);

    assert_eq!(raise(&h, ALX_ISR_TX_Q0), IrqResult::Handled);
    assert_eq!(h.nic.interrupts.mask() & ALX_ISR_TX_Q0, 0);
    assert_ne!(h.nic.interrupts.mask() & ALX_ISR_RX_Q0, 0);
    assert!(h.nic.tasks.is_pending(IO_TASK));

    assert_eq!(h.nic.run_deferred_tasks(), 1);
    assert_eq!(h.nic.stats().tx_completions, 1);
    assert_eq!(h.nic.interrupts.mask(), ALX_ISR_MISC | ALX_ISR_PHY | ALX_ISR_IO);
    assert_eq!(h.regs.value(ALX_IMR), ALX_ISR_MISC | ALX_ISR_PHY | ALX_ISR_IO);
}


#[test]
fn received_frame_is_delivered_and_buffer_reposted() {
    let h = started(small_config(), LINK_1000_FULL);
    {
        let mut state = h.nic.state.lock();
        let rx = state.rx.as_mut().unwrap();
        assert_eq!(rx.free.producer_index(), 7);
        assert_eq!(rx.pool.bound_count(), 7);
        let buffer = rx.pool.payload_mut(0).unwrap();
        buffer.fragments_mut()[0][..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        *rx.ret.descriptor_mut(0).unwrap() = RrdDesc::written_back(0, 1, 64 + 4);
    }

    assert_eq!(h.nic.poll_receive(), 1);
    let received = h.nic.get_received_frame().unwrap();
    assert_eq!(received.len(), 64);
    assert_eq!(received.to_vec()[..4], [0xDE, 0xAD, 0xBE, 0xEF]);
    assert!(h.nic.get_received_frame().is_none());
    assert_eq!(h.nic.stats().rx_frames, 1);

    let state = h.nic.state.lock();
    let rx = state.rx.as_ref().unwrap();
    assert_eq!(rx.free.consumer_index(), 1);
    assert_eq!(rx.free.producer_index(), 0);
    assert_eq!(rx.pool.bound_count(), 7);
    assert_eq!(rx.ret.consumer_index(), 1);
    assert!(!rx.ret.descriptor(0).unwrap().updated());
    drop(state);
    assert_eq!(h.regs.writes_to(ALX_RFD_PIDX), vec![7, 0]);
}

#[test]
fn received_frame_may_span_buffers() {
    let h = started(small_config(), LINK_1000_FULL);
    {
        let mut state = h.nic.state.lock();
        let rx = state.rx.as_mut().unwrap();
        rx.pool.payload_mut(1).unwrap().fragments_mut()[0][0] = 0x42;
        *rx.ret.descriptor_mut(0).unwrap() = RrdDesc::written_back(0, 2, 2000);
    }
    assert_eq!(h.nic.poll_receive(), 1);
    let received = h.nic.get_received_frame().unwrap();
    assert_eq!(received.len(), 1996);
    assert_eq!(received.fragment_count(), 2);
    assert_eq!(received.to_vec()[1528], 0x42);
}

#[test]
fn errored_frame_is_dropped() {
    let h = started(small_config(), LINK_1000_FULL);
    {
        let mut state = h.nic.state.lock();
        let rx = state.rx.as_mut().unwrap();
        let mut rrd = RrdDesc::written_back(0, 1, 64);
        rrd.word3.set(rrd.word3.get() | 1 << RRD_ERR_FCS_SHIFT);
        *rx.ret.descriptor_mut(0).unwrap() = rrd;
    }
    assert_eq!(h.nic.poll_receive(), 0);
    assert!(h.nic.get_received_frame().is_none());
    let stats = h.nic.stats();
    assert_eq!(stats.rx_errors, 1);
    assert_eq!(stats.rx_frames, 0);
    assert_eq!(h.nic.state.lock().rx.as_ref().unwrap().pool.bound_count(), 7);
}

#[test]
fn return_descriptor_naming_unposted_buffers_is_dropped() {
    let h = started(small_config(), LINK_1000_FULL);
    {
        let mut state = h.nic.state.lock();
        let rx = state.rx.as_mut().unwrap();
        // more RFDs than are posted, the wrong start, and no RFDs at all
        *rx.ret.descriptor_mut(0).unwrap() = RrdDesc::written_back(0, 9, 64);
        *rx.ret.descriptor_mut(1).unwrap() = RrdDesc::written_back(3, 1, 64);
        *rx.ret.descriptor_mut(2).unwrap() = RrdDesc::written_back(0, 0, 64);
        *rx.ret.descriptor_mut(3).unwrap() = RrdDesc::written_back(0, 1, 64 + 4);
    }

    assert_eq!(h.nic.poll_receive(), 1);
    assert_eq!(h.nic.get_received_frame().unwrap().len(), 64);
    let stats = h.nic.stats();
    assert_eq!(stats.rx_errors, 3);
    assert_eq!(stats.rx_frames, 1);

    let state = h.nic.state.lock();
    let rx = state.rx.as_ref().unwrap();
    assert_eq!(rx.ret.consumer_index(), 4);
    assert_eq!(rx.free.consumer_index(), 1);
    assert_eq!(rx.free.in_use(), 7);
    assert_eq!(rx.pool.bound_count(), 7);
}

#[test]
fn failed_refill_never_advances_producer() {
    let h = attach(small_config());
    h.dma.lock().unwrap().fail_load = Some(LoadError::NoResources);
    h.nic.start().unwrap();
    {
        let state = h.nic.state.lock();
        let rx = state.rx.as_ref().unwrap();
        assert_eq!(rx.free.producer_index(), 0);
        assert_eq!(rx.pool.bound_count(), 0);
    }
    assert!(h.regs.writes_to(ALX_RFD_PIDX).is_empty());
    assert_eq!(h.nic.stats().rx_refill_failures, 1);

    h.dma.lock().unwrap().fail_load = None;
    h.nic.poll_receive();
    assert_eq!(h.regs.writes_to(ALX_RFD_PIDX), vec![7]);
}


#[test]
fn detach_releases_everything() {
    let h = started(small_config(), LINK_1000_FULL);
    h.nic.send(frame(1)).unwrap();
    h.nic.send(Frame::from_fragments(vec![vec![1; 10], vec![2; 10]])).unwrap();
    raise(&h, ALX_ISR_PHY);

    h.nic.detach();
    assert!(h.nic.tasks.is_shutting_down());
    assert!(h.nic.tasks.is_idle());
    assert!(!h.nic.is_running());
    assert_eq!(h.nic.interrupts.disable_depth(), 1);
    assert_eq!(h.nic.start(), Err(StartError::Detached));
    assert_eq!(h.nic.handle_interrupt(), IrqResult::NotMine);

    let dma = h.dma.lock().unwrap();
    assert_eq!(dma.allocs, dma.frees);
    assert_eq!(dma.maps_created, dma.maps_destroyed);
    assert_eq!(dma.loads, dma.unloads);
}

#[test]
fn dropping_the_device_releases_dma_resources() {
    let h = attach(small_config());
    let dma = Arc::clone(&h.dma);
    drop(h);
    let dma = dma.lock().unwrap();
    assert_eq!(dma.allocs, 3);
    assert_eq!(dma.frees, 3);
    assert_eq!(dma.maps_destroyed, 16);
}

#[test]
fn worker_thread_runs_deferred_tasks() {
    let h = started(small_config(), LINK_DOWN);
    let worker = h.nic.spawn_deferred_worker().unwrap();
    assert!(h.nic.spawn_deferred_worker().is_err());

    h.hw.lock().unwrap().link = LINK_1000_FULL;
    assert_eq!(raise(&h, ALX_ISR_PHY), IrqResult::Handled);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !h.nic.link_status().is_up() {
        assert!(Instant::now() < deadline, "link task never ran");
        thread::sleep(Duration::from_millis(1));
    }
    h.nic.detach();
    worker.join().unwrap();
}

#[test]
fn last_reference_dropped_during_a_deferred_task_still_tears_down() {
    let h = started(small_config(), LINK_DOWN);
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    h.nic.set_link_observer(Arc::new(move |_link: LinkState| {
        let _ = entered_tx.lock().unwrap().send(());
        let _ = release_rx.lock().unwrap().recv();
    }));
    let worker = h.nic.spawn_deferred_worker().unwrap();

    h.hw.lock().unwrap().link = LINK_1000_FULL;
    assert_eq!(raise(&h, ALX_ISR_PHY), IrqResult::Handled);
    entered_rx.recv_timeout(Duration::from_secs(5)).expect("link task never ran");

    // the worker now holds the only reference
    let Harness { nic, dma, .. } = h;
    drop(nic);
    release_tx.send(()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !worker.is_finished() {
        assert!(Instant::now() < deadline, "worker stuck after the device was dropped");
        thread::sleep(Duration::from_millis(1));
    }
    worker.join().unwrap();
    let dma = dma.lock().unwrap();
    assert_eq!(dma.allocs, dma.frees);
    assert_eq!(dma.maps_created, dma.maps_destroyed);
    assert_eq!(dma.loads, dma.unloads);
}
