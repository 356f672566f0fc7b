//! Link state tracking: polling the PHY after a link-change interrupt
//! and reconfiguring the MAC for the new link.

use atheros_ethernet::types::{Capabilities, LinkState, SPEED_0};
use nic_buffers::DmaEngine;
use crate::{AlxHardware, AlxNic, AlxState, LinkObserver, RegisterBlock};
use crate::regs::ALX_ISR_PHY;


/// A link change to be reported to the observer once the device lock is released.
#[must_use]
pub(crate) struct LinkEvent {
    link: LinkState,
    observer: Option<LinkObserver>,
}

impl LinkEvent {
    pub(crate) fn publish(self) {
        if let Some(observer) = self.observer {
            observer(self.link);
        }
    }
}

impl<R, H, D> AlxNic<R, H, D>
    where R: RegisterBlock,
          H: AlxHardware,
          D: DmaEngine,
{
    /// The deferred task for [`ALX_ISR_PHY`]: acknowledges the PHY, unmasks its interrupt
    /// and picks up whatever link change it signalled.
    pub(crate) fn link_task(&self) {
        let event = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Err(e) = state.hw.clear_phy_interrupt() {
                warn!("alx: failed to clear PHY interrupt: {}", e);
            }
            self.interrupts.restore_causes(ALX_ISR_PHY);
            self.update_link(state)
        };
        if let Some(event) = event {
            event.publish();
        }
    }

    /// Polls the PHY and brings the MAC in line with the link it reports.
    ///
    /// Returns the event to publish, or `None` if nothing changed:
    /// the link stayed down, stayed up at the same speed and duplex, or the device isn't running.
    pub(crate) fn update_link(&self, state: &mut AlxState<H, D>) -> Option<LinkEvent> {
        let (up, speed_code) = match state.hw.get_link() {
            Ok(link) => link,
            Err(e) => {
                warn!("alx: failed to read link state: {}", e);
                return None;
            }
        };
        let was_up = state.link.is_up();
        if (!up && !was_up) || !state.running {
            return None;
        }
        let caps = state.capabilities;

        if up {
            if was_up && state.link.speed_code() == speed_code {
                return None;
            }
            let link = LinkState::from_speed_code(speed_code);
            state.link = link;
            state.hw.post_link_configure(link.speed(), caps.contains(Capabilities::AZ));
            state.hw.enable_aspm(caps.contains(Capabilities::L0S), caps.contains(Capabilities::L1));
            state.hw.start_mac();
            info!("alx: link {}", link);
        } else {
            state.link = LinkState::Down;
            if let Err(e) = state.hw.reset_mac() {
                error!("alx: failed to reset MAC after link down: {}", e);
                return None;
            }
            self.interrupts.disable();
            state.hw.configure_basic();
            state.hw.configure_rss(state.config.rss_table_index);
            state.hw.enable_aspm(false, caps.contains(Capabilities::L1));
            state.hw.post_link_configure(SPEED_0, caps.contains(Capabilities::AZ));
            self.interrupts.enable();
            info!("alx: link down");
        }

        Some(Self::link_event(state))
    }

    /// Captures the current link state and observer for publishing after the lock is released.
    pub(crate) fn link_event(state: &AlxState<H, D>) -> LinkEvent {
        LinkEvent {
            link: state.link,
            observer: state.link_observer.clone(),
        }
    }
}
