#![no_std]

extern crate alloc;

use alloc::collections::VecDeque;
use nic_buffers::Frame;


/// A trait that defines the necessary minimum functions that all network interface card (NIC) drivers
/// should implement.
///
/// Every method takes `&self`: drivers are shared between the network stack,
/// their interrupt handler and their deferred tasks, and synchronize internally.
pub trait NetworkInterfaceCard {
    /// The outcome of a failed [`NetworkInterfaceCard::send_frame()`].
    type SendError;
    /// The snapshot returned by [`NetworkInterfaceCard::link_status()`].
    type LinkStatus: Copy;
    /// The outcome of a failed [`NetworkInterfaceCard::start()`].
    type StartError;

    /// Hands the given `frame` to the hardware for transmission.
    /// Never blocks: the frame is either on the transmit ring when this returns,
    /// or an error says whether the caller should keep it and retry later.
    fn send_frame(&self, frame: Frame) -> Result<(), Self::SendError>;

    /// Sends frames from the front of `queue` until it is empty or the NIC can take no more.
    /// A frame that could not be sent for now stays at the front of `queue`, keeping the order.
    ///
    /// Returns the number of frames that left `queue`, sent or dropped.
    fn transmit_queue(&self, queue: &mut VecDeque<Frame>) -> usize;

    /// Returns the earliest received frame, if any.
    fn get_received_frame(&self) -> Option<Frame>;

    /// Poll the NIC for received frames and reclaim completed transmit buffers.
    /// Can be used as an alternative to interrupts, or as a supplement to interrupts.
    ///
    /// Returns the number of newly-received frames.
    fn poll_receive(&self) -> usize;

    /// Returns the most recently published link state.
    fn link_status(&self) -> Self::LinkStatus;

    /// Returns the MAC address that this NIC is configured with.
    fn mac_address(&self) -> [u8; 6];

    /// Brings the interface up: programs the rings and enables interrupts.
    fn start(&self) -> Result<(), Self::StartError>;

    /// Takes the interface down. Frames already on the rings stay there until the next start.
    fn stop(&self);
}
