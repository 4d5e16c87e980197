//! Packet transports.
//!
//! Every socket family is driven through the same [`Transport`] trait so the
//! mode driver never needs to know whether a frame travelled through the
//! kernel stack or through AF_XDP rings. Differences in timestamp retrieval
//! stay behind the trait: variants that cannot capture a stamp simply leave
//! it `None`.

pub mod sys;

mod datagram;
mod link;
mod xdp;

pub use datagram::DatagramTransport;
pub use link::PacketTransport;
pub use sys::{CaptureStamps, TxStamps};
pub use xdp::XdpTransport;

use crate::bpf::XdpLoader;
use crate::config::{RunConfig, RunOption, TransportKind};
use crate::Result;
use std::time::Duration;

/// How long tx timestamp collection waits for the error queue.
pub const TX_TIMESTAMP_TIMEOUT_MS: libc::c_int = 100;

/// How long a blocking receive sleeps before reporting that nothing arrived.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// A received packet, borrowed from the transport until the next call.
#[derive(Debug)]
pub struct Received<'a> {
    /// Bytes the socket returned (see [`crate::packet::rx_overhead`])
    pub payload: &'a [u8],
    pub stamps: CaptureStamps,
}

/// Send/receive capability shared by all socket families.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Sends one payload to the configured destination.
    fn send(&mut self, payload: &[u8]) -> Result<usize>;

    /// Waits for the next packet.
    ///
    /// `Ok(None)` means nothing arrived within the receive period (or at
    /// once, in software polling mode); callers retry.
    fn receive(&mut self) -> Result<Option<Received<'_>>>;

    /// Sends the last received packet back towards its origin.
    fn reply(&mut self) -> Result<usize>;

    /// Capture timestamps of the last send.
    fn tx_timestamps(&mut self) -> Result<TxStamps>;

    /// Releases the socket early. Dropping the transport does the same.
    fn close(&mut self) -> Result<()>;
}

/// `recvmsg` flags for the configured socket mode.
pub(crate) fn receive_flags(config: &RunConfig) -> libc::c_int {
    if config.has_option(RunOption::SoftwarePoll) {
        libc::MSG_DONTWAIT
    } else {
        0
    }
}

/// Where an echo goes: back to whoever sent the packet, or to the configured
/// address when the sender is unknown.
pub(crate) fn echo_destination<A>(last_source: Option<A>, configured: Option<A>) -> Option<A> {
    last_source.or(configured)
}

/// Opens the transport for a validated configuration.
///
/// `loader` is only consulted by zero-copy receive modes.
pub fn open(config: &RunConfig, loader: &dyn XdpLoader) -> Result<Box<dyn Transport>> {
    Ok(match config.transport() {
        TransportKind::Datagram => Box::new(DatagramTransport::open(config)?),
        TransportKind::LinkLayer | TransportKind::Raw => Box::new(PacketTransport::open(config)?),
        TransportKind::ZeroCopy => Box::new(XdpTransport::open(config, loader)?),
    })
}
