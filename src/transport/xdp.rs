//! AF_XDP transport.
//!
//! Frames bypass the kernel stack, so no software or hardware stamps are
//! available; only the driver's application stamps are recorded.

use super::{Received, Transport, TxStamps};
use crate::bpf::{XdpAttachment, XdpLoader};
use crate::config::{MacAddr, Mode, RunConfig, RunOption, TransportKind};
use crate::packet::{self, EthernetHeader};
use crate::transport::sys::{self, CaptureStamps};
use crate::xsk::{XskConfig, XskSocket};
use crate::{Error, Result};
use log::{debug, info};
use std::os::unix::io::AsRawFd;

/// Zero-copy transport. The program attachment is declared first so the
/// kernel stops redirecting into the socket before the socket goes away.
pub struct XdpTransport {
    attachment: Option<XdpAttachment>,
    socket: Option<XskSocket>,
    dst: Option<MacAddr>,
    src: MacAddr,
    ethertype: u16,
    wait: bool,
    scratch: Vec<u8>,
}

impl XdpTransport {
    pub fn open(config: &RunConfig, loader: &dyn XdpLoader) -> Result<Self> {
        let ifname = config
            .interface
            .as_deref()
            .ok_or_else(|| Error::Config("For XDP sockets, dev has to be specified".into()))?;
        let queue = config.queue.unwrap_or(0);

        let src = {
            let query = sys::socket(libc::AF_INET, libc::SOCK_DGRAM, 0)?;
            sys::if_hwaddr(query.as_raw_fd(), ifname)?
        };

        let socket = XskSocket::open(&XskConfig::new(ifname, queue).with_zero_copy(config.zero_copy))?;

        // transmit-only runs never need frames steered to the socket
        let attachment = if config.mode != Mode::TransmitLatency {
            let attachment = loader.attach(ifname, queue)?;
            attachment.register(queue, socket.fd())?;
            Some(attachment)
        } else {
            debug!("Skipping XDP program in {} mode", config.mode);
            None
        };

        info!(
            "XDP transport on {} queue {} ({} mode)",
            ifname,
            queue,
            if socket.is_zero_copy() { "zero-copy" } else { "copy" }
        );

        Ok(Self {
            attachment,
            socket: Some(socket),
            dst: config.address.and_then(|a| a.mac()),
            src,
            ethertype: packet::ethertype(config.packet_type.payload()),
            wait: !config.has_option(RunOption::SoftwarePoll),
            scratch: Vec::with_capacity(packet::MAX_FRAME_SIZE),
        })
    }

    fn socket(&mut self) -> Result<&mut XskSocket> {
        self.socket
            .as_mut()
            .ok_or_else(|| Error::Resource("XDP socket is closed".into()))
    }
}

impl Transport for XdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ZeroCopy
    }

    fn send(&mut self, payload: &[u8]) -> Result<usize> {
        let dst = self
            .dst
            .ok_or_else(|| Error::Config("no destination address".into()))?;
        let header = EthernetHeader {
            dst,
            src: self.src,
            ethertype: self.ethertype,
        };
        let mut frame = std::mem::take(&mut self.scratch);
        frame.clear();
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);
        let result = self.socket().and_then(|s| s.send(&frame));
        self.scratch = frame;
        result
    }

    fn receive(&mut self) -> Result<Option<Received<'_>>> {
        let wait = self.wait;
        let socket = self.socket()?;
        let desc = match socket.receive(wait)? {
            Some(desc) => desc,
            None => return Ok(None),
        };
        Ok(Some(Received {
            payload: socket.data(&desc)?,
            stamps: CaptureStamps::default(),
        }))
    }

    fn reply(&mut self) -> Result<usize> {
        self.socket()?.reply()
    }

    fn tx_timestamps(&mut self) -> Result<TxStamps> {
        Ok(TxStamps::default())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(attachment) = self.attachment.take() {
            attachment.detach()?;
        }
        if self.socket.take().is_some() {
            debug!("XDP socket closed");
        }
        Ok(())
    }
}
