//! AF_PACKET transports.
//!
//! `SOCK_DGRAM` leaves the Ethernet header to the kernel and is addressed by
//! MAC per send; `SOCK_RAW` sees whole frames, so the header is written (and
//! on receive, returned) here.

use super::{echo_destination, receive_flags, sys, Received, Transport, TxStamps};
use super::{RECEIVE_TIMEOUT, TX_TIMESTAMP_TIMEOUT_MS};
use crate::config::{MacAddr, Mode, RunConfig, TransportKind};
use crate::packet::{self, EthernetHeader, ETH_ALEN, ETH_HLEN};
use crate::{Error, Result};
use log::{debug, info};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

const RECV_BUF_LEN: usize = 2048;

pub struct PacketTransport {
    fd: Option<OwnedFd>,
    kind: TransportKind,
    ifindex: i32,
    ethertype: u16,
    dst: Option<MacAddr>,
    src: MacAddr,
    last_source: Option<MacAddr>,
    want_hw: bool,
    sched_depth: usize,
    tx_keys: sys::TxKeys,
    recv_flags: libc::c_int,
    buf: Vec<u8>,
    last_len: usize,
    frame: Vec<u8>,
}

fn sockaddr_ll(ifindex: i32, ethertype: u16, mac: Option<MacAddr>) -> libc::sockaddr_ll {
    // SAFETY: sockaddr_ll is plain old data.
    let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as u16;
    sll.sll_protocol = ethertype.to_be();
    sll.sll_ifindex = ifindex;
    if let Some(mac) = mac {
        sll.sll_halen = ETH_ALEN as u8;
        sll.sll_addr[..ETH_ALEN].copy_from_slice(&mac.octets());
    }
    sll
}

fn add_membership(fd: RawFd, ifindex: i32, group: MacAddr) -> Result<()> {
    // SAFETY: packet_mreq is plain old data.
    let mut mreq: libc::packet_mreq = unsafe { mem::zeroed() };
    mreq.mr_ifindex = ifindex;
    mreq.mr_type = libc::PACKET_MR_MULTICAST as u16;
    mreq.mr_alen = ETH_ALEN as u16;
    mreq.mr_address[..ETH_ALEN].copy_from_slice(&group.octets());
    sys::setsockopt(fd, libc::SOL_PACKET, libc::PACKET_ADD_MEMBERSHIP, &mreq)
        .map_err(|e| Error::resource("PACKET_ADD_MEMBERSHIP", e))?;
    info!("Listening to multicast address {}", group);
    Ok(())
}

impl PacketTransport {
    pub fn open(config: &RunConfig) -> Result<Self> {
        let kind = config.transport();
        let sock_type = match kind {
            TransportKind::LinkLayer => libc::SOCK_DGRAM,
            TransportKind::Raw => libc::SOCK_RAW,
            other => {
                return Err(Error::Config(format!(
                    "{:?} is not an AF_PACKET transport",
                    other
                )))
            }
        };
        let ifname = config
            .interface
            .as_deref()
            .ok_or_else(|| Error::Config("packet sockets need an interface".into()))?;
        let ifindex = sys::if_index(ifname)? as i32;
        let ethertype = packet::ethertype(config.packet_type.payload());
        let mode = config.mode;

        let fd = sys::socket(libc::AF_PACKET, sock_type, i32::from(ethertype.to_be()))?;
        let raw = fd.as_raw_fd();

        let local = sockaddr_ll(ifindex, ethertype, None);
        // SAFETY: `local` is a valid sockaddr_ll of the size passed.
        let ret = unsafe {
            libc::bind(
                raw,
                &local as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::resource(
                &format!("bind to {}", ifname),
                io::Error::last_os_error(),
            ));
        }

        sys::apply_common_options(raw, config.priority, config.busy_poll)?;
        let src = sys::if_hwaddr(raw, ifname)?;
        let dst = config.address.and_then(|a| a.mac());

        let receives = mode.captures_rx() || mode == Mode::ReceiveRate;
        if let Some(group) = dst.filter(|mac| receives && mac.is_multicast()) {
            add_membership(raw, ifindex, group)?;
        }

        let mut want_hw = false;
        if mode.captures_tx() || mode.captures_rx() {
            if config.wants_hw_timestamps() {
                want_hw = sys::enable_hw_timestamps(raw, ifname);
            }
            sys::enable_timestamping(raw, want_hw, config.dev_deep > 0)?;
        }

        let recv_flags = receive_flags(config);
        if receives && recv_flags == 0 {
            sys::set_receive_timeout(raw, RECEIVE_TIMEOUT)?;
        }

        debug!(
            "{:?} packet socket on {} ({}), ethertype {:#06x}",
            kind, ifname, src, ethertype
        );

        Ok(Self {
            fd: Some(fd),
            kind,
            ifindex,
            ethertype,
            dst,
            src,
            last_source: None,
            want_hw,
            sched_depth: config.dev_deep as usize,
            tx_keys: sys::TxKeys::new(),
            recv_flags,
            buf: vec![0u8; RECV_BUF_LEN],
            last_len: 0,
            frame: Vec::with_capacity(RECV_BUF_LEN),
        })
    }

    fn raw_fd(&self) -> Result<RawFd> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| Error::Resource("packet socket is closed".into()))
    }

    fn send_frame(&self, bytes: &[u8], dst: MacAddr) -> Result<usize> {
        let fd = self.raw_fd()?;
        let addr = sockaddr_ll(self.ifindex, self.ethertype, Some(dst));
        // SAFETY: `bytes` and `addr` are live for the call.
        let ret = unsafe {
            libc::sendto(
                fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Sample(format!(
                "sendto {}: {}",
                dst,
                io::Error::last_os_error()
            )));
        }
        let sent = ret as usize;
        if sent != bytes.len() {
            return Err(Error::Sample(format!(
                "short write: {} of {} bytes",
                sent,
                bytes.len()
            )));
        }
        Ok(sent)
    }
}

impl Transport for PacketTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn send(&mut self, payload: &[u8]) -> Result<usize> {
        let dst = self
            .dst
            .ok_or_else(|| Error::Config("no destination address".into()))?;
        if self.kind == TransportKind::LinkLayer {
            let result = self.send_frame(payload, dst);
            self.tx_keys.record_send(result.is_ok());
            return result;
        }

        let header = EthernetHeader {
            dst,
            src: self.src,
            ethertype: self.ethertype,
        };
        let mut frame = mem::take(&mut self.frame);
        frame.clear();
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);
        let result = self.send_frame(&frame, dst);
        self.frame = frame;
        self.tx_keys.record_send(result.is_ok());
        result
    }

    fn receive(&mut self) -> Result<Option<Received<'_>>> {
        let fd = self.raw_fd()?;
        let outcome = match sys::recv_timestamped(fd, &mut self.buf, self.recv_flags)? {
            Some(outcome) => outcome,
            None => return Ok(None),
        };
        if outcome.source.as_ref().is_some_and(sys::is_outgoing) {
            return Ok(None);
        }

        self.last_len = 0;
        self.last_len = outcome.checked_len(self.buf.len())?;
        let source = match self.kind {
            TransportKind::Raw => EthernetHeader::from_bytes(&self.buf[..self.last_len]).map(|h| h.src),
            _ => outcome.source.as_ref().and_then(sys::sockaddr_ll_mac),
        };
        if source.is_some() {
            self.last_source = source;
        }
        Ok(Some(Received {
            payload: &self.buf[..self.last_len],
            stamps: outcome.stamps,
        }))
    }

    fn reply(&mut self) -> Result<usize> {
        if self.last_len == 0 {
            return Err(Error::Sample("no received packet to echo".into()));
        }
        let dst = echo_destination(self.last_source, self.dst)
            .ok_or_else(|| Error::Sample("nowhere to echo to".into()))?;

        if self.kind == TransportKind::Raw {
            if self.last_len < ETH_HLEN {
                return Err(Error::Sample("runt frame".into()));
            }
            let mut frame = mem::take(&mut self.buf);
            // turn the frame around; a multicast destination must not become our source
            frame[..ETH_ALEN].copy_from_slice(&dst.octets());
            frame[ETH_ALEN..2 * ETH_ALEN].copy_from_slice(&self.src.octets());
            let result = self.send_frame(&frame[..self.last_len], dst);
            self.buf = frame;
            self.tx_keys.record_send(result.is_ok());
            return result;
        }

        let buf = mem::take(&mut self.buf);
        let result = self.send_frame(&buf[..self.last_len], dst);
        self.buf = buf;
        self.tx_keys.record_send(result.is_ok());
        result
    }

    fn tx_timestamps(&mut self) -> Result<TxStamps> {
        let fd = self.raw_fd()?;
        sys::collect_tx_stamps(
            fd,
            &mut self.tx_keys,
            self.want_hw,
            self.sched_depth,
            TX_TIMESTAMP_TIMEOUT_MS,
        )
    }

    fn close(&mut self) -> Result<()> {
        if self.fd.take().is_some() {
            debug!("Packet socket closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_ll_layout() {
        let mac: MacAddr = "01:1b:19:00:00:00".parse().unwrap();
        let sll = sockaddr_ll(3, packet::ETH_P_1588, Some(mac));
        assert_eq!(sll.sll_family, libc::AF_PACKET as u16);
        assert_eq!(u16::from_be(sll.sll_protocol), 0x88f7);
        assert_eq!(sll.sll_ifindex, 3);
        assert_eq!(sll.sll_halen, 6);
        assert_eq!(&sll.sll_addr[..6], &mac.octets());

        let bare = sockaddr_ll(3, packet::ETH_P_TSN, None);
        assert_eq!(bare.sll_halen, 0);
    }

    #[test]
    fn test_open_requires_interface() {
        let config = RunConfig::transmit_latency(crate::config::PacketType::PtpL2);
        assert!(matches!(
            PacketTransport::open(&config),
            Err(Error::Config(_))
        ));
    }
}
