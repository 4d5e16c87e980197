//! UDP over the kernel IPv4 stack.

use super::{echo_destination, receive_flags, sys, Received, Transport, TxStamps};
use super::{RECEIVE_TIMEOUT, TX_TIMESTAMP_TIMEOUT_MS};
use crate::config::{Mode, RunConfig, TransportKind};
use crate::{Error, Result};
use log::{debug, info};
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

const RECV_BUF_LEN: usize = 2048;

pub struct DatagramTransport {
    socket: Option<UdpSocket>,
    peer: Option<SocketAddrV4>,
    last_source: Option<SocketAddrV4>,
    want_hw: bool,
    sched_depth: usize,
    tx_keys: sys::TxKeys,
    recv_flags: libc::c_int,
    buf: Vec<u8>,
    last_len: usize,
}

fn bind_reusable(port: u16) -> Result<UdpSocket> {
    let fd = sys::socket(libc::AF_INET, libc::SOCK_DGRAM, 0)?;
    let on: libc::c_int = 1;
    sys::setsockopt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, &on)
        .map_err(|e| Error::resource("SO_REUSEADDR", e))?;

    // SAFETY: sockaddr_in is plain old data.
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = port.to_be();
    sin.sin_addr.s_addr = u32::from(Ipv4Addr::UNSPECIFIED).to_be();

    // SAFETY: `sin` is a valid sockaddr_in of the size passed.
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::resource(
            &format!("bind UDP port {}", port),
            std::io::Error::last_os_error(),
        ));
    }
    Ok(UdpSocket::from(fd))
}

fn join_group(fd: RawFd, group: Ipv4Addr, interface: Option<&str>) -> Result<()> {
    let ifindex = match interface {
        Some(name) => sys::if_index(name)? as libc::c_int,
        None => 0,
    };
    let mreq = libc::ip_mreqn {
        imr_multiaddr: libc::in_addr {
            s_addr: u32::from(group).to_be(),
        },
        imr_address: libc::in_addr { s_addr: 0 },
        imr_ifindex: ifindex,
    };
    sys::setsockopt(fd, libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP, &mreq)
        .map_err(|e| Error::resource("IP_ADD_MEMBERSHIP", e))?;
    info!("Joined multicast group {}", group);
    Ok(())
}

impl DatagramTransport {
    pub fn open(config: &RunConfig) -> Result<Self> {
        let mode = config.mode;
        let port = config
            .port
            .ok_or_else(|| Error::Config("UDP port is required".into()))?;
        let peer = config
            .address
            .and_then(|a| a.ip())
            .map(|ip| SocketAddrV4::new(ip, port));

        let receives = mode.captures_rx() || mode == Mode::ReceiveRate;
        let socket = if receives {
            bind_reusable(port)?
        } else {
            UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?
        };
        let fd = socket.as_raw_fd();

        if let Some(ifname) = config.interface.as_deref() {
            sys::bind_to_device(fd, ifname)?;
        }
        sys::apply_common_options(fd, config.priority, config.busy_poll)?;

        if let Some(peer) = peer {
            if peer.ip().is_multicast() {
                // our own transmissions must not loop back into the receive path
                socket.set_multicast_loop_v4(false)?;
                if receives {
                    join_group(fd, *peer.ip(), config.interface.as_deref())?;
                }
            }
        }

        let mut want_hw = false;
        if mode.captures_tx() || mode.captures_rx() {
            if let Some(ifname) = config.interface.as_deref() {
                if config.wants_hw_timestamps() {
                    want_hw = sys::enable_hw_timestamps(fd, ifname);
                }
            }
            sys::enable_timestamping(fd, want_hw, config.dev_deep > 0)?;
        }

        let recv_flags = receive_flags(config);
        if receives && recv_flags == 0 {
            sys::set_receive_timeout(fd, RECEIVE_TIMEOUT)?;
        }

        debug!(
            "UDP transport ready: peer {:?}, local {}",
            peer,
            socket.local_addr()?
        );

        Ok(Self {
            socket: Some(socket),
            peer,
            last_source: None,
            want_hw,
            sched_depth: config.dev_deep as usize,
            tx_keys: sys::TxKeys::new(),
            recv_flags,
            buf: vec![0u8; RECV_BUF_LEN],
            last_len: 0,
        })
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| Error::Resource("UDP socket is closed".into()))
    }

    fn send_to(&self, payload: &[u8], dst: SocketAddrV4) -> Result<usize> {
        let sent = self
            .socket()?
            .send_to(payload, dst)
            .map_err(|e| Error::Sample(format!("sendto {}: {}", dst, e)))?;
        if sent != payload.len() {
            return Err(Error::Sample(format!(
                "short write: {} of {} bytes",
                sent,
                payload.len()
            )));
        }
        Ok(sent)
    }
}

impl Transport for DatagramTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn send(&mut self, payload: &[u8]) -> Result<usize> {
        let dst = self
            .peer
            .ok_or_else(|| Error::Config("no destination address".into()))?;
        let result = self.send_to(payload, dst);
        self.tx_keys.record_send(result.is_ok());
        result
    }

    fn receive(&mut self) -> Result<Option<Received<'_>>> {
        let fd = self.socket()?.as_raw_fd();
        let outcome = match sys::recv_timestamped(fd, &mut self.buf, self.recv_flags)? {
            Some(outcome) => outcome,
            None => return Ok(None),
        };

        self.last_len = 0;
        self.last_len = outcome.checked_len(self.buf.len())?;
        if let Some(source) = outcome.source.as_ref().and_then(sys::sockaddr_v4) {
            self.last_source = Some(source);
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
        let dst = echo_destination(self.last_source, self.peer)
            .ok_or_else(|| Error::Sample("nowhere to echo to".into()))?;
        let result = self.send_to(&self.buf[..self.last_len], dst);
        self.tx_keys.record_send(result.is_ok());
        result
    }

    fn tx_timestamps(&mut self) -> Result<TxStamps> {
        let fd = self.socket()?.as_raw_fd();
        sys::collect_tx_stamps(
            fd,
            &mut self.tx_keys,
            self.want_hw,
            self.sched_depth,
            TX_TIMESTAMP_TIMEOUT_MS,
        )
    }

    fn close(&mut self) -> Result<()> {
        if self.socket.take().is_some() {
            debug!("UDP socket closed");
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Address, PacketType};
    use std::time::Duration;

    fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn echo_config(port: u16) -> RunConfig {
        RunConfig::echo_latency(PacketType::Udp)
            .with_port(port)
            .with_address(Address::Ip(Ipv4Addr::LOCALHOST))
            .with_packet_count(1)
            .validate()
            .unwrap()
    }

    #[test]
    fn test_echo_goes_back_to_the_sender() {
        let port = free_port();
        let mut echo = DatagramTransport::open(&echo_config(port)).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        sender
            .send_to(b"ping-payload", ("127.0.0.1", port))
            .unwrap();

        let received = echo.receive().unwrap().expect("datagram");
        assert_eq!(received.payload, b"ping-payload");
        assert_eq!(echo.reply().unwrap(), 12);

        // the configured address is our own port; the reply must still
        // reach the socket that sent the packet
        let mut buf = [0u8; 64];
        let (len, from) = sender.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping-payload");
        assert_eq!(from.port(), port);
    }

    #[test]
    fn test_reply_without_packet_is_sample_error() {
        let mut echo = DatagramTransport::open(&echo_config(free_port())).unwrap();
        assert!(matches!(echo.reply(), Err(Error::Sample(_))));
    }

    #[test]
    fn test_oversized_datagram_is_rejected() {
        let port = free_port();
        let config = RunConfig::receive_latency(PacketType::Udp)
            .with_port(port)
            .with_packet_count(1)
            .validate()
            .unwrap();
        let mut rx = DatagramTransport::open(&config).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&[0xa5; RECV_BUF_LEN + 500], ("127.0.0.1", port))
            .unwrap();
        sender.send_to(&[0x5a; 100], ("127.0.0.1", port)).unwrap();

        assert!(matches!(rx.receive(), Err(Error::Sample(_))));
        let next = rx.receive().unwrap().expect("datagram");
        assert_eq!(next.payload.len(), 100);
    }
}
