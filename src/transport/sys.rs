//! Socket plumbing shared by the kernel-stack transports: option setters,
//! `SO_TIMESTAMPING` control-message parsing and error-queue draining.

use crate::config::MacAddr;
use crate::timestamp::Timestamp;
use crate::{Error, Result};
use log::{debug, info, warn};
use std::ffi::CString;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::mem;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

pub const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
pub const SOF_TIMESTAMPING_TX_SOFTWARE: u32 = 1 << 1;
pub const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
pub const SOF_TIMESTAMPING_RX_SOFTWARE: u32 = 1 << 3;
pub const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
pub const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;
pub const SOF_TIMESTAMPING_OPT_ID: u32 = 1 << 7;
pub const SOF_TIMESTAMPING_TX_SCHED: u32 = 1 << 8;
pub const SOF_TIMESTAMPING_OPT_TSONLY: u32 = 1 << 11;

const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;
pub const SCM_TSTAMP_SND: u32 = 0;
pub const SCM_TSTAMP_SCHED: u32 = 1;

const PACKET_TX_TIMESTAMP: libc::c_int = 16;
const PACKET_OUTGOING: u8 = 4;
const IP_RECVERR: libc::c_int = 11;

const SIOCSHWTSTAMP: libc::c_ulong = 0x89b0;
const HWTSTAMP_TX_ON: libc::c_int = 1;
const HWTSTAMP_FILTER_ALL: libc::c_int = 1;

const CMSG_BUF_LEN: usize = 512;

#[repr(C)]
#[derive(Clone, Copy)]
struct ScmTimestamping {
    ts: [libc::timespec; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct SockExtendedErr {
    ee_errno: u32,
    ee_origin: u8,
    ee_type: u8,
    ee_code: u8,
    ee_pad: u8,
    ee_info: u32,
    ee_data: u32,
}

#[repr(C)]
struct HwtstampConfig {
    flags: libc::c_int,
    tx_type: libc::c_int,
    rx_filter: libc::c_int,
}

/// Software and hardware captures of one packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStamps {
    pub software: Option<Timestamp>,
    pub hardware: Option<Timestamp>,
}

/// Captures reported on the error queue for the last transmitted packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxStamps {
    pub software: Option<Timestamp>,
    pub hardware: Option<Timestamp>,
    /// One entry per packet scheduler hop, in the order reported
    pub sched: Vec<Timestamp>,
}

impl TxStamps {
    fn is_complete(&self, want_hw: bool, sched_depth: usize) -> bool {
        self.software.is_some()
            && (!want_hw || self.hardware.is_some())
            && self.sched.len() >= sched_depth
    }
}

fn last_error(context: &str) -> Error {
    Error::resource(context, io::Error::last_os_error())
}

pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> Result<OwnedFd> {
    // SAFETY: plain syscall.
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 {
        return Err(last_error("socket"));
    }
    // SAFETY: `fd` is a fresh descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    // SAFETY: `value` is a live `T` of the size passed.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn getsockopt<T: Default>(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<T> {
    let mut value = T::default();
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    // SAFETY: `value` is a writable `T` of the size passed.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut value as *mut T as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

/// Applies the per-run socket options shared by every kernel-stack transport.
pub fn apply_common_options(fd: RawFd, priority: Option<i32>, busy_poll: Option<u32>) -> Result<()> {
    if let Some(prio) = priority {
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_PRIORITY, &prio)
            .map_err(|e| Error::resource("SO_PRIORITY", e))?;
        debug!("SO_PRIORITY set to {}", prio);
    }
    if let Some(usecs) = busy_poll {
        let usecs = usecs as libc::c_int;
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_BUSY_POLL, &usecs)
            .map_err(|e| Error::resource("SO_BUSY_POLL", e))?;
        debug!("SO_BUSY_POLL set to {}us", usecs);
    }
    Ok(())
}

/// Bounds how long a blocking receive may sleep.
pub fn set_receive_timeout(fd: RawFd, timeout: Duration) -> Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv)
        .map_err(|e| Error::resource("SO_RCVTIMEO", e))
}

/// Requests software (and optionally raw hardware) timestamps on both paths.
///
/// Tx reports are numbered per socket from here on, see [`TxKeys`].
pub fn enable_timestamping(fd: RawFd, hardware: bool, sched: bool) -> Result<()> {
    let mut flags = SOF_TIMESTAMPING_TX_SOFTWARE
        | SOF_TIMESTAMPING_RX_SOFTWARE
        | SOF_TIMESTAMPING_SOFTWARE
        | SOF_TIMESTAMPING_OPT_TSONLY
        | SOF_TIMESTAMPING_OPT_ID;
    if hardware {
        flags |= SOF_TIMESTAMPING_TX_HARDWARE
            | SOF_TIMESTAMPING_RX_HARDWARE
            | SOF_TIMESTAMPING_RAW_HARDWARE;
    }
    if sched {
        flags |= SOF_TIMESTAMPING_TX_SCHED;
    }
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPING, &flags)
        .map_err(|e| Error::resource("SO_TIMESTAMPING", e))
}

fn ifreq_for(ifname: &str) -> Result<libc::ifreq> {
    if ifname.len() >= libc::IFNAMSIZ {
        return Err(Error::Config(format!("interface name too long: {}", ifname)));
    }
    // SAFETY: ifreq is plain old data.
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(ifname.bytes()) {
        *dst = src as libc::c_char;
    }
    Ok(ifr)
}

/// Turns on NIC hardware stamping for tx and every rx packet.
///
/// Failure is not fatal: the hardware vectors simply stay invalid. Returns
/// whether the NIC accepted the request.
pub fn enable_hw_timestamps(fd: RawFd, ifname: &str) -> bool {
    let mut config = HwtstampConfig {
        flags: 0,
        tx_type: HWTSTAMP_TX_ON,
        rx_filter: HWTSTAMP_FILTER_ALL,
    };
    let mut ifr = match ifreq_for(ifname) {
        Ok(ifr) => ifr,
        Err(e) => {
            warn!("{}", e);
            return false;
        }
    };
    ifr.ifr_ifru.ifru_data = &mut config as *mut HwtstampConfig as *mut libc::c_char;

    // SAFETY: `ifr` points at a live hwtstamp_config for the duration of the call.
    let ret = unsafe { libc::ioctl(fd, SIOCSHWTSTAMP as _, &mut ifr) };
    if ret < 0 {
        info!(
            "SIOCSHWTSTAMP on {} failed, no hardware timestamps: {}",
            ifname,
            io::Error::last_os_error()
        );
        return false;
    }
    debug!("Hardware timestamping enabled on {}", ifname);
    true
}

/// Restricts the socket to one interface.
pub fn bind_to_device(fd: RawFd, ifname: &str) -> Result<()> {
    let name = CString::new(ifname)
        .map_err(|_| Error::Config(format!("invalid interface name: {}", ifname)))?;
    let bytes = name.as_bytes_with_nul();
    // SAFETY: `bytes` is live for the call and its length is passed.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(last_error("SO_BINDTODEVICE"));
    }
    Ok(())
}

/// IPv4 source of a received datagram.
pub fn sockaddr_v4(storage: &libc::sockaddr_storage) -> Option<SocketAddrV4> {
    if i32::from(storage.ss_family) != libc::AF_INET {
        return None;
    }
    // SAFETY: an AF_INET sockaddr_storage holds a sockaddr_in.
    let sin: libc::sockaddr_in =
        unsafe { ptr::read(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
    Some(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    ))
}

/// Hardware source of a frame received on an AF_PACKET socket.
pub fn sockaddr_ll_mac(storage: &libc::sockaddr_storage) -> Option<MacAddr> {
    if i32::from(storage.ss_family) != libc::AF_PACKET {
        return None;
    }
    // SAFETY: an AF_PACKET sockaddr_storage holds a sockaddr_ll.
    let sll: libc::sockaddr_ll =
        unsafe { ptr::read(storage as *const libc::sockaddr_storage as *const libc::sockaddr_ll) };
    if sll.sll_halen as usize != 6 {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&sll.sll_addr[..6]);
    Some(MacAddr(mac))
}

/// Whether an AF_PACKET socket is looking at one of our own transmissions.
pub fn is_outgoing(storage: &libc::sockaddr_storage) -> bool {
    if i32::from(storage.ss_family) != libc::AF_PACKET {
        return false;
    }
    // SAFETY: an AF_PACKET sockaddr_storage holds a sockaddr_ll.
    let sll: libc::sockaddr_ll =
        unsafe { ptr::read(storage as *const libc::sockaddr_storage as *const libc::sockaddr_ll) };
    sll.sll_pkttype == PACKET_OUTGOING
}

pub fn if_index(ifname: &str) -> Result<u32> {
    let name = CString::new(ifname)
        .map_err(|_| Error::Config(format!("invalid interface name: {}", ifname)))?;
    // SAFETY: `name` is a valid C string.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(Error::Config(format!("no such interface: {}", ifname)));
    }
    Ok(index)
}

pub fn if_hwaddr(fd: RawFd, ifname: &str) -> Result<MacAddr> {
    let mut ifr = ifreq_for(ifname)?;
    // SAFETY: SIOCGIFHWADDR fills `ifr_hwaddr`.
    let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR as _, &mut ifr) };
    if ret < 0 {
        return Err(last_error("SIOCGIFHWADDR"));
    }
    // SAFETY: the union member written by SIOCGIFHWADDR.
    let data = unsafe { ifr.ifr_ifru.ifru_hwaddr.sa_data };
    let mut mac = [0u8; 6];
    for (dst, src) in mac.iter_mut().zip(data.iter()) {
        *dst = *src as u8;
    }
    Ok(MacAddr(mac))
}

/// Waits up to `timeout_ms` for `events` on `fd`. Returns the revents.
pub fn poll_fd(fd: RawFd, events: libc::c_short, timeout_ms: libc::c_int) -> Result<libc::c_short> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    // SAFETY: one valid pollfd.
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(Error::resource("poll", err));
    }
    Ok(pfd.revents)
}

/// Result of one `recvmsg` on a timestamping socket.
pub struct RecvOutcome {
    pub len: usize,
    pub stamps: CaptureStamps,
    pub source: Option<libc::sockaddr_storage>,
    /// The packet did not fit the buffer and lost its tail
    pub truncated: bool,
}

impl RecvOutcome {
    /// Rejects a truncated packet, otherwise returns the usable length.
    pub fn checked_len(&self, capacity: usize) -> Result<usize> {
        if self.truncated || self.len > capacity {
            warn!("Dropping packet larger than the {} byte receive buffer", capacity);
            return Err(Error::Sample(format!(
                "packet truncated to {} bytes",
                capacity
            )));
        }
        Ok(self.len)
    }
}

/// Receives one packet into `buf`, parsing the timestamp control message.
///
/// Returns `None` when the call would block.
pub fn recv_timestamped(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> Result<Option<RecvOutcome>> {
    let mut control = [0u8; CMSG_BUF_LEN];
    // SAFETY: sockaddr_storage is plain old data.
    let mut source: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // SAFETY: msghdr is plain old data.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut source as *mut _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.len() as _;

    // SAFETY: every pointer in `msg` refers to live buffers above.
    let ret = unsafe { libc::recvmsg(fd, &mut msg, flags) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(Error::Sample(format!("recvmsg: {}", err))),
        };
    }

    let mut stamps = CaptureStamps::default();
    for_each_cmsg(&msg, |level, ty, data| {
        if level == libc::SOL_SOCKET && ty == libc::SO_TIMESTAMPING {
            if let Some(ts) = read_cmsg::<ScmTimestamping>(data) {
                stamps.software = Timestamp::from_timespec(&ts.ts[0]);
                stamps.hardware = Timestamp::from_timespec(&ts.ts[2]);
            }
        }
    });

    let source = (msg.msg_namelen > 0).then_some(source);
    Ok(Some(RecvOutcome {
        len: ret as usize,
        stamps,
        source,
        truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
    }))
}

/// Tracks which packet the error-queue reports should belong to.
///
/// With `SOF_TIMESTAMPING_OPT_ID` the kernel numbers every packet sent on the
/// socket and echoes the number in `ee_data`. Reports for an earlier packet
/// are dropped so a late capture never lands on the next sample. Kernels
/// that do not number reports on a socket family leave `ee_data` at zero;
/// matching is turned off once that is evident.
#[derive(Debug, Clone, Default)]
pub struct TxKeys {
    next: u32,
    pending: Option<u32>,
    confirmed: bool,
    unkeyed: bool,
    zero_miss: Option<u32>,
}

impl TxKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of a send on the timestamping socket.
    pub fn record_send(&mut self, sent: bool) {
        if sent {
            self.pending = Some(self.next);
            self.next = self.next.wrapping_add(1);
        } else {
            self.pending = None;
        }
    }

    /// Key of the packet whose reports are being collected.
    pub fn pending(&self) -> Option<u32> {
        self.pending
    }

    /// Whether a report numbered `key` belongs to the pending packet.
    pub fn accept(&mut self, key: u32) -> bool {
        let Some(pending) = self.pending else {
            return false;
        };
        if self.unkeyed {
            return true;
        }
        if key == pending {
            self.confirmed |= key != 0;
            return true;
        }
        if key == 0 && !self.confirmed {
            // either a very late report of the first packet or a kernel
            // that does not number reports; two misses settle it
            match self.zero_miss {
                Some(seen) if seen != pending => {
                    info!("Tx timestamp reports are not numbered, matching disabled");
                    self.unkeyed = true;
                    return true;
                }
                _ => {
                    self.zero_miss = Some(pending);
                    return false;
                }
            }
        }
        if (key.wrapping_sub(pending) as i32) > 0 {
            // the kernel numbered a send we did not count
            debug!("Tx report key {} ahead of {}, resyncing", key, pending);
            self.pending = Some(key);
            self.next = key.wrapping_add(1);
            self.confirmed = true;
            return true;
        }
        false
    }
}

/// Drains error-queue timestamp reports until the expected set arrived or
/// `timeout_ms` passed without news.
///
/// Only reports for the packet pending in `keys` are merged.
pub fn collect_tx_stamps(
    fd: RawFd,
    keys: &mut TxKeys,
    want_hw: bool,
    sched_depth: usize,
    timeout_ms: libc::c_int,
) -> Result<TxStamps> {
    let mut stamps = TxStamps::default();
    let mut scratch = [0u8; 256];
    if keys.pending().is_none() {
        return Ok(stamps);
    }

    while !stamps.is_complete(want_hw, sched_depth) {
        let revents = poll_fd(fd, libc::POLLPRI, timeout_ms)?;
        if revents & libc::POLLERR == 0 {
            debug!(
                "Tx timestamps incomplete after {}ms: sw {} hw {} sched {}/{}",
                timeout_ms,
                stamps.software.is_some(),
                stamps.hardware.is_some(),
                stamps.sched.len(),
                sched_depth
            );
            break;
        }
        while let Some(report) = read_errqueue(fd, &mut scratch)? {
            absorb_report(&mut stamps, keys, report);
        }
    }
    Ok(stamps)
}

/// One error-queue timestamp report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ErrqueueReport {
    pub info: u32,
    /// Packet number from `ee_data`
    pub key: u32,
    pub software: Option<Timestamp>,
    pub hardware: Option<Timestamp>,
}

/// Merges `report` if it belongs to the pending packet. Returns whether it did.
pub(crate) fn absorb_report(stamps: &mut TxStamps, keys: &mut TxKeys, report: ErrqueueReport) -> bool {
    if !matches!(report.info, SCM_TSTAMP_SCHED | SCM_TSTAMP_SND) {
        debug!("Ignoring timestamp report type {}", report.info);
        return false;
    }
    if !keys.accept(report.key) {
        debug!(
            "Dropping stale tx timestamp report for packet {} (expecting {:?})",
            report.key,
            keys.pending()
        );
        return false;
    }
    merge_report(stamps, report);
    true
}

pub(crate) fn merge_report(stamps: &mut TxStamps, report: ErrqueueReport) {
    match report.info {
        SCM_TSTAMP_SCHED => {
            if let Some(ts) = report.software {
                stamps.sched.push(ts);
            }
        }
        SCM_TSTAMP_SND => {
            if report.software.is_some() {
                stamps.software = report.software;
            }
            if report.hardware.is_some() {
                stamps.hardware = report.hardware;
            }
        }
        other => debug!("Ignoring timestamp report type {}", other),
    }
}

fn read_errqueue(fd: RawFd, scratch: &mut [u8]) -> Result<Option<ErrqueueReport>> {
    let mut control = [0u8; CMSG_BUF_LEN];
    let mut iov = libc::iovec {
        iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
        iov_len: scratch.len(),
    };
    // SAFETY: msghdr is plain old data.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.len() as _;

    // SAFETY: every pointer in `msg` refers to live buffers above.
    let ret = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(Error::Sample(format!("recvmsg errqueue: {}", err))),
        };
    }

    let mut times = None;
    let mut info = None;
    let mut key = 0;
    for_each_cmsg(&msg, |level, ty, data| {
        if level == libc::SOL_SOCKET && ty == libc::SO_TIMESTAMPING {
            times = read_cmsg::<ScmTimestamping>(data);
        } else if (level == libc::SOL_IP && ty == IP_RECVERR)
            || (level == libc::SOL_PACKET && ty == PACKET_TX_TIMESTAMP)
        {
            if let Some(err) = read_cmsg::<SockExtendedErr>(data) {
                if err.ee_errno == libc::ENOMSG as u32 && err.ee_origin == SO_EE_ORIGIN_TIMESTAMPING {
                    info = Some(err.ee_info);
                    key = err.ee_data;
                }
            }
        }
    });

    Ok(match (times, info) {
        (Some(ts), Some(info)) => Some(ErrqueueReport {
            info,
            key,
            software: Timestamp::from_timespec(&ts.ts[0]),
            hardware: Timestamp::from_timespec(&ts.ts[2]),
        }),
        // a message without a usable report still has to be drained
        _ => Some(ErrqueueReport {
            info: u32::MAX,
            key,
            software: None,
            hardware: None,
        }),
    })
}

fn for_each_cmsg(msg: &libc::msghdr, mut visit: impl FnMut(libc::c_int, libc::c_int, &[u8])) {
    // SAFETY: walking the control buffer the kernel just filled, within
    // `msg_controllen` as enforced by CMSG_NXTHDR.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            let header_len = libc::CMSG_LEN(0) as usize;
            let data_len = (hdr.cmsg_len as usize).saturating_sub(header_len);
            let data = std::slice::from_raw_parts(libc::CMSG_DATA(cmsg), data_len);
            visit(hdr.cmsg_level, hdr.cmsg_type, data);
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
}

fn read_cmsg<T: Copy>(data: &[u8]) -> Option<T> {
    if data.len() < mem::size_of::<T>() {
        return None;
    }
    // SAFETY: length checked; control data may be unaligned.
    Some(unsafe { ptr::read_unaligned(data.as_ptr() as *const T) })
}
