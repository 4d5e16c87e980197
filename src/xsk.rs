//! AF_XDP socket: the frame pool plus the four rings, bound to one NIC queue.

use crate::ring::{PacketDescriptor, RingLayout, RingQueue};
use crate::transport::sys;
use crate::umem::{FramePool, MmapRegion, DEFAULT_FRAME_COUNT, DEFAULT_FRAME_SIZE};
use crate::{packet, Error, Result};
use log::{debug, info, warn};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;

const AF_XDP: libc::c_int = 44;
const SOL_XDP: libc::c_int = 283;
const XDP_MMAP_OFFSETS: libc::c_int = 1;
const XDP_RX_RING: libc::c_int = 2;
const XDP_TX_RING: libc::c_int = 3;
const XDP_UMEM_REG: libc::c_int = 4;
const XDP_UMEM_FILL_RING: libc::c_int = 5;
const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;

const XDP_COPY: u16 = 1 << 1;
const XDP_ZEROCOPY: u16 = 1 << 2;
const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

const XDP_PGOFF_RX_RING: u64 = 0;
const XDP_PGOFF_TX_RING: u64 = 0x8000_0000;
const XDP_UMEM_PGOFF_FILL_RING: u64 = 0x1_0000_0000;
const XDP_UMEM_PGOFF_COMPLETION_RING: u64 = 0x1_8000_0000;

pub const DEFAULT_RING_SIZE: u32 = 2048;

/// How long a waiting receive sleeps in poll(2) before giving up.
const RX_POLL_TIMEOUT_MS: libc::c_int = 1000;

#[repr(C)]
#[derive(Default)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct XdpRingOffset {
    producer: u64,
    consumer: u64,
    desc: u64,
    flags: u64,
}

impl From<XdpRingOffset> for RingLayout {
    fn from(off: XdpRingOffset) -> Self {
        RingLayout {
            producer: off.producer,
            consumer: off.consumer,
            desc: off.desc,
            flags: off.flags,
        }
    }
}

#[repr(C)]
#[derive(Default)]
struct XdpMmapOffsets {
    rx: XdpRingOffset,
    tx: XdpRingOffset,
    fr: XdpRingOffset,
    cr: XdpRingOffset,
}

#[repr(C)]
struct SockaddrXdp {
    sxdp_family: u16,
    sxdp_flags: u16,
    sxdp_ifindex: u32,
    sxdp_queue_id: u32,
    sxdp_shared_umem_fd: u32,
}

/// Socket geometry and bind preferences.
#[derive(Debug, Clone)]
pub struct XskConfig {
    pub interface: String,
    pub queue: u32,
    pub zero_copy: bool,
    pub frame_count: u32,
    pub frame_size: u32,
    pub ring_size: u32,
}

impl XskConfig {
    pub fn new(interface: impl Into<String>, queue: u32) -> Self {
        Self {
            interface: interface.into(),
            queue,
            zero_copy: false,
            frame_count: DEFAULT_FRAME_COUNT,
            frame_size: DEFAULT_FRAME_SIZE,
            ring_size: DEFAULT_RING_SIZE,
        }
    }

    pub fn with_zero_copy(mut self, zero_copy: bool) -> Self {
        self.zero_copy = zero_copy;
        self
    }
}

/// An AF_XDP socket with its own frame pool.
///
/// Rings are declared before the pool and the descriptor so that they are
/// unmapped first on drop.
pub struct XskSocket {
    rx: RingQueue<PacketDescriptor>,
    tx: RingQueue<PacketDescriptor>,
    fill: RingQueue<u64>,
    completion: RingQueue<u64>,
    pool: FramePool,
    held: Option<PacketDescriptor>,
    zero_copy: bool,
    fd: OwnedFd,
}

fn map_ring<T: Copy>(
    fd: RawFd,
    pgoff: u64,
    offsets: XdpRingOffset,
    size: u32,
) -> Result<RingQueue<T>> {
    let len = offsets.desc as usize + size as usize * mem::size_of::<T>();
    let region = MmapRegion::socket_ring(fd, len, pgoff)
        .map_err(|e| Error::resource("mmap xdp ring", e))?;
    // SAFETY: the mapping was laid out by the kernel per `offsets` and holds
    // `size` slots of the ring's descriptor type.
    unsafe { RingQueue::mapped(Arc::new(region), offsets.into(), size) }
}

impl XskSocket {
    pub fn open(config: &XskConfig) -> Result<Self> {
        info!(
            "Creating AF_XDP socket on {} queue {}",
            config.interface, config.queue
        );

        let ifindex = sys::if_index(&config.interface)?;
        let fd = sys::socket(AF_XDP, libc::SOCK_RAW, 0)?;
        let raw = fd.as_raw_fd();

        let pool = FramePool::new(config.frame_count, config.frame_size)?;
        let (addr, len) = pool.area();
        let reg = XdpUmemReg {
            addr,
            len,
            chunk_size: config.frame_size,
            headroom: 0,
            flags: 0,
        };
        sys::setsockopt(raw, SOL_XDP, XDP_UMEM_REG, &reg)
            .map_err(|e| Error::resource("XDP_UMEM_REG", e))?;

        for (opt, name) in [
            (XDP_UMEM_FILL_RING, "XDP_UMEM_FILL_RING"),
            (XDP_UMEM_COMPLETION_RING, "XDP_UMEM_COMPLETION_RING"),
            (XDP_RX_RING, "XDP_RX_RING"),
            (XDP_TX_RING, "XDP_TX_RING"),
        ] {
            sys::setsockopt(raw, SOL_XDP, opt, &config.ring_size)
                .map_err(|e| Error::resource(name, e))?;
        }

        let offsets: XdpMmapOffsets = sys::getsockopt(raw, SOL_XDP, XDP_MMAP_OFFSETS)
            .map_err(|e| Error::resource("XDP_MMAP_OFFSETS", e))?;

        let size = config.ring_size;
        let fill = map_ring(raw, XDP_UMEM_PGOFF_FILL_RING, offsets.fr, size)?;
        let completion = map_ring(raw, XDP_UMEM_PGOFF_COMPLETION_RING, offsets.cr, size)?;
        let rx = map_ring(raw, XDP_PGOFF_RX_RING, offsets.rx, size)?;
        let tx = map_ring(raw, XDP_PGOFF_TX_RING, offsets.tx, size)?;

        let zero_copy = bind(raw, ifindex, config.queue, config.zero_copy)?;

        let mut socket = Self {
            rx,
            tx,
            fill,
            completion,
            pool,
            held: None,
            zero_copy,
            fd,
        };
        let posted = socket.refill();
        debug!("Posted {} frames to the fill ring", posted);

        Ok(socket)
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn is_zero_copy(&self) -> bool {
        self.zero_copy
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Posts as many free frames to the fill ring as it has room for.
    pub fn refill(&mut self) -> u32 {
        let want = self.pool.available().min(self.fill.capacity() as usize) as u32;
        let room = self.fill.reserve(want);
        let mut posted = 0;
        while posted < room {
            match self.pool.acquire_for_fill() {
                Ok(addr) => {
                    self.fill.write_slot(posted, addr);
                    posted += 1;
                }
                Err(_) => break,
            }
        }
        if posted > 0 {
            self.fill.submit(posted);
        }
        posted
    }

    /// Returns completed tx frames to the pool.
    pub fn reclaim_completions(&mut self) -> Result<u32> {
        let done = self.completion.poll_available();
        for i in 0..done {
            let addr = self.completion.read_slot(i);
            self.pool.complete(addr)?;
        }
        if done > 0 {
            self.completion.release(done);
        }
        Ok(done)
    }

    fn kick_tx(&self) -> Result<()> {
        if !self.tx.needs_wakeup() && self.zero_copy {
            return Ok(());
        }
        // SAFETY: zero-length send used only as a doorbell.
        let ret = unsafe {
            libc::sendto(
                self.fd(),
                ptr::null(),
                0,
                libc::MSG_DONTWAIT,
                ptr::null(),
                0,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::ENOBUFS) => {}
                _ => return Err(Error::Sample(format!("xdp tx kick: {}", err))),
            }
        }
        Ok(())
    }

    fn push_tx(&mut self, desc: PacketDescriptor) -> Result<()> {
        self.tx.write_slot(0, desc);
        self.tx.submit(1);
        self.kick_tx()
    }

    fn tx_room(&mut self) -> Result<()> {
        if self.tx.reserve(1) == 0 {
            self.kick_tx()?;
            return Err(Error::Sample("tx ring full".into()));
        }
        Ok(())
    }

    /// Copies `frame` into a pool frame and submits it to the tx ring.
    pub fn send(&mut self, frame: &[u8]) -> Result<usize> {
        self.reclaim_completions()?;
        self.tx_room()?;

        let addr = self.pool.acquire_for_tx()?;
        let desc = match self.pool.write(addr, frame) {
            Ok(desc) => desc,
            Err(e) => {
                self.pool.release(addr)?;
                return Err(e);
            }
        };
        self.push_tx(desc)?;
        Ok(frame.len())
    }

    /// Recycles the frame of the previous receive, if any.
    fn recycle_held(&mut self) -> Result<()> {
        if let Some(desc) = self.held.take() {
            self.pool.release(desc.addr)?;
            self.refill();
        }
        Ok(())
    }

    fn take_rx(&mut self) -> Result<Option<PacketDescriptor>> {
        if self.rx.poll_available() == 0 {
            return Ok(None);
        }
        let desc = self.rx.read_slot(0);
        self.rx.release(1);
        self.pool.received(desc.addr)?;
        self.held = Some(desc);
        Ok(Some(desc))
    }

    /// Takes the next frame off the rx ring.
    ///
    /// With `wait` an empty ring is polled once for up to a second before
    /// giving up; without it `None` comes back at once. The frame stays held
    /// until the next receive or [`XskSocket::reply`].
    pub fn receive(&mut self, wait: bool) -> Result<Option<PacketDescriptor>> {
        self.recycle_held()?;

        if let Some(desc) = self.take_rx()? {
            return Ok(Some(desc));
        }
        self.refill();
        if !wait {
            return Ok(None);
        }
        // poll(2) also wakes the driver when the fill ring asks for it
        sys::poll_fd(self.fd(), libc::POLLIN, RX_POLL_TIMEOUT_MS)?;
        self.take_rx()
    }

    /// Bytes of a received frame.
    pub fn data(&self, desc: &PacketDescriptor) -> Result<&[u8]> {
        self.pool.data(desc)
    }

    /// Sends the last received frame back out with its MAC addresses swapped,
    /// reusing the same pool frame.
    pub fn reply(&mut self) -> Result<usize> {
        self.reclaim_completions()?;

        let desc = self
            .held
            .take()
            .ok_or_else(|| Error::Sample("no received frame to echo".into()))?;
        if let Err(e) = self.tx_room() {
            warn!("Echo of frame {:#x} dropped: {}", desc.addr, e);
            self.pool.release(desc.addr)?;
            self.refill();
            return Err(e);
        }
        packet::swap_mac(self.pool.data_mut(&desc)?);
        self.pool.resubmit(desc.addr)?;
        self.push_tx(desc)?;
        self.refill();
        Ok(desc.len as usize)
    }
}

/// Binds to the queue, falling back from zero-copy to copy mode.
fn bind(fd: RawFd, ifindex: u32, queue: u32, zero_copy: bool) -> Result<bool> {
    let addr = |flags: u16| SockaddrXdp {
        sxdp_family: AF_XDP as u16,
        sxdp_flags: flags | XDP_USE_NEED_WAKEUP,
        sxdp_ifindex: ifindex,
        sxdp_queue_id: queue,
        sxdp_shared_umem_fd: 0,
    };
    let try_bind = |sxdp: &SockaddrXdp| -> io::Result<()> {
        // SAFETY: `sxdp` is a valid sockaddr_xdp of the size passed.
        let ret = unsafe {
            libc::bind(
                fd,
                sxdp as *const SockaddrXdp as *const libc::sockaddr,
                mem::size_of::<SockaddrXdp>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    };

    if zero_copy {
        match try_bind(&addr(XDP_ZEROCOPY)) {
            Ok(()) => {
                info!("Bound in zero-copy mode");
                return Ok(true);
            }
            Err(e) => info!("Zero-copy bind failed: {}, trying copy mode", e),
        }
    }

    try_bind(&addr(XDP_COPY)).map_err(|e| Error::resource("bind AF_XDP socket", e))?;
    info!("Bound in copy mode");
    Ok(false)
}
