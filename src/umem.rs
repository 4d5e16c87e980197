//! Frame pool (umem) shared with the kernel by AF_XDP sockets.
//!
//! The pool is one anonymous mapping cut into equally sized frames. Frames are
//! named by their byte offset into the mapping, which is what travels through
//! the rings. Every frame is in exactly one [`FrameState`] at any time, and
//! every transition is checked, so a frame can never be handed out twice.

use crate::ring::PacketDescriptor;
use crate::{Error, Result};
use log::debug;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};

pub const DEFAULT_FRAME_SIZE: u32 = 2048;
pub const DEFAULT_FRAME_COUNT: u32 = 4096;

/// An mmap'ed memory region, unmapped on drop.
pub(crate) struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain memory; access is coordinated by its users.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    pub(crate) fn anonymous(len: usize) -> io::Result<Self> {
        Self::map(
            len,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
            -1,
            0,
        )
    }

    /// Maps the ring of `fd` found at page offset `pgoff`.
    pub(crate) fn socket_ring(fd: RawFd, len: usize, pgoff: u64) -> io::Result<Self> {
        Self::map(len, libc::MAP_SHARED | libc::MAP_POPULATE, fd, pgoff as libc::off_t)
    }

    fn map(len: usize, flags: libc::c_int, fd: RawFd, offset: libc::off_t) -> io::Result<Self> {
        // SAFETY: a fresh mapping with no aliasing Rust references.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                offset,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is `len` readable bytes for our lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` rules out other borrows.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly what `map` returned.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Who currently owns a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// On the pool's free list
    Free,
    /// Posted to the fill ring, waiting for an incoming packet
    Fill,
    /// Posted to the tx ring, waiting for the completion ring
    InFlight,
    /// Taken off the rx ring, owned by the application
    Held,
}

/// Fixed-size frames in one mapping, with an ownership-checked free list.
///
/// ```
/// use rplget::umem::{FramePool, FrameState};
///
/// let mut pool = FramePool::new(4, 2048).unwrap();
/// let addr = pool.acquire_for_tx().unwrap();
/// assert_eq!(pool.state(addr), Some(FrameState::InFlight));
///
/// pool.complete(addr).unwrap();
/// assert_eq!(pool.available(), 4);
/// ```
pub struct FramePool {
    region: MmapRegion,
    frame_size: u32,
    free: Vec<u64>,
    states: Vec<FrameState>,
}

impl FramePool {
    pub fn new(frame_count: u32, frame_size: u32) -> Result<Self> {
        if frame_count == 0 || !frame_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "frame pool needs at least one power-of-two sized frame, got {} x {}",
                frame_count, frame_size
            )));
        }

        let len = frame_count as usize * frame_size as usize;
        let region =
            MmapRegion::anonymous(len).map_err(|e| Error::resource("frame pool mmap", e))?;

        // Reversed so that pops hand out the lowest offsets first.
        let free = (0..frame_count)
            .rev()
            .map(|i| u64::from(i) * u64::from(frame_size))
            .collect();

        debug!("Frame pool: {} frames x {} bytes", frame_count, frame_size);

        Ok(Self {
            region,
            frame_size,
            free,
            states: vec![FrameState::Free; frame_count as usize],
        })
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn frame_count(&self) -> u32 {
        self.states.len() as u32
    }

    /// Base address and length, as registered with `XDP_UMEM_REG`.
    pub(crate) fn area(&self) -> (u64, u64) {
        (self.region.as_ptr() as u64, self.region.len() as u64)
    }

    /// Frames on the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Frames owned by a ring, the kernel or the application.
    pub fn in_flight(&self) -> usize {
        self.states.len() - self.free.len()
    }

    fn index(&self, addr: u64) -> Option<usize> {
        let index = (addr / u64::from(self.frame_size)) as usize;
        (index < self.states.len()).then_some(index)
    }

    /// State of the frame containing `addr`.
    pub fn state(&self, addr: u64) -> Option<FrameState> {
        self.index(addr).map(|i| self.states[i])
    }

    fn take(&mut self, next: FrameState) -> Result<u64> {
        let addr = self.free.pop().ok_or(Error::FramePoolExhausted {
            in_flight: self.in_flight(),
        })?;
        let index = addr as usize / self.frame_size as usize;
        self.states[index] = next;
        Ok(addr)
    }

    fn transition(&mut self, addr: u64, from: &[FrameState], to: FrameState) -> Result<usize> {
        let index = self
            .index(addr)
            .ok_or_else(|| Error::Resource(format!("frame address {:#x} outside the pool", addr)))?;
        let current = self.states[index];
        if !from.contains(&current) {
            return Err(Error::Resource(format!(
                "frame {:#x} is {:?}, expected one of {:?}",
                addr, current, from
            )));
        }
        self.states[index] = to;
        Ok(index)
    }

    /// Takes a free frame to post on the fill ring.
    pub fn acquire_for_fill(&mut self) -> Result<u64> {
        self.take(FrameState::Fill)
    }

    /// Takes a free frame to post on the tx ring.
    pub fn acquire_for_tx(&mut self) -> Result<u64> {
        self.take(FrameState::InFlight)
    }

    /// Records that a fill-ring frame came back on the rx ring.
    pub fn received(&mut self, addr: u64) -> Result<()> {
        self.transition(addr, &[FrameState::Fill], FrameState::Held)
            .map(|_| ())
    }

    /// Puts a held frame back on the tx ring, e.g. to echo it.
    pub fn resubmit(&mut self, addr: u64) -> Result<()> {
        self.transition(addr, &[FrameState::Held], FrameState::InFlight)
            .map(|_| ())
    }

    /// Reclaims a transmitted frame seen on the completion ring.
    pub fn complete(&mut self, addr: u64) -> Result<()> {
        self.give_back(addr, &[FrameState::InFlight])
    }

    /// Returns a frame the application is done with.
    ///
    /// Releasing a frame that is already free is rejected.
    pub fn release(&mut self, addr: u64) -> Result<()> {
        self.give_back(addr, &[FrameState::Held, FrameState::InFlight])
    }

    fn give_back(&mut self, addr: u64, from: &[FrameState]) -> Result<()> {
        let index = self.transition(addr, from, FrameState::Free)?;
        self.free
            .push(index as u64 * u64::from(self.frame_size));
        Ok(())
    }

    fn checked_range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let index = self
            .index(addr)
            .ok_or_else(|| Error::Sample(format!("frame address {:#x} outside the pool", addr)))?;
        let frame_end = (index + 1) * self.frame_size as usize;
        let start = addr as usize;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= frame_end)
            .ok_or_else(|| {
                Error::Sample(format!("{} bytes at {:#x} overrun the frame", len, addr))
            })?;
        Ok(start..end)
    }

    /// Packet bytes referenced by a ring descriptor.
    pub fn data(&self, desc: &PacketDescriptor) -> Result<&[u8]> {
        let range = self.checked_range(desc.addr, desc.len as usize)?;
        Ok(&self.region.as_slice()[range])
    }

    /// Mutable packet bytes referenced by a ring descriptor.
    pub fn data_mut(&mut self, desc: &PacketDescriptor) -> Result<&mut [u8]> {
        let range = self.checked_range(desc.addr, desc.len as usize)?;
        Ok(&mut self.region.as_mut_slice()[range])
    }

    /// Copies `payload` to the start of the frame at `addr`.
    pub fn write(&mut self, addr: u64, payload: &[u8]) -> Result<PacketDescriptor> {
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::Sample("payload too large".into()))?;
        let desc = PacketDescriptor::new(addr, len);
        self.data_mut(&desc)?.copy_from_slice(payload);
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_geometry() {
        let pool = FramePool::new(8, 2048).unwrap();
        assert_eq!(pool.frame_count(), 8);
        assert_eq!(pool.available(), 8);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.area().1, 8 * 2048);

        assert!(matches!(
            FramePool::new(8, 1500).map(|_| ()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_exhaustion_fails_loudly() {
        let mut pool = FramePool::new(2, 2048).unwrap();
        let a = pool.acquire_for_fill().unwrap();
        let b = pool.acquire_for_tx().unwrap();
        assert_ne!(a, b);

        match pool.acquire_for_tx() {
            Err(Error::FramePoolExhausted { in_flight }) => assert_eq!(in_flight, 2),
            other => panic!("expected exhaustion, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_double_release_rejected() {
        let mut pool = FramePool::new(2, 2048).unwrap();
        let addr = pool.acquire_for_tx().unwrap();
        pool.release(addr).unwrap();
        assert!(pool.release(addr).is_err());
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_receive_lifecycle() {
        let mut pool = FramePool::new(4, 2048).unwrap();
        let addr = pool.acquire_for_fill().unwrap();

        // a fill frame cannot be reclaimed as a completion
        assert!(pool.complete(addr).is_err());

        // rx descriptors may point past the frame start (headroom)
        pool.received(addr + 256).unwrap();
        assert_eq!(pool.state(addr), Some(FrameState::Held));

        pool.resubmit(addr).unwrap();
        assert_eq!(pool.state(addr), Some(FrameState::InFlight));
        pool.complete(addr).unwrap();
        assert_eq!(pool.state(addr), Some(FrameState::Free));
    }

    #[test]
    fn test_frame_data_bounds() {
        let mut pool = FramePool::new(2, 2048).unwrap();
        let addr = pool.acquire_for_tx().unwrap();
        let desc = pool.write(addr, &[1, 2, 3, 4]).unwrap();
        assert_eq!(pool.data(&desc).unwrap(), &[1, 2, 3, 4]);

        let overrun = PacketDescriptor::new(addr + 2000, 100);
        assert!(pool.data(&overrun).is_err());
        let outside = PacketDescriptor::new(4096, 1);
        assert!(pool.data(&outside).is_err());
    }

    #[test]
    fn test_no_frame_in_two_states() {
        let mut pool = FramePool::new(8, 2048).unwrap();
        let mut fill = Vec::new();
        let mut held = Vec::new();
        let mut tx = Vec::new();

        // deterministic interleaving of every transition
        let mut seed = 0x2545_f491_u32;
        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            match seed % 5 {
                0 => {
                    if let Ok(a) = pool.acquire_for_fill() {
                        fill.push(a)
                    }
                }
                1 => {
                    if let Ok(a) = pool.acquire_for_tx() {
                        tx.push(a)
                    }
                }
                2 => {
                    if let Some(a) = fill.pop() {
                        pool.received(a).unwrap();
                        held.push(a);
                    }
                }
                3 => {
                    if let Some(a) = held.pop() {
                        pool.resubmit(a).unwrap();
                        tx.push(a);
                    }
                }
                _ => {
                    if let Some(a) = tx.pop() {
                        pool.complete(a).unwrap();
                    }
                    if let Some(a) = held.pop() {
                        pool.release(a).unwrap();
                    }
                }
            }

            let mut owned: Vec<u64> = fill.iter().chain(&held).chain(&tx).copied().collect();
            owned.extend(pool.free.iter().copied());
            owned.sort_unstable();
            owned.dedup();
            assert_eq!(owned.len(), 8);
        }
    }
}
