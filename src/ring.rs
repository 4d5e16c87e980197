//! Single-producer/single-consumer descriptor rings.
//!
//! A [`RingQueue`] is one side's view of a ring whose two indices are shared
//! with the other side (the kernel for AF_XDP rings, another handle for a
//! local ring). The same type serves the fill, completion, rx and tx rings;
//! only the slot type differs (`u64` frame addresses or [`PacketDescriptor`]).
//!
//! Cursors are free-running `u32` counters. Slot positions are always
//! `cursor & mask`, and `producer - consumer` is computed with wrapping
//! arithmetic, so it stays within `0..=capacity`.

use crate::umem::MmapRegion;
use crate::{Error, Result};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

/// Set by the kernel in a ring's flags word when it must be kicked.
pub const XDP_RING_NEED_WAKEUP: u32 = 1 << 0;

/// Zero-copy frame reference as laid out in AF_XDP rx/tx ring slots.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketDescriptor {
    /// Offset of the frame data inside the frame pool
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

impl PacketDescriptor {
    pub fn new(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            options: 0,
        }
    }
}

/// Ring memory owned by this process, for rings not backed by a socket.
struct LocalRing<T> {
    producer: AtomicU32,
    consumer: AtomicU32,
    flags: AtomicU32,
    slots: Box<[UnsafeCell<T>]>,
}

// SAFETY: slot access is serialised by the producer/consumer protocol, slot
// writes happen-before the release store of the producer index and reads
// happen-after the matching acquire load.
unsafe impl<T: Send> Sync for LocalRing<T> {}

/// Keeps the ring's memory alive for as long as any view of it exists.
enum RingMemory<T> {
    Local(Arc<LocalRing<T>>),
    Mapped(Arc<MmapRegion>),
}

/// Byte offsets of a ring's fields inside its mapping, as reported by the
/// kernel through `XDP_MMAP_OFFSETS`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingLayout {
    pub producer: u64,
    pub consumer: u64,
    pub desc: u64,
    pub flags: u64,
}

/// One side of a shared descriptor ring.
pub struct RingQueue<T: Copy> {
    producer: NonNull<AtomicU32>,
    consumer: NonNull<AtomicU32>,
    flags: NonNull<AtomicU32>,
    slots: NonNull<T>,
    capacity: u32,
    mask: u32,
    cached_prod: u32,
    cached_cons: u32,
    _memory: RingMemory<T>,
}

// SAFETY: the pointers reference memory kept alive by `_memory`; a RingQueue
// is one side of an SPSC ring and is only ever used from one thread at a time.
unsafe impl<T: Copy + Send> Send for RingQueue<T> {}

fn check_capacity(capacity: u32) -> Result<u32> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(Error::Config(format!(
            "ring capacity must be a power of two, got {}",
            capacity
        )));
    }
    Ok(capacity - 1)
}

impl<T: Copy + Default + Send> RingQueue<T> {
    /// Creates a process-local ring and returns its producer and consumer views.
    ///
    /// ```
    /// use rplget::ring::RingQueue;
    ///
    /// let (mut tx, mut rx) = RingQueue::<u64>::pair(4).unwrap();
    /// assert_eq!(tx.reserve(1), 1);
    /// tx.write_slot(0, 0x1000);
    /// tx.submit(1);
    ///
    /// assert_eq!(rx.poll_available(), 1);
    /// assert_eq!(rx.read_slot(0), 0x1000);
    /// rx.release(1);
    /// ```
    pub fn pair(capacity: u32) -> Result<(Self, Self)> {
        let mask = check_capacity(capacity)?;
        let local = Arc::new(LocalRing {
            producer: AtomicU32::new(0),
            consumer: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            slots: (0..capacity).map(|_| UnsafeCell::new(T::default())).collect(),
        });

        let view = |local: &Arc<LocalRing<T>>| -> Self {
            // UnsafeCell<T> has the same in-memory representation as T.
            let slots = local.slots.as_ptr() as *mut T;
            Self {
                producer: NonNull::from(&local.producer),
                consumer: NonNull::from(&local.consumer),
                flags: NonNull::from(&local.flags),
                // SAFETY: boxed slices are never null.
                slots: unsafe { NonNull::new_unchecked(slots) },
                capacity,
                mask,
                cached_prod: 0,
                cached_cons: 0,
                _memory: RingMemory::Local(Arc::clone(local)),
            }
        };

        Ok((view(&local), view(&local)))
    }
}

impl<T: Copy> RingQueue<T> {
    /// Wraps a ring mapped from an AF_XDP socket.
    ///
    /// # Safety
    ///
    /// `region` must be the mapping of a ring whose fields sit at `layout`
    /// and whose descriptor array holds `capacity` slots of `T`.
    pub(crate) unsafe fn mapped(
        region: Arc<MmapRegion>,
        layout: RingLayout,
        capacity: u32,
    ) -> Result<Self> {
        let mask = check_capacity(capacity)?;
        let at = |offset: u64| region.as_ptr().add(offset as usize);

        let producer = NonNull::new_unchecked(at(layout.producer) as *mut AtomicU32);
        let consumer = NonNull::new_unchecked(at(layout.consumer) as *mut AtomicU32);
        let flags = NonNull::new_unchecked(at(layout.flags) as *mut AtomicU32);
        let slots = NonNull::new_unchecked(at(layout.desc) as *mut T);

        let cached_prod = producer.as_ref().load(Ordering::Relaxed);
        let cached_cons = consumer.as_ref().load(Ordering::Relaxed);

        Ok(Self {
            producer,
            consumer,
            flags,
            slots,
            capacity,
            mask,
            cached_prod,
            cached_cons,
            _memory: RingMemory::Mapped(region),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn shared_producer(&self) -> &AtomicU32 {
        // SAFETY: points into memory owned by `_memory`.
        unsafe { self.producer.as_ref() }
    }

    fn shared_consumer(&self) -> &AtomicU32 {
        // SAFETY: points into memory owned by `_memory`.
        unsafe { self.consumer.as_ref() }
    }

    fn slot_ptr(&self, cursor: u32) -> *mut T {
        let index = (cursor & self.mask) as usize;
        // SAFETY: index <= mask < capacity, inside the slot array.
        unsafe { self.slots.as_ptr().add(index) }
    }

    /// Number of entries between the cached cursors.
    pub fn outstanding(&self) -> u32 {
        self.cached_prod.wrapping_sub(self.cached_cons)
    }

    /// Returns how many of `n` slots can be written, at most `n`.
    ///
    /// The shared consumer index is re-read only when the cached value does
    /// not leave room for `n`. Cursors do not move until [`submit`](Self::submit).
    pub fn reserve(&mut self, n: u32) -> u32 {
        // an over-submitted ring reports no room rather than wrapping
        let mut free = self.capacity.saturating_sub(self.outstanding());
        if free < n {
            self.cached_cons = self.shared_consumer().load(Ordering::Acquire);
            free = self.capacity.saturating_sub(self.outstanding());
        }
        free.min(n)
    }

    /// Stores `value` in the `i`th reserved slot.
    pub fn write_slot(&mut self, i: u32, value: T) {
        let slot = self.slot_ptr(self.cached_prod.wrapping_add(i));
        // SAFETY: the slot was reserved, so the consumer is not reading it.
        unsafe { slot.write_volatile(value) }
    }

    /// Publishes `n` written slots to the consumer.
    pub fn submit(&mut self, n: u32) {
        self.cached_prod = self.cached_prod.wrapping_add(n);
        fence(Ordering::Release);
        self.shared_producer()
            .store(self.cached_prod, Ordering::Relaxed);
    }

    /// Returns how many entries the producer has published past our cursor.
    pub fn poll_available(&mut self) -> u32 {
        self.cached_prod = self.shared_producer().load(Ordering::Acquire);
        self.outstanding()
    }

    /// Reads the `i`th available entry.
    pub fn read_slot(&self, i: u32) -> T {
        let slot = self.slot_ptr(self.cached_cons.wrapping_add(i));
        // SAFETY: the entry was published and has not been released yet.
        unsafe { slot.read_volatile() }
    }

    /// Hands `n` consumed entries back to the producer.
    pub fn release(&mut self, n: u32) {
        self.cached_cons = self.cached_cons.wrapping_add(n);
        self.shared_consumer()
            .store(self.cached_cons, Ordering::Release);
    }

    /// Whether the kernel asked to be woken up for this ring.
    pub fn needs_wakeup(&self) -> bool {
        // SAFETY: points into memory owned by `_memory`.
        let flags = unsafe { self.flags.as_ref() };
        flags.load(Ordering::Relaxed) & XDP_RING_NEED_WAKEUP != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ring with `prod` entries produced and `cons` of them consumed.
    fn ring_at(capacity: u32, prod: u32, cons: u32) -> (RingQueue<u64>, RingQueue<u64>) {
        assert!(prod - cons <= capacity);
        let (mut p, mut c) = RingQueue::<u64>::pair(capacity).unwrap();
        let (mut produced, mut consumed) = (0, 0);
        while produced < prod || consumed < cons {
            let n = p.reserve(prod - produced);
            for i in 0..n {
                p.write_slot(i, u64::from(produced + i));
            }
            p.submit(n);
            produced += n;

            let m = c.poll_available().min(cons - consumed);
            c.release(m);
            consumed += m;
        }
        (p, c)
    }

    #[test]
    fn test_non_power_of_two_is_config_error() {
        assert!(matches!(
            RingQueue::<u64>::pair(6).map(|_| ()),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RingQueue::<u64>::pair(0).map(|_| ()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_reserve_is_bounded_by_free_space() {
        let (mut p, c) = ring_at(8, 6, 2);
        assert_eq!(c.cached_cons, 2);
        assert_eq!(p.reserve(4), 4);
        assert_eq!(p.reserve(5), 4);
        // reserve alone never moves the cursors
        assert_eq!(p.cached_prod, 6);
        assert_eq!(p.reserve(5), 4);
    }

    #[test]
    fn test_over_submission_leaves_no_room() {
        let (mut p, _c) = RingQueue::<u64>::pair(4).unwrap();
        assert_eq!(p.reserve(4), 4);
        p.submit(6);
        assert_eq!(p.outstanding(), 6);
        assert_eq!(p.reserve(1), 0);
    }

    #[test]
    fn test_submit_grows_outstanding() {
        for d in 0..=8u32 {
            for n in 0..=9u32 {
                let (mut p, c) = ring_at(8, 6 + d, 6);
                let got = p.reserve(n);
                assert_eq!(got, n.min(8 - d), "d={} n={}", d, n);
                p.submit(got);
                assert_eq!(p.cached_prod.wrapping_sub(c.cached_cons), d + got);
            }
        }
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let (mut p, mut c) = RingQueue::<PacketDescriptor>::pair(4).unwrap();
        let mut next = 0u64;
        let mut expected = 0u64;
        for _ in 0..10 {
            let n = p.reserve(3);
            for i in 0..n {
                p.write_slot(i, PacketDescriptor::new(next * 2048, 60));
                next += 1;
            }
            p.submit(n);

            let avail = c.poll_available();
            for i in 0..avail {
                assert_eq!(c.read_slot(i).addr, expected * 2048);
                expected += 1;
            }
            c.release(avail);
        }
        assert_eq!(next, expected);
        assert!(next > 4);
    }

    #[test]
    fn test_cursor_overflow_wraps() {
        let (mut p, mut c) = RingQueue::<u64>::pair(4).unwrap();
        p.cached_prod = u32::MAX - 1;
        p.cached_cons = u32::MAX - 1;
        c.cached_cons = u32::MAX - 1;
        p.shared_producer().store(u32::MAX - 1, Ordering::Relaxed);
        p.shared_consumer().store(u32::MAX - 1, Ordering::Relaxed);

        assert_eq!(p.reserve(4), 4);
        for i in 0..4 {
            p.write_slot(i, u64::from(i) + 100);
        }
        p.submit(4);
        assert_eq!(c.poll_available(), 4);
        assert_eq!(c.read_slot(3), 103);
        c.release(4);
        assert_eq!(p.reserve(4), 4);
    }

    #[test]
    fn test_needs_wakeup_flag() {
        let (p, _c) = RingQueue::<u64>::pair(2).unwrap();
        assert!(!p.needs_wakeup());
        if let RingMemory::Local(local) = &p._memory {
            local.flags.store(XDP_RING_NEED_WAKEUP, Ordering::Relaxed);
        }
        assert!(p.needs_wakeup());
    }
}
