//
// ring.rs - AF_XDP ring protocol
//
// Purpose:
//   Single-producer/single-consumer descriptor rings shared with the kernel.
//   Four kinds exist per socket: fill and TX are produced by user space,
//   RX and completion are consumed by user space. This module owns the ring
//   page mappings and the cursor arithmetic; it knows nothing about frames
//   or packets.
//
// Main components:
//   - RingMmap: the mapped ring page with producer/consumer/flags words and
//     the descriptor array at kernel-reported offsets.
//   - ProducerRing: reserve/write/submit.
//   - ConsumerRing: peek/read/release.
//   - RingType: sockopt and mmap plumbing per ring kind.
//

use crate::mmap::OwnedMmap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::{io, ptr};

/// Fill ring depth (kernel default producer descriptor count).
pub const FILL_RING_SIZE: usize = 2048;
/// Completion ring depth.
pub const COMP_RING_SIZE: usize = 2048;
/// RX ring depth (kernel default consumer descriptor count).
pub const RX_RING_SIZE: usize = 2048;

/// Kernel RX/TX descriptor (`struct xdp_desc`). Fill and completion rings
/// carry bare `u64` frame addresses instead.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

/// A mapped ring page. The producer/consumer/flags words are shared with
/// the kernel; `desc` points at the descriptor array.
pub struct RingMmap<T> {
    // Keeps the mapping alive for the pointers below.
    _mmap: OwnedMmap,
    producer: *mut AtomicU32,
    consumer: *mut AtomicU32,
    desc: *mut T,
    flags: *mut AtomicU32,
}

// SAFETY: the pointers target the owned mapping; all shared words are
// accessed through atomics.
unsafe impl<T: Send> Send for RingMmap<T> {}

impl<T> RingMmap<T> {
    /// Lays out ring pointers over an owned mapping according to the
    /// kernel-reported (or, in tests, synthetic) ring offsets.
    pub(crate) fn from_offsets(mmap: OwnedMmap, offsets: &libc::xdp_ring_offset) -> Self {
        let base = mmap.as_void_ptr();
        let producer = unsafe { base.add(offsets.producer as usize) as *mut AtomicU32 };
        let consumer = unsafe { base.add(offsets.consumer as usize) as *mut AtomicU32 };
        let desc = unsafe { base.add(offsets.desc as usize) as *mut T };
        let flags = unsafe { base.add(offsets.flags as usize) as *mut AtomicU32 };
        RingMmap {
            _mmap: mmap,
            producer,
            consumer,
            desc,
            flags,
        }
    }

    fn load_producer(&self, order: Ordering) -> u32 {
        unsafe { (*self.producer).load(order) }
    }

    fn load_consumer(&self, order: Ordering) -> u32 {
        unsafe { (*self.consumer).load(order) }
    }

    fn store_producer(&self, value: u32) {
        unsafe { (*self.producer).store(value, Ordering::Release) }
    }

    fn store_consumer(&self, value: u32) {
        unsafe { (*self.consumer).store(value, Ordering::Release) }
    }

    fn flags(&self) -> u32 {
        unsafe { (*self.flags).load(Ordering::Acquire) }
    }
}

/// Maps one ring of the socket at the given page offset and lays out the
/// ring pointers from the kernel-reported offsets.
pub fn mmap_ring<T>(
    fd: libc::c_int,
    desc_bytes: usize,
    offsets: &libc::xdp_ring_offset,
    pgoff: u64,
) -> Result<RingMmap<T>, io::Error> {
    let map_size = (offsets.desc as usize).saturating_add(desc_bytes);
    let map_addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            map_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd,
            pgoff as i64,
        )
    };
    if map_addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(RingMmap::from_offsets(
        OwnedMmap::new(map_addr, map_size),
        offsets,
    ))
}

/*
   Cursor protocol, shared with the kernel:

   Both cursors are free-running u32 counters; the slot for cursor value c
   is c & (size - 1). The producer owns the producer word, the consumer owns
   the consumer word, and each side reads the other's word with Acquire and
   publishes its own with Release. In flight entries = producer - consumer
   (wrapping), free slots = size - in flight.

   Each side additionally keeps private cached copies of both cursors. The
   cached view of its own cursor runs ahead of the shared word between
   reserve/peek and submit/release; the cached view of the opposite cursor
   is refreshed from shared memory only when the cached value would make the
   operation fail. On the producer side the cached consumer is stored offset
   by +size, so free slots are simply cached_cons - cached_prod.

   reserve/peek hand out the raw cursor as the start index; descriptor
   accessors mask it, so callers iterate idx, idx+1, ... without wrapping
   logic of their own.
*/

/// User-space-produced ring (fill, TX).
pub struct ProducerRing<T> {
    ring: RingMmap<T>,
    size: u32,
    cached_prod: u32,
    cached_cons: u32,
}

impl<T: Copy> ProducerRing<T> {
    pub fn new(ring: RingMmap<T>, size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        let cached_prod = ring.load_producer(Ordering::Relaxed);
        let cached_cons = ring.load_consumer(Ordering::Relaxed).wrapping_add(size as u32);
        ProducerRing {
            ring,
            size: size as u32,
            cached_prod,
            cached_cons,
        }
    }

    pub fn map(
        fd: libc::c_int,
        ring_type: RingType,
        size: usize,
        offsets: &libc::xdp_mmap_offsets,
    ) -> io::Result<Self> {
        debug_assert!(ring_type.is_producer());
        let mmap = mmap_ring(
            fd,
            size * size_of::<T>(),
            ring_type.offsets_of(offsets),
            ring_type.page_offset(),
        )?;
        Ok(Self::new(mmap, size))
    }

    pub fn capacity(&self) -> u32 {
        self.size
    }

    fn free(&mut self, want: u32) -> u32 {
        let free = self.cached_cons.wrapping_sub(self.cached_prod);
        if free >= want {
            return free;
        }
        self.cached_cons = self
            .ring
            .load_consumer(Ordering::Acquire)
            .wrapping_add(self.size);
        self.cached_cons.wrapping_sub(self.cached_prod)
    }

    /// Reserves `n` consecutive slots. Returns the start index, or `None`
    /// when fewer than `n` slots are free (caller retries or reduces the
    /// batch; nothing is consumed on failure).
    pub fn reserve(&mut self, n: u32) -> Option<u32> {
        if self.free(n) < n {
            return None;
        }
        let idx = self.cached_prod;
        self.cached_prod = self.cached_prod.wrapping_add(n);
        Some(idx)
    }

    /// Writes the descriptor at a reserved index. `index` is the raw cursor
    /// handed out by `reserve`, possibly advanced; it is masked here.
    pub fn write(&mut self, index: u32, value: T) {
        unsafe {
            *self.ring.desc.add((index & (self.size - 1)) as usize) = value;
        }
    }

    /// Publishes `n` previously reserved and written slots to the kernel.
    pub fn submit(&mut self, n: u32) {
        debug_assert!(
            n <= self.cached_prod.wrapping_sub(self.ring.load_producer(Ordering::Relaxed))
        );
        let prod = self.ring.load_producer(Ordering::Relaxed);
        self.ring.store_producer(prod.wrapping_add(n));
    }

    /// True when the kernel asks to be woken after the next submit.
    pub fn needs_wakeup(&self) -> bool {
        self.ring.flags() & libc::XDP_RING_NEED_WAKEUP != 0
    }
}

/// Kernel-produced ring (RX, completion).
pub struct ConsumerRing<T> {
    ring: RingMmap<T>,
    size: u32,
    cached_prod: u32,
    cached_cons: u32,
}

impl<T: Copy> ConsumerRing<T> {
    pub fn new(ring: RingMmap<T>, size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        let cached_prod = ring.load_producer(Ordering::Relaxed);
        let cached_cons = ring.load_consumer(Ordering::Relaxed);
        ConsumerRing {
            ring,
            size: size as u32,
            cached_prod,
            cached_cons,
        }
    }

    pub fn map(
        fd: libc::c_int,
        ring_type: RingType,
        size: usize,
        offsets: &libc::xdp_mmap_offsets,
    ) -> io::Result<Self> {
        debug_assert!(!ring_type.is_producer());
        let mmap = mmap_ring(
            fd,
            size * size_of::<T>(),
            ring_type.offsets_of(offsets),
            ring_type.page_offset(),
        )?;
        Ok(Self::new(mmap, size))
    }

    pub fn capacity(&self) -> u32 {
        self.size
    }

    /// Takes up to `max` available entries. Returns `(count, start_index)`;
    /// the caller reads exactly `count` descriptors from `start_index` on
    /// and must eventually `release` the same count.
    pub fn peek(&mut self, max: u32) -> (u32, u32) {
        let mut avail = self.cached_prod.wrapping_sub(self.cached_cons);
        if avail == 0 {
            self.cached_prod = self.ring.load_producer(Ordering::Acquire);
            avail = self.cached_prod.wrapping_sub(self.cached_cons);
        }
        let n = avail.min(max);
        let idx = self.cached_cons;
        self.cached_cons = self.cached_cons.wrapping_add(n);
        (n, idx)
    }

    /// Reads the descriptor at a peeked index (raw cursor, masked here).
    pub fn read(&self, index: u32) -> T {
        unsafe { *self.ring.desc.add((index & (self.size - 1)) as usize) }
    }

    /// Returns `n` consumed slots to the kernel.
    pub fn release(&mut self, n: u32) {
        debug_assert!(
            n <= self.cached_cons.wrapping_sub(self.ring.load_consumer(Ordering::Relaxed))
        );
        let cons = self.ring.load_consumer(Ordering::Relaxed);
        self.ring.store_consumer(cons.wrapping_add(n));
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RingType {
    Tx,
    Rx,
    Fill,
    Completion,
}

impl RingType {
    fn as_index(self) -> libc::c_int {
        match self {
            RingType::Tx => libc::XDP_TX_RING,
            RingType::Rx => libc::XDP_RX_RING,
            RingType::Fill => libc::XDP_UMEM_FILL_RING,
            RingType::Completion => libc::XDP_UMEM_COMPLETION_RING,
        }
    }

    fn page_offset(self) -> u64 {
        match self {
            RingType::Tx => libc::XDP_PGOFF_TX_RING as u64,
            RingType::Rx => libc::XDP_PGOFF_RX_RING as u64,
            RingType::Fill => libc::XDP_UMEM_PGOFF_FILL_RING,
            RingType::Completion => libc::XDP_UMEM_PGOFF_COMPLETION_RING,
        }
    }

    fn is_producer(self) -> bool {
        matches!(self, RingType::Fill | RingType::Tx)
    }

    fn offsets_of(self, offsets: &libc::xdp_mmap_offsets) -> &libc::xdp_ring_offset {
        match self {
            RingType::Tx => &offsets.tx,
            RingType::Rx => &offsets.rx,
            RingType::Fill => &offsets.fr,
            RingType::Completion => &offsets.cr,
        }
    }

    /// Declares the ring size to the kernel. Must precede the offsets query
    /// and the ring mmap.
    pub fn set_size(self, raw_fd: libc::c_int, ring_size: usize) -> io::Result<()> {
        debug_assert!(ring_size.is_power_of_two());
        let ring_size = ring_size as u32;
        unsafe {
            if libc::setsockopt(
                raw_fd,
                libc::SOL_XDP,
                self.as_index(),
                &ring_size as *const _ as *const libc::c_void,
                size_of::<u32>() as libc::socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}
