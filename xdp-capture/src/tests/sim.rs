//
// sim.rs - simulated rings and streams
//
// Builds the user-space ring wrappers over anonymous memory with synthetic
// layout offsets and drives the kernel half of the cursor protocol by
// hand, so ring and stream behavior is testable without an AF_XDP socket.
// A pipe stands in for the socket fd; it is never readable, so empty-ring
// polls genuinely wait.
//

use crate::mmap::OwnedMmap;
use crate::ring::{
    COMP_RING_SIZE, ConsumerRing, FILL_RING_SIZE, ProducerRing, RX_RING_SIZE, RingMmap, XdpDesc,
};
use crate::socket::XskSocket;
use crate::stream::RxStream;
use crate::umem::{FRAME_HEADROOM, FramePool};
use std::io;
use std::os::fd::{FromRawFd as _, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PROD_OFFSET: usize = 0;
const CONS_OFFSET: usize = 64;
const FLAGS_OFFSET: usize = 128;
const DESC_OFFSET: usize = 192;

/// Offset a delivered payload sits at inside its frame: the kernel's own
/// packet headroom plus the configured metadata headroom.
pub const DELIVERY_OFFSET: u64 = 256 + FRAME_HEADROOM as u64;

/// The kernel's half of one simulated ring.
pub struct KernelSide<T> {
    producer: *mut AtomicU32,
    consumer: *mut AtomicU32,
    flags: *mut AtomicU32,
    desc: *mut T,
    size: u32,
}

impl<T: Copy> KernelSide<T> {
    /// Publishes entries the way the kernel does: write the slots, then
    /// move the producer cursor.
    pub fn produce(&self, values: &[T]) {
        unsafe {
            let mut prod = (*self.producer).load(Ordering::Relaxed);
            for v in values {
                *self.desc.add((prod & (self.size - 1)) as usize) = *v;
                prod = prod.wrapping_add(1);
            }
            (*self.producer).store(prod, Ordering::Release);
        }
    }

    /// Drains up to `max` entries published by the user side.
    pub fn consume(&self, max: u32) -> Vec<T> {
        unsafe {
            let prod = (*self.producer).load(Ordering::Acquire);
            let mut cons = (*self.consumer).load(Ordering::Relaxed);
            let mut taken = Vec::new();
            while cons != prod && (taken.len() as u32) < max {
                taken.push(*self.desc.add((cons & (self.size - 1)) as usize));
                cons = cons.wrapping_add(1);
            }
            (*self.consumer).store(cons, Ordering::Release);
            taken
        }
    }

    /// Entries published by the user side and not yet drained here.
    pub fn queued(&self) -> u32 {
        unsafe {
            (*self.producer)
                .load(Ordering::Acquire)
                .wrapping_sub((*self.consumer).load(Ordering::Relaxed))
        }
    }

    /// Total entries the user side has released back on a kernel-produced
    /// ring, read off the shared consumer word.
    pub fn released(&self) -> u32 {
        unsafe { (*self.consumer).load(Ordering::Acquire) }
    }

    /// Forces both shared cursor words to `value`. Only meaningful before
    /// the user-side wrapper is built on top of the mapping.
    pub fn set_cursors(&self, value: u32) {
        unsafe {
            (*self.producer).store(value, Ordering::Release);
            (*self.consumer).store(value, Ordering::Release);
        }
    }

    pub fn set_flags(&self, bits: u32) {
        unsafe { (*self.flags).store(bits, Ordering::Release) }
    }
}

/// An anonymous ring mapping plus its kernel half.
pub fn sim_ring<T: Copy>(size: usize) -> (RingMmap<T>, KernelSide<T>) {
    let mmap = OwnedMmap::anonymous(DESC_OFFSET + size * size_of::<T>(), Some(false)).unwrap();
    let base = mmap.as_u8_ptr();
    let kernel = KernelSide {
        producer: unsafe { base.add(PROD_OFFSET) } as *mut AtomicU32,
        consumer: unsafe { base.add(CONS_OFFSET) } as *mut AtomicU32,
        flags: unsafe { base.add(FLAGS_OFFSET) } as *mut AtomicU32,
        desc: unsafe { base.add(DESC_OFFSET) } as *mut T,
        size: size as u32,
    };
    let offsets = libc::xdp_ring_offset {
        producer: PROD_OFFSET as u64,
        consumer: CONS_OFFSET as u64,
        desc: DESC_OFFSET as u64,
        flags: FLAGS_OFFSET as u64,
    };
    (RingMmap::from_offsets(mmap, &offsets), kernel)
}

pub fn sim_producer<T: Copy>(size: usize) -> (ProducerRing<T>, KernelSide<T>) {
    let (mmap, kernel) = sim_ring(size);
    (ProducerRing::new(mmap, size), kernel)
}

pub fn sim_consumer<T: Copy>(size: usize) -> (ConsumerRing<T>, KernelSide<T>) {
    let (mmap, kernel) = sim_ring(size);
    (ConsumerRing::new(mmap, size), kernel)
}

pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// A receive stream over simulated rings, with a pipe in place of the
/// socket fd.
pub struct SimStream {
    pub stream: RxStream,
    pub rx: KernelSide<XdpDesc>,
    pub fill: KernelSide<u64>,
    pub halt: CancellationToken,
    umem_base: *mut u8,
    _pipe_wr: OwnedFd,
}

impl SimStream {
    pub fn new(poll_timeout: Duration) -> Self {
        Self::build(0, poll_timeout, false)
    }

    /// A stream carrying the given hardware queue index.
    pub fn with_queue(queue: u32, poll_timeout: Duration) -> Self {
        Self::build(queue, poll_timeout, false)
    }

    /// A stream whose fill ring is already full, so no recycle can ever
    /// reserve a slot.
    pub fn with_saturated_fill(poll_timeout: Duration) -> Self {
        Self::build(0, poll_timeout, true)
    }

    fn build(queue: u32, poll_timeout: Duration, saturate_fill: bool) -> Self {
        let pool = FramePool::create(Some(false)).unwrap();
        let umem_base = pool.frame(0);
        let (mut fill, fill_kernel) = sim_producer::<u64>(FILL_RING_SIZE);
        if saturate_fill {
            let n = FILL_RING_SIZE as u32;
            let idx = fill.reserve(n).unwrap();
            for i in 0..n {
                fill.write(idx.wrapping_add(i), 0);
            }
            fill.submit(n);
        }
        let (comp, _) = sim_consumer::<u64>(COMP_RING_SIZE);
        let (rx, rx_kernel) = sim_consumer::<XdpDesc>(RX_RING_SIZE);
        let (rd, wr) = pipe().unwrap();
        let socket = XskSocket::from_parts(fill, comp, rx, rd, queue);
        let halt = CancellationToken::new();
        let stream = RxStream::new(socket, pool, queue, halt.child_token(), poll_timeout);
        SimStream {
            stream,
            rx: rx_kernel,
            fill: fill_kernel,
            halt,
            umem_base,
            _pipe_wr: wr,
        }
    }

    /// Plays the kernel delivering one packet: payload bytes land past the
    /// delivery offset of `frame` and an RX entry is published.
    pub fn deliver(&self, frame: u64, payload: &[u8]) {
        let addr = frame + DELIVERY_OFFSET;
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.umem_base.add(addr as usize),
                payload.len(),
            );
        }
        self.rx.produce(&[XdpDesc {
            addr,
            len: payload.len() as u32,
            options: 0,
        }]);
    }
}
