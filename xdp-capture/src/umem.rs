//
// umem.rs - UMEM frame pool
//
// Purpose:
//   Owns the shared packet memory region and its frame geometry. Frames are
//   identified everywhere by their byte offset into the region; that u64
//   address is the value circulating through the rings, never a pointer.
//
// How it works:
//   The region is NUM_FRAMES frames of FRAME_SIZE bytes, mapped anonymously
//   and registered with the socket as its UMEM. FRAME_HEADROOM bytes are
//   declared to the kernel so every received payload is preceded by room
//   for the capture metadata (PacketMeta). The fill ring is populated once
//   per stream with the first ring's worth of frame addresses; afterwards
//   frames cycle between the kernel and the application via the rings.
//

use crate::mmap::OwnedMmap;
use crate::ring::{FILL_RING_SIZE, ProducerRing};
use std::{io, ptr};

/// Frames in the region.
pub const NUM_FRAMES: usize = 4096;
/// Frame (UMEM chunk) size in bytes.
pub const FRAME_SIZE: usize = 4096;
/// Metadata bytes preceding every delivered payload.
pub const FRAME_HEADROOM: usize = size_of::<PacketMeta>();

/// Capture metadata written into the frame headroom, immediately before the
/// payload: nanosecond timestamp, then the original wire length. The layout
/// is part of the delivered buffer format and must stay exactly 12 bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct PacketMeta {
    pub timestamp: u64,
    pub packet_len: u32,
}

static_assertions::const_assert_eq!(size_of::<PacketMeta>(), 12);

impl PacketMeta {
    /// Writes the metadata at `headroom`.
    ///
    /// # Safety
    /// `headroom` must point at `FRAME_HEADROOM` writable bytes.
    pub(crate) unsafe fn write(self, headroom: *mut u8) {
        unsafe { ptr::write_unaligned(headroom as *mut PacketMeta, self) }
    }

    /// Reads the metadata back from `headroom`.
    ///
    /// # Safety
    /// `headroom` must point at `FRAME_HEADROOM` initialized bytes.
    pub(crate) unsafe fn read(headroom: *const u8) -> Self {
        unsafe { ptr::read_unaligned(headroom as *const PacketMeta) }
    }
}

/// The shared memory region backing one stream's frames.
pub struct FramePool {
    region: OwnedMmap,
}

impl FramePool {
    /// Maps an anonymous zero-initialized region for `NUM_FRAMES` frames.
    pub fn create(huge_page: Option<bool>) -> io::Result<Self> {
        let region = OwnedMmap::anonymous(NUM_FRAMES * FRAME_SIZE, huge_page)
            .map_err(|e| io::Error::other(format!("failed to allocate UMEM region: {e}")))?;
        Ok(FramePool { region })
    }

    /// Registers the region as the socket's UMEM, declaring the frame size
    /// and the metadata headroom.
    pub fn register(&self, raw_fd: libc::c_int) -> io::Result<()> {
        let reg = unsafe {
            libc::xdp_umem_reg {
                addr: self.region.as_void_ptr() as u64,
                len: self.region.len() as u64,
                chunk_size: FRAME_SIZE as u32,
                headroom: FRAME_HEADROOM as u32,
                ..std::mem::zeroed()
            }
        };
        unsafe {
            if libc::setsockopt(
                raw_fd,
                libc::SOL_XDP,
                libc::XDP_UMEM_REG,
                &reg as *const _ as *const libc::c_void,
                size_of::<libc::xdp_umem_reg>() as libc::socklen_t,
            ) < 0
            {
                return Err(io::Error::other(format!(
                    "failed to register UMEM: {}",
                    io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }

    /// Offers the first `FILL_RING_SIZE` frame addresses to the kernel, in
    /// order. Called exactly once per stream after the socket is bound. The
    /// reservation is all-or-nothing: a fresh fill ring that cannot take the
    /// full depth means the stream never becomes usable.
    pub fn populate_fill_ring(&self, fill: &mut ProducerRing<u64>) -> io::Result<()> {
        let n = FILL_RING_SIZE as u32;
        let Some(idx) = fill.reserve(n) else {
            return Err(io::Error::other(
                "fill ring rejected the initial frame reservation",
            ));
        };
        for i in 0..n {
            fill.write(idx.wrapping_add(i), i as u64 * FRAME_SIZE as u64);
        }
        fill.submit(n);
        Ok(())
    }

    /// Resolves a ring address to memory inside the region.
    pub fn frame(&self, addr: u64) -> *mut u8 {
        debug_assert!((addr as usize) < self.region.len());
        unsafe { self.region.as_u8_ptr().add(addr as usize) }
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }
}

/// Masks an RX descriptor address down to the base address of its frame.
/// Delivered addresses point at payload (past the kernel and metadata
/// headroom); the fill ring wants frame bases back.
pub fn frame_base(addr: u64) -> u64 {
    addr & !(FRAME_SIZE as u64 - 1)
}
