//! # Owned memory mappings
//!
//! ## Purpose
//!
//! Backing storage for the UMEM frame region. The whole capture path is
//! zero-copy: the kernel writes received packets straight into this region
//! and the engine hands out views into it, so the mapping must outlive every
//! ring and packet record derived from it.
//!
//! ## How it works
//!
//! `OwnedMmap` wraps a raw `libc::mmap` allocation and releases it with
//! `munmap` on drop. Anonymous private mappings are used for the frame
//! region; the kernel ring pages reuse the same wrapper over `MAP_SHARED`
//! mappings of the socket fd (see `ring.rs`). The region can optionally be
//! backed by 2MB huge pages when `/proc/meminfo` reports free ones.

use std::fs::File;
use std::io::{BufRead as _, BufReader};
use std::{io, ptr};

/// An owned memory-mapped region, unmapped on drop.
pub struct OwnedMmap(
    /// Base address of the mapping.
    pub *mut libc::c_void,
    /// Mapping length in bytes.
    pub usize,
);

// SAFETY: the mapping is exclusively owned and munmap works from any thread.
unsafe impl Send for OwnedMmap {}

impl OwnedMmap {
    /// Wraps an existing mapping. The caller hands over ownership; the
    /// region is unmapped when the value drops.
    pub fn new(ptr: *mut libc::c_void, size: usize) -> Self {
        OwnedMmap(ptr, size)
    }

    /// Maps a fresh anonymous zero-initialized region of at least `size`
    /// bytes, rounded up to the page size.
    ///
    /// `huge_page` selects 2MB huge pages explicitly; `None` probes
    /// `/proc/meminfo` and uses them when free 2MB pages are available.
    pub fn anonymous(size: usize, huge_page: Option<bool>) -> Result<Self, io::Error> {
        let huge_tlb = if let Some(yes) = huge_page {
            yes
        } else {
            let info = hugepage_info()?;
            if let (Some(free), Some(2048)) = (info.free, info.size_kb) {
                free > 0
            } else {
                false
            }
        };
        let page_size = if huge_tlb {
            2 * 1024 * 1024
        } else {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        };
        let aligned_size = (size + page_size - 1) & !(page_size - 1);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE
                    | libc::MAP_ANONYMOUS
                    | if huge_tlb {
                        libc::MAP_HUGETLB | libc::MAP_HUGE_2MB
                    } else {
                        0
                    },
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedMmap(ptr, aligned_size))
    }

    pub fn as_void_ptr(&self) -> *mut libc::c_void {
        self.0
    }

    pub fn as_u8_ptr(&self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Mapping length in bytes.
    pub fn len(&self) -> usize {
        self.1
    }

    pub fn is_empty(&self) -> bool {
        self.1 == 0
    }
}

impl Drop for OwnedMmap {
    fn drop(&mut self) {
        unsafe {
            if self.0 != libc::MAP_FAILED && !self.0.is_null() {
                let res = libc::munmap(self.0, self.1);
                if res < 0 {
                    log::error!("failed to unmap memory: {}", io::Error::last_os_error());
                }
            }
        }
    }
}

/// Huge page availability, as reported by `/proc/meminfo`.
#[derive(Debug, Default)]
pub struct HugePageInfo {
    /// Huge page size in kilobytes.
    pub size_kb: Option<u64>,
    /// Configured huge pages.
    pub total: Option<u64>,
    /// Free huge pages.
    pub free: Option<u64>,
}

/// Parses `Hugepagesize`, `HugePages_Total` and `HugePages_Free` out of
/// `/proc/meminfo`.
pub fn hugepage_info() -> io::Result<HugePageInfo> {
    let file = File::open("/proc/meminfo")?;
    let reader = BufReader::new(file);
    let mut info = HugePageInfo::default();
    for line in reader.lines() {
        let line = line?;
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_end_matches(" kB");
        match key.trim() {
            "Hugepagesize" => info.size_kb = Some(value.parse().map_err(io::Error::other)?),
            "HugePages_Total" => info.total = Some(value.parse().map_err(io::Error::other)?),
            "HugePages_Free" => info.free = Some(value.parse().map_err(io::Error::other)?),
            _ => {}
        }
    }
    Ok(info)
}
