//
// socket.rs - AF_XDP socket binding
//
// Purpose:
//   Creates the kernel socket for one (interface, hardware queue) pair and
//   wires it to a stream's frame pool: UMEM registration, ring sizing, ring
//   mmaps, bind. Binding is all-or-nothing; any failing step aborts the
//   stream's initialization.
//
// How it works:
//   - socket(AF_XDP), register the pool region as UMEM.
//   - Declare fill/completion/RX ring sizes, query the mmap offsets, map
//     the three rings. Receive streams create no TX ring.
//   - bind() to (ifindex, queue) with the configured bind flags.
//   Readiness waits (poll) and need-wakeup kicks also live here: they are
//   the only socket syscalls issued on the hot path.
//

use crate::capture::CaptureConfig;
use crate::ring::{
    COMP_RING_SIZE, ConsumerRing, FILL_RING_SIZE, ProducerRing, RX_RING_SIZE, RingType, XdpDesc,
};
use crate::umem::FramePool;
use std::os::fd::{AsRawFd, FromRawFd as _, OwnedFd};
use std::time::Duration;
use std::{io, ptr};

/// One bound AF_XDP socket and its three rings. Rings are declared before
/// the fd so their mappings are torn down before the socket closes.
pub struct XskSocket {
    pub fill: ProducerRing<u64>,
    pub comp: ConsumerRing<u64>,
    pub rx: ConsumerRing<XdpDesc>,
    pub fd: OwnedFd,
    if_index: u32,
    queue: u32,
}

impl XskSocket {
    pub fn bind(
        config: &CaptureConfig,
        pool: &FramePool,
        if_index: u32,
        queue: u32,
    ) -> io::Result<Self> {
        let (fd, raw_fd) = unsafe {
            let fd = libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            (OwnedFd::from_raw_fd(fd), fd)
        };

        pool.register(raw_fd)?;

        RingType::Fill.set_size(raw_fd, FILL_RING_SIZE)?;
        RingType::Completion.set_size(raw_fd, COMP_RING_SIZE)?;
        RingType::Rx.set_size(raw_fd, RX_RING_SIZE)?;

        let offsets = ring_offsets(raw_fd)?;
        let fill = ProducerRing::map(raw_fd, RingType::Fill, FILL_RING_SIZE, &offsets)?;
        let comp = ConsumerRing::map(raw_fd, RingType::Completion, COMP_RING_SIZE, &offsets)?;
        let rx = ConsumerRing::map(raw_fd, RingType::Rx, RX_RING_SIZE, &offsets)?;

        let zero_copy = match config.zero_copy {
            Some(true) => libc::XDP_ZEROCOPY,
            Some(false) => libc::XDP_COPY,
            None => 0,
        };
        let need_wakeup = if config.need_wakeup.unwrap_or(false) {
            libc::XDP_USE_NEED_WAKEUP
        } else {
            0
        };

        let sxdp = libc::sockaddr_xdp {
            sxdp_family: libc::AF_XDP as libc::sa_family_t,
            sxdp_flags: zero_copy | need_wakeup,
            sxdp_ifindex: if_index,
            sxdp_queue_id: queue,
            sxdp_shared_umem_fd: 0,
        };

        if unsafe {
            libc::bind(
                raw_fd,
                &sxdp as *const _ as *const libc::sockaddr,
                size_of::<libc::sockaddr_xdp>() as libc::socklen_t,
            ) < 0
        } {
            return Err(io::Error::other(format!(
                "failed to bind to queue {queue}: {}",
                io::Error::last_os_error()
            )));
        }

        log::debug!("bound AF_XDP socket: ifindex {if_index} queue {queue}");

        Ok(Self {
            fill,
            comp,
            rx,
            fd,
            if_index,
            queue,
        })
    }

    /// Bounded wait for readability. `Ok(true)` means the RX ring should
    /// have entries, `Ok(false)` that the timeout elapsed.
    pub fn poll_read(&self, timeout: Duration) -> io::Result<bool> {
        let mut fds = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut fds, 1, timeout.as_millis() as libc::c_int) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret > 0)
    }

    /// Wakes the kernel after a fill submit when the ring flags ask for it.
    pub fn kick_rx(&self) -> io::Result<()> {
        if !self.fill.needs_wakeup() {
            return Ok(());
        }
        if unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                ptr::null_mut(),
                0,
                libc::MSG_DONTWAIT,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        } < 0
        {
            match io::Error::last_os_error().raw_os_error() {
                None | Some(libc::EBUSY | libc::ENOBUFS | libc::EAGAIN | libc::EINTR) => {}
                Some(libc::ENETDOWN) => {
                    log::warn!("interface index {} is down, cannot wake up", self.if_index);
                }
                Some(e) => {
                    return Err(io::Error::from_raw_os_error(e));
                }
            }
        }
        Ok(())
    }

    pub fn queue(&self) -> u32 {
        self.queue
    }

    /// Assembles a socket from already-mapped rings and an arbitrary fd,
    /// so ring traffic can be driven without a kernel AF_XDP socket.
    #[cfg(test)]
    pub(crate) fn from_parts(
        fill: ProducerRing<u64>,
        comp: ConsumerRing<u64>,
        rx: ConsumerRing<XdpDesc>,
        fd: OwnedFd,
        queue: u32,
    ) -> Self {
        XskSocket {
            fill,
            comp,
            rx,
            fd,
            if_index: 0,
            queue,
        }
    }
}

impl AsRawFd for XskSocket {
    fn as_raw_fd(&self) -> libc::c_int {
        self.fd.as_raw_fd()
    }
}

/// Queries where the kernel wants the ring pages mapped.
pub fn ring_offsets(raw_fd: libc::c_int) -> io::Result<libc::xdp_mmap_offsets> {
    let mut offsets: libc::xdp_mmap_offsets = unsafe { std::mem::zeroed() };
    let mut optlen = size_of::<libc::xdp_mmap_offsets>() as libc::socklen_t;
    unsafe {
        if libc::getsockopt(
            raw_fd,
            libc::SOL_XDP,
            libc::XDP_MMAP_OFFSETS,
            &mut offsets as *mut _ as *mut libc::c_void,
            &mut optlen,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(offsets)
}
