//
// capture.rs - capture engine and configuration
//
// Purpose:
//   The crate's front door. An XdpCapture is created against one network
//   device, provisioned with receive streams (one per hardware queue),
//   and handed out stream by stream to worker threads. All the one-time
//   setup lives here: device resolution, memlock limits, queue
//   negotiation, XDP program attach, per-queue stream construction.
//
// Main components:
//   - CaptureConfig: the knobs. Options default to "let the kernel or
//     driver decide", except the bind mode, which defaults to copy so
//     capture works on every driver.
//   - CaptureError: which setup step failed. Runtime errors are
//     StreamError, produced by the streams themselves.
//   - XdpCapture: create, start or start_parallel, take_stream per
//     worker, cancel, finish.
//

use crate::channels;
use crate::netlink;
use crate::prog::{self, XdpProg};
use crate::socket::XskSocket;
use crate::stream::{POLL_TIMEOUT, Received, RxStream, StreamError};
use crate::umem::FramePool;
use std::os::fd::AsRawFd as _;
use std::path::PathBuf;
use std::time::Duration;
use std::{fmt, io};
use tokio_util::sync::CancellationToken;

pub struct CaptureConfig {
    /// Force zero-copy (`Some(true)`) or copy mode (`Some(false)`).
    /// `None` lets the kernel pick the fastest mode the driver offers.
    /// Defaults to copy mode, which every driver supports.
    pub zero_copy: Option<bool>,
    /// Back the UMEM with huge pages. `None` probes /proc/meminfo and
    /// uses them when available.
    pub huge_page: Option<bool>,
    /// Bind with the need-wakeup protocol, saving syscalls on the fill
    /// path while the driver keeps up.
    pub need_wakeup: Option<bool>,
    /// XDP attach mode (XDP_FLAGS_SKB_MODE, XDP_FLAGS_DRV_MODE, ...).
    /// Zero lets the kernel choose.
    pub xdp_flags: u32,
    /// BPF object file holding the redirect program and its xsks_map.
    /// Without one the redirect program is assumed to be managed
    /// externally; the engine then only queries the hook.
    pub bpf_object: Option<PathBuf>,
    /// Program name inside the object. `None` takes the first program.
    pub bpf_program: Option<String>,
    /// Bounded wait per empty-ring poll. Also the cancellation latency.
    pub poll_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            zero_copy: Some(false),
            huge_page: None,
            need_wakeup: None,
            xdp_flags: 0,
            bpf_object: None,
            bpf_program: None,
            poll_timeout: POLL_TIMEOUT,
        }
    }
}

/// A setup step that failed. Construction and start are fatal as a whole
/// when any step fails; the variant says which one.
#[derive(Debug)]
pub enum CaptureError {
    /// The device string did not resolve to a usable interface.
    Device(String, io::Error),
    /// The locked-memory limit could not be lifted.
    Rlimit(io::Error),
    /// Queue negotiation with the driver failed.
    Queues(io::Error),
    /// Loading, attaching or querying the XDP program failed.
    Prog(io::Error),
    /// Building the stream for one queue failed (UMEM allocation, socket
    /// setup, bind, or fill ring population).
    Stream { queue: u32, source: io::Error },
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Device(name, e) => write!(f, "cannot open device {name}: {e}"),
            CaptureError::Rlimit(e) => write!(f, "cannot lift locked-memory limit: {e}"),
            CaptureError::Queues(e) => write!(f, "queue negotiation failed: {e}"),
            CaptureError::Prog(e) => write!(f, "XDP program setup failed: {e}"),
            CaptureError::Stream { queue, source } => {
                write!(f, "stream setup failed on queue {queue}: {source}")
            }
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Device(_, e)
            | CaptureError::Rlimit(e)
            | CaptureError::Queues(e)
            | CaptureError::Prog(e)
            | CaptureError::Stream { source: e, .. } => Some(e),
        }
    }
}

/// The capture engine for one device.
///
/// Streams are provisioned by `start` (queue 0 only) or `start_parallel`
/// (queues 0..n, one per worker thread) and then moved out with
/// `take_stream`, so each worker owns its stream outright and the hot
/// path takes no locks.
pub struct XdpCapture {
    link: netlink::Link,
    config: CaptureConfig,
    halt: CancellationToken,
    streams: Vec<Option<RxStream>>,
    prog: Option<XdpProg>,
}

impl XdpCapture {
    /// Resolves the device and prepares the process for capture. Accepts
    /// `"xdp:IFNAME"` or a bare interface name.
    pub fn new(device: &str, config: CaptureConfig) -> Result<Self, CaptureError> {
        let name =
            parse_device(device).map_err(|e| CaptureError::Device(device.to_string(), e))?;
        let link =
            netlink::find_link(name).map_err(|e| CaptureError::Device(name.to_string(), e))?;
        raise_memlock_limit().map_err(CaptureError::Rlimit)?;
        warn_missing_caps();
        log::info!(
            "capturing on {} (index {}, mtu {}, mac {})",
            link.name,
            link.if_index,
            link.mtu,
            link.mac_string()
        );
        Ok(XdpCapture {
            link,
            config,
            halt: CancellationToken::new(),
            streams: Vec::new(),
            prog: None,
        })
    }

    /// Provisions a single stream on hardware queue 0. Traffic steered to
    /// other queues by the NIC does not reach it.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        self.start_queues(1)
    }

    /// Negotiates `threads` receive queues with the driver and provisions
    /// one stream per queue. Fails when the device cannot provide that
    /// many queues.
    pub fn start_parallel(&mut self, threads: usize) -> Result<(), CaptureError> {
        let wanted = threads.max(1) as u32;
        let max = channels::max_queues(&self.link.name).map_err(CaptureError::Queues)?;
        if wanted > max {
            return Err(CaptureError::Queues(io::Error::other(format!(
                "device {} supports at most {max} queues, {wanted} requested",
                self.link.name
            ))));
        }
        let granted =
            channels::set_queue_count(&self.link.name, wanted).map_err(CaptureError::Queues)?;
        log::debug!("device {}: {granted} receive queues active", self.link.name);
        self.start_queues(granted)
    }

    fn start_queues(&mut self, queues: u32) -> Result<(), CaptureError> {
        if !self.streams.is_empty() {
            return Err(CaptureError::Queues(io::Error::other(
                "capture already started",
            )));
        }

        if let Some(path) = &self.config.bpf_object {
            let prog = XdpProg::load_and_attach(
                path,
                self.config.bpf_program.as_deref(),
                self.link.if_index,
                self.config.xdp_flags,
            )
            .map_err(CaptureError::Prog)?;
            self.prog = Some(prog);
        }

        for queue in 0..queues {
            let stream = self.open_stream(queue)?;
            if let Some(prog) = &self.prog {
                prog.register_socket(queue, stream.as_raw_fd())
                    .map_err(CaptureError::Prog)?;
            }
            self.streams.push(Some(stream));
        }

        // The hook must be queryable once sockets are up. Id zero is not an
        // error: an externally managed program may not be attached yet.
        let id = prog::query_prog_id(self.link.if_index, self.config.xdp_flags)
            .map_err(CaptureError::Prog)?;
        if id == 0 && self.prog.is_none() {
            log::warn!(
                "no XDP program attached on {}; packets will not arrive until one redirects here",
                self.link.name
            );
        } else {
            log::debug!("XDP hook on {}: program id {id}", self.link.name);
        }
        Ok(())
    }

    fn open_stream(&self, queue: u32) -> Result<RxStream, CaptureError> {
        let wrap = |source| CaptureError::Stream { queue, source };
        let pool = FramePool::create(self.config.huge_page).map_err(wrap)?;
        let mut socket =
            XskSocket::bind(&self.config, &pool, self.link.if_index, queue).map_err(wrap)?;
        pool.populate_fill_ring(&mut socket.fill).map_err(wrap)?;
        socket.kick_rx().map_err(wrap)?;
        Ok(RxStream::new(
            socket,
            pool,
            queue,
            self.halt.child_token(),
            self.config.poll_timeout,
        ))
    }

    /// Number of provisioned streams, taken ones included.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// The resolved device name.
    pub fn device(&self) -> &str {
        &self.link.name
    }

    /// Moves stream `index` out of the engine so a worker thread can own
    /// it. Returns `None` once taken or when the index is out of range.
    pub fn take_stream(&mut self, index: usize) -> Option<RxStream> {
        self.streams.get_mut(index).and_then(Option::take)
    }

    /// Reads from the first stream. Single-stream convenience; parallel
    /// callers take their streams and drive them directly. Returns
    /// `Halted` when no stream is resident.
    pub fn read(&mut self, max_packets: usize) -> Result<Received<'_>, StreamError> {
        match self.streams.first_mut().and_then(Option::as_mut) {
            Some(stream) => stream.read_batch(max_packets),
            None => Ok(Received::Halted),
        }
    }

    /// Signals every stream, resident or taken, to stop. Readers observe
    /// the signal within one poll timeout and return `Halted`.
    pub fn cancel(&self) {
        self.halt.cancel();
    }

    /// A token cancelled together with the engine.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt.child_token()
    }

    /// Stops and tears down: remaining streams are dropped (flushing
    /// their outstanding frames) and the XDP program is detached.
    pub fn finish(&mut self) {
        self.halt.cancel();
        self.streams.clear();
        self.prog = None;
    }

    /// Assembles an engine from already-built streams, so provisioning and
    /// handout can be exercised without binding real sockets.
    #[cfg(test)]
    pub(crate) fn from_streams(streams: Vec<RxStream>) -> Self {
        XdpCapture {
            link: netlink::Link::default(),
            config: CaptureConfig::default(),
            halt: CancellationToken::new(),
            streams: streams.into_iter().map(Some).collect(),
            prog: None,
        }
    }
}

impl Drop for XdpCapture {
    fn drop(&mut self) {
        self.halt.cancel();
    }
}

/// Strips an optional `scheme:` prefix off a device string.
pub(crate) fn parse_device(device: &str) -> io::Result<&str> {
    let name = match device.split_once(':') {
        Some((_, name)) => name,
        None => device,
    };
    if name.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "device has no interface name",
        ));
    }
    Ok(name)
}

/// UMEM pages are locked; the default rlimit is far too small for one
/// pool, let alone one per queue.
fn raise_memlock_limit() -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn warn_missing_caps() {
    for cap in [
        caps::Capability::CAP_NET_ADMIN,
        caps::Capability::CAP_NET_RAW,
    ] {
        match caps::has_cap(None, caps::CapSet::Effective, cap) {
            Ok(true) => {}
            Ok(false) => log::warn!("{cap} is not in the effective set, setup will likely fail"),
            Err(e) => log::debug!("capability check failed: {e}"),
        }
    }
}
