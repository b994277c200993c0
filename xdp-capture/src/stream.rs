//
// stream.rs - receive stream and packet framing
//
// Purpose:
//   One hardware-queue-bound receive pipeline: a frame pool, a bound
//   socket, and the read-side bookkeeping (frames to recycle, last issued
//   timestamp). Exactly one thread drives a stream; nothing here is
//   shared.
//
// How it works:
//   read_batch first recycles the frames delivered by the previous call
//   (fill resubmit + RX release, same count), then peeks the RX ring,
//   blocking in poll while it is empty. Each delivered descriptor gets
//   its capture metadata written into the frame headroom and is handed out
//   as a borrowed view; the borrow ends before the next read_batch call
//   can recycle the frames underneath it.
//

use crate::socket::XskSocket;
use crate::umem::{FRAME_HEADROOM, FramePool, PacketMeta, frame_base};
use std::os::fd::AsRawFd;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::{fmt, io, slice};
use tokio_util::sync::CancellationToken;

/// Largest number of packets one read call delivers.
pub const RX_BATCH_SIZE: usize = 64;
/// Default bounded wait while the RX ring is empty.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of a read call. Halted is terminal for the stream and is not
/// an error.
pub enum Received<'a> {
    Batch(Vec<CapturedPacket<'a>>),
    Halted,
}

#[derive(Debug)]
pub enum StreamError {
    /// The readiness wait failed. Fatal to this read call only.
    Poll(io::Error),
    /// The fill ring rejected the recycle of that many frames. The ring is
    /// stalled; the stream should be torn down.
    FillRing(u32),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Poll(e) => write!(f, "poll failed: {e}"),
            StreamError::FillRing(n) => write!(f, "fill ring rejected {n} recycled frames"),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::Poll(e) => Some(e),
            StreamError::FillRing(_) => None,
        }
    }
}

/// One delivered packet: a borrowed view into the stream's frame memory,
/// laid out as [metadata headroom][payload]. Valid until the next read on
/// the same stream, which recycles the frame under it.
pub struct CapturedPacket<'a> {
    buffer: &'a [u8],
}

impl<'a> CapturedPacket<'a> {
    /// Metadata bytes preceding the payload in every delivered buffer.
    pub const HEADROOM: usize = FRAME_HEADROOM;

    /// The whole delivered buffer, headroom included.
    pub fn buffer(&self) -> &'a [u8] {
        self.buffer
    }

    /// Payload bytes.
    pub fn payload(&self) -> &'a [u8] {
        &self.buffer[FRAME_HEADROOM..]
    }

    fn meta(&self) -> PacketMeta {
        unsafe { PacketMeta::read(self.buffer.as_ptr()) }
    }

    /// Capture timestamp in nanoseconds since the epoch. Strictly
    /// increasing within one stream.
    pub fn timestamp_ns(&self) -> u64 {
        self.meta().timestamp
    }

    /// Capture timestamp as wall-clock time.
    pub fn time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.timestamp_ns())
    }

    /// Original packet length on the wire.
    pub fn wire_len(&self) -> usize {
        self.meta().packet_len as usize
    }

    /// Bytes present in the buffer. This path never truncates, so it
    /// equals the wire length.
    pub fn capture_len(&self) -> usize {
        self.buffer.len() - FRAME_HEADROOM
    }
}

/// One hardware-queue receive stream.
pub struct RxStream {
    socket: XskSocket,
    pool: FramePool,
    queue: u32,
    halt: CancellationToken,
    poll_timeout: Duration,
    pending: Vec<u64>,
    prev_time: u64,
}

impl RxStream {
    pub(crate) fn new(
        socket: XskSocket,
        pool: FramePool,
        queue: u32,
        halt: CancellationToken,
        poll_timeout: Duration,
    ) -> Self {
        RxStream {
            socket,
            pool,
            queue,
            halt,
            poll_timeout,
            pending: Vec::with_capacity(RX_BATCH_SIZE),
            prev_time: 0,
        }
    }

    /// The hardware queue this stream is bound to.
    pub fn queue(&self) -> u32 {
        self.queue
    }

    /// Reads the next batch of packets, blocking while the RX ring is
    /// empty. At most `RX_BATCH_SIZE` packets are returned regardless of
    /// `max_packets`. Returns `Halted` once the engine's cancellation
    /// signal is set; cancellation latency is bounded by the poll timeout.
    pub fn read_batch(&mut self, max_packets: usize) -> Result<Received<'_>, StreamError> {
        self.recycle()?;

        let max = max_packets.min(RX_BATCH_SIZE) as u32;
        if max == 0 {
            return Ok(Received::Batch(Vec::new()));
        }

        let (rcvd, idx_rx) = loop {
            if self.halt.is_cancelled() {
                return Ok(Received::Halted);
            }
            let (rcvd, idx) = self.socket.rx.peek(max);
            if rcvd > 0 {
                break (rcvd, idx);
            }
            if let Err(e) = self.socket.poll_read(self.poll_timeout) {
                return Err(StreamError::Poll(e));
            }
        };

        let mut packets = Vec::with_capacity(rcvd as usize);
        for i in 0..rcvd {
            let desc = self.socket.rx.read(idx_rx.wrapping_add(i));
            let payload = self.pool.frame(desc.addr);
            let meta = PacketMeta {
                timestamp: self.next_timestamp(),
                packet_len: desc.len,
            };
            let buffer = unsafe {
                let headroom = payload.sub(FRAME_HEADROOM);
                meta.write(headroom);
                slice::from_raw_parts(headroom, FRAME_HEADROOM + desc.len as usize)
            };
            self.pending.push(frame_base(desc.addr));
            packets.push(CapturedPacket { buffer });
        }
        Ok(Received::Batch(packets))
    }

    /// Returns the previous batch's frames to the kernel: fill resubmit
    /// first, then RX release, exactly the delivered count.
    fn recycle(&mut self) -> Result<(), StreamError> {
        let n = self.pending.len() as u32;
        if n == 0 {
            return Ok(());
        }
        if !self.recycle_pending() {
            return Err(StreamError::FillRing(n));
        }
        if let Err(e) = self.socket.kick_rx() {
            log::warn!("queue {}: wakeup after recycle failed: {e}", self.queue);
        }
        Ok(())
    }

    fn recycle_pending(&mut self) -> bool {
        let n = self.pending.len() as u32;
        if n == 0 {
            return true;
        }
        let Some(idx) = self.socket.fill.reserve(n) else {
            return false;
        };
        for (i, addr) in self.pending.drain(..).enumerate() {
            self.socket.fill.write(idx.wrapping_add(i as u32), addr);
        }
        self.socket.fill.submit(n);
        self.socket.rx.release(n);
        true
    }

    fn next_timestamp(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.stamp(now)
    }

    /// Forces strictly increasing timestamps within the stream even when
    /// the sampled clock is coarse or steps backwards.
    pub(crate) fn stamp(&mut self, now: u64) -> u64 {
        let ts = if now <= self.prev_time {
            self.prev_time + 1
        } else {
            now
        };
        self.prev_time = ts;
        ts
    }
}

impl AsRawFd for RxStream {
    fn as_raw_fd(&self) -> libc::c_int {
        self.socket.as_raw_fd()
    }
}

impl Drop for RxStream {
    fn drop(&mut self) {
        // Flush the final batch so every delivered frame is back in the
        // fill ring before the mappings go away.
        if !self.recycle_pending() {
            log::debug!(
                "queue {}: {} frames still outstanding at teardown",
                self.queue,
                self.pending.len()
            );
        }
    }
}
