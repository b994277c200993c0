use crate::ring::{COMP_RING_SIZE, FILL_RING_SIZE, RX_RING_SIZE, XdpDesc};
use crate::socket::XskSocket;
use crate::stream::{RX_BATCH_SIZE, Received, StreamError};
use crate::tests::sim::{self, SimStream};
use crate::umem::{FRAME_HEADROOM, FRAME_SIZE, frame_base};
use std::os::fd::AsRawFd as _;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(5);

fn frame(i: u64) -> u64 {
    i * FRAME_SIZE as u64
}

fn batch(got: Result<Received<'_>, StreamError>) -> Vec<crate::stream::CapturedPacket<'_>> {
    match got {
        Ok(Received::Batch(b)) => b,
        Ok(Received::Halted) => panic!("unexpected halt"),
        Err(e) => panic!("unexpected stream error: {e}"),
    }
}

#[test]
fn delivers_packets_with_framing() {
    let mut sim = SimStream::new(TICK);
    sim.deliver(frame(0), b"alpha");
    sim.deliver(frame(1), b"beta");
    let got = batch(sim.stream.read_batch(RX_BATCH_SIZE));
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].payload(), b"alpha");
    assert_eq!(got[1].payload(), b"beta");
    assert_eq!(got[0].wire_len(), 5);
    assert_eq!(got[0].capture_len(), 5);
    assert_eq!(got[0].buffer().len(), FRAME_HEADROOM + 5);

    // The headroom bytes are the metadata itself: timestamp, then length.
    let buf = got[1].buffer();
    let ts = u64::from_ne_bytes(buf[0..8].try_into().unwrap());
    let len = u32::from_ne_bytes(buf[8..12].try_into().unwrap());
    assert_eq!(ts, got[1].timestamp_ns());
    assert_eq!(len, 4);
}

#[test]
fn payload_sits_right_after_the_headroom() {
    let mut sim = SimStream::new(TICK);
    let body = [0xabu8; 128];
    sim.deliver(frame(3), &body);
    let got = batch(sim.stream.read_batch(64));
    assert_eq!(got.len(), 1);
    let p = &got[0];
    assert_eq!(p.wire_len(), 128);
    assert_eq!(p.buffer().len(), FRAME_HEADROOM + 128);
    assert_eq!(p.payload(), &body[..]);
    assert_eq!(&p.buffer()[FRAME_HEADROOM..], &body[..]);
    assert_eq!(
        p.payload().as_ptr(),
        p.buffer()[FRAME_HEADROOM..].as_ptr()
    );
}

#[test]
fn clamps_every_read_to_the_batch_limit() {
    let mut sim = SimStream::new(TICK);
    for i in 0..(RX_BATCH_SIZE as u64 + 20) {
        sim.deliver(frame(i), b"x");
    }
    let first = batch(sim.stream.read_batch(1000)).len();
    assert_eq!(first, RX_BATCH_SIZE);
    let second = batch(sim.stream.read_batch(1000)).len();
    assert_eq!(second, 20);
}

#[test]
fn zero_max_reads_nothing() {
    let mut sim = SimStream::new(TICK);
    sim.deliver(frame(0), b"pkt");
    assert!(batch(sim.stream.read_batch(0)).is_empty());
    // The delivered entry is still there for a real read.
    assert_eq!(batch(sim.stream.read_batch(64)).len(), 1);
}

#[test]
fn recycles_exactly_the_previous_batch() {
    let mut sim = SimStream::new(TICK);
    sim.deliver(frame(4), b"one");
    sim.deliver(frame(9), b"two");
    sim.deliver(frame(2), b"three");
    {
        let got = batch(sim.stream.read_batch(64));
        assert_eq!(got.len(), 3);
        // Nothing is recycled while the batch is alive.
        assert_eq!(sim.fill.queued(), 0);
        assert_eq!(sim.rx.released(), 0);
    }
    // Nor on drop of the batch; recycling happens on the next read.
    assert_eq!(sim.fill.queued(), 0);

    sim.deliver(frame(7), b"four");
    let got = batch(sim.stream.read_batch(64));
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload(), b"four");
    drop(got);

    // The second read returned the first batch's frame bases, in order,
    // and released the same count of RX entries.
    let recycled = sim.fill.consume(16);
    assert_eq!(recycled, vec![frame(4), frame(9), frame(2)]);
    // The second batch's frame has not been recycled yet.
    assert!(!recycled.contains(&frame(7)));
    assert_eq!(sim.rx.released(), 3);
}

#[test]
fn recycled_addresses_are_masked_to_frame_bases() {
    let mut sim = SimStream::new(TICK);
    sim.deliver(frame(5), b"payload");
    { batch(sim.stream.read_batch(64)); }
    sim.deliver(frame(6), b"payload");
    { batch(sim.stream.read_batch(64)); }
    let recycled = sim.fill.consume(16);
    assert_eq!(recycled, vec![frame(5)]);
    assert_eq!(recycled[0] % FRAME_SIZE as u64, 0);
    assert_eq!(frame_base(frame(5) + sim::DELIVERY_OFFSET), frame(5));
}

#[test]
fn timestamps_strictly_increase_even_when_the_clock_does_not() {
    let mut sim = SimStream::new(TICK);
    assert_eq!(sim.stream.stamp(1000), 1000);
    assert_eq!(sim.stream.stamp(1000), 1001);
    assert_eq!(sim.stream.stamp(900), 1002);
    assert_eq!(sim.stream.stamp(5000), 5000);
}

#[test]
fn batch_timestamps_increase_monotonically() {
    let mut sim = SimStream::new(TICK);
    for i in 0..10 {
        sim.deliver(frame(i), b"p");
    }
    let ts: Vec<u64> = batch(sim.stream.read_batch(64))
        .iter()
        .map(|p| p.timestamp_ns())
        .collect();
    for w in ts.windows(2) {
        assert!(w[1] > w[0], "{} then {}", w[0], w[1]);
    }
}

#[test]
fn halt_wins_over_queued_packets() {
    let mut sim = SimStream::new(TICK);
    sim.deliver(frame(0), b"pkt");
    sim.halt.cancel();
    assert!(matches!(sim.stream.read_batch(64), Ok(Received::Halted)));
    // The RX entry was not consumed.
    assert_eq!(sim.rx.released(), 0);
}

#[test]
fn halt_breaks_an_empty_ring_wait() {
    let mut sim = SimStream::new(TICK);
    let halt = sim.halt.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(25));
        halt.cancel();
    });
    let start = Instant::now();
    assert!(matches!(sim.stream.read_batch(64), Ok(Received::Halted)));
    assert!(start.elapsed() < Duration::from_secs(2));
    canceller.join().unwrap();
}

#[test]
fn fill_ring_stall_fails_the_read() {
    let mut sim = SimStream::with_saturated_fill(TICK);
    sim.deliver(frame(0), b"pkt");
    { batch(sim.stream.read_batch(64)); }
    sim.deliver(frame(1), b"next");
    match sim.stream.read_batch(64) {
        Err(StreamError::FillRing(n)) => assert_eq!(n, 1),
        _ => panic!("expected a fill ring error"),
    }
}

#[test]
fn poll_read_times_out_then_wakes() {
    let (fill, _fk) = sim::sim_producer::<u64>(FILL_RING_SIZE);
    let (comp, _ck) = sim::sim_consumer::<u64>(COMP_RING_SIZE);
    let (rx, _rk) = sim::sim_consumer::<XdpDesc>(RX_RING_SIZE);
    let (rd, wr) = sim::pipe().unwrap();
    let sock = XskSocket::from_parts(fill, comp, rx, rd, 0);
    assert!(!sock.poll_read(Duration::from_millis(5)).unwrap());
    let n = unsafe { libc::write(wr.as_raw_fd(), b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1);
    assert!(sock.poll_read(Duration::from_millis(1000)).unwrap());
}
