// Public modules and re-exports
pub mod capture;
pub mod channels;
pub mod mmap;
pub mod netlink;
pub mod prog;
pub mod ring;
pub mod socket;
pub mod stream;
pub mod umem;

pub use capture::{CaptureConfig, CaptureError, XdpCapture};
pub use prog::{XDP_FLAGS_DRV_MODE, XDP_FLAGS_SKB_MODE, XDP_FLAGS_UPDATE_IF_NOEXIST};
pub use stream::{CapturedPacket, POLL_TIMEOUT, RX_BATCH_SIZE, Received, RxStream, StreamError};
pub use umem::{FRAME_HEADROOM, FRAME_SIZE, NUM_FRAMES};

#[cfg(test)]
mod tests;
