//
// channels.rs - NIC queue negotiation
//
// Ethtool channel controls, spoken over the SIOCETHTOOL ioctl on a plain
// AF_INET socket. Used once at startup to check and set the device's
// hardware queue count before any stream binds; never touched again.
//

use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd};
use std::{io, mem};

const ETHTOOL_GCHANNELS: u32 = 0x0000003c;
const ETHTOOL_SCHANNELS: u32 = 0x0000003d;

/// `struct ethtool_channels` from the kernel uapi.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct EthtoolChannels {
    cmd: u32,
    max_rx: u32,
    max_tx: u32,
    max_other: u32,
    max_combined: u32,
    rx_count: u32,
    tx_count: u32,
    other_count: u32,
    combined_count: u32,
}

static_assertions::const_assert_eq!(size_of::<EthtoolChannels>(), 36);

/// Issues one ethtool request for `ifname`. `Ok(true)` means the driver
/// applied it, `Ok(false)` that the driver has no channel support
/// (EOPNOTSUPP); anything else is a hard error.
fn send_ethtool(ifname: &str, channels: &mut EthtoolChannels) -> io::Result<bool> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    let name = ifname.as_bytes();
    if name.len() >= ifr.ifr_name.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name too long: {ifname}"),
        ));
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_data = channels as *mut EthtoolChannels as *mut libc::c_char;

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCETHTOOL, &mut ifr) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EOPNOTSUPP) {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(true)
}

/// The largest hardware queue count the device supports. Devices without
/// channel controls report one queue.
pub fn max_queues(ifname: &str) -> io::Result<u32> {
    let mut ch = EthtoolChannels {
        cmd: ETHTOOL_GCHANNELS,
        ..Default::default()
    };
    if !send_ethtool(ifname, &mut ch)? {
        return Ok(1);
    }
    Ok(ch.max_rx.max(ch.max_tx).max(ch.max_combined).max(1))
}

/// The currently configured queue count.
pub fn current_queues(ifname: &str) -> io::Result<u32> {
    let mut ch = EthtoolChannels {
        cmd: ETHTOOL_GCHANNELS,
        ..Default::default()
    };
    if !send_ethtool(ifname, &mut ch)? {
        return Ok(1);
    }
    Ok(ch.rx_count.max(ch.tx_count).max(ch.combined_count).max(1))
}

/// Sets the device queue count. Tries the combined-channel form first and
/// falls back to setting RX and TX counts separately when the driver
/// rejects it. Returns the resulting count.
pub fn set_queue_count(ifname: &str, queues: u32) -> io::Result<u32> {
    let mut ch = EthtoolChannels {
        cmd: ETHTOOL_GCHANNELS,
        ..Default::default()
    };
    if !send_ethtool(ifname, &mut ch)? {
        if queues <= 1 {
            return Ok(1);
        }
        return Err(io::Error::other(format!(
            "{ifname}: driver does not support channel configuration"
        )));
    }

    let org_combined = ch.combined_count;
    ch.cmd = ETHTOOL_SCHANNELS;
    ch.combined_count = queues;
    match send_ethtool(ifname, &mut ch) {
        Ok(true) => return Ok(queues),
        Ok(false) => {}
        Err(e) => {
            log::debug!("{ifname}: combined channel set rejected, trying rx/tx: {e}");
        }
    }

    ch.rx_count = queues;
    ch.tx_count = queues;
    ch.combined_count = org_combined;
    match send_ethtool(ifname, &mut ch) {
        Ok(true) => Ok(queues),
        Ok(false) => Err(io::Error::other(format!(
            "{ifname}: driver does not support channel configuration"
        ))),
        Err(e) => Err(io::Error::other(format!(
            "{ifname}: failed to set {queues} queues: {e}"
        ))),
    }
}
