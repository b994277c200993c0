//! # Netlink link queries
//!
//! ## Purpose
//!
//! Resolves the capture device at startup: interface name to index, plus
//! MTU and MAC for the startup log line. This is the only place the engine
//! talks rtnetlink; everything after initialization goes through the AF_XDP
//! socket and ethtool.
//!
//! ## How it works
//!
//! A `NETLINK_ROUTE` socket sends one `GetLink` dump request; the
//! `netlink-packet` crates serialize the request and deserialize the
//! multi-part response. The generic `netlink` helper owns the
//! request/response loop, a closure picks the attributes out of each
//! message.

use netlink_packet_core::{
    NLM_F_DUMP, NLM_F_REQUEST, NetlinkDeserializable, NetlinkMessage, NetlinkPayload,
    NetlinkSerializable,
};
use netlink_packet_route::{
    RouteNetlinkMessage,
    link::{LinkAttribute, LinkMessage},
};
use netlink_sys::{Socket, SocketAddr};
use std::io;

/// One network interface.
#[derive(Clone, Debug, Default)]
pub struct Link {
    /// Interface index.
    pub if_index: u32,
    /// Interface name (e.g. "eth0").
    pub name: String,
    /// Maximum transmission unit.
    pub mtu: u32,
    /// Hardware address, zeroed when the link has none of the usual size.
    pub mac: [u8; 6],
}

impl Link {
    /// The hardware address as colon-separated hex.
    pub fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Sends a netlink dump request and collects the closure's results across
/// the multi-part response.
pub fn netlink<T, F, R>(mut req: NetlinkMessage<T>, f: F) -> Result<Vec<R>, io::Error>
where
    T: NetlinkSerializable + NetlinkDeserializable,
    F: Fn(NetlinkMessage<T>) -> Result<Option<R>, io::Error>,
{
    let mut socket = Socket::new(netlink_sys::constants::NETLINK_ROUTE)?;
    let kernel_addr = SocketAddr::new(0, 0);
    socket.bind(&kernel_addr)?;
    req.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
    let mut send_buf = vec![0u8; req.buffer_len()];
    req.finalize();
    req.serialize(&mut send_buf);
    if socket.send(send_buf.as_slice(), 0)? != send_buf.len() {
        return Err(io::Error::other("failed to send netlink request"));
    };

    let (recv_buf, _) = socket.recv_from_full()?;
    let mut buffer_view = &recv_buf[..];
    let mut result = Vec::new();
    while !buffer_view.is_empty() {
        let msg = NetlinkMessage::<T>::deserialize(buffer_view).map_err(io::Error::other)?;
        let len = msg.header.length as usize;
        if let Some(r) = f(msg)? {
            result.push(r);
        }
        if len == 0 || len > buffer_view.len() {
            return Err(io::Error::other(
                "received a malformed netlink message (invalid length)",
            ));
        }
        buffer_view = &buffer_view[len..];
    }
    Ok(result)
}

/// Dumps all links from the kernel.
pub fn get_links() -> Result<Vec<Link>, io::Error> {
    let req_msg = LinkMessage::default();
    let req = NetlinkMessage::from(RouteNetlinkMessage::GetLink(req_msg));
    netlink(req, |msg| match msg.payload {
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(ref link_msg)) => {
            let mut link = Link {
                if_index: link_msg.header.index,
                ..Default::default()
            };
            for attr in link_msg.attributes.iter() {
                match attr {
                    LinkAttribute::IfName(name) => {
                        link.name = name.to_string();
                    }
                    LinkAttribute::Mtu(mtu) => {
                        link.mtu = *mtu;
                    }
                    LinkAttribute::Address(mac) => {
                        if mac.len() == 6 {
                            link.mac = mac[0..6]
                                .try_into()
                                .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
                        }
                    }
                    _ => {}
                }
            }
            Ok(Some(link))
        }
        _ => Ok(None),
    })
}

/// Resolves one interface by name.
pub fn find_link(name: &str) -> io::Result<Link> {
    get_links()?.into_iter().find(|l| l.name == name).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such interface: {name}"),
        )
    })
}
