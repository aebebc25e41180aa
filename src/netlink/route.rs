//! RTNL dumps: link list, IPv4 address list and default-gateway discovery.

use super::{for_each_message, parse_attrs, NetlinkSocket};
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;

const RTM_NEWLINK: u16 = 16;
const RTM_GETLINK: u16 = 18;
const RTM_NEWADDR: u16 = 20;
const RTM_GETADDR: u16 = 22;
const RTM_NEWROUTE: u16 = 24;
const RTM_GETROUTE: u16 = 26;

const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_MTU: u16 = 4;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

const RTA_GATEWAY: u16 = 5;

// struct ifinfomsg
const IFINFOMSG_LEN: usize = 16;
// struct ifaddrmsg
const IFADDRMSG_LEN: usize = 8;
// struct rtmsg
const RTMSG_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub index: i32,
    pub name: String,
    pub mac: String,
    pub mtu: u32,
    pub is_loopback: bool,
}

/// Dump all network links (RTM_GETLINK).
pub fn link_list() -> io::Result<Vec<LinkInfo>> {
    let socket = NetlinkSocket::open(libc::NETLINK_ROUTE)?;
    // struct rtgenmsg { unsigned char rtgen_family; } padded to 4 bytes
    let dump = socket.dump(RTM_GETLINK, &[libc::AF_UNSPEC as u8, 0, 0, 0])?;

    let mut links = Vec::new();
    for_each_message(&dump, RTM_NEWLINK, |payload| {
        if payload.len() < IFINFOMSG_LEN {
            return;
        }
        let index = i32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let flags = u32::from_ne_bytes([payload[8], payload[9], payload[10], payload[11]]);

        let mut link = LinkInfo {
            index,
            name: String::new(),
            mac: String::new(),
            mtu: 0,
            is_loopback: flags & libc::IFF_LOOPBACK as u32 != 0,
        };
        for attr in parse_attrs(&payload[IFINFOMSG_LEN..]) {
            match attr.kind {
                IFLA_IFNAME => {
                    link.name = String::from_utf8_lossy(
                        attr.data.split(|&b| b == 0).next().unwrap_or(&[]),
                    )
                    .into_owned();
                }
                IFLA_ADDRESS => {
                    link.mac = attr
                        .data
                        .iter()
                        .map(|b| format!("{:02x}", b))
                        .collect::<Vec<_>>()
                        .join(":");
                }
                IFLA_MTU if attr.data.len() >= 4 => {
                    link.mtu = u32::from_ne_bytes([
                        attr.data[0],
                        attr.data[1],
                        attr.data[2],
                        attr.data[3],
                    ]);
                }
                _ => {}
            }
        }
        links.push(link);
    });
    Ok(links)
}

/// Dump IPv4 addresses (RTM_GETADDR) keyed by interface index.
pub fn ipv4_addrs() -> io::Result<HashMap<i32, Vec<Ipv4Addr>>> {
    let socket = NetlinkSocket::open(libc::NETLINK_ROUTE)?;
    let dump = socket.dump(RTM_GETADDR, &[libc::AF_INET as u8, 0, 0, 0])?;

    let mut addrs: HashMap<i32, Vec<Ipv4Addr>> = HashMap::new();
    for_each_message(&dump, RTM_NEWADDR, |payload| {
        if payload.len() < IFADDRMSG_LEN {
            return;
        }
        if payload[0] != libc::AF_INET as u8 {
            return;
        }
        let index = u32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]) as i32;

        // IFA_LOCAL is the interface address; IFA_ADDRESS may be the
        // peer on point-to-point links. Prefer local.
        let mut local: Option<Ipv4Addr> = None;
        let mut address: Option<Ipv4Addr> = None;
        for attr in parse_attrs(&payload[IFADDRMSG_LEN..]) {
            if attr.data.len() != 4 {
                continue;
            }
            let ip = Ipv4Addr::new(attr.data[0], attr.data[1], attr.data[2], attr.data[3]);
            match attr.kind {
                IFA_LOCAL => local = Some(ip),
                IFA_ADDRESS => address = Some(ip),
                _ => {}
            }
        }
        if let Some(ip) = local.or(address) {
            addrs.entry(index).or_default().push(ip);
        }
    });
    Ok(addrs)
}

/// Find the IPv4 default gateway: the first route in the main dump whose
/// destination prefix length is zero and that carries a gateway attribute.
pub fn default_gateway() -> io::Result<Option<Ipv4Addr>> {
    let socket = NetlinkSocket::open(libc::NETLINK_ROUTE)?;
    let dump = socket.dump(RTM_GETROUTE, &[libc::AF_INET as u8, 0, 0, 0])?;

    let mut gateway: Option<Ipv4Addr> = None;
    for_each_message(&dump, RTM_NEWROUTE, |payload| {
        if gateway.is_some() || payload.len() < RTMSG_LEN {
            return;
        }
        let family = payload[0];
        let dst_len = payload[1];
        if family != libc::AF_INET as u8 || dst_len != 0 {
            return;
        }
        for attr in parse_attrs(&payload[RTMSG_LEN..]) {
            if attr.kind == RTA_GATEWAY && attr.data.len() == 4 {
                gateway = Some(Ipv4Addr::new(
                    attr.data[0],
                    attr.data[1],
                    attr.data[2],
                    attr.data[3],
                ));
                return;
            }
        }
    });
    Ok(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_list() {
        // RTNL dumps are unprivileged; every Linux host has at least lo.
        if !std::path::Path::new("/proc/net/dev").exists() {
            return;
        }
        let links = link_list().unwrap();
        assert!(!links.is_empty());
        assert!(links.iter().any(|l| l.is_loopback));
        for link in &links {
            assert!(!link.name.is_empty());
        }
    }

    #[test]
    fn test_ipv4_addrs() {
        if !std::path::Path::new("/proc/net/dev").exists() {
            return;
        }
        // Must not error even when no addresses are configured.
        ipv4_addrs().unwrap();
    }

    #[test]
    fn test_default_gateway_does_not_error() {
        if !std::path::Path::new("/proc/net/dev").exists() {
            return;
        }
        // A host without a default route yields Ok(None).
        default_gateway().unwrap();
    }
}
