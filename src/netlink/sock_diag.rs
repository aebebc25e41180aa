//! INET_DIAG census of IPv4 TCP sockets by kernel state.

use super::{for_each_message, NetlinkSocket};
use std::io;

const SOCK_DIAG_BY_FAMILY: u16 = 20;

// From include/net/tcp_states.h
pub const TCP_ESTABLISHED: u8 = 1;
pub const TCP_TIME_WAIT: u8 = 6;
pub const TCP_CLOSE_WAIT: u8 = 8;

#[repr(C)]
#[derive(Clone, Copy)]
struct InetDiagSockId {
    idiag_sport: u16,
    idiag_dport: u16,
    idiag_src: [u32; 4],
    idiag_dst: [u32; 4],
    idiag_if: u32,
    idiag_cookie: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct InetDiagReqV2 {
    sdiag_family: u8,
    sdiag_protocol: u8,
    idiag_ext: u8,
    pad: u8,
    idiag_states: u32,
    id: InetDiagSockId,
}

// struct inet_diag_msg up to and including idiag_state
const STATE_OFFSET: usize = 1;
const INET_DIAG_MSG_LEN: usize = 72;

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpStateCounts {
    pub established: u64,
    pub time_wait: u64,
    pub close_wait: u64,
}

/// Dump all IPv4 TCP sockets and count the states the dashboard cares
/// about. Requires NETLINK_SOCK_DIAG access; restricted kernels return
/// EPERM/EACCES, which the caller treats as a degraded (all-zero) census.
pub fn tcp_state_counts() -> io::Result<TcpStateCounts> {
    let req = InetDiagReqV2 {
        sdiag_family: libc::AF_INET as u8,
        sdiag_protocol: libc::IPPROTO_TCP as u8,
        idiag_ext: 0,
        pad: 0,
        idiag_states: !0, // all states; we filter in userspace
        id: unsafe { std::mem::zeroed() },
    };
    let payload = unsafe {
        std::slice::from_raw_parts(
            &req as *const _ as *const u8,
            std::mem::size_of::<InetDiagReqV2>(),
        )
    };

    let socket = NetlinkSocket::open(libc::NETLINK_SOCK_DIAG)?;
    let dump = socket.dump(SOCK_DIAG_BY_FAMILY, payload)?;

    let mut counts = TcpStateCounts::default();
    for_each_message(&dump, SOCK_DIAG_BY_FAMILY, |payload| {
        if payload.len() < INET_DIAG_MSG_LEN {
            return;
        }
        match payload[STATE_OFFSET] {
            TCP_ESTABLISHED => counts.established += 1,
            TCP_TIME_WAIT => counts.time_wait += 1,
            TCP_CLOSE_WAIT => counts.close_wait += 1,
            _ => {}
        }
    });
    Ok(counts)
}
