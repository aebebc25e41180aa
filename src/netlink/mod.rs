pub mod route;
pub mod sock_diag;

use std::io;
use std::os::unix::io::RawFd;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ROOT: u16 = 0x100;
const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

const HDR_LEN: usize = std::mem::size_of::<NlMsgHdr>();

pub const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Thin RAII wrapper over an AF_NETLINK socket. The fd is closed on drop.
pub struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    /// Open a netlink socket for the given protocol (NETLINK_ROUTE,
    /// NETLINK_SOCK_DIAG, ...).
    pub fn open(protocol: libc::c_int) -> io::Result<Self> {
        unsafe {
            let fd = libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                protocol,
            );
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut addr: libc::sockaddr_nl = std::mem::zeroed();
            addr.nl_family = libc::AF_NETLINK as u16;
            let ret = libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            );
            if ret < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            // Bounded receive: a dump that stalls must not hang the probe.
            let timeout = libc::timeval {
                tv_sec: 2,
                tv_usec: 0,
            };
            let ret = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as u32,
            );
            if ret < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            Ok(NetlinkSocket { fd })
        }
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        unsafe {
            let mut addr: libc::sockaddr_nl = std::mem::zeroed();
            addr.nl_family = libc::AF_NETLINK as u16;
            let ret = libc::sendto(
                self.fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            );
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            if ret as usize != data.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short netlink send: {} of {}", ret, data.len()),
                ));
            }
            Ok(())
        }
    }

    fn recv(&self, buffer: &mut [u8]) -> io::Result<usize> {
        unsafe {
            let ret = libc::recv(
                self.fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0,
            );
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(ret as usize)
        }
    }

    /// Send a dump request (NLM_F_REQUEST | NLM_F_DUMP) and collect the
    /// multi-part response until NLMSG_DONE. A kernel-reported error (for
    /// example EPERM on a restricted diag family) surfaces as Err.
    pub fn dump(&self, msg_type: u16, payload: &[u8]) -> io::Result<Vec<u8>> {
        let total = HDR_LEN + payload.len();
        let hdr = NlMsgHdr {
            nlmsg_len: total as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: NLM_F_REQUEST | NLM_F_DUMP,
            nlmsg_seq: 1,
            nlmsg_pid: 0,
        };

        let mut request = Vec::with_capacity(nlmsg_align(total));
        request.extend_from_slice(unsafe {
            std::slice::from_raw_parts(&hdr as *const _ as *const u8, HDR_LEN)
        });
        request.extend_from_slice(payload);
        request.resize(nlmsg_align(total), 0);
        self.send(&request)?;

        let mut all = Vec::with_capacity(32768);
        let mut buffer = vec![0u8; 65536];
        loop {
            let n = match self.recv(&mut buffer) {
                Ok(n) => n,
                Err(e)
                    if !all.is_empty()
                        && (e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut) =>
                {
                    break;
                }
                Err(e) => return Err(e),
            };
            let chunk = &buffer[..n];

            // Scan this datagram for terminal messages before accepting it.
            let mut done = false;
            let mut offset = 0usize;
            while offset + HDR_LEN <= chunk.len() {
                let hdr: NlMsgHdr =
                    unsafe { std::ptr::read_unaligned(chunk[offset..].as_ptr() as *const _) };
                let len = hdr.nlmsg_len as usize;
                if len < HDR_LEN || offset + len > chunk.len() {
                    break;
                }
                match hdr.nlmsg_type {
                    NLMSG_DONE => done = true,
                    NLMSG_ERROR => {
                        let payload = &chunk[offset + HDR_LEN..offset + len];
                        if payload.len() >= 4 {
                            let errno =
                                i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
                            if errno != 0 {
                                return Err(io::Error::from_raw_os_error(-errno));
                            }
                        }
                        done = true;
                    }
                    _ => {}
                }
                offset += nlmsg_align(len);
            }

            all.extend_from_slice(chunk);
            if done {
                break;
            }
            // Backstop against a runaway dump.
            if all.len() > 16 * 1024 * 1024 {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "netlink dump exceeded 16MB",
                ));
            }
        }

        Ok(all)
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Walk every netlink message of `msg_type` in a dump buffer and hand its
/// payload to `f`. DONE and ERROR messages terminate the walk.
pub fn for_each_message(buf: &[u8], msg_type: u16, mut f: impl FnMut(&[u8])) {
    let mut offset = 0usize;
    while offset + HDR_LEN <= buf.len() {
        let hdr: NlMsgHdr =
            unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr() as *const _) };
        let len = hdr.nlmsg_len as usize;
        if len < HDR_LEN || offset + len > buf.len() {
            break;
        }
        if hdr.nlmsg_type == NLMSG_DONE || hdr.nlmsg_type == NLMSG_ERROR {
            break;
        }
        if hdr.nlmsg_type == msg_type {
            f(&buf[offset + HDR_LEN..offset + len]);
        }
        offset += nlmsg_align(len);
    }
}

/// A single routing attribute: 2-byte length, 2-byte type, payload, padded
/// to a 4-byte boundary.
pub struct Attr<'a> {
    pub kind: u16,
    pub data: &'a [u8],
}

/// Parse the attribute list that follows a fixed-size netlink payload header.
pub fn parse_attrs(mut buf: &[u8]) -> Vec<Attr<'_>> {
    let mut attrs = Vec::new();
    while buf.len() >= 4 {
        let rta_len = u16::from_ne_bytes([buf[0], buf[1]]) as usize;
        let rta_type = u16::from_ne_bytes([buf[2], buf[3]]);
        if rta_len < 4 || rta_len > buf.len() {
            break;
        }
        attrs.push(Attr {
            kind: rta_type,
            data: &buf[4..rta_len],
        });
        let advance = nlmsg_align(rta_len);
        if advance >= buf.len() {
            break;
        }
        buf = &buf[advance..];
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr_bytes(kind: u16, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((4 + data.len()) as u16).to_ne_bytes());
        out.extend_from_slice(&kind.to_ne_bytes());
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    #[test]
    fn test_parse_attrs() {
        let mut buf = attr_bytes(3, b"eth0\0");
        buf.extend_from_slice(&attr_bytes(4, &1500u32.to_ne_bytes()));
        let attrs = parse_attrs(&buf);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].kind, 3);
        assert_eq!(attrs[0].data, b"eth0\0");
        assert_eq!(attrs[1].kind, 4);
        assert_eq!(attrs[1].data, &1500u32.to_ne_bytes());
    }

    #[test]
    fn test_parse_attrs_truncated() {
        // A length that runs past the buffer must not panic.
        let buf = [8u8, 0, 1, 0, 0xde];
        assert!(parse_attrs(&buf).is_empty());
    }

    #[test]
    fn test_nlmsg_align() {
        assert_eq!(nlmsg_align(0), 0);
        assert_eq!(nlmsg_align(1), 4);
        assert_eq!(nlmsg_align(4), 4);
        assert_eq!(nlmsg_align(5), 8);
    }
}
