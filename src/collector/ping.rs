//! ICMP echo with TCP-connect fallback for unprivileged or filtered hosts.

use super::PingResult;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::net::TcpStream;

const PACKET_COUNT: u32 = 3;
const PACKET_TIMEOUT: Duration = Duration::from_secs(2);
const ECHO_PAYLOAD: &[u8] = b"lnd-connectivity-probe-payload!!";

/// Ping a target. ICMP echo needs a raw socket; any ICMP failure
/// (permission included) falls back to TCP connect timing against port 80,
/// then 443.
pub async fn ping_target(target: &str) -> PingResult {
    match icmp_ping(target).await {
        Ok(result) => result,
        Err(e) => {
            log::debug!("icmp ping of {} failed ({}), trying tcp", target, e);
            tcp_ping(target).await
        }
    }
}

async fn resolve_v4(target: &str) -> anyhow::Result<Ipv4Addr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        match ip {
            IpAddr::V4(v4) => return Ok(v4),
            IpAddr::V6(_) => anyhow::bail!("ipv6 target not supported for icmp"),
        }
    }
    let mut addrs = tokio::net::lookup_host(format!("{}:0", target)).await?;
    addrs
        .find_map(|a| match a {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            _ => None,
        })
        .ok_or_else(|| anyhow::anyhow!("no ipv4 address for {}", target))
}

async fn icmp_ping(target: &str) -> anyhow::Result<PingResult> {
    let addr = resolve_v4(target).await?;

    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.set_nonblocking(true)?;
    socket.connect(&SockAddr::from(SocketAddrV4::new(addr, 0)))?;
    let fd = AsyncFd::new(socket)?;

    let ident = std::process::id() as u16;
    let mut rtts: Vec<Duration> = Vec::new();

    for seq in 1..=PACKET_COUNT as u16 {
        let packet = build_echo_request(ident, seq);
        send_packet(&fd, &packet).await?;

        let start = Instant::now();
        let deadline = start + PACKET_TIMEOUT;
        if recv_echo_reply(&fd, ident, seq, deadline).await? {
            rtts.push(start.elapsed());
        }
    }

    let received = rtts.len() as u32;
    let loss = (PACKET_COUNT - received) as f64 / PACKET_COUNT as f64 * 100.0;
    let mut result = PingResult {
        target: target.to_string(),
        packet_loss: loss,
        ..Default::default()
    };
    if received > 0 {
        result.min_rtt = rtts.iter().copied().min().unwrap_or_default();
        result.max_rtt = rtts.iter().copied().max().unwrap_or_default();
        result.avg_rtt = rtts.iter().sum::<Duration>() / received;
    } else {
        anyhow::bail!("no echo reply from {}", target);
    }
    Ok(result)
}

async fn send_packet(fd: &AsyncFd<Socket>, packet: &[u8]) -> anyhow::Result<()> {
    loop {
        let mut guard = fd.writable().await?;
        match guard.try_io(|inner| inner.get_ref().send(packet)) {
            Ok(res) => {
                res?;
                return Ok(());
            }
            Err(_would_block) => continue,
        }
    }
}

/// Drain the raw socket until the matching echo reply arrives or the
/// deadline passes. A raw ICMP socket sees every ICMP message on the host,
/// so replies are matched on identifier and sequence.
async fn recv_echo_reply(
    fd: &AsyncFd<Socket>,
    ident: u16,
    seq: u16,
    deadline: Instant,
) -> anyhow::Result<bool> {
    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        let mut guard = match tokio::time::timeout(remaining, fd.readable()).await {
            Ok(guard) => guard?,
            Err(_) => return Ok(false),
        };
        let n = match guard.try_io(|inner| inner.get_ref().recv(&mut buf)) {
            Ok(res) => res?,
            Err(_would_block) => continue,
        };
        let data = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n) };
        if is_matching_reply(data, ident, seq) {
            return Ok(true);
        }
    }
}

fn build_echo_request(ident: u16, seq: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + ECHO_PAYLOAD.len());
    packet.extend_from_slice(&[8, 0, 0, 0]); // type 8 (echo), code 0, checksum 0
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(ECHO_PAYLOAD);
    let ck = checksum(&packet);
    packet[2..4].copy_from_slice(&ck.to_be_bytes());
    packet
}

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum = sum.wrapping_add(word as u32);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// A raw IPv4 socket delivers the IP header; the ICMP message starts after
/// IHL words.
fn is_matching_reply(datagram: &[u8], ident: u16, seq: u16) -> bool {
    if datagram.is_empty() {
        return false;
    }
    let ihl = ((datagram[0] & 0x0f) as usize) * 4;
    if datagram.len() < ihl + 8 {
        return false;
    }
    let icmp = &datagram[ihl..];
    icmp[0] == 0 // echo reply
        && u16::from_be_bytes([icmp[4], icmp[5]]) == ident
        && u16::from_be_bytes([icmp[6], icmp[7]]) == seq
}

/// TCP connect timing: one handshake stands in for min/avg/max.
async fn tcp_ping(target: &str) -> PingResult {
    for port in [80u16, 443] {
        let start = Instant::now();
        match tokio::time::timeout(
            PACKET_TIMEOUT,
            TcpStream::connect((target.to_string(), port)),
        )
        .await
        {
            Ok(Ok(_stream)) => {
                let rtt = start.elapsed();
                return PingResult {
                    target: target.to_string(),
                    packet_loss: 0.0,
                    min_rtt: rtt,
                    avg_rtt: rtt,
                    max_rtt: rtt,
                    error: None,
                };
            }
            Ok(Err(e)) => log::debug!("tcp ping {}:{} failed: {}", target, port, e),
            Err(_) => log::debug!("tcp ping {}:{} timed out", target, port),
        }
    }
    PingResult {
        target: target.to_string(),
        packet_loss: 100.0,
        error: Some(format!("tcp connect to {}:80 and :443 failed", target)),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_verifies() {
        // A packet whose checksum field is filled in sums to zero.
        let packet = build_echo_request(0x1234, 1);
        let mut sum = 0u32;
        for chunk in packet.chunks(2) {
            let word = if chunk.len() == 2 {
                u16::from_be_bytes([chunk[0], chunk[1]])
            } else {
                u16::from_be_bytes([chunk[0], 0])
            };
            sum = sum.wrapping_add(word as u32);
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        assert_eq!(sum as u16, 0xffff);
    }

    #[test]
    fn test_matching_reply() {
        // 20-byte IP header followed by an echo reply.
        let mut datagram = vec![0x45u8; 1];
        datagram.extend_from_slice(&[0; 19]);
        datagram.extend_from_slice(&[0, 0, 0, 0]);
        datagram.extend_from_slice(&0x1234u16.to_be_bytes());
        datagram.extend_from_slice(&2u16.to_be_bytes());
        assert!(is_matching_reply(&datagram, 0x1234, 2));
        assert!(!is_matching_reply(&datagram, 0x1234, 3));
        assert!(!is_matching_reply(&datagram, 0x4321, 2));
        assert!(!is_matching_reply(&[0x45], 0x1234, 2));
    }

    #[tokio::test]
    async fn test_tcp_ping_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });
        // Direct port probe rather than 80/443: exercises the connect path.
        let start = Instant::now();
        let ok = tokio::time::timeout(
            Duration::from_secs(2),
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await;
        assert!(ok.is_ok());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_ping_unroutable_reports_loss() {
        // 203.0.113.0/24 is TEST-NET-3; both ICMP and TCP paths fail.
        let result = ping_target("203.0.113.1").await;
        assert_eq!(result.packet_loss, 100.0);
        assert!(result.error.is_some());
        assert_eq!(result.min_rtt, Duration::ZERO);
    }
}
