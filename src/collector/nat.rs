//! STUN binding probe and minimal NAT classification.
//!
//! The probe performs one RFC 5389 binding exchange per configured server.
//! It distinguishes open-internet, blocked-UDP and behind-NAT cases; the
//! cone/restricted/symmetric split needs the RFC 5780 behaviour tests, so
//! Other-Address is captured to enable that extension but the type is
//! reported as behind-NAT-unknown for now.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const STUN_TIMEOUT: Duration = Duration::from_secs(2);

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_OTHER_ADDRESS: u16 = 0x802c;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    OpenInternet,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
    UdpBlocked,
    BehindNat,
    Unknown,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatType::OpenInternet => "Open Internet",
            NatType::FullCone => "Full Cone",
            NatType::RestrictedCone => "Restricted Cone",
            NatType::PortRestrictedCone => "Port Restricted Cone",
            NatType::Symmetric => "Symmetric NAT",
            NatType::UdpBlocked => "UDP Blocked",
            NatType::BehindNat => "Behind NAT (Type Unknown)",
            NatType::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct NatInfo {
    pub target: String,
    pub nat_type: NatType,
    pub public_ip: String,
    pub local_ip: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StunTarget {
    pub host: String,
    pub port: u16,
}

pub struct NatProbe {
    targets: Vec<StunTarget>,
}

impl NatProbe {
    pub fn new(targets: Vec<StunTarget>) -> Self {
        NatProbe { targets }
    }

    /// Probe every configured server in parallel and collect the results
    /// over a channel sized to the fan-out.
    pub async fn collect(&self) -> Vec<NatInfo> {
        if self.targets.is_empty() {
            return Vec::new();
        }
        let (tx, mut rx) = mpsc::channel(self.targets.len());
        for target in self.targets.clone() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let info = probe_target(&target).await;
                let _ = tx.send(info).await;
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(self.targets.len());
        while let Some(info) = rx.recv().await {
            results.push(info);
        }
        results
    }
}

async fn probe_target(target: &StunTarget) -> NatInfo {
    let mut info = NatInfo {
        target: format!("{}:{}", target.host, target.port),
        nat_type: NatType::Unknown,
        public_ip: String::new(),
        local_ip: String::new(),
        error: None,
    };

    // A connected socket makes the kernel pick the source address, which is
    // exactly the "local IP" the classification compares against.
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            info.nat_type = NatType::UdpBlocked;
            info.error = Some(format!("binding udp socket: {}", e));
            return info;
        }
    };
    if let Err(e) = socket.connect((target.host.as_str(), target.port)).await {
        info.nat_type = NatType::UdpBlocked;
        info.error = Some(format!("dialing stun host: {}", e));
        return info;
    }
    if let Ok(local) = socket.local_addr() {
        info.local_ip = local.ip().to_string();
    }

    let transaction_id: [u8; 12] = rand::random();
    let request = encode_binding_request(transaction_id);

    let exchange = async {
        socket.send(&request).await?;
        let mut buf = vec![0u8; 1024];
        loop {
            let n = socket.recv(&mut buf).await?;
            if let Some(binding) = decode_binding_response(&buf[..n], transaction_id) {
                return Ok::<_, std::io::Error>(binding);
            }
        }
    };

    let binding = match tokio::time::timeout(STUN_TIMEOUT, exchange).await {
        Ok(Ok(binding)) => binding,
        Ok(Err(e)) => {
            info.nat_type = NatType::UdpBlocked;
            info.error = Some(format!("stun request failed: {}", e));
            return info;
        }
        Err(_) => {
            // A reply landing after this point is simply never read.
            info.error = Some("stun request timed out".to_string());
            return info;
        }
    };

    match binding.mapped {
        Some(addr) => info.public_ip = addr.ip().to_string(),
        None => {
            info.nat_type = NatType::Unknown;
            info.error = Some("failed to get public ip".to_string());
            return info;
        }
    }

    info.nat_type = classify(&info.public_ip, &info.local_ip, binding.other.is_some());
    info
}

fn classify(public_ip: &str, local_ip: &str, _has_other_address: bool) -> NatType {
    if public_ip.is_empty() {
        return NatType::Unknown;
    }
    if public_ip == local_ip {
        return NatType::OpenInternet;
    }
    NatType::BehindNat
}

struct BindingResponse {
    mapped: Option<SocketAddr>,
    other: Option<SocketAddr>,
}

fn encode_binding_request(transaction_id: [u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(20);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes()); // no attributes
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(&transaction_id);
    msg
}

/// Decode a binding success response, preferring XOR-Mapped-Address over
/// the legacy Mapped-Address. Messages for other transactions are ignored.
fn decode_binding_response(buf: &[u8], transaction_id: [u8; 12]) -> Option<BindingResponse> {
    if buf.len() < 20 {
        return None;
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if msg_type != BINDING_SUCCESS || cookie != MAGIC_COOKIE {
        return None;
    }
    if buf[8..20] != transaction_id {
        return None;
    }
    if buf.len() < 20 + msg_len {
        return None;
    }

    let mut xor_mapped: Option<SocketAddr> = None;
    let mut mapped: Option<SocketAddr> = None;
    let mut other: Option<SocketAddr> = None;

    let mut pos = 20usize;
    let end = 20 + msg_len;
    while pos + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let attr_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
        let value_start = pos + 4;
        if value_start + attr_len > end {
            break;
        }
        let value = &buf[value_start..value_start + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = decode_address(value, true, transaction_id),
            ATTR_MAPPED_ADDRESS => mapped = decode_address(value, false, transaction_id),
            ATTR_OTHER_ADDRESS => other = decode_address(value, false, transaction_id),
            _ => {}
        }
        pos = value_start + (attr_len + 3) / 4 * 4;
    }

    Some(BindingResponse {
        mapped: xor_mapped.or(mapped),
        other,
    })
}

fn decode_address(value: &[u8], xored: bool, transaction_id: [u8; 12]) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xored {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    match family {
        0x01 => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xored {
                let cookie = MAGIC_COOKIE.to_be_bytes();
                for (o, c) in octets.iter_mut().zip(cookie.iter()) {
                    *o ^= c;
                }
            }
            Some(SocketAddr::from((octets, port)))
        }
        0x02 => {
            if value.len() < 20 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if xored {
                let mut mask = [0u8; 16];
                mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                mask[4..].copy_from_slice(&transaction_id);
                for (o, m) in octets.iter_mut().zip(mask.iter()) {
                    *o ^= m;
                }
            }
            Some(SocketAddr::from((octets, port)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_attr(transaction_id: [u8; 12], attr_type: u16, value: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        msg.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&transaction_id);
        msg.extend_from_slice(&attr_type.to_be_bytes());
        msg.extend_from_slice(&(value.len() as u16).to_be_bytes());
        msg.extend_from_slice(value);
        msg
    }

    #[test]
    fn test_encode_binding_request() {
        let id = [7u8; 12];
        let msg = encode_binding_request(id);
        assert_eq!(msg.len(), 20);
        assert_eq!(&msg[0..2], &[0x00, 0x01]);
        assert_eq!(&msg[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&msg[8..20], &id);
    }

    #[test]
    fn test_decode_xor_mapped_address() {
        let id = [3u8; 12];
        // 203.0.113.7:54321 XORed with the magic cookie.
        let ip: [u8; 4] = [203, 0, 113, 7];
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let xored: Vec<u8> = ip.iter().zip(cookie.iter()).map(|(a, b)| a ^ b).collect();
        let port_xored = 54321u16 ^ (MAGIC_COOKIE >> 16) as u16;

        let mut value = vec![0x00, 0x01];
        value.extend_from_slice(&port_xored.to_be_bytes());
        value.extend_from_slice(&xored);

        let msg = response_with_attr(id, ATTR_XOR_MAPPED_ADDRESS, &value);
        let binding = decode_binding_response(&msg, id).unwrap();
        let addr = binding.mapped.unwrap();
        assert_eq!(addr.ip().to_string(), "203.0.113.7");
        assert_eq!(addr.port(), 54321);
    }

    #[test]
    fn test_decode_plain_mapped_address() {
        let id = [9u8; 12];
        let mut value = vec![0x00, 0x01];
        value.extend_from_slice(&3478u16.to_be_bytes());
        value.extend_from_slice(&[198, 51, 100, 1]);
        let msg = response_with_attr(id, ATTR_MAPPED_ADDRESS, &value);
        let binding = decode_binding_response(&msg, id).unwrap();
        assert_eq!(binding.mapped.unwrap().ip().to_string(), "198.51.100.1");
    }

    #[test]
    fn test_decode_ignores_foreign_transaction() {
        let id = [1u8; 12];
        let mut value = vec![0x00, 0x01];
        value.extend_from_slice(&3478u16.to_be_bytes());
        value.extend_from_slice(&[198, 51, 100, 1]);
        let msg = response_with_attr(id, ATTR_MAPPED_ADDRESS, &value);
        assert!(decode_binding_response(&msg, [2u8; 12]).is_none());
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("", "10.0.0.2", false), NatType::Unknown);
        assert_eq!(
            classify("198.51.100.1", "198.51.100.1", false),
            NatType::OpenInternet
        );
        assert_eq!(
            classify("198.51.100.1", "10.0.0.2", true),
            NatType::BehindNat
        );
        assert_eq!(
            classify("198.51.100.1", "10.0.0.2", false),
            NatType::BehindNat
        );
    }

    #[tokio::test]
    async fn test_unreachable_target_reports_udp_blocked() {
        // Port 1 on loopback: the connected socket sees the ICMP port
        // unreachable as a receive error.
        let target = StunTarget {
            host: "127.0.0.1".to_string(),
            port: 1,
        };
        let info = probe_target(&target).await;
        assert!(info.error.is_some());
        assert!(!info.local_ip.is_empty());
        assert!(matches!(
            info.nat_type,
            NatType::UdpBlocked | NatType::Unknown
        ));
    }

    #[tokio::test]
    async fn test_collect_returns_one_result_per_target() {
        let probe = NatProbe::new(vec![
            StunTarget {
                host: "127.0.0.1".to_string(),
                port: 1,
            },
            StunTarget {
                host: "127.0.0.1".to_string(),
                port: 2,
            },
        ]);
        let results = probe.collect().await;
        assert_eq!(results.len(), 2);
    }
}
