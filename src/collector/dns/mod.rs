//! Multi-protocol DNS lookup with TLS certificate capture.

pub mod transport;
pub mod wire;

use super::tls::CertInfo;
use crate::config::DnsServerConfig;
use crate::utils::network_utils::is_ip;
use std::fmt;
use std::time::Duration;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsRecordType {
    Auto,
    A,
    Aaaa,
    Cname,
    Mx,
    Txt,
    Ns,
    Ptr,
    Srv,
    Caa,
}

impl DnsRecordType {
    pub const ALL: [DnsRecordType; 10] = [
        DnsRecordType::Auto,
        DnsRecordType::A,
        DnsRecordType::Aaaa,
        DnsRecordType::Cname,
        DnsRecordType::Mx,
        DnsRecordType::Txt,
        DnsRecordType::Ns,
        DnsRecordType::Ptr,
        DnsRecordType::Srv,
        DnsRecordType::Caa,
    ];

    pub fn parse(s: &str) -> Option<DnsRecordType> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.to_string().eq_ignore_ascii_case(s))
    }

    fn qtype(self) -> u16 {
        match self {
            DnsRecordType::Auto | DnsRecordType::A => wire::TYPE_A,
            DnsRecordType::Aaaa => wire::TYPE_AAAA,
            DnsRecordType::Cname => wire::TYPE_CNAME,
            DnsRecordType::Mx => wire::TYPE_MX,
            DnsRecordType::Txt => wire::TYPE_TXT,
            DnsRecordType::Ns => wire::TYPE_NS,
            DnsRecordType::Ptr => wire::TYPE_PTR,
            DnsRecordType::Srv => wire::TYPE_SRV,
            DnsRecordType::Caa => wire::TYPE_CAA,
        }
    }
}

impl fmt::Display for DnsRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DnsRecordType::Auto => "Auto",
            DnsRecordType::A => "A",
            DnsRecordType::Aaaa => "AAAA",
            DnsRecordType::Cname => "CNAME",
            DnsRecordType::Mx => "MX",
            DnsRecordType::Txt => "TXT",
            DnsRecordType::Ns => "NS",
            DnsRecordType::Ptr => "PTR",
            DnsRecordType::Srv => "SRV",
            DnsRecordType::Caa => "CAA",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnsProtocol {
    #[default]
    Udp,
    Tcp,
    Dot,
    Doh,
}

impl DnsProtocol {
    pub fn parse(s: &str) -> Option<DnsProtocol> {
        match s {
            "UDP" => Some(DnsProtocol::Udp),
            "TCP" => Some(DnsProtocol::Tcp),
            "DoT" => Some(DnsProtocol::Dot),
            "DoH" => Some(DnsProtocol::Doh),
            _ => None,
        }
    }
}

impl fmt::Display for DnsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DnsProtocol::Udp => "UDP",
            DnsProtocol::Tcp => "TCP",
            DnsProtocol::Dot => "DoT",
            DnsProtocol::Doh => "DoH",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct DnsServer {
    pub name: String,
    pub address: String,
    pub proto: DnsProtocol,
}

/// Built-in server presets. "System" resolves through resolv.conf;
/// "Custom" takes its address from user input at query time.
pub fn default_servers() -> Vec<DnsServer> {
    vec![
        DnsServer {
            name: "System".to_string(),
            address: String::new(),
            proto: DnsProtocol::Udp,
        },
        DnsServer {
            name: "Google".to_string(),
            address: "8.8.8.8:53".to_string(),
            proto: DnsProtocol::Udp,
        },
        DnsServer {
            name: "Cloudflare".to_string(),
            address: "1.1.1.1:53".to_string(),
            proto: DnsProtocol::Udp,
        },
        DnsServer {
            name: "AliDNS".to_string(),
            address: "223.5.5.5:53".to_string(),
            proto: DnsProtocol::Udp,
        },
        DnsServer {
            name: "Custom".to_string(),
            address: String::new(),
            proto: DnsProtocol::Dot,
        },
    ]
}

/// Presets plus configured servers, keeping Custom as the final entry.
pub fn server_list(configured: &[DnsServerConfig]) -> Vec<DnsServer> {
    let mut servers = default_servers();
    let custom = servers.pop();
    for cfg in configured {
        servers.push(DnsServer {
            name: cfg.name.clone(),
            address: cfg.address.clone(),
            proto: DnsProtocol::parse(&cfg.proto).unwrap_or_default(),
        });
    }
    if let Some(custom) = custom {
        servers.push(custom);
    }
    servers
}

#[derive(Debug, Clone, Default)]
pub struct DnsLookupResult {
    pub records: Vec<String>,
    pub latency: Duration,
    pub server: String,
    pub protocol: DnsProtocol,
    pub response_code: String,
    pub cert_info: Option<CertInfo>,
    pub error: Option<String>,
}

pub struct DnsProbe;

impl DnsProbe {
    pub fn new() -> Self {
        DnsProbe
    }

    /// Resolve `domain` through `server`. The whole lookup is bounded by a
    /// 10-second deadline regardless of transport.
    pub async fn lookup(
        &self,
        domain: &str,
        record_type: DnsRecordType,
        server: &DnsServer,
    ) -> DnsLookupResult {
        match tokio::time::timeout(LOOKUP_TIMEOUT, self.lookup_inner(domain, record_type, server))
            .await
        {
            Ok(result) => result,
            Err(_) => DnsLookupResult {
                latency: LOOKUP_TIMEOUT,
                server: server.address.clone(),
                protocol: server.proto,
                error: Some("lookup timed out".to_string()),
                ..Default::default()
            },
        }
    }

    async fn lookup_inner(
        &self,
        domain: &str,
        record_type: DnsRecordType,
        server: &DnsServer,
    ) -> DnsLookupResult {
        let mut rtype = match record_type {
            DnsRecordType::Auto => {
                if is_ip(domain) {
                    DnsRecordType::Ptr
                } else {
                    DnsRecordType::A
                }
            }
            other => other,
        };

        // Any IP input becomes a reverse lookup, whatever type was chosen.
        let mut name = domain.to_string();
        if rtype == DnsRecordType::Ptr || is_ip(&name) {
            rtype = DnsRecordType::Ptr;
            match wire::reverse_addr(&name) {
                Ok(reversed) => name = reversed,
                Err(e) => {
                    return DnsLookupResult {
                        server: server.address.clone(),
                        protocol: server.proto,
                        error: Some(e.to_string()),
                        ..Default::default()
                    };
                }
            }
        }

        if !name.ends_with('.') {
            name.push('.');
        }

        let id: u16 = rand::random();
        let query = match wire::encode_query(id, &name, rtype.qtype()) {
            Ok(q) => q,
            Err(e) => {
                return DnsLookupResult {
                    server: server.address.clone(),
                    protocol: server.proto,
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        match server.proto {
            DnsProtocol::Udp => transport::lookup_udp(id, &query, server).await,
            DnsProtocol::Tcp => transport::lookup_tcp(id, &query, server).await,
            DnsProtocol::Dot => transport::lookup_dot(id, &query, server).await,
            DnsProtocol::Doh => transport::lookup_doh(id, &query, server).await,
        }
    }
}

/// Choose the follow-up ping target for a successful lookup: the queried IP
/// itself, or the first answer whose final field parses as an IP.
pub fn ping_target_from(domain: &str, records: &[String]) -> Option<String> {
    if is_ip(domain) {
        return Some(domain.to_string());
    }
    for record in records {
        if let Some(last) = record.split_whitespace().last() {
            if is_ip(last) {
                return Some(last.to_string());
            }
        }
    }
    None
}
