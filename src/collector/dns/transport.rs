//! The four DNS transports: UDP, TCP, DNS over TLS and DNS over HTTPS.

use super::wire;
use super::{DnsLookupResult, DnsProtocol, DnsServer};
use crate::collector::http;
use crate::collector::tls;
use crate::utils::network_utils::split_host_port;
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;

const TLS_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const FALLBACK_RESOLVER: &str = "8.8.8.8:53";

/// Resolve the `ip:port` a plain UDP/TCP lookup should talk to. The
/// "System" pseudo-server means the first resolv.conf nameserver.
pub fn standard_address(server: &DnsServer) -> String {
    if server.name == "System" {
        return system_resolver_address(
            &std::fs::read_to_string("/etc/resolv.conf").unwrap_or_default(),
        );
    }
    ensure_port(&server.address, 53)
}

/// First nameserver from resolv.conf content, with the stock fallback when
/// the file is empty or unparsable.
pub fn system_resolver_address(resolv_conf: &str) -> String {
    for line in resolv_conf.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("nameserver") {
            let ns = rest.trim();
            if ns.is_empty() {
                continue;
            }
            if ns.contains(':') {
                // Bare IPv6 nameserver.
                return format!("[{}]:53", ns);
            }
            return format!("{}:53", ns);
        }
    }
    FALLBACK_RESOLVER.to_string()
}

fn ensure_port(address: &str, default_port: u16) -> String {
    if split_host_port(address).is_some() {
        address.to_string()
    } else {
        format!("{}:{}", address, default_port)
    }
}

/// DoT talks to port 853: a configured :53 is rewritten, a bare host gets
/// 853 appended.
pub fn dot_address(address: &str) -> String {
    match split_host_port(address) {
        Some((host, 53)) => format!("{}:853", host),
        Some(_) => address.to_string(),
        None => format!("{}:853", address),
    }
}

/// Map a configured address onto a DoH endpoint URL. Well-known resolver
/// IPs get their published endpoints; anything else is wrapped as
/// `https://<addr>/dns-query`, which may well fail but is at least explicit.
pub fn doh_url(address: &str) -> String {
    if address.starts_with("https://") {
        return address.to_string();
    }
    if address.starts_with("8.8.8.8") {
        "https://dns.google/dns-query".to_string()
    } else if address.starts_with("1.1.1.1") {
        "https://cloudflare-dns.com/dns-query".to_string()
    } else if address.starts_with("223.5.5.5") {
        "https://dns.alidns.com/dns-query".to_string()
    } else {
        format!("https://{}/dns-query", address)
    }
}

pub fn parse_https_url(url: &str) -> Result<(String, u16, String)> {
    let rest = url
        .strip_prefix("https://")
        .context("endpoint must be an https URL")?;
    let (host_port, path) = match rest.split_once('/') {
        Some((hp, path)) => (hp, format!("/{}", path)),
        // A query string can appear without any path component.
        None => match rest.split_once('?') {
            Some((hp, query)) => (hp, format!("/?{}", query)),
            None => (rest, "/".to_string()),
        },
    };
    let (host, port) = match split_host_port(host_port) {
        Some((host, port)) => (host, port),
        None => (host_port.to_string(), 443),
    };
    Ok((host, port, path))
}

fn finish(
    query_id: u16,
    buf: &[u8],
    started: Instant,
    server: String,
    proto: DnsProtocol,
    cert: Option<tls::CertInfo>,
) -> DnsLookupResult {
    let mut result = DnsLookupResult {
        server,
        protocol: proto,
        cert_info: cert,
        ..Default::default()
    };
    match wire::decode_response(buf) {
        Ok(resp) => {
            result.latency = started.elapsed();
            if resp.id != query_id {
                result.error = Some(format!(
                    "response id {:#06x} does not match query {:#06x}",
                    resp.id, query_id
                ));
                return result;
            }
            result.response_code = wire::rcode_name(resp.rcode);
            result.records = resp.answers.iter().map(wire::answer_to_string).collect();
        }
        Err(e) => {
            result.latency = started.elapsed();
            result.error = Some(e.to_string());
        }
    }
    result
}

fn fail(
    started: Instant,
    server: String,
    proto: DnsProtocol,
    err: impl std::fmt::Display,
) -> DnsLookupResult {
    DnsLookupResult {
        latency: started.elapsed(),
        server,
        protocol: proto,
        error: Some(err.to_string()),
        ..Default::default()
    }
}

pub async fn lookup_udp(query_id: u16, query: &[u8], server: &DnsServer) -> DnsLookupResult {
    let address = standard_address(server);
    let started = Instant::now();
    match exchange_udp(query, &address).await {
        Ok(buf) => finish(query_id, &buf, started, address, DnsProtocol::Udp, None),
        Err(e) => fail(started, address, DnsProtocol::Udp, e),
    }
}

async fn exchange_udp(query: &[u8], address: &str) -> Result<Vec<u8>> {
    let addr = resolve_one(address).await?;
    let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    socket.send(query).await?;
    let mut buf = vec![0u8; 4096];
    let n = socket.recv(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

pub async fn lookup_tcp(query_id: u16, query: &[u8], server: &DnsServer) -> DnsLookupResult {
    let address = standard_address(server);
    let started = Instant::now();
    match exchange_tcp(query, &address).await {
        Ok(buf) => finish(query_id, &buf, started, address, DnsProtocol::Tcp, None),
        Err(e) => fail(started, address, DnsProtocol::Tcp, e),
    }
}

async fn exchange_tcp(query: &[u8], address: &str) -> Result<Vec<u8>> {
    let addr = resolve_one(address).await?;
    let mut stream = TcpStream::connect(addr).await?;
    write_framed(&mut stream, query).await?;
    read_framed(&mut stream).await
}

pub async fn lookup_dot(query_id: u16, query: &[u8], server: &DnsServer) -> DnsLookupResult {
    let address = dot_address(&server.address);
    let sni = match split_host_port(&address) {
        Some((host, _)) => host,
        None => address.clone(),
    };
    let started = Instant::now();
    match exchange_dot(query, &address, &sni).await {
        Ok((buf, cert)) => finish(query_id, &buf, started, address, DnsProtocol::Dot, cert),
        Err(e) => fail(started, address, DnsProtocol::Dot, e),
    }
}

async fn exchange_dot(
    query: &[u8],
    address: &str,
    sni: &str,
) -> Result<(Vec<u8>, Option<tls::CertInfo>)> {
    let connector = TlsConnector::from(tls::verified_config());
    let name = tls::server_name(sni)?;

    let mut stream = tokio::time::timeout(TLS_DIAL_TIMEOUT, async {
        let addr = resolve_one(address).await?;
        let tcp = TcpStream::connect(addr).await?;
        Ok::<_, anyhow::Error>(connector.connect(name, tcp).await?)
    })
    .await
    .context("TLS dial timed out")??;

    // RFC 7858 frames messages exactly like DNS over TCP.
    write_framed(&mut stream, query).await?;
    let buf = read_framed(&mut stream).await?;

    let cert = tls::capture_cert_info(stream.get_ref().1);
    Ok((buf, cert))
}

pub async fn lookup_doh(query_id: u16, query: &[u8], server: &DnsServer) -> DnsLookupResult {
    let url = doh_url(&server.address);
    let started = Instant::now();
    match exchange_doh(query, &url).await {
        Ok((buf, cert)) => finish(query_id, &buf, started, url, DnsProtocol::Doh, cert),
        Err(e) => fail(started, url, DnsProtocol::Doh, e),
    }
}

async fn exchange_doh(query: &[u8], url: &str) -> Result<(Vec<u8>, Option<tls::CertInfo>)> {
    let (host, port, path) = parse_https_url(url)?;
    let connector = TlsConnector::from(tls::verified_config());
    let name = tls::server_name(&host)?;

    let mut stream = tokio::time::timeout(TLS_DIAL_TIMEOUT, async {
        let addr = resolve_one(&format!("{}:{}", host, port)).await?;
        let tcp = TcpStream::connect(addr).await?;
        Ok::<_, anyhow::Error>(connector.connect(name, tcp).await?)
    })
    .await
    .context("TLS dial timed out")??;

    let response = tokio::time::timeout(HTTP_TIMEOUT, async {
        http::write_post(&mut stream, &host, &path, "application/dns-message", query).await?;
        http::read_response(&mut stream).await
    })
    .await
    .context("DoH request timed out")??;

    if response.status != 200 {
        bail!("DoH server returned {}", response.status);
    }
    let cert = tls::capture_cert_info(stream.get_ref().1);
    Ok((response.body, cert))
}

async fn resolve_one(address: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .with_context(|| format!("no address for {}", address))
}

async fn write_framed<S>(stream: &mut S, msg: &[u8]) -> Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let mut framed = Vec::with_capacity(msg.len() + 2);
    framed.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    framed.extend_from_slice(msg);
    stream.write_all(&framed).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_framed<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let len = u16::from_be_bytes(len) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
