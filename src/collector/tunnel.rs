//! Composed reachability checks: an application protocol validated over a
//! chosen transport, optionally through a SOCKS5 or HTTP proxy.

use super::http;
use super::tls;
use crate::config::TunnelConfig;
use crate::utils::network_utils::{host_of, split_host_port};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;
use webrtc_dtls::config::Config as DtlsConfig;
use webrtc_dtls::conn::DTLSConn;
use webrtc_util::conn::Conn as DatagramConn;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const APP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TunnelResult {
    pub name: String,
    pub app: String,
    pub transport: String,
    pub target: String,
    pub status: String,
    pub latency: Duration,
    pub error: Option<String>,
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// The established transport connection an application check runs over.
/// Stream transports carry byte streams; UDP and DTLS carry datagrams.
enum Tunnel {
    Stream(Box<dyn AsyncStream>),
    Datagram(Arc<dyn DatagramConn + Send + Sync>),
}

impl Tunnel {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Tunnel::Stream(s) => s.write_all(buf).await?,
            Tunnel::Datagram(c) => {
                c.send(buf).await?;
            }
        }
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Tunnel::Stream(s) => Ok(s.read(buf).await?),
            Tunnel::Datagram(c) => Ok(c.recv(buf).await?),
        }
    }

    async fn close(self) {
        match self {
            Tunnel::Stream(mut s) => {
                let _ = s.shutdown().await;
            }
            Tunnel::Datagram(c) => {
                let _ = c.close().await;
            }
        }
    }
}

pub struct TunnelProbe {
    tunnels: Vec<TunnelConfig>,
    insecure_skip_verify: bool,
}

impl TunnelProbe {
    pub fn new(tunnels: Vec<TunnelConfig>, insecure_skip_verify: bool) -> Self {
        TunnelProbe {
            tunnels,
            insecure_skip_verify,
        }
    }

    pub async fn collect(&self) -> Vec<TunnelResult> {
        let mut results = Vec::with_capacity(self.tunnels.len());
        for cfg in &self.tunnels {
            results.push(self.test_tunnel(cfg).await);
        }
        results
    }

    pub async fn test_tunnel(&self, cfg: &TunnelConfig) -> TunnelResult {
        let start = Instant::now();
        let outcome = self.run_check(cfg).await;
        let latency = start.elapsed();

        TunnelResult {
            name: cfg.name.clone(),
            app: cfg.app.clone(),
            transport: cfg.transport.clone(),
            target: cfg.target.clone(),
            status: if outcome.is_ok() { "OK" } else { "Error" }.to_string(),
            latency,
            error: outcome.err().map(|e| format!("{:#}", e)),
        }
    }

    async fn run_check(&self, cfg: &TunnelConfig) -> Result<()> {
        let tunnel = self
            .dial_transport(cfg)
            .await
            .context("transport error")?;
        let result = tokio::time::timeout(APP_TIMEOUT, self.check_application(tunnel, cfg))
            .await
            .unwrap_or_else(|_| bail_timeout(&cfg.app));
        result
    }

    async fn dial_transport(&self, cfg: &TunnelConfig) -> Result<Tunnel> {
        match cfg.transport.as_str() {
            "tcp" => {
                let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&cfg.target))
                    .await
                    .context("dial timed out")??;
                Ok(Tunnel::Stream(Box::new(stream)))
            }
            "udp" => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                tokio::time::timeout(DIAL_TIMEOUT, socket.connect(&cfg.target))
                    .await
                    .context("dial timed out")??;
                Ok(Tunnel::Datagram(Arc::new(socket)))
            }
            "tls" => {
                let config = if self.insecure_skip_verify {
                    tls::insecure_config()
                } else {
                    tls::verified_config()
                };
                let connector = TlsConnector::from(config);
                let name = tls::server_name(&host_of(&cfg.target))?;
                let stream = tokio::time::timeout(DIAL_TIMEOUT, async {
                    let tcp = TcpStream::connect(&cfg.target).await?;
                    Ok::<_, anyhow::Error>(connector.connect(name, tcp).await?)
                })
                .await
                .context("dial timed out")??;
                Ok(Tunnel::Stream(Box::new(stream)))
            }
            "dtls" => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(&cfg.target).await?;
                let conn: Arc<dyn DatagramConn + Send + Sync> = Arc::new(socket);
                let dtls_config = DtlsConfig {
                    insecure_skip_verify: self.insecure_skip_verify,
                    server_name: host_of(&cfg.target),
                    ..Default::default()
                };
                let dtls = tokio::time::timeout(
                    DIAL_TIMEOUT,
                    DTLSConn::new(conn, dtls_config, true, None),
                )
                .await
                .context("dial timed out")?
                .map_err(|e| anyhow::anyhow!("dtls handshake: {}", e))?;
                Ok(Tunnel::Datagram(Arc::new(dtls)))
            }
            "socks5" => {
                if cfg.proxy.is_empty() {
                    bail!("proxy address required for socks5");
                }
                let stream = tokio::time::timeout(
                    DIAL_TIMEOUT,
                    socks5_connect(&cfg.proxy, &cfg.target, &cfg.user, &cfg.password),
                )
                .await
                .context("dial timed out")??;
                Ok(Tunnel::Stream(Box::new(stream)))
            }
            "http" => {
                if cfg.proxy.is_empty() {
                    bail!("proxy address required for http proxy");
                }
                let stream = tokio::time::timeout(
                    DIAL_TIMEOUT,
                    http_connect(&cfg.proxy, &cfg.target, &cfg.user, &cfg.password),
                )
                .await
                .context("dial timed out")??;
                Ok(Tunnel::Stream(Box::new(stream)))
            }
            other => bail!("unsupported transport protocol: {}", other),
        }
    }

    async fn check_application(&self, mut tunnel: Tunnel, cfg: &TunnelConfig) -> Result<()> {
        let result = match cfg.app.as_str() {
            // An established transport is the whole check.
            "tcp" | "udp" => Ok(()),
            "http" => check_http(&mut tunnel, &cfg.target).await,
            "ws" => check_websocket(&mut tunnel, &cfg.target).await,
            "socks5" => check_socks5(&mut tunnel).await,
            "tls" => {
                return match tunnel {
                    Tunnel::Stream(stream) => {
                        let config = if self.insecure_skip_verify {
                            tls::insecure_config()
                        } else {
                            tls::verified_config()
                        };
                        let connector = TlsConnector::from(config);
                        let name = tls::server_name(&host_of(&cfg.target))?;
                        let mut tls_stream = connector
                            .connect(name, stream)
                            .await
                            .context("tls handshake")?;
                        let _ = tls_stream.shutdown().await;
                        Ok(())
                    }
                    Tunnel::Datagram(c) => {
                        let _ = c.close().await;
                        bail!("tls check requires a stream transport");
                    }
                };
            }
            other => {
                tunnel.close().await;
                bail!("unsupported application protocol: {}", other);
            }
        };
        tunnel.close().await;
        result
    }
}

fn bail_timeout(app: &str) -> Result<()> {
    Err(anyhow::anyhow!("{} check timed out", app))
}

async fn check_http(tunnel: &mut Tunnel, target: &str) -> Result<()> {
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        target
    );
    tunnel.write_all(request.as_bytes()).await?;
    let status = read_status_code(tunnel).await?;
    if (200..400).contains(&status) {
        Ok(())
    } else {
        bail!("http status: {}", status)
    }
}

async fn check_websocket(tunnel: &mut Tunnel, target: &str) -> Result<()> {
    // Fixed nonce from RFC 6455's worked example; the probe only needs the
    // 101 back, not a usable socket.
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        target
    );
    tunnel.write_all(request.as_bytes()).await?;
    let status = read_status_code(tunnel).await?;
    if status == 101 {
        Ok(())
    } else {
        bail!("websocket upgrade failed: {}", status)
    }
}

async fn check_socks5(tunnel: &mut Tunnel) -> Result<()> {
    tunnel.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut buf = [0u8; 2];
    let mut read = 0usize;
    while read < 2 {
        let n = tunnel.read_some(&mut buf[read..]).await?;
        if n == 0 {
            bail!("connection closed during socks5 negotiation");
        }
        read += n;
    }
    if buf[0] != 0x05 {
        bail!("invalid socks version: {:#04x}", buf[0]);
    }
    if buf[1] == 0xff {
        bail!("socks5 no acceptable methods");
    }
    Ok(())
}

/// Read enough of the response to extract the HTTP status code.
async fn read_status_code(tunnel: &mut Tunnel) -> Result<u16> {
    let mut buf = vec![0u8; 2048];
    let mut filled = 0usize;
    loop {
        let n = tunnel.read_some(&mut buf[filled..]).await?;
        if n == 0 {
            bail!("connection closed before status line");
        }
        filled += n;
        if let Some(eol) = buf[..filled].iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&buf[..eol]);
            let mut parts = line.split_whitespace();
            let version = parts.next().unwrap_or("");
            if !version.starts_with("HTTP/") {
                bail!("not an http response: {:?}", line.trim());
            }
            return parts
                .next()
                .and_then(|s| s.parse().ok())
                .context("missing http status code");
        }
        if filled == buf.len() {
            bail!("status line too long");
        }
    }
}

/// SOCKS5 CONNECT through a proxy (RFC 1928), with optional username and
/// password auth (RFC 1929).
async fn socks5_connect(
    proxy: &str,
    target: &str,
    user: &str,
    password: &str,
) -> Result<TcpStream> {
    let (host, port) = split_host_port(target).context("target must be host:port")?;
    let mut stream = TcpStream::connect(proxy).await?;

    let with_auth = !user.is_empty() || !password.is_empty();
    if with_auth {
        stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await?;
    } else {
        stream.write_all(&[0x05, 0x01, 0x00]).await?;
    }
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 {
        bail!("invalid socks version: {:#04x}", reply[0]);
    }
    match reply[1] {
        0x00 => {}
        0x02 => {
            if !with_auth {
                bail!("proxy demands credentials but none are configured");
            }
            let mut msg = vec![0x01, user.len() as u8];
            msg.extend_from_slice(user.as_bytes());
            msg.push(password.len() as u8);
            msg.extend_from_slice(password.as_bytes());
            stream.write_all(&msg).await?;
            let mut auth_reply = [0u8; 2];
            stream.read_exact(&mut auth_reply).await?;
            if auth_reply[1] != 0x00 {
                bail!("socks5 authentication rejected");
            }
        }
        0xff => bail!("socks5 no acceptable methods"),
        other => bail!("unsupported socks5 method: {:#04x}", other),
    }

    // CONNECT request: prefer the literal IPv4 form, else a domain name.
    let mut request = vec![0x05, 0x01, 0x00];
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        request.push(0x01);
        request.extend_from_slice(&ip.octets());
    } else {
        if host.len() > 255 {
            bail!("target host too long for socks5");
        }
        request.push(0x03);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        bail!("socks5 connect failed: reply {:#04x}", head[1]);
    }
    // Drain the bound address the proxy reports.
    let addr_len = match head[3] {
        0x01 => 4,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        0x04 => 16,
        other => bail!("unknown socks5 address type: {:#04x}", other),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await?;

    Ok(stream)
}

/// HTTP CONNECT through a proxy, with optional basic auth.
async fn http_connect(
    proxy: &str,
    target: &str,
    user: &str,
    password: &str,
) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await?;
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if !user.is_empty() || !password.is_empty() {
        request.push_str(&format!(
            "Proxy-Authorization: {}\r\n",
            http::basic_auth(user, password)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Consume the proxy's response line and headers; the tunnel bytes that
    // follow belong to the target.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            bail!("proxy closed connection during connect");
        }
        head.push(byte[0]);
        if head.len() > 16 * 1024 {
            bail!("proxy response headers too long");
        }
    }
    let head = String::from_utf8_lossy(&head);
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .context("malformed proxy response")?;
    if status != 200 {
        bail!("http proxy connect failed: {}", status);
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn tunnel_cfg(name: &str, target: &str, app: &str, transport: &str) -> TunnelConfig {
        TunnelConfig {
            name: name.to_string(),
            target: target.to_string(),
            app: app.to_string(),
            transport: transport.to_string(),
            ..Default::default()
        }
    }

    /// Minimal HTTP server: 200 for plain requests, 101 for websocket
    /// upgrades.
    async fn start_http_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut filled = 0usize;
                    loop {
                        let Ok(n) = conn.read(&mut buf[filled..]).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        filled += n;
                        if buf[..filled].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..filled]).to_string();
                    let response = if request.contains("Upgrade: websocket") {
                        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n"
                    } else {
                        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"
                    };
                    let _ = conn.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    /// No-auth SOCKS5 server that honors CONNECT and then relays bytes.
    async fn start_socks5_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut head = [0u8; 2];
                    if conn.read_exact(&mut head).await.is_err() {
                        return;
                    }
                    let mut methods = vec![0u8; head[1] as usize];
                    if conn.read_exact(&mut methods).await.is_err() {
                        return;
                    }
                    if conn.write_all(&[0x05, 0x00]).await.is_err() {
                        return;
                    }

                    let mut req = [0u8; 4];
                    if conn.read_exact(&mut req).await.is_err() {
                        return;
                    }
                    let host = match req[3] {
                        0x01 => {
                            let mut ip = [0u8; 4];
                            if conn.read_exact(&mut ip).await.is_err() {
                                return;
                            }
                            std::net::Ipv4Addr::from(ip).to_string()
                        }
                        0x03 => {
                            let mut len = [0u8; 1];
                            if conn.read_exact(&mut len).await.is_err() {
                                return;
                            }
                            let mut name = vec![0u8; len[0] as usize];
                            if conn.read_exact(&mut name).await.is_err() {
                                return;
                            }
                            String::from_utf8_lossy(&name).to_string()
                        }
                        _ => return,
                    };
                    let mut port = [0u8; 2];
                    if conn.read_exact(&mut port).await.is_err() {
                        return;
                    }
                    let port = u16::from_be_bytes(port);

                    let Ok(mut upstream) = TcpStream::connect((host, port)).await else {
                        let _ = conn
                            .write_all(&[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                            .await;
                        return;
                    };
                    if conn
                        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                        .await
                        .is_err()
                    {
                        return;
                    }
                    let _ = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await;
                });
            }
        });
        addr
    }

    /// HTTP proxy that only understands CONNECT.
    async fn start_http_proxy() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut byte = [0u8; 1];
                    while !head.ends_with(b"\r\n\r\n") {
                        let Ok(n) = conn.read(&mut byte).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        head.push(byte[0]);
                    }
                    let head = String::from_utf8_lossy(&head).to_string();
                    let mut parts = head.split_whitespace();
                    if parts.next() != Some("CONNECT") {
                        let _ = conn.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n").await;
                        return;
                    }
                    let Some(target) = parts.next() else { return };
                    let Ok(mut upstream) = TcpStream::connect(target).await else {
                        let _ = conn.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                        return;
                    };
                    if conn
                        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                        .await
                        .is_err()
                    {
                        return;
                    }
                    let _ = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_http_over_tcp() {
        let target = start_http_server().await;
        let probe = TunnelProbe::new(vec![tunnel_cfg("t", &target, "http", "tcp")], true);
        let results = probe.collect().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "OK", "{:?}", results[0].error);
        assert!(results[0].latency > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_websocket_over_tcp() {
        let target = start_http_server().await;
        let probe = TunnelProbe::new(vec![tunnel_cfg("t", &target, "ws", "tcp")], true);
        let results = probe.collect().await;
        assert_eq!(results[0].status, "OK", "{:?}", results[0].error);
    }

    #[tokio::test]
    async fn test_http_over_socks5() {
        let target = start_http_server().await;
        let proxy = start_socks5_server().await;
        let mut cfg = tunnel_cfg("t", &target, "http", "socks5");
        cfg.proxy = proxy;
        let probe = TunnelProbe::new(vec![cfg], true);
        let results = probe.collect().await;
        assert_eq!(results[0].status, "OK", "{:?}", results[0].error);
    }

    #[tokio::test]
    async fn test_socks5_app_over_tcp() {
        let target = start_socks5_server().await;
        let probe = TunnelProbe::new(vec![tunnel_cfg("t", &target, "socks5", "tcp")], true);
        let results = probe.collect().await;
        assert_eq!(results[0].status, "OK", "{:?}", results[0].error);
    }

    #[tokio::test]
    async fn test_http_over_http_proxy() {
        let target = start_http_server().await;
        let proxy = start_http_proxy().await;
        let mut cfg = tunnel_cfg("t", &target, "http", "http");
        cfg.proxy = proxy;
        let probe = TunnelProbe::new(vec![cfg], true);
        let results = probe.collect().await;
        assert_eq!(results[0].status, "OK", "{:?}", results[0].error);
    }

    #[tokio::test]
    async fn test_socks5_without_proxy_fails_fast() {
        let probe = TunnelProbe::new(
            vec![tunnel_cfg("t", "example.org:80", "http", "socks5")],
            true,
        );
        let start = Instant::now();
        let results = probe.collect().await;
        assert_eq!(results[0].status, "Error");
        assert!(results[0]
            .error
            .as_deref()
            .unwrap_or("")
            .contains("proxy address required"));
        // No dialing happened.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unknown_transport_is_an_error() {
        let probe = TunnelProbe::new(vec![tunnel_cfg("t", "example.org:80", "tcp", "kcp")], true);
        let results = probe.collect().await;
        assert_eq!(results[0].status, "Error");
    }

    #[tokio::test]
    async fn test_udp_transport_existence_check() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = socket.local_addr().unwrap().to_string();
        let probe = TunnelProbe::new(vec![tunnel_cfg("t", &target, "udp", "udp")], true);
        let results = probe.collect().await;
        assert_eq!(results[0].status, "OK", "{:?}", results[0].error);
    }
}
