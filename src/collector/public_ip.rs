//! Public IP discovery through a list of HTTPS echo services.

use super::http;
use super::tls;
use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(3);
// Some services block unknown user agents.
const USER_AGENT: &str = "curl/7.68.0";

const PROVIDERS: &[&str] = &[
    "https://api.ipify.org?format=text",
    "https://ifconfig.me/ip",
    "https://icanhazip.com",
    "https://checkip.amazonaws.com",
    "https://ipinfo.io/ip",
    "https://ipecho.net/plain",
    "https://ident.me",
    "https://whatismyip.akamai.com",
    "https://myexternalip.com/raw",
];

#[derive(Debug, Clone, Default)]
pub struct PublicIpInfo {
    pub ip: String,
    pub provider: String,
    pub error: Option<String>,
}

pub struct PublicIpProbe;

impl PublicIpProbe {
    pub fn new() -> Self {
        PublicIpProbe
    }

    /// Try each provider in order; the first plausible answer wins.
    pub async fn collect(&self) -> PublicIpInfo {
        for url in PROVIDERS {
            match tokio::time::timeout(PROVIDER_TIMEOUT, fetch_ip(url)).await {
                Ok(Ok(ip)) => {
                    return PublicIpInfo {
                        ip,
                        provider: url.to_string(),
                        error: None,
                    };
                }
                Ok(Err(e)) => log::debug!("public ip via {} failed: {}", url, e),
                Err(_) => log::debug!("public ip via {} timed out", url),
            }
        }
        PublicIpInfo {
            error: Some("failed to fetch public IP from all providers".to_string()),
            ..Default::default()
        }
    }
}

async fn fetch_ip(url: &str) -> Result<String> {
    let (host, port, path) = crate::collector::dns::transport::parse_https_url(url)?;

    let connector = TlsConnector::from(tls::verified_config());
    let name = tls::server_name(&host)?;
    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    let mut stream = connector.connect(name, tcp).await?;

    http::write_get(&mut stream, &host, &path, &[("User-Agent", USER_AGENT)]).await?;
    let response = http::read_response(&mut stream).await?;
    if response.status != 200 {
        bail!("status code {}", response.status);
    }

    let ip = String::from_utf8_lossy(&response.body).trim().to_string();
    // 45 characters covers the longest textual IPv6 form.
    if ip.is_empty() || ip.len() > 45 {
        bail!("invalid response length");
    }
    Ok(ip)
}
