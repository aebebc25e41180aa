use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// A DNS server entry as it appears in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsServerConfig {
    pub name: String,
    #[serde(default)]
    pub address: String,
    pub proto: String,
}

/// A tunnel check entry: application protocol carried over a transport
/// towards a target, optionally through a proxy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TunnelConfig {
    pub name: String,
    pub target: String,
    pub app: String,
    pub transport: String,
    #[serde(default)]
    pub proxy: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stun_servers: Vec<String>,
    pub dns_servers: Vec<DnsServerConfig>,
    pub tunnels: Vec<TunnelConfig>,
    // Tunnel TLS/DTLS dials skip certificate verification by default: the
    // probe is diagnostic tooling and self-signed endpoints are common.
    pub tunnel_insecure_skip_verify: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stun_servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun3.l.google.com:19302".to_string(),
            ],
            dns_servers: Vec::new(),
            tunnels: Vec::new(),
            tunnel_insecure_skip_verify: true,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from `$HOME/.lnd.yaml` when no path
    /// is given. A missing file is not an error; a malformed file is fatal.
    pub fn load(path: Option<&str>) -> Result<Config> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => match std::env::var_os("HOME") {
                Some(home) => PathBuf::from(home).join(".lnd.yaml"),
                None => return Ok(Config::default()),
            },
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading config {}", path.display()));
            }
        };

        serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Split a `host:port` STUN entry; an entry without an explicit port uses the
/// standard STUN port 3478.
pub fn parse_stun_server(entry: &str) -> (String, u16) {
    match entry.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().unwrap_or(3478);
            (host.to_string(), port)
        }
        None => (entry.to_string(), 3478),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.stun_servers.len(), 2);
        assert!(cfg.dns_servers.is_empty());
        assert!(cfg.tunnel_insecure_skip_verify);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
stun_servers: ["stun.example.org:3478"]
dns_servers:
  - { name: "Quad9", address: "9.9.9.9:53", proto: "UDP" }
tunnels:
  - { name: "web", target: "example.org:443", app: "tls", transport: "tcp" }
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.stun_servers, vec!["stun.example.org:3478"]);
        assert_eq!(cfg.dns_servers[0].name, "Quad9");
        assert_eq!(cfg.tunnels[0].app, "tls");
        assert!(cfg.tunnels[0].proxy.is_empty());
        // Not present in the file, so the default applies.
        assert!(cfg.tunnel_insecure_skip_verify);
    }

    #[test]
    fn test_parse_error_is_fatal() {
        let bad = "stun_servers: [unterminated";
        assert!(serde_yaml::from_str::<Config>(bad).is_err());
    }

    #[test]
    fn test_parse_stun_server() {
        assert_eq!(
            parse_stun_server("stun.l.google.com:19302"),
            ("stun.l.google.com".to_string(), 19302)
        );
        assert_eq!(
            parse_stun_server("stun.example.org"),
            ("stun.example.org".to_string(), 3478)
        );
    }
}
