//! Reachability of configured targets plus the default gateway, with
//! resolver timing on the side.

use super::ping::ping_target;
use super::{ConnectivityStats, DnsTimings, PingResult};
use crate::collector::dns::wire;
use crate::netlink::route;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

const DEFAULT_TARGETS: &[&str] = &["8.8.8.8", "baidu.com"];
const DNS_CHECK_DOMAIN: &str = "google.com";
const PUBLIC_RESOLVER: &str = "1.1.1.1:53";
const RESOLVER_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ConnectivityProbe {
    targets: Vec<String>,
}

impl ConnectivityProbe {
    pub fn new() -> Self {
        ConnectivityProbe {
            targets: DEFAULT_TARGETS.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[cfg(test)]
    fn with_targets(targets: Vec<String>) -> Self {
        ConnectivityProbe { targets }
    }

    pub async fn collect(&self) -> ConnectivityStats {
        // The gateway changes with the network the host sits on, so it is
        // rediscovered on every cycle rather than cached.
        let gateway = tokio::task::spawn_blocking(route::default_gateway)
            .await
            .ok()
            .and_then(|r| r.ok())
            .flatten()
            .map(|ip| ip.to_string());
        let targets = merge_targets(&self.targets, gateway);

        let results: Arc<Mutex<HashMap<String, PingResult>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut handles = Vec::new();
        for target in targets {
            let results = Arc::clone(&results);
            handles.push(tokio::spawn(async move {
                let res = ping_target(&target).await;
                results.lock().unwrap().insert(target, res);
            }));
        }
        let dns_handle = tokio::spawn(check_dns());

        for handle in handles {
            let _ = handle.await;
        }
        let dns = match dns_handle.await {
            Ok(timings) => timings,
            Err(e) => DnsTimings {
                error: Some(format!("dns timing task failed: {}", e)),
                ..Default::default()
            },
        };

        let targets = std::mem::take(&mut *results.lock().unwrap());
        ConnectivityStats { targets, dns }
    }

    /// One-shot ping used by the DNS view's follow-up check.
    pub async fn ping(&self, target: &str) -> PingResult {
        ping_target(target).await
    }
}

/// Gateway first, then the configured targets, without duplicates.
fn merge_targets(configured: &[String], gateway: Option<String>) -> Vec<String> {
    let mut targets: Vec<String> = Vec::with_capacity(configured.len() + 1);
    if let Some(gw) = gateway {
        if !configured.contains(&gw) {
            targets.push(gw);
        }
    }
    targets.extend(configured.iter().cloned());
    targets
}

/// Time one lookup through the system resolver and one forced through
/// 1.1.1.1 over UDP.
async fn check_dns() -> DnsTimings {
    let mut timings = DnsTimings::default();

    let start = Instant::now();
    match tokio::net::lookup_host((DNS_CHECK_DOMAIN, 80)).await {
        Ok(_) => timings.local_resolver = start.elapsed(),
        Err(e) => {
            timings.local_resolver = start.elapsed();
            timings.error = Some(format!("system resolver: {}", e));
        }
    }

    let start = Instant::now();
    match public_lookup().await {
        Ok(_) => timings.public_resolver = start.elapsed(),
        Err(e) => {
            timings.public_resolver = start.elapsed();
            if timings.error.is_none() {
                timings.error = Some(format!("public resolver: {}", e));
            }
        }
    }

    timings
}

async fn public_lookup() -> anyhow::Result<()> {
    let query = wire::encode_query(
        rand::random(),
        &format!("{}.", DNS_CHECK_DOMAIN),
        wire::TYPE_A,
    )?;
    let exchange = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(PUBLIC_RESOLVER).await?;
        socket.send(&query).await?;
        let mut buf = vec![0u8; 4096];
        socket.recv(&mut buf).await?;
        Ok::<_, anyhow::Error>(())
    };
    tokio::time::timeout(RESOLVER_TIMEOUT, exchange)
        .await
        .map_err(|_| anyhow::anyhow!("query to {} timed out", PUBLIC_RESOLVER))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_targets_prepends_gateway() {
        let configured = vec!["8.8.8.8".to_string(), "baidu.com".to_string()];
        let merged = merge_targets(&configured, Some("192.168.1.1".to_string()));
        assert_eq!(merged, vec!["192.168.1.1", "8.8.8.8", "baidu.com"]);
    }

    #[test]
    fn test_merge_targets_deduplicates_gateway() {
        let configured = vec!["192.168.1.1".to_string(), "8.8.8.8".to_string()];
        let merged = merge_targets(&configured, Some("192.168.1.1".to_string()));
        assert_eq!(merged, vec!["192.168.1.1", "8.8.8.8"]);
    }

    #[test]
    fn test_merge_targets_without_gateway() {
        let configured = vec!["8.8.8.8".to_string()];
        assert_eq!(merge_targets(&configured, None), vec!["8.8.8.8"]);
    }

    #[tokio::test]
    async fn test_collect_covers_every_target() {
        // Loopback only: fast and independent of external reachability.
        let probe = ConnectivityProbe::with_targets(vec!["127.0.0.1".to_string()]);
        let stats = probe.collect().await;
        assert!(stats.targets.contains_key("127.0.0.1"));
        // DNS timing may fail offline, but the field is always populated.
        let res = &stats.targets["127.0.0.1"];
        assert_eq!(res.target, "127.0.0.1");
    }
}
