//! Diagnostic probes and the typed snapshots they produce.
//!
//! Every probe is constructed once, holds only the state needed to compute
//! deltas between samples, and returns an immutable snapshot per invocation.
//! A snapshot whose `error` field is set may carry partial data; consumers
//! must not read its zeroes as measured zeroes.

pub mod connectivity;
pub mod dns;
pub mod http;
pub mod kernel;
pub mod nat;
pub mod ping;
pub mod public_ip;
pub mod system;
pub mod tls;
pub mod traffic;
pub mod tunnel;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Host identity, limits, tuning parameters and NIC inventory.
#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    pub hostname: String,
    pub kernel_version: String,
    pub arch: String,
    pub uptime: Duration,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub max_open_files: u64,
    pub file_max: u64,
    pub sysctl_params: HashMap<String, String>,
    pub interfaces: Vec<InterfaceInfo>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InterfaceInfo {
    pub name: String,
    pub ip: String,
    pub mac: String,
    pub mtu: u32,
    pub driver: String,
    pub driver_version: String,
    pub firmware_version: String,
    pub offload: HashMap<String, bool>,
}

#[derive(Debug, Clone, Default)]
pub struct PingResult {
    pub target: String,
    pub packet_loss: f64,
    pub min_rtt: Duration,
    pub avg_rtt: Duration,
    pub max_rtt: Duration,
    pub error: Option<String>,
}

/// Resolver latency measured against the system resolver and a forced
/// public resolver (1.1.1.1).
#[derive(Debug, Clone, Default)]
pub struct DnsTimings {
    pub local_resolver: Duration,
    pub public_resolver: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectivityStats {
    pub targets: HashMap<String, PingResult>,
    pub dns: DnsTimings,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InterfaceTraffic {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    // Derived from counter deltas; zero on the first sample and after a
    // counter reset.
    pub rx_rate: f64,
    pub tx_rate: f64,
    pub drops: u64,
    pub errors: u64,
    pub collisions: u64,
}

#[derive(Debug, Clone)]
pub struct TrafficStats {
    pub timestamp: DateTime<Utc>,
    pub interfaces: HashMap<String, InterfaceTraffic>,
    pub error: Option<String>,
}

impl Default for TrafficStats {
    fn default() -> Self {
        TrafficStats {
            timestamp: Utc::now(),
            interfaces: HashMap::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KernelStats {
    /// Percentage of retransmitted segments over the last sampling window.
    pub tcp_retrans_rate: f64,
    pub tcp_established: u64,
    pub tcp_time_wait: u64,
    pub tcp_close_wait: u64,
    pub udp_rcvbuf_errors: u64,
    pub error: Option<String>,
}
