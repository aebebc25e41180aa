//! Startup diagnostics logged before the collection loop begins.

use crate::config::Config;
use log::{info, warn};
use std::fs;

fn read_first_line(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
}

fn hostname() -> Option<String> {
    read_first_line("/proc/sys/kernel/hostname").or_else(|| read_first_line("/etc/hostname"))
}

fn loadavg() -> Option<String> {
    fs::read_to_string("/proc/loadavg").ok().map(|s| {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.len() >= 3 {
            format!("{} {} {}", parts[0], parts[1], parts[2])
        } else {
            s.trim().to_string()
        }
    })
}

pub fn effective_uid() -> u32 {
    unsafe { libc::geteuid() }
}

pub fn log_startup_info(cfg: &Config) {
    let app_version = env!("CARGO_PKG_VERSION");
    let uid = effective_uid();
    let host = hostname().unwrap_or_else(|| "unknown".to_string());
    let kernel = read_first_line("/proc/version").unwrap_or_else(|| "unknown".to_string());
    let load = loadavg().unwrap_or_else(|| "unknown".to_string());

    info!("lnd v{} started", app_version);
    info!("Host: {} (uid={})", host, uid);
    info!("OS: {}", std::env::consts::OS);
    info!("Arch: {}", std::env::consts::ARCH);
    info!("Kernel: {}", kernel);
    info!("Load: {}", load);
    if uid != 0 {
        warn!("Running without root; ICMP and socket diagnostics degrade to fallbacks");
    }
    info!("STUN servers: {}", cfg.stun_servers.join(", "));
    info!("Configured DNS servers: {}", cfg.dns_servers.len());
    if cfg.tunnels.is_empty() {
        info!("Tunnel checks: none configured");
    } else {
        info!("Tunnel checks ({}):", cfg.tunnels.len());
        for t in &cfg.tunnels {
            info!(
                "  • {} ({} over {}) -> {}{}",
                t.name,
                t.app,
                t.transport,
                t.target,
                if t.proxy.is_empty() {
                    String::new()
                } else {
                    format!(" via {}", t.proxy)
                }
            );
        }
    }
}
