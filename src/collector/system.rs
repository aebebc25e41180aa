//! Host facts: identity, limits, selected sysctls and NIC inventory.

use super::{HostInfo, InterfaceInfo};
use crate::netlink::route;
use std::collections::HashMap;
use std::fs;
use std::panic::AssertUnwindSafe;

const SYSCTL_KEYS: &[&str] = &[
    "net/core/somaxconn",
    "net/ipv4/tcp_tw_reuse",
    "net/ipv4/ip_local_port_range",
];

pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        SystemProbe
    }

    pub fn collect(&self) -> HostInfo {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.collect_inner())) {
            Ok(info) => info,
            Err(_) => HostInfo {
                error: Some("panic in system probe".to_string()),
                ..Default::default()
            },
        }
    }

    fn collect_inner(&self) -> HostInfo {
        let mut info = HostInfo::default();

        info.hostname = read_trimmed("/proc/sys/kernel/hostname").unwrap_or_default();

        let (release, machine) = uname();
        info.kernel_version = release;
        info.arch = machine;

        // First field of /proc/uptime is seconds since boot.
        if let Some(line) = read_trimmed("/proc/uptime") {
            if let Some(secs) = line
                .split_whitespace()
                .next()
                .and_then(|f| f.parse::<f64>().ok())
            {
                info.uptime = std::time::Duration::from_secs_f64(secs);
            }
        }

        if let Some(line) = read_trimmed("/proc/loadavg") {
            let mut fields = line.split_whitespace();
            info.load1 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0.0);
            info.load5 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0.0);
            info.load15 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0.0);
        }

        info.max_open_files = rlimit_nofile();

        if let Some(v) = read_trimmed("/proc/sys/fs/file-max") {
            info.file_max = v.parse().unwrap_or(0);
        }

        for key in SYSCTL_KEYS {
            if let Some(v) = read_trimmed(&format!("/proc/sys/{}", key)) {
                info.sysctl_params.insert(key.to_string(), v);
            }
        }

        match collect_interfaces() {
            Ok(interfaces) => info.interfaces = interfaces,
            Err(e) => {
                log::warn!("interface enumeration failed: {}", e);
                info.error = Some(format!("interface enumeration failed: {}", e));
            }
        }

        info
    }
}

fn read_trimmed(path: &str) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn uname() -> (String, String) {
    unsafe {
        let mut name: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut name) != 0 {
            return (String::new(), String::new());
        }
        (cstr_field(&name.release), cstr_field(&name.machine))
    }
}

fn cstr_field(field: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = field
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn rlimit_nofile() -> u64 {
    unsafe {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) == 0 {
            limit.rlim_cur
        } else {
            0
        }
    }
}

/// Enumerate non-loopback links with their first IPv4 address and driver
/// name. Driver and address lookups are best-effort: an interface without
/// either is still reported.
fn collect_interfaces() -> std::io::Result<Vec<InterfaceInfo>> {
    let links = route::link_list()?;
    let addrs = route::ipv4_addrs().unwrap_or_default();

    let mut interfaces = Vec::new();
    for link in links {
        if link.is_loopback {
            continue;
        }

        let ip = addrs
            .get(&link.index)
            .and_then(|list| list.first())
            .map(|ip| ip.to_string())
            .unwrap_or_default();

        interfaces.push(InterfaceInfo {
            ip,
            driver: driver_name(&link.name).unwrap_or_default(),
            name: link.name,
            mac: link.mac,
            mtu: link.mtu,
            driver_version: String::new(),
            firmware_version: String::new(),
            offload: HashMap::new(),
        });
    }
    Ok(interfaces)
}

/// Driver name from the DRIVER= line of the device uevent file. Virtual
/// interfaces have no device directory; that is not an error.
fn driver_name(iface: &str) -> Option<String> {
    let content = fs::read_to_string(format!("/sys/class/net/{}/device/uevent", iface)).ok()?;
    parse_uevent_driver(&content)
}

fn parse_uevent_driver(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("DRIVER="))
        .map(|d| d.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uevent_driver() {
        let uevent = "DRIVER=e1000e\nPCI_CLASS=20000\nPCI_ID=8086:10D3\n";
        assert_eq!(parse_uevent_driver(uevent), Some("e1000e".to_string()));
        assert_eq!(parse_uevent_driver("PCI_CLASS=20000\n"), None);
    }

    #[test]
    fn test_collect_is_total() {
        // Whatever the environment provides, collect must return a snapshot
        // rather than abort.
        let info = SystemProbe::new().collect();
        for iface in &info.interfaces {
            assert!(!iface.name.is_empty());
        }
    }

    #[test]
    fn test_loadavg_populated() {
        if !std::path::Path::new("/proc/loadavg").exists() {
            return;
        }
        let info = SystemProbe::new().collect();
        assert!(info.load1 >= 0.0);
        assert!(info.uptime.as_secs_f64() > 0.0);
    }
}
