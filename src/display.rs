//! Terminal rendering of the latest snapshots. This is the thin consumer
//! side of the scheduler's message channel: it owns the latest copy of each
//! snapshot and redraws on a fixed cadence.

use crate::collector::dns::DnsLookupResult;
use crate::collector::nat::NatInfo;
use crate::collector::public_ip::PublicIpInfo;
use crate::collector::tunnel::TunnelResult;
use crate::collector::{ConnectivityStats, HostInfo, KernelStats, PingResult, TrafficStats};
use crate::scheduler::Message;
use crate::utils::format_utils::{format_bytes, format_duration, format_rate};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

#[derive(Default)]
struct AppState {
    host: Option<HostInfo>,
    connectivity: Option<ConnectivityStats>,
    traffic: Option<TrafficStats>,
    kernel: Option<KernelStats>,
    nat: Option<Vec<NatInfo>>,
    dns: Option<DnsLookupResult>,
    dns_ping: Option<PingResult>,
    tunnels: Option<Vec<TunnelResult>>,
    public_ip: Option<PublicIpInfo>,
}

impl AppState {
    fn apply(&mut self, msg: Message) {
        match msg {
            Message::System(info) => self.host = Some(info),
            Message::Connectivity(stats) => self.connectivity = Some(stats),
            Message::Traffic(stats) => self.traffic = Some(stats),
            Message::Kernel(stats) => self.kernel = Some(stats),
            Message::Nat(info) => self.nat = Some(info),
            Message::Dns(result) => self.dns = Some(*result),
            Message::DnsPing(result) => self.dns_ping = Some(result),
            Message::Tunnel(results) => self.tunnels = Some(results),
            Message::PublicIp(info) => self.public_ip = Some(info),
        }
    }
}

/// Consume scheduler messages and redraw once a second until shutdown.
pub async fn run(mut rx: mpsc::Receiver<Message>, shutdown: Arc<Notify>) {
    let mut state = AppState::default();
    let mut redraw = tokio::time::interval(Duration::from_secs(1));
    redraw.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(msg) => state.apply(msg),
                    None => break,
                }
            }
            _ = redraw.tick() => render(&state),
            _ = shutdown.notified() => break,
        }
    }
}

fn render(state: &AppState) {
    // Clear screen
    print!("\x1B[2J\x1B[1;1H");

    if let Some(host) = &state.host {
        render_host(host);
    } else {
        println!("Loading system info...");
    }
    if let Some(traffic) = &state.traffic {
        render_traffic(traffic);
    }
    if let Some(kernel) = &state.kernel {
        render_kernel(kernel);
    }
    if let Some(connectivity) = &state.connectivity {
        render_connectivity(connectivity);
    }
    if let Some(nat) = &state.nat {
        render_nat(nat);
    }
    if let Some(public_ip) = &state.public_ip {
        match &public_ip.error {
            Some(e) => println!("Public IP: N/A ({})", e),
            None => println!("Public IP: {} (via {})", public_ip.ip, public_ip.provider),
        }
    }
    if let Some(tunnels) = &state.tunnels {
        render_tunnels(tunnels);
    }
    if let Some(dns) = &state.dns {
        render_dns(dns, state.dns_ping.as_ref());
    }
}

fn render_host(info: &HostInfo) {
    println!(
        "{} | kernel {} ({}) | up {} | load {:.2} {:.2} {:.2}",
        info.hostname,
        info.kernel_version,
        info.arch,
        format_duration(info.uptime),
        info.load1,
        info.load5,
        info.load15,
    );
    println!(
        "open files: soft limit {} / system max {}",
        info.max_open_files, info.file_max
    );
    for (key, value) in &info.sysctl_params {
        println!("  {} = {}", key, value);
    }
    if let Some(e) = &info.error {
        println!("  warning: {}", e);
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Interface", "IPv4", "MAC", "MTU", "Driver"]);
    for iface in &info.interfaces {
        table.add_row(vec![
            iface.name.clone(),
            iface.ip.clone(),
            iface.mac.clone(),
            iface.mtu.to_string(),
            iface.driver.clone(),
        ]);
    }
    println!("{}", table);
}

fn render_traffic(stats: &TrafficStats) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Interface", "RX Rate", "TX Rate", "RX Total", "TX Total", "Drops", "Errors",
        ]);

    let mut rows: Vec<_> = stats.interfaces.iter().collect();
    rows.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (name, t) in rows {
        // Idle interfaces with no history are noise.
        if t.rx_bytes == 0 && t.tx_bytes == 0 {
            continue;
        }
        table.add_row(vec![
            name.clone(),
            format_rate(t.rx_rate),
            format_rate(t.tx_rate),
            format_bytes(t.rx_bytes),
            format_bytes(t.tx_bytes),
            t.drops.to_string(),
            t.errors.to_string(),
        ]);
    }
    println!("{}", table);
    if let Some(e) = &stats.error {
        println!("traffic: {}", e);
    }
}

fn render_kernel(stats: &KernelStats) {
    if let Some(e) = &stats.error {
        println!("kernel: N/A ({})", e);
        return;
    }
    println!(
        "tcp retrans {:.2}% | established {} | time-wait {} | close-wait {} | udp rcvbuf errors {}",
        stats.tcp_retrans_rate,
        stats.tcp_established,
        stats.tcp_time_wait,
        stats.tcp_close_wait,
        stats.udp_rcvbuf_errors,
    );
}

fn render_connectivity(stats: &ConnectivityStats) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Target", "Status", "Loss", "RTT min/avg/max"]);

    let mut rows: Vec<_> = stats.targets.iter().collect();
    rows.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (target, res) in rows {
        let (status, rtt) = match &res.error {
            Some(e) => ("FAIL".to_string(), format!("N/A ({})", e)),
            None => (
                if res.packet_loss > 0.0 { "LOSSY" } else { "OK" }.to_string(),
                format!(
                    "{} / {} / {}",
                    format_duration(res.min_rtt),
                    format_duration(res.avg_rtt),
                    format_duration(res.max_rtt)
                ),
            ),
        };
        table.add_row(vec![
            target.clone(),
            status,
            format!("{:.0}%", res.packet_loss),
            rtt,
        ]);
    }
    println!("{}", table);

    match &stats.dns.error {
        Some(e) => println!("resolvers: N/A ({})", e),
        None => println!(
            "resolvers: system {} | 1.1.1.1 {}",
            format_duration(stats.dns.local_resolver),
            format_duration(stats.dns.public_resolver)
        ),
    }
}

fn render_nat(results: &[NatInfo]) {
    for info in results {
        match &info.error {
            Some(e) => println!("NAT {}: {} ({})", info.target, info.nat_type, e),
            None => println!(
                "NAT {}: {} | public {} | local {}",
                info.target, info.nat_type, info.public_ip, info.local_ip
            ),
        }
    }
}

fn render_tunnels(results: &[TunnelResult]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Tunnel", "App", "Transport", "Target", "Status", "Latency"]);
    for res in results {
        let status = match &res.error {
            Some(e) => format!("{} ({})", res.status, e),
            None => res.status.clone(),
        };
        table.add_row(vec![
            res.name.clone(),
            res.app.clone(),
            res.transport.clone(),
            res.target.clone(),
            status,
            format_duration(res.latency),
        ]);
    }
    println!("{}", table);
}

fn render_dns(result: &DnsLookupResult, ping: Option<&PingResult>) {
    if let Some(e) = &result.error {
        println!("dns lookup via {} ({}): {}", result.server, result.protocol, e);
        return;
    }
    println!(
        "dns {} ({}) | {} | {}",
        result.server,
        result.protocol,
        result.response_code,
        format_duration(result.latency)
    );
    if let Some(cert) = &result.cert_info {
        println!(
            "  tls: {} issued by {} | expires {}",
            cert.subject,
            cert.issuer,
            cert.not_after.format("%Y-%m-%d")
        );
    }
    for record in &result.records {
        println!("  {}", record);
    }
    if result.records.is_empty() {
        println!("  (no records)");
    }
    if let Some(ping) = ping {
        match &ping.error {
            Some(e) => println!("  reachability {}: N/A ({})", ping.target, e),
            None => println!(
                "  reachability {}: loss {:.0}%, rtt {}",
                ping.target,
                ping.packet_loss,
                format_duration(ping.avg_rtt)
            ),
        }
    }
}
