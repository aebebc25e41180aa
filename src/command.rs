use crate::collector::dns::{server_list, DnsProtocol, DnsRecordType, DnsServer};
use crate::config::Config;
use crate::display;
use crate::scheduler::Scheduler;
use crate::system::{effective_uid, log_startup_info};
use clap::Parser;
use log::{info, LevelFilter};
use std::io::BufRead;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Parser)]
#[clap(name = "lnd")]
#[clap(version = env!("CARGO_PKG_VERSION"))]
#[clap(about = "Terminal network diagnostics for Linux")]
pub struct Opt {
    #[clap(long, help = "Path to configuration file (default: ~/.lnd.yaml)")]
    pub config: Option<String>,
}

pub async fn run(opt: Opt) -> Result<(), anyhow::Error> {
    // Set up logging
    env_logger::Builder::new()
        .filter(None, LevelFilter::Info)
        .target(env_logger::Target::Stdout)
        .init();

    // A malformed config is fatal; a missing one falls back to defaults.
    let cfg = Config::load(opt.config.as_deref())?;

    if effective_uid() != 0 {
        println!("Warning: lnd is running without root privileges.");
        println!("Some features (ICMP ping, socket diagnostics) may be limited or unavailable.");
        println!("Press Enter to continue or Ctrl+C to abort...");
        wait_for_enter();
    }

    log_startup_info(&cfg);

    let shutdown = Arc::new(Notify::new());
    let (tx, rx) = mpsc::channel(64);

    let scheduler = Scheduler::new(&cfg, tx, Arc::clone(&shutdown));
    scheduler.start(!cfg.tunnels.is_empty());
    scheduler.trigger_public_ip();

    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Exiting...");
                shutdown.notify_waiters();
            }
        });
    }

    spawn_command_reader(
        scheduler,
        server_list(&cfg.dns_servers),
        Arc::clone(&shutdown),
    );

    // The display loop owns the latest snapshots and returns on shutdown;
    // in-flight probes are abandoned with the process.
    display::run(rx, shutdown).await;

    Ok(())
}

fn wait_for_enter() {
    let stdin = std::io::stdin();
    let mut line = String::new();
    let _ = stdin.lock().read_line(&mut line);
}

/// Line commands from stdin drive the one-shot probes:
///   dns <domain> [type] [server-name-or-address] [proto]
///   ping <target>
///   publicip
///   quit
fn spawn_command_reader(scheduler: Scheduler, servers: Vec<DnsServer>, shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        loop {
            let line = tokio::task::spawn_blocking(|| {
                let mut line = String::new();
                match std::io::stdin().lock().read_line(&mut line) {
                    Ok(0) | Err(_) => None,
                    Ok(_) => Some(line),
                }
            })
            .await
            .ok()
            .flatten();

            let Some(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !dispatch_command(&scheduler, &servers, line, &shutdown) {
                break;
            }
        }
    });
}

fn dispatch_command(
    scheduler: &Scheduler,
    servers: &[DnsServer],
    line: &str,
    shutdown: &Notify,
) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("quit") | Some("q") => {
            shutdown.notify_waiters();
            return false;
        }
        Some("ping") => {
            if let Some(target) = parts.next() {
                scheduler.trigger_ping(target.to_string());
            }
        }
        Some("dns") => {
            let Some(domain) = parts.next() else {
                return true;
            };
            let record_type = parts
                .next()
                .and_then(DnsRecordType::parse)
                .unwrap_or(DnsRecordType::Auto);
            // A known server name selects a preset; anything else is a
            // custom address.
            let mut server = match parts.next() {
                None => servers[0].clone(),
                Some(arg) => servers
                    .iter()
                    .find(|s| s.name.eq_ignore_ascii_case(arg))
                    .cloned()
                    .unwrap_or_else(|| DnsServer {
                        name: "Custom".to_string(),
                        address: arg.to_string(),
                        proto: DnsProtocol::Udp,
                    }),
            };
            if let Some(proto) = parts.next().and_then(DnsProtocol::parse) {
                server.proto = proto;
            }
            scheduler.trigger_dns(domain.to_string(), record_type, server);
        }
        Some("publicip") => scheduler.trigger_public_ip(),
        Some(other) => log::warn!("unknown command: {}", other),
        None => {}
    }
    true
}
