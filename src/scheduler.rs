//! Collection loop: periodic ticks, at-most-one in-flight invocation per
//! probe, and snapshot fan-out over a message channel.

use crate::collector::connectivity::ConnectivityProbe;
use crate::collector::dns::{self, DnsLookupResult, DnsProbe, DnsRecordType, DnsServer};
use crate::collector::kernel::KernelProbe;
use crate::collector::nat::{NatInfo, NatProbe, StunTarget};
use crate::collector::public_ip::{PublicIpInfo, PublicIpProbe};
use crate::collector::system::SystemProbe;
use crate::collector::traffic::TrafficProbe;
use crate::collector::tunnel::{TunnelProbe, TunnelResult};
use crate::collector::{
    ConnectivityStats, DnsTimings, HostInfo, KernelStats, PingResult, TrafficStats,
};
use crate::config::{parse_stun_server, Config};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const CONNECTIVITY_REFRESH: Duration = Duration::from_secs(5);

/// One message per completed probe invocation. Each carries a whole
/// snapshot; consumers replace their latest copy wholesale.
#[derive(Debug, Clone)]
pub enum Message {
    System(HostInfo),
    Connectivity(ConnectivityStats),
    Traffic(TrafficStats),
    Kernel(KernelStats),
    Nat(Vec<NatInfo>),
    Dns(Box<DnsLookupResult>),
    DnsPing(PingResult),
    Tunnel(Vec<TunnelResult>),
    PublicIp(PublicIpInfo),
}

#[derive(Clone)]
pub struct Scheduler {
    system: Arc<SystemProbe>,
    traffic: Arc<TrafficProbe>,
    kernel: Arc<KernelProbe>,
    connectivity: Arc<ConnectivityProbe>,
    nat: Arc<NatProbe>,
    dns: Arc<DnsProbe>,
    tunnel: Arc<TunnelProbe>,
    public_ip: Arc<PublicIpProbe>,

    tx: mpsc::Sender<Message>,
    shutdown: Arc<Notify>,

    traffic_busy: Arc<AtomicBool>,
    kernel_busy: Arc<AtomicBool>,
    // One-shot probes coalesce on their parameters.
    one_shot_busy: Arc<Mutex<HashSet<String>>>,
}

impl Scheduler {
    pub fn new(cfg: &Config, tx: mpsc::Sender<Message>, shutdown: Arc<Notify>) -> Self {
        let stun_targets: Vec<StunTarget> = cfg
            .stun_servers
            .iter()
            .map(|entry| {
                let (host, port) = parse_stun_server(entry);
                StunTarget { host, port }
            })
            .collect();

        Scheduler {
            system: Arc::new(SystemProbe::new()),
            traffic: Arc::new(TrafficProbe::new()),
            kernel: Arc::new(KernelProbe::new()),
            connectivity: Arc::new(ConnectivityProbe::new()),
            nat: Arc::new(NatProbe::new(stun_targets)),
            dns: Arc::new(DnsProbe::new()),
            tunnel: Arc::new(TunnelProbe::new(
                cfg.tunnels.clone(),
                cfg.tunnel_insecure_skip_verify,
            )),
            public_ip: Arc::new(PublicIpProbe::new()),
            tx,
            shutdown,
            traffic_busy: Arc::new(AtomicBool::new(false)),
            kernel_busy: Arc::new(AtomicBool::new(false)),
            one_shot_busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Initial burst (system, connectivity, NAT, tunnels) plus the periodic
    /// tick loop. Returns immediately; everything runs on spawned tasks.
    pub fn start(&self, run_tunnels: bool) {
        self.spawn_system();
        self.spawn_nat();
        self.spawn_connectivity_loop();
        if run_tunnels {
            self.spawn_tunnels();
        }
        self.spawn_tick_loop();
    }

    fn spawn_system(&self) {
        let probe = Arc::clone(&self.system);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let info = run_blocking_probe(move || probe.collect(), |msg| HostInfo {
                error: Some(msg),
                ..Default::default()
            })
            .await;
            let _ = tx.send(Message::System(info)).await;
        });
    }

    fn spawn_nat(&self) {
        let probe = Arc::clone(&self.nat);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let results = run_async_probe(
                async move { probe.collect().await },
                |msg| {
                    vec![NatInfo {
                        target: String::new(),
                        nat_type: crate::collector::nat::NatType::Unknown,
                        public_ip: String::new(),
                        local_ip: String::new(),
                        error: Some(msg),
                    }]
                },
            )
            .await;
            let _ = tx.send(Message::Nat(results)).await;
        });
    }

    /// Connectivity self-chains: the next cycle starts a fixed delay after
    /// the previous result landed, so slow networks never pile up probes.
    fn spawn_connectivity_loop(&self) {
        let probe = Arc::clone(&self.connectivity);
        let tx = self.tx.clone();
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            loop {
                let p = Arc::clone(&probe);
                let stats = run_async_probe(async move { p.collect().await }, |msg| {
                    ConnectivityStats {
                        dns: DnsTimings {
                            error: Some(msg),
                            ..Default::default()
                        },
                        ..Default::default()
                    }
                })
                .await;
                if tx.send(Message::Connectivity(stats)).await.is_err() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(CONNECTIVITY_REFRESH) => {}
                    _ = shutdown.notified() => break,
                }
            }
        });
    }

    fn spawn_tunnels(&self) {
        let probe = Arc::clone(&self.tunnel);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let results =
                run_async_probe(async move { probe.collect().await }, |_| Vec::new()).await;
            let _ = tx.send(Message::Tunnel(results)).await;
        });
    }

    fn spawn_tick_loop(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            // A lagging tick fires once, late; it never bursts to catch up.
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => scheduler.tick(),
                    _ = scheduler.shutdown.notified() => break,
                }
            }
        });
    }

    /// Spawn-if-idle for the per-second probes.
    fn tick(&self) {
        if self
            .traffic_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let probe = Arc::clone(&self.traffic);
            let busy = Arc::clone(&self.traffic_busy);
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let stats = run_blocking_probe(move || probe.collect(), |msg| TrafficStats {
                    error: Some(msg),
                    ..Default::default()
                })
                .await;
                busy.store(false, Ordering::SeqCst);
                let _ = tx.send(Message::Traffic(stats)).await;
            });
        }

        if self
            .kernel_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let probe = Arc::clone(&self.kernel);
            let busy = Arc::clone(&self.kernel_busy);
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let stats = run_blocking_probe(move || probe.collect(), |msg| KernelStats {
                    error: Some(msg),
                    ..Default::default()
                })
                .await;
                busy.store(false, Ordering::SeqCst);
                let _ = tx.send(Message::Kernel(stats)).await;
            });
        }
    }

    /// One-shot DNS lookup. A successful lookup chains a single-target ping
    /// of the resolved address, published as its own message.
    pub fn trigger_dns(&self, domain: String, record_type: DnsRecordType, server: DnsServer) {
        let key = format!("dns/{}/{}/{}/{}", domain, record_type, server.name, server.address);
        if !self.claim_one_shot(&key) {
            return;
        }
        let scheduler = self.clone();
        tokio::spawn(async move {
            let dns = Arc::clone(&scheduler.dns);
            let d = domain.clone();
            let result = run_async_probe(
                async move { dns.lookup(&d, record_type, &server).await },
                |msg| DnsLookupResult {
                    error: Some(msg),
                    ..Default::default()
                },
            )
            .await;

            let follow_up = if result.error.is_none() {
                dns::ping_target_from(&domain, &result.records)
            } else {
                None
            };

            let _ = scheduler.tx.send(Message::Dns(Box::new(result))).await;
            scheduler.release_one_shot(&key);

            if let Some(target) = follow_up {
                scheduler.trigger_ping(target);
            }
        });
    }

    pub fn trigger_ping(&self, target: String) {
        let key = format!("ping/{}", target);
        if !self.claim_one_shot(&key) {
            return;
        }
        let scheduler = self.clone();
        tokio::spawn(async move {
            let connectivity = Arc::clone(&scheduler.connectivity);
            let t = target.clone();
            let result = run_async_probe(
                async move { connectivity.ping(&t).await },
                |msg| PingResult {
                    error: Some(msg),
                    ..Default::default()
                },
            )
            .await;
            let _ = scheduler.tx.send(Message::DnsPing(result)).await;
            scheduler.release_one_shot(&key);
        });
    }

    pub fn trigger_public_ip(&self) {
        let key = "public_ip".to_string();
        if !self.claim_one_shot(&key) {
            return;
        }
        let scheduler = self.clone();
        tokio::spawn(async move {
            let probe = Arc::clone(&scheduler.public_ip);
            let info = run_async_probe(
                async move { probe.collect().await },
                |msg| PublicIpInfo {
                    error: Some(msg),
                    ..Default::default()
                },
            )
            .await;
            let _ = scheduler.tx.send(Message::PublicIp(info)).await;
            scheduler.release_one_shot(&key);
        });
    }

    fn claim_one_shot(&self, key: &str) -> bool {
        self.one_shot_busy.lock().unwrap().insert(key.to_string())
    }

    fn release_one_shot(&self, key: &str) {
        self.one_shot_busy.lock().unwrap().remove(key);
    }
}

/// Run a synchronous probe on the blocking pool. A panic inside the probe
/// becomes an error-bearing snapshot instead of taking the process down.
async fn run_blocking_probe<T, F, E>(probe: F, on_panic: E) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
    E: FnOnce(String) -> T,
{
    match tokio::task::spawn_blocking(probe).await {
        Ok(snapshot) => snapshot,
        Err(e) => on_panic(format!("probe panicked: {}", e)),
    }
}

/// Same containment for async probes: the probe runs in its own task whose
/// panic is absorbed at the join point.
async fn run_async_probe<T, Fut, E>(fut: Fut, on_panic: E) -> T
where
    T: Send + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
    E: FnOnce(String) -> T,
{
    match tokio::spawn(fut).await {
        Ok(snapshot) => snapshot,
        Err(e) => on_panic(format!("probe panicked: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panicking_probe_becomes_error_snapshot() {
        let stats = run_blocking_probe(
            || -> KernelStats { panic!("boom") },
            |msg| KernelStats {
                error: Some(msg),
                ..Default::default()
            },
        )
        .await;
        assert!(stats.error.as_deref().unwrap().contains("panicked"));
        assert_eq!(stats.tcp_established, 0);
    }

    #[tokio::test]
    async fn test_panicking_async_probe_becomes_error_snapshot() {
        let result = run_async_probe(
            async { panic!("boom") },
            |msg| DnsLookupResult {
                error: Some(msg),
                ..Default::default()
            },
        )
        .await;
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_one_shot_coalescing() {
        let (tx, _rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(&Config::default(), tx, Arc::new(Notify::new()));
        assert!(scheduler.claim_one_shot("ping/8.8.8.8"));
        // Same parameters: rejected while in flight.
        assert!(!scheduler.claim_one_shot("ping/8.8.8.8"));
        // Different parameters: allowed.
        assert!(scheduler.claim_one_shot("ping/1.1.1.1"));
        scheduler.release_one_shot("ping/8.8.8.8");
        assert!(scheduler.claim_one_shot("ping/8.8.8.8"));
    }

    #[tokio::test]
    async fn test_tick_skips_busy_probes() {
        let (tx, mut rx) = mpsc::channel(64);
        let scheduler = Scheduler::new(&Config::default(), tx, Arc::new(Notify::new()));

        // Mark traffic busy by hand; a tick must then only produce kernel
        // messages.
        scheduler.traffic_busy.store(true, Ordering::SeqCst);
        scheduler.tick();
        let msg = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("tick produced no message")
            .unwrap();
        assert!(matches!(msg, Message::Kernel(_)));
        assert!(rx.try_recv().is_err());
    }
}
