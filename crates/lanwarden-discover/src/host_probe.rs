//! Host liveness probing.
//!
//! ICMP echo is used when the process may open an ICMP socket. Otherwise a
//! TCP connect against a few commonly open ports stands in: any answer,
//! including a refusal, proves the host is up. Either probe is wrapped in a
//! neighbour-aware probe that also accepts a resolved ARP entry as proof of
//! liveness.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::select_ok;
use serde::Serialize;
use surge_ping::{Client, Config, PingIdentifier, PingSequence, ICMP};
use tokio::net::TcpStream;
use tokio::time::timeout;

use lanwarden_core::ScanError;

use crate::neighbor::{CachedNeighborTable, NeighborTable};

const PING_PAYLOAD: [u8; 56] = [0; 56];

/// How liveness was established.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    Icmp,
    Tcp,
    Arp,
    None,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct LivenessResult {
    pub alive: bool,
    pub rtt_ms: Option<u64>,
    pub method: ProbeMethod,
}

impl LivenessResult {
    pub fn alive(method: ProbeMethod, rtt: Option<Duration>) -> Self {
        Self {
            alive: true,
            rtt_ms: rtt.map(|d| d.as_millis() as u64),
            method,
        }
    }

    pub fn not_alive() -> Self {
        Self {
            alive: false,
            rtt_ms: None,
            method: ProbeMethod::None,
        }
    }
}

#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Determine whether `addr` is up. `timeout` covers the whole attempt.
    async fn probe(&self, addr: IpAddr, timeout: Duration) -> LivenessResult;
}

/// Run a probe under a hard timeout; a probe that overruns counts as not-alive.
pub async fn probe_with_timeout(
    probe: &dyn HostProbe,
    addr: IpAddr,
    limit: Duration,
) -> LivenessResult {
    match timeout(limit, probe.probe(addr, limit)).await {
        Ok(result) => result,
        Err(_) => {
            let err = ScanError::ProbeTimeout {
                target: addr.to_string(),
                timeout_ms: limit.as_millis() as u64,
            };
            tracing::trace!(error = %err, "Host marked not alive");
            LivenessResult::not_alive()
        }
    }
}

// ── ICMP ──────────────────────────────────────────────────────────

/// ICMP echo probe. Needs raw-socket or unprivileged-ICMP permission.
pub struct IcmpProbe {
    v4: Client,
    v6: Option<Client>,
}

impl IcmpProbe {
    /// Open the ICMP sockets. Fails when the OS denies them.
    pub fn new() -> io::Result<Self> {
        let v4 = Client::new(&Config::default())?;
        let v6 = Client::new(&Config::builder().kind(ICMP::V6).build()).ok();
        Ok(Self { v4, v6 })
    }
}

#[async_trait]
impl HostProbe for IcmpProbe {
    async fn probe(&self, addr: IpAddr, limit: Duration) -> LivenessResult {
        let client = match (addr, &self.v6) {
            (IpAddr::V4(_), _) => &self.v4,
            (IpAddr::V6(_), Some(v6)) => v6,
            (IpAddr::V6(_), None) => return LivenessResult::not_alive(),
        };

        let ident = PingIdentifier(uuid::Uuid::new_v4().as_u128() as u16);
        let mut pinger = client.pinger(addr, ident).await;
        pinger.timeout(limit);

        match pinger.ping(PingSequence(0), &PING_PAYLOAD).await {
            Ok((_packet, rtt)) => LivenessResult::alive(ProbeMethod::Icmp, Some(rtt)),
            Err(e) => {
                tracing::trace!(ip = %addr, error = %e, "No ICMP echo reply");
                LivenessResult::not_alive()
            }
        }
    }
}

// ── TCP connect ───────────────────────────────────────────────────

/// Liveness heuristic for environments without ICMP permission.
pub struct TcpConnectProbe {
    ports: Vec<u16>,
}

impl TcpConnectProbe {
    pub fn new(ports: Vec<u16>) -> Self {
        Self { ports }
    }
}

#[async_trait]
impl HostProbe for TcpConnectProbe {
    async fn probe(&self, addr: IpAddr, limit: Duration) -> LivenessResult {
        if self.ports.is_empty() {
            return LivenessResult::not_alive();
        }

        let attempts = self
            .ports
            .iter()
            .map(|port| Box::pin(connect_answers(SocketAddr::new(addr, *port))));

        match timeout(limit, select_ok(attempts)).await {
            Ok(Ok((rtt, _))) => LivenessResult::alive(ProbeMethod::Tcp, Some(rtt)),
            Ok(Err(e)) => {
                tracing::trace!(ip = %addr, error = %e, "No TCP answer");
                LivenessResult::not_alive()
            }
            Err(_) => LivenessResult::not_alive(),
        }
    }
}

/// Resolves when the peer answers at all: an accepted or refused connection.
async fn connect_answers(addr: SocketAddr) -> io::Result<Duration> {
    let start = Instant::now();
    match TcpStream::connect(addr).await {
        Ok(_) => Ok(start.elapsed()),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(start.elapsed()),
        Err(e) => Err(e),
    }
}

// ── Neighbour fallback ────────────────────────────────────────────

/// How long one neighbour-table read serves lookups for other hosts.
const NEIGHBOR_MAX_AGE: Duration = Duration::from_millis(250);

/// Wraps a primary probe; a host the primary misses is still alive when the
/// neighbour table holds a complete entry for it. The table is consulted
/// while the primary attempt runs, inside the same time budget.
pub struct NeighborAwareProbe {
    primary: Arc<dyn HostProbe>,
    neighbors: Arc<dyn NeighborTable>,
}

impl NeighborAwareProbe {
    pub fn new(primary: Arc<dyn HostProbe>, neighbors: Arc<dyn NeighborTable>) -> Self {
        Self {
            primary,
            neighbors: Arc::new(CachedNeighborTable::new(neighbors, NEIGHBOR_MAX_AGE)),
        }
    }

    /// Checks the table at once and again halfway through the budget, after
    /// the primary attempt has made the kernel resolve the address on-link.
    async fn neighbor_entry(&self, addr: IpAddr, limit: Duration) -> Option<String> {
        let deadline = Instant::now() + limit;
        for wait in [Duration::ZERO, limit / 2] {
            tokio::time::sleep(wait).await;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Ok(Some(mac)) = timeout(remaining, self.neighbors.lookup(addr)).await {
                return Some(mac);
            }
        }
        None
    }
}

#[async_trait]
impl HostProbe for NeighborAwareProbe {
    async fn probe(&self, addr: IpAddr, limit: Duration) -> LivenessResult {
        let primary = self.primary.probe(addr, limit);
        let neighbor = self.neighbor_entry(addr, limit);
        tokio::pin!(primary, neighbor);

        let mut neighbor_missing = false;
        loop {
            tokio::select! {
                result = &mut primary => {
                    if result.alive || neighbor_missing {
                        return result;
                    }
                    return match (&mut neighbor).await {
                        Some(mac) => arp_alive(addr, &mac),
                        None => result,
                    };
                }
                found = &mut neighbor, if !neighbor_missing => match found {
                    Some(mac) => return arp_alive(addr, &mac),
                    None => neighbor_missing = true,
                },
            }
        }
    }
}

fn arp_alive(addr: IpAddr, mac: &str) -> LivenessResult {
    tracing::trace!(ip = %addr, mac = %mac, "Host has a neighbour entry");
    LivenessResult::alive(ProbeMethod::Arp, None)
}

/// Pick the liveness probe once at startup.
pub fn select_host_probe(
    liveness_ports: Vec<u16>,
    neighbors: Arc<dyn NeighborTable>,
) -> Arc<dyn HostProbe> {
    let primary: Arc<dyn HostProbe> = match IcmpProbe::new() {
        Ok(probe) => {
            tracing::info!("Using ICMP echo for host liveness");
            Arc::new(probe)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                ports = ?liveness_ports,
                "ICMP unavailable, using TCP connect for host liveness"
            );
            Arc::new(TcpConnectProbe::new(liveness_ports))
        }
    };
    Arc::new(NeighborAwareProbe::new(primary, neighbors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    struct SlowProbe;

    #[async_trait]
    impl HostProbe for SlowProbe {
        async fn probe(&self, _addr: IpAddr, _timeout: Duration) -> LivenessResult {
            tokio::time::sleep(Duration::from_secs(30)).await;
            LivenessResult::alive(ProbeMethod::Icmp, None)
        }
    }

    struct DeadProbe;

    #[async_trait]
    impl HostProbe for DeadProbe {
        async fn probe(&self, _addr: IpAddr, _timeout: Duration) -> LivenessResult {
            LivenessResult::not_alive()
        }
    }

    /// Stays silent for the whole budget, like a host that drops ICMP.
    struct SilentProbe;

    #[async_trait]
    impl HostProbe for SilentProbe {
        async fn probe(&self, _addr: IpAddr, limit: Duration) -> LivenessResult {
            tokio::time::sleep(limit).await;
            LivenessResult::not_alive()
        }
    }

    /// A neighbour table read from a `/proc/net/arp` formatted file.
    struct ArpFile(std::path::PathBuf);

    #[async_trait]
    impl NeighborTable for ArpFile {
        async fn snapshot(&self) -> crate::error::Result<HashMap<IpAddr, String>> {
            let raw = tokio::fs::read_to_string(&self.0).await?;
            Ok(crate::neighbor::parse_proc_arp(&raw))
        }
    }

    struct FakeNeighbors(HashMap<IpAddr, String>);

    #[async_trait]
    impl NeighborTable for FakeNeighbors {
        async fn snapshot(&self) -> crate::error::Result<HashMap<IpAddr, String>> {
            Ok(self.0.clone())
        }
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_timeout_bounds_slow_probe() {
        let started = Instant::now();
        let result = probe_with_timeout(&SlowProbe, localhost(), Duration::from_millis(50)).await;

        assert!(!result.alive);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_tcp_probe_accepting_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpConnectProbe::new(vec![port]);
        let result = probe.probe(localhost(), Duration::from_secs(2)).await;
        assert!(result.alive);
        assert_eq!(result.method, ProbeMethod::Tcp);
    }

    #[tokio::test]
    async fn test_tcp_probe_refused_port_proves_liveness() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = TcpConnectProbe::new(vec![port]);
        let result = probe.probe(localhost(), Duration::from_secs(2)).await;
        assert!(result.alive);
    }

    #[tokio::test]
    async fn test_tcp_probe_without_ports() {
        let probe = TcpConnectProbe::new(vec![]);
        assert!(!probe.probe(localhost(), Duration::from_millis(50)).await.alive);
    }

    #[tokio::test]
    async fn test_neighbor_entry_makes_host_alive() {
        let ip: IpAddr = "192.168.2.1".parse().unwrap();
        let neighbors = FakeNeighbors(HashMap::from([(ip, "00:1b:54:aa:bb:cc".to_string())]));
        let probe = NeighborAwareProbe::new(Arc::new(DeadProbe), Arc::new(neighbors));

        let result = probe.probe(ip, Duration::from_millis(200)).await;
        assert!(result.alive);
        assert_eq!(result.method, ProbeMethod::Arp);

        let other: IpAddr = "192.168.2.2".parse().unwrap();
        assert!(!probe.probe(other, Duration::from_millis(200)).await.alive);
    }

    #[tokio::test]
    async fn test_silent_host_with_arp_entry_is_alive() {
        let path = std::env::temp_dir().join(format!("lanwarden-arp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(
            &path,
            "IP address       HW type     Flags       HW address            Mask     Device\n\
             192.168.2.1      0x1         0x2         00:1b:54:aa:bb:cc     *        eth0\n",
        )
        .await
        .unwrap();

        let table = Arc::new(ArpFile(path.clone()));
        let probe = NeighborAwareProbe::new(Arc::new(SilentProbe), table);
        let gateway: IpAddr = "192.168.2.1".parse().unwrap();
        let limit = Duration::from_millis(300);

        let direct = probe.probe(gateway, limit).await;
        assert!(direct.alive);
        assert_eq!(direct.method, ProbeMethod::Arp);

        // The coordinator applies the same budget around the whole attempt.
        let started = Instant::now();
        let wrapped = probe_with_timeout(&probe, gateway, limit).await;
        assert!(wrapped.alive);
        assert_eq!(wrapped.method, ProbeMethod::Arp);
        assert!(started.elapsed() < limit);

        let stranger: IpAddr = "192.168.2.50".parse().unwrap();
        assert!(!probe_with_timeout(&probe, stranger, limit).await.alive);

        tokio::fs::remove_file(&path).await.unwrap();
    }
}
