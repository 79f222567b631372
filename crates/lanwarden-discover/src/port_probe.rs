//! TCP connect port scanning for a single live host.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use lanwarden_core::{DeviceId, PortFinding, PortState, Protocol, ScanRunId};

use crate::banner;

/// One port's observed state, before it is attributed to a device and run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortObservation {
    pub port: u16,
    pub protocol: Protocol,
    pub state: PortState,
    pub banner_hint: Option<String>,
}

impl PortObservation {
    pub fn open(port: u16, banner_hint: Option<String>) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
            state: PortState::Open,
            banner_hint,
        }
    }

    pub fn closed(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
            state: PortState::Closed,
            banner_hint: None,
        }
    }

    pub fn filtered(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
            state: PortState::Filtered,
            banner_hint: None,
        }
    }

    pub fn into_finding(self, device_id: DeviceId, scan_run_id: ScanRunId) -> PortFinding {
        PortFinding {
            device_id,
            scan_run_id,
            port: self.port,
            protocol: self.protocol,
            state: self.state,
            banner_hint: self.banner_hint,
        }
    }
}

#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Probe `ports` on `addr`, at most `concurrency` at a time.
    /// Results are sorted by port; a failing port is recorded, never fatal.
    async fn scan_ports(
        &self,
        addr: IpAddr,
        ports: &[u16],
        timeout: Duration,
        concurrency: usize,
    ) -> Vec<PortObservation>;
}

/// Full-handshake TCP connect scanner.
pub struct TcpPortScanner {
    grab_banners: bool,
}

impl TcpPortScanner {
    pub fn new() -> Self {
        Self { grab_banners: true }
    }

    pub fn with_banners(mut self, grab_banners: bool) -> Self {
        self.grab_banners = grab_banners;
        self
    }

    async fn probe_port(&self, addr: IpAddr, port: u16, limit: Duration) -> PortObservation {
        let target = SocketAddr::new(addr, port);

        match timeout(limit, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                let hint = if self.grab_banners {
                    banner::read_hint(stream, port, limit).await
                } else {
                    None
                };
                tracing::trace!(%target, "Port open");
                PortObservation::open(port, hint)
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                PortObservation::closed(port)
            }
            Ok(Err(e)) => {
                tracing::trace!(%target, error = %e, "Port probe failed, recording filtered");
                PortObservation::filtered(port)
            }
            Err(_) => PortObservation::filtered(port),
        }
    }
}

impl Default for TcpPortScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortProbe for TcpPortScanner {
    async fn scan_ports(
        &self,
        addr: IpAddr,
        ports: &[u16],
        limit: Duration,
        concurrency: usize,
    ) -> Vec<PortObservation> {
        fan_out(ports, concurrency, move |port| self.probe_port(addr, port, limit)).await
    }
}

/// Run `check` for each distinct port with at most `concurrency` in flight.
/// Results come back sorted by port.
async fn fan_out<F, Fut>(ports: &[u16], concurrency: usize, check: F) -> Vec<PortObservation>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = PortObservation>,
{
    let mut targets = ports.to_vec();
    targets.sort_unstable();
    targets.dedup();

    let mut results: Vec<PortObservation> = stream::iter(targets)
        .map(check)
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    results.sort_by_key(|r| r.port);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_and_closed_ports() {
        let open = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = open.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = open.accept().await else {
                    break;
                };
                let _ = socket.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await;
            }
        });

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let scanner = TcpPortScanner::new();
        let results = scanner
            .scan_ports(
                "127.0.0.1".parse().unwrap(),
                &[closed_port, open_port, open_port],
                Duration::from_secs(2),
                4,
            )
            .await;

        assert_eq!(results.len(), 2);
        let by_port = |p: u16| results.iter().find(|r| r.port == p).unwrap();
        assert_eq!(by_port(open_port).state, PortState::Open);
        assert_eq!(
            by_port(open_port).banner_hint.as_deref(),
            Some("SSH-2.0-OpenSSH_9.6")
        );
        assert_eq!(by_port(closed_port).state, PortState::Closed);
        assert!(results.windows(2).all(|w| w[0].port < w[1].port));
    }

    #[test]
    fn test_into_finding_keeps_state() {
        let device_id = DeviceId::for_host("10.0.0.0/30", "10.0.0.1".parse().unwrap());
        let scan_id = ScanRunId::new();
        let finding = PortObservation::open(23, Some("login:".to_string()))
            .into_finding(device_id, scan_id);

        assert!(finding.is_open());
        assert_eq!(finding.device_id, device_id);
        assert_eq!(finding.scan_run_id, scan_id);
        assert_eq!(finding.banner_hint.as_deref(), Some("login:"));
    }

    #[tokio::test]
    async fn test_port_checks_respect_concurrency() {
        let counters = (AtomicUsize::new(0), AtomicUsize::new(0));
        let (in_flight, peak) = (&counters.0, &counters.1);
        let check = move |port: u16| async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            PortObservation::closed(port)
        };
        let ports: Vec<u16> = (1..=20).collect();

        let results = fan_out(&ports, 3, check).await;
        assert_eq!(results.len(), 20);
        assert_eq!(peak.load(Ordering::SeqCst), 3);

        // Zero is treated as one at a time.
        peak.store(0, Ordering::SeqCst);
        let results = fan_out(&ports[..4], 0, check).await;
        assert_eq!(results.len(), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
