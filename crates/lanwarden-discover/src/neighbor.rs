//! OS neighbour (ARP) table access.
//!
//! Linux exposes the table at `/proc/net/arp`; other platforms are read
//! through `arp -an`. Only complete entries are returned.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

/// Snapshot access to the neighbour table: address → MAC.
#[async_trait]
pub trait NeighborTable: Send + Sync {
    /// Complete entries, MACs normalised to lowercase `aa:bb:cc:dd:ee:ff`.
    async fn snapshot(&self) -> Result<HashMap<IpAddr, String>>;

    async fn lookup(&self, ip: IpAddr) -> Option<String> {
        self.snapshot().await.ok()?.remove(&ip)
    }
}

/// The neighbour table of the host the engine runs on.
pub struct SystemNeighborTable;

#[async_trait]
impl NeighborTable for SystemNeighborTable {
    #[cfg(target_os = "linux")]
    async fn snapshot(&self) -> Result<HashMap<IpAddr, String>> {
        let raw = tokio::fs::read_to_string("/proc/net/arp").await?;
        Ok(parse_proc_arp(&raw))
    }

    #[cfg(not(target_os = "linux"))]
    async fn snapshot(&self) -> Result<HashMap<IpAddr, String>> {
        let output = tokio::process::Command::new("arp")
            .arg("-an")
            .output()
            .await?;
        Ok(parse_arp_command(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Serves lookups from a shared snapshot that is re-read once it is older
/// than `max_age`. Concurrent callers wait on a single refresh.
pub struct CachedNeighborTable {
    inner: Arc<dyn NeighborTable>,
    max_age: Duration,
    cached: Mutex<Option<(Instant, Arc<HashMap<IpAddr, String>>)>>,
}

impl CachedNeighborTable {
    pub fn new(inner: Arc<dyn NeighborTable>, max_age: Duration) -> Self {
        Self {
            inner,
            max_age,
            cached: Mutex::new(None),
        }
    }

    async fn current(&self) -> Result<Arc<HashMap<IpAddr, String>>> {
        let mut cached = self.cached.lock().await;
        if let Some((taken, table)) = cached.as_ref() {
            if taken.elapsed() < self.max_age {
                return Ok(Arc::clone(table));
            }
        }
        let table = Arc::new(self.inner.snapshot().await?);
        *cached = Some((Instant::now(), Arc::clone(&table)));
        Ok(table)
    }
}

#[async_trait]
impl NeighborTable for CachedNeighborTable {
    async fn snapshot(&self) -> Result<HashMap<IpAddr, String>> {
        Ok(self.current().await?.as_ref().clone())
    }

    async fn lookup(&self, ip: IpAddr) -> Option<String> {
        match self.current().await {
            Ok(table) => table.get(&ip).cloned(),
            Err(e) => {
                tracing::debug!(error = %e, "Neighbour table unreadable");
                None
            }
        }
    }
}

const ATF_COM: u32 = 0x2;

/// Parse `/proc/net/arp`.
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 192.168.2.1      0x1         0x2         00:1b:54:aa:bb:cc     *        eth0
/// ```
pub fn parse_proc_arp(raw: &str) -> HashMap<IpAddr, String> {
    raw.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 4 {
                return None;
            }
            let ip: IpAddr = cols[0].parse().ok()?;
            let flags = u32::from_str_radix(cols[2].trim_start_matches("0x"), 16).ok()?;
            if flags & ATF_COM == 0 {
                return None;
            }
            Some((ip, normalize_mac(cols[3])?))
        })
        .collect()
}

/// Parse BSD/macOS `arp -an` output.
///
/// ```text
/// ? (192.168.2.1) at 0:1b:54:aa:bb:cc on en0 ifscope [ethernet]
/// ? (192.168.2.9) at (incomplete) on en0 ifscope [ethernet]
/// ```
pub fn parse_arp_command(raw: &str) -> HashMap<IpAddr, String> {
    raw.lines()
        .filter_map(|line| {
            let open = line.find('(')?;
            let close = line[open..].find(')')? + open;
            let ip: IpAddr = line[open + 1..close].parse().ok()?;
            let rest = line[close + 1..].trim_start().strip_prefix("at ")?;
            let mac = rest.split_whitespace().next()?;
            Some((ip, normalize_mac(mac)?))
        })
        .collect()
}

/// Normalise `0:1B:54:aa:bb:cc` / `00-1b-54-aa-bb-cc` to `00:1b:54:aa:bb:cc`.
/// The all-zero address (an unresolved entry) yields `None`.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let octets = parse_mac(raw)?;
    if octets == [0; 6] {
        return None;
    }
    Some(
        octets
            .iter()
            .map(|o| format!("{o:02x}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

pub fn parse_mac(raw: &str) -> Option<[u8; 6]> {
    let mut octets = [0u8; 6];
    let mut parts = raw.split(|c| c == ':' || c == '-');
    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        *octet = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(octets)
}
