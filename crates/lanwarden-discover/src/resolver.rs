//! Address-space resolution: which addresses a scan targets.
//!
//! Configured CIDRs are validated, capped, and expanded into usable host
//! addresses. Local private IPv4 networks can be added automatically from the
//! host's interfaces.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use pnet::datalink;

use lanwarden_core::{NetworkRange, ScanError};

/// Source of the host's interface networks.
pub trait InterfaceSource: Send + Sync {
    /// Networks (address + prefix) of up, non-loopback interfaces.
    fn networks(&self) -> Vec<IpNet>;
}

/// Reads interfaces through `pnet::datalink`.
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn networks(&self) -> Vec<IpNet> {
        datalink::interfaces()
            .into_iter()
            .filter(|iface| iface.is_up() && !iface.is_loopback())
            .flat_map(|iface| {
                iface
                    .ips
                    .iter()
                    .filter_map(|ip| IpNet::new(ip.ip(), ip.prefix()).ok())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// A validated range and its usable host addresses.
#[derive(Debug, Clone)]
pub struct ResolvedRange {
    pub key: String,
    pub network: IpNet,
    pub addresses: Vec<IpAddr>,
}

pub struct AddressSpaceResolver {
    max_addresses: u64,
    interfaces: Arc<dyn InterfaceSource>,
}

impl AddressSpaceResolver {
    pub fn new(max_addresses: u64) -> Self {
        Self::with_interfaces(max_addresses, Arc::new(SystemInterfaces))
    }

    pub fn with_interfaces(max_addresses: u64, interfaces: Arc<dyn InterfaceSource>) -> Self {
        Self {
            max_addresses,
            interfaces,
        }
    }

    /// Validate one range and expand it to its usable host addresses.
    ///
    /// IPv4 network and broadcast addresses are excluded except for /31 and
    /// /32, which keep all their addresses.
    pub fn expand(&self, range: &NetworkRange) -> Result<ResolvedRange, ScanError> {
        let network = range.network()?.trunc();
        let total = address_count(&network);
        if total > u128::from(self.max_addresses) {
            return Err(ScanError::RangeTooLarge {
                cidr: range.cidr.clone(),
                addresses: total,
                limit: self.max_addresses,
            });
        }

        Ok(ResolvedRange {
            key: network.to_string(),
            network,
            addresses: network.hosts().collect(),
        })
    }

    /// Expand every enabled range into one de-duplicated address list.
    ///
    /// Invalid ranges are logged and skipped. Fails only when no enabled
    /// range could be resolved.
    pub fn resolve(&self, ranges: &[NetworkRange]) -> Result<Vec<IpAddr>, ScanError> {
        let mut seen = HashSet::new();
        let mut addresses = Vec::new();
        let mut first_error = None;
        let mut resolved_any = false;

        for range in ranges {
            if !range.enabled {
                tracing::debug!(cidr = %range.cidr, "Range disabled, skipping");
                continue;
            }
            match self.expand(range) {
                Ok(resolved) => {
                    resolved_any = true;
                    addresses.extend(resolved.addresses.into_iter().filter(|ip| seen.insert(*ip)));
                }
                Err(e) => {
                    tracing::warn!(cidr = %range.cidr, error = %e, "Range rejected");
                    first_error.get_or_insert(e);
                }
            }
        }

        match (resolved_any, first_error) {
            (true, _) => Ok(addresses),
            (false, Some(e)) => Err(e),
            (false, None) => Err(ScanError::Configuration(
                "no enabled network ranges".to_string(),
            )),
        }
    }

    /// Private IPv4 networks of local interfaces, in network form.
    pub fn detect_local_ranges(&self) -> Vec<NetworkRange> {
        let mut seen = HashSet::new();
        let mut ranges = Vec::new();

        for net in self.interfaces.networks() {
            let IpNet::V4(v4) = net else { continue };
            if !v4.addr().is_private() {
                continue;
            }
            let net = IpNet::V4(v4.trunc());
            if seen.insert(net) {
                tracing::debug!(cidr = %net, "Detected local network");
                ranges.push(NetworkRange::auto_detected(net));
            }
        }

        ranges
    }

    /// Configured ranges plus detected ones. A configured range wins when both
    /// share a range key.
    pub fn all_ranges(&self, configured: &[NetworkRange]) -> Vec<NetworkRange> {
        let configured_keys: HashSet<String> =
            configured.iter().filter_map(|r| r.key().ok()).collect();

        let mut ranges = configured.to_vec();
        ranges.extend(
            self.detect_local_ranges()
                .into_iter()
                .filter(|r| r.key().map_or(false, |k| !configured_keys.contains(&k))),
        );
        ranges
    }
}

/// Total addresses covered by a network, saturating for huge IPv6 blocks.
fn address_count(net: &IpNet) -> u128 {
    let host_bits = u32::from(net.max_prefix_len() - net.prefix_len());
    1u128.checked_shl(host_bits).unwrap_or(u128::MAX)
}
