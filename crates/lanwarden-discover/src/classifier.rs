//! Device classification from MAC vendor, open ports, and response hints.
//!
//! The cascade is evaluated in a fixed order and the first matching rule
//! wins, so identical inputs always yield the same classification:
//!
//! 1. vendor of the MAC OUI
//! 2. port signatures (printer, server, router, database, endpoint)
//! 3. `unknown`

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;

use mac_oui::Oui;

use lanwarden_core::DeviceType;

use crate::banner;
use crate::error::{DiscoverError, Result};
use crate::neighbor::parse_mac;

/// Maps a MAC address to its manufacturer.
pub trait VendorLookup: Send + Sync {
    fn vendor(&self, mac: &str) -> Option<String>;
}

/// Small built-in OUI table covering common network, printer, server and
/// client hardware. Extendable from configuration.
pub struct OuiTable {
    entries: HashMap<[u8; 3], String>,
}

const BUILTIN_OUIS: &[([u8; 3], &str)] = &[
    ([0x00, 0x00, 0x0c], "Cisco Systems"),
    ([0x00, 0x1b, 0x54], "Cisco Systems"),
    ([0x24, 0xa4, 0x3c], "Ubiquiti Networks"),
    ([0xfc, 0xec, 0xda], "Ubiquiti Networks"),
    ([0x50, 0xc7, 0xbf], "TP-Link Technologies"),
    ([0xec, 0x08, 0x6b], "TP-Link Technologies"),
    ([0x00, 0x14, 0x6c], "Netgear"),
    ([0xa0, 0x40, 0xa0], "Netgear"),
    ([0x4c, 0x5e, 0x0c], "MikroTik"),
    ([0x00, 0x05, 0x85], "Juniper Networks"),
    ([0x00, 0x80, 0x77], "Brother Industries"),
    ([0x00, 0x1e, 0x8f], "Canon"),
    ([0x00, 0x26, 0xab], "Seiko Epson"),
    ([0x00, 0x00, 0xaa], "Xerox"),
    ([0x00, 0x04, 0x00], "Lexmark International"),
    ([0x00, 0x25, 0x90], "Super Micro Computer"),
    ([0x00, 0x50, 0x56], "VMware"),
    ([0x3c, 0x22, 0xfb], "Apple"),
    ([0xf0, 0x18, 0x98], "Apple"),
    ([0x8c, 0x77, 0x12], "Samsung Electronics"),
    ([0x3c, 0xa9, 0xf4], "Intel Corporate"),
    ([0xb8, 0x27, 0xeb], "Raspberry Pi Foundation"),
];

impl OuiTable {
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_OUIS
                .iter()
                .map(|(prefix, vendor)| (*prefix, (*vendor).to_string()))
                .collect(),
        }
    }

    /// Add `"00:1b:54" → vendor` entries, replacing built-in ones.
    pub fn with_entries(mut self, extra: &HashMap<String, String>) -> Result<Self> {
        for (prefix, vendor) in extra {
            let oui = parse_oui(prefix)
                .ok_or_else(|| DiscoverError::Config(format!("invalid OUI prefix {prefix:?}")))?;
            self.entries.insert(oui, vendor.clone());
        }
        Ok(self)
    }
}

impl VendorLookup for OuiTable {
    fn vendor(&self, mac: &str) -> Option<String> {
        let octets = parse_mac(mac)?;
        self.entries
            .get(&[octets[0], octets[1], octets[2]])
            .cloned()
    }
}

fn parse_oui(prefix: &str) -> Option<[u8; 3]> {
    let octets = parse_mac(&format!("{}:00:00:00", prefix.trim()))?;
    Some([octets[0], octets[1], octets[2]])
}

/// The full IEEE registry shipped with the `mac_oui` crate.
pub struct MacOuiDatabase {
    db: Oui,
}

impl MacOuiDatabase {
    pub fn load() -> Result<Self> {
        let db = Oui::default()
            .map_err(|e| DiscoverError::Config(format!("failed to load OUI database: {e:?}")))?;
        Ok(Self { db })
    }
}

impl VendorLookup for MacOuiDatabase {
    fn vendor(&self, mac: &str) -> Option<String> {
        match self.db.lookup_by_mac(mac) {
            Ok(Some(entry)) => Some(entry.company_name.clone()),
            _ => None,
        }
    }
}

// ── Classification ────────────────────────────────────────────────

/// What the probes learned about one host, beyond its address.
#[derive(Debug, Clone, Default)]
pub struct ResponseHints {
    /// Banner hint per open port.
    pub banners: BTreeMap<u16, String>,
    /// The host behaves like a gateway (see [`gateway_like_hosts`]).
    pub gateway_like: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub device_type: DeviceType,
    pub vendor: Option<String>,
}

const PRINTER_PORTS: [u16; 3] = [515, 631, 9100];
const WEB_PORTS: [u16; 4] = [80, 443, 8080, 8443];
const DATABASE_PORTS: [u16; 6] = [1433, 3306, 5432, 6379, 9200, 27017];
const ENDPOINT_PORTS: [u16; 7] = [135, 139, 445, 3389, 5900, 5901, 62078];

const ROUTER_VENDORS: [&str; 10] = [
    "cisco", "ubiquiti", "tp-link", "netgear", "mikrotik", "juniper", "aruba", "fortinet",
    "zyxel", "d-link",
];
const PRINTER_VENDORS: [&str; 7] = [
    "brother", "canon", "epson", "xerox", "lexmark", "kyocera", "ricoh",
];
const SERVER_VENDORS: [&str; 3] = ["super micro", "vmware", "quanta"];
const ENDPOINT_VENDORS: [&str; 6] = ["apple", "samsung", "intel", "lenovo", "microsoft", "xiaomi"];

pub struct DeviceClassifier {
    lookups: Vec<Box<dyn VendorLookup>>,
}

impl DeviceClassifier {
    /// Vendor lookups are consulted in order; the first hit wins.
    pub fn new(lookups: Vec<Box<dyn VendorLookup>>) -> Self {
        Self { lookups }
    }

    /// Built-in table plus configured extras, then the IEEE registry when it
    /// loads.
    pub fn from_config(extra_oui: &HashMap<String, String>) -> Result<Self> {
        let mut lookups: Vec<Box<dyn VendorLookup>> =
            vec![Box::new(OuiTable::builtin().with_entries(extra_oui)?)];
        match MacOuiDatabase::load() {
            Ok(db) => lookups.push(Box::new(db)),
            Err(e) => {
                tracing::warn!(error = %e, "IEEE OUI registry unavailable, using built-in table")
            }
        }
        Ok(Self::new(lookups))
    }

    pub fn lookup_vendor(&self, mac: &str) -> Option<String> {
        self.lookups.iter().find_map(|l| l.vendor(mac))
    }

    pub fn classify(
        &self,
        mac_address: Option<&str>,
        open_ports: &[u16],
        hints: &ResponseHints,
    ) -> Classification {
        let vendor = mac_address.and_then(|mac| self.lookup_vendor(mac));

        let device_type = vendor
            .as_deref()
            .map(type_for_vendor)
            .filter(DeviceType::is_known)
            .unwrap_or_else(|| type_for_ports(open_ports, hints));

        Classification {
            device_type,
            vendor,
        }
    }
}

fn type_for_vendor(vendor: &str) -> DeviceType {
    let name = vendor.to_lowercase();
    let matches = |keywords: &[&str]| keywords.iter().any(|k| name.contains(k));

    if matches(&ROUTER_VENDORS) {
        DeviceType::Router
    } else if matches(&PRINTER_VENDORS) {
        DeviceType::Printer
    } else if matches(&SERVER_VENDORS) {
        DeviceType::Server
    } else if matches(&ENDPOINT_VENDORS) {
        DeviceType::Endpoint
    } else {
        DeviceType::Unknown
    }
}

fn type_for_ports(open_ports: &[u16], hints: &ResponseHints) -> DeviceType {
    let has = |port: u16| open_ports.contains(&port);
    let any = |ports: &[u16]| ports.iter().any(|p| has(*p));

    if any(&PRINTER_PORTS) {
        return DeviceType::Printer;
    }

    let server_banner = [22, 80, 443]
        .iter()
        .filter_map(|p| hints.banners.get(p))
        .any(|hint| banner::identifies_server(hint));
    if has(22) && (has(80) || has(443)) && server_banner {
        return DeviceType::Server;
    }

    if hints.gateway_like || (has(53) && any(&WEB_PORTS)) {
        return DeviceType::Router;
    }

    if any(&DATABASE_PORTS) {
        return DeviceType::Server;
    }

    if any(&ENDPOINT_PORTS) {
        return DeviceType::Endpoint;
    }

    DeviceType::Unknown
}

/// Addresses that behave like gateways: configured gateways, and every live
/// address whose MAC also answers for another live address (proxy ARP).
pub fn gateway_like_hosts(
    macs: &HashMap<IpAddr, String>,
    live: &[IpAddr],
    gateways: &[IpAddr],
) -> HashSet<IpAddr> {
    let mut by_mac: HashMap<&str, Vec<IpAddr>> = HashMap::new();
    for ip in live {
        if let Some(mac) = macs.get(ip) {
            by_mac.entry(mac.as_str()).or_default().push(*ip);
        }
    }

    let mut result: HashSet<IpAddr> = live
        .iter()
        .filter(|ip| gateways.contains(ip))
        .copied()
        .collect();
    for ips in by_mac.into_values().filter(|ips| ips.len() > 1) {
        result.extend(ips);
    }
    result
}
