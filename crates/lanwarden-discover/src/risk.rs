//! Risk assessment: dangerous services to security findings.
//!
//! A fixed rule table is applied to the open ports of one device. Rules are
//! additive and never suppress each other. The output depends only on the
//! device and its port findings, so re-assessing stored results reproduces
//! the same findings.

use lanwarden_core::{Device, DeviceType, FindingCategory, PortFinding, SecurityFinding, Severity};

use crate::banner;

struct Rule {
    ports: &'static [u16],
    severity: Severity,
    category: FindingCategory,
    description: &'static str,
}

const RULES: &[Rule] = &[
    Rule {
        ports: &[23],
        severity: Severity::High,
        category: FindingCategory::InsecureProtocol,
        description: "Telnet service exposed; credentials travel in cleartext",
    },
    Rule {
        ports: &[21],
        severity: Severity::Medium,
        category: FindingCategory::InsecureProtocol,
        description: "FTP service exposed; credentials travel in cleartext",
    },
    Rule {
        ports: &[2375],
        severity: Severity::Critical,
        category: FindingCategory::ExposedAdminInterface,
        description: "Unauthenticated Docker API exposed",
    },
    Rule {
        ports: &[3389],
        severity: Severity::High,
        category: FindingCategory::RemoteAccess,
        description: "Remote Desktop (RDP) exposed",
    },
    Rule {
        ports: &[5900, 5901, 5902, 5903],
        severity: Severity::High,
        category: FindingCategory::RemoteAccess,
        description: "VNC remote desktop exposed",
    },
    Rule {
        ports: &[1433, 3306, 5432, 6379, 9200, 27017],
        severity: Severity::High,
        category: FindingCategory::ExposedDatabase,
        description: "Database listener reachable from the network",
    },
    Rule {
        ports: &[139, 445],
        severity: Severity::Medium,
        category: FindingCategory::FileSharing,
        description: "SMB/NetBIOS file sharing exposed",
    },
    Rule {
        ports: &[22],
        severity: Severity::Medium,
        category: FindingCategory::RemoteAccess,
        description: "SSH reachable from the scanning host",
    },
    Rule {
        ports: &[9100],
        severity: Severity::Low,
        category: FindingCategory::PrinterService,
        description: "Raw printing port (JetDirect) exposed",
    },
];

pub struct RiskAssessor;

impl RiskAssessor {
    /// Findings for one device. Only open ports count; the finding timestamp
    /// is the device's `last_seen` and the scan id its `last_scan_id`.
    pub fn assess(device: &Device, ports: &[PortFinding]) -> Vec<SecurityFinding> {
        let open: Vec<&PortFinding> = ports
            .iter()
            .filter(|p| p.device_id == device.id && p.is_open())
            .collect();

        let mut findings = Vec::new();

        if device.device_type == DeviceType::Router {
            if let Some(finding) = router_admin_finding(device, &open) {
                findings.push(finding);
            }
        }

        for rule in RULES {
            let matched = matched_ports(&open, rule.ports);
            if !matched.is_empty() {
                findings.push(finding(
                    device,
                    rule.severity,
                    rule.category,
                    rule.description.to_string(),
                    matched,
                ));
            }
        }

        findings
    }
}

/// An HTTP admin page on a router. Critical when it answered without an
/// auth challenge.
fn router_admin_finding(device: &Device, open: &[&PortFinding]) -> Option<SecurityFinding> {
    let matched = matched_ports(open, &banner::HTTP_PORTS);
    if matched.is_empty() {
        return None;
    }

    let unauthenticated = open
        .iter()
        .filter(|p| banner::HTTP_PORTS.contains(&p.port))
        .filter_map(|p| p.banner_hint.as_deref())
        .filter_map(banner::http_status)
        .any(|status| (200..400).contains(&status));

    let (severity, description) = if unauthenticated {
        (
            Severity::Critical,
            "Router admin interface served over HTTP without authentication",
        )
    } else {
        (Severity::High, "Router admin interface served over plain HTTP")
    };

    Some(finding(
        device,
        severity,
        FindingCategory::ExposedAdminInterface,
        description.to_string(),
        matched,
    ))
}

fn matched_ports(open: &[&PortFinding], rule_ports: &[u16]) -> Vec<u16> {
    let mut matched: Vec<u16> = open
        .iter()
        .map(|p| p.port)
        .filter(|port| rule_ports.contains(port))
        .collect();
    matched.sort_unstable();
    matched.dedup();
    matched
}

fn finding(
    device: &Device,
    severity: Severity,
    category: FindingCategory,
    description: String,
    ports: Vec<u16>,
) -> SecurityFinding {
    SecurityFinding {
        device_id: device.id,
        scan_run_id: device.last_scan_id,
        severity,
        category,
        description,
        ports,
        discovered_at: device.last_seen,
    }
}
