//! Integration tests for lanwarden-store against a live Neo4j instance.
//!
//! These tests require a local Neo4j (bolt://localhost:7687).
//! Run with: cargo test --package lanwarden-store --test integration -- --ignored
//!
//! Skipped automatically if Neo4j is not available.

use std::net::IpAddr;

use chrono::Utc;
use lanwarden_core::{
    Device, DeviceId, DeviceStatus, DeviceType, FindingCategory, PortFinding, PortState, Protocol,
    ScanRun, ScanStatus, SecurityFinding, Severity,
};
use lanwarden_store::{GraphClient, GraphConfig, ResultSink, StoreError};

async fn connect_or_skip() -> Option<GraphClient> {
    let config = GraphConfig::default();
    match GraphClient::connect(&config).await {
        Ok(client) => Some(client),
        Err(e) => {
            eprintln!("Skipping integration test (Neo4j not available): {e}");
            None
        }
    }
}

/// Each test works on its own /30 so runs do not interfere.
fn unique_range() -> String {
    let n = uuid::Uuid::new_v4().as_u128();
    let octet = |shift: u32| ((n >> shift) & 0xff) as u8;
    format!("10.{}.{}.{}/30", octet(0), octet(8), octet(16) & 0xfc)
}

async fn cleanup(client: &GraphClient, range: &str) {
    let q = neo4rs::query(
        "MATCH (n) WHERE n.range = $range
         OPTIONAL MATCH (n)-[:HAS_PORT]->(p:Port)
         DETACH DELETE n, p",
    )
    .param("range", range.to_string());
    let _ = client.run(q).await;
}

fn make_device(run: &ScanRun, offset: u8) -> Device {
    let base: ipnet::Ipv4Net = run.range.parse().unwrap();
    let octets = base.network().octets();
    let ip = IpAddr::from([octets[0], octets[1], octets[2], octets[3] + offset]);
    Device {
        id: DeviceId::for_host(&run.range, ip),
        range: run.range.clone(),
        ip,
        mac_address: Some("00:1b:54:aa:bb:cc".to_string()),
        vendor: None,
        device_type: DeviceType::Server,
        first_seen: Utc::now(),
        last_seen: Utc::now(),
        status: DeviceStatus::Online,
        last_scan_id: run.id,
    }
}

fn open_port(run: &ScanRun, device: &Device, port: u16) -> PortFinding {
    PortFinding {
        device_id: device.id,
        scan_run_id: run.id,
        port,
        protocol: Protocol::Tcp,
        state: PortState::Open,
        banner_hint: Some("SSH-2.0-OpenSSH_9.6".to_string()),
    }
}

fn telnet_finding(run: &ScanRun, device: &Device) -> SecurityFinding {
    SecurityFinding {
        device_id: device.id,
        scan_run_id: run.id,
        severity: Severity::High,
        category: FindingCategory::InsecureProtocol,
        description: "Telnet service exposed".to_string(),
        ports: vec![23],
        discovered_at: device.last_seen,
    }
}

#[tokio::test]
#[ignore = "requires live Neo4j: cargo test --package lanwarden-store --test integration -- --ignored"]
async fn test_save_and_read_back() {
    let Some(client) = connect_or_skip().await else {
        return;
    };
    let mut run = ScanRun::start(unique_range());
    run.complete(1, 2);
    cleanup(&client, &run.range).await;

    let device = make_device(&run, 1);
    let ports = vec![open_port(&run, &device, 22), open_port(&run, &device, 23)];
    let findings = vec![telnet_finding(&run, &device)];

    client
        .save_scan_result(&run, &[device.clone()], &ports, &findings)
        .await
        .unwrap();

    let devices = client.get_devices(&run.range).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, device.id);
    assert_eq!(devices[0].device_type, DeviceType::Server);
    assert_eq!(devices[0].vendor, None);

    let stored_ports = client.get_port_findings(device.id).await.unwrap();
    assert_eq!(
        stored_ports.iter().map(|p| p.port).collect::<Vec<_>>(),
        vec![22, 23]
    );

    let stored_findings = client.get_latest_findings(&run.range).await.unwrap();
    assert_eq!(stored_findings.len(), 1);
    assert_eq!(stored_findings[0].severity, Severity::High);
    assert_eq!(stored_findings[0].ports, vec![23]);

    let stored_run = client.get_scan_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored_run.status, ScanStatus::Completed);
    assert_eq!(stored_run.devices_found, 1);

    cleanup(&client, &run.range).await;
}

#[tokio::test]
#[ignore = "requires live Neo4j: cargo test --package lanwarden-store --test integration -- --ignored"]
async fn test_rescan_keeps_first_seen_and_replaces_findings() {
    let Some(client) = connect_or_skip().await else {
        return;
    };
    let range = unique_range();
    cleanup(&client, &range).await;

    let mut first = ScanRun::start(range.clone());
    first.complete(1, 2);
    let device = make_device(&first, 1);
    client
        .save_scan_result(
            &first,
            &[device.clone()],
            &[open_port(&first, &device, 23)],
            &[telnet_finding(&first, &device)],
        )
        .await
        .unwrap();

    let mut second = ScanRun::start(range.clone());
    second.complete(1, 2);
    let later = Device {
        first_seen: Utc::now(),
        last_seen: Utc::now(),
        last_scan_id: second.id,
        ..device.clone()
    };
    client
        .save_scan_result(&second, &[later], &[open_port(&second, &device, 22)], &[])
        .await
        .unwrap();

    let devices = client.get_devices(&range).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(
        devices[0].first_seen.timestamp_millis(),
        device.first_seen.timestamp_millis()
    );
    assert_eq!(devices[0].last_scan_id, second.id);

    let ports = client.get_port_findings(device.id).await.unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].port, 22);
    assert!(client.get_latest_findings(&range).await.unwrap().is_empty());

    cleanup(&client, &range).await;
}

#[tokio::test]
#[ignore = "requires live Neo4j: cargo test --package lanwarden-store --test integration -- --ignored"]
async fn test_running_scan_is_rejected() {
    let Some(client) = connect_or_skip().await else {
        return;
    };
    let run = ScanRun::start(unique_range());

    let result = client.save_scan_result(&run, &[], &[], &[]).await;
    assert!(matches!(result, Err(StoreError::Rejected(_))));
    assert!(client.get_scan_run(run.id).await.unwrap().is_none());
}
