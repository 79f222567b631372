//! Scan orchestration.
//!
//! One coordinator task drives each scan run through
//! `Resolving → Probing → Classifying → Persisting → Completed`, with `Failed`
//! reachable from any non-terminal phase and `Cancelled` from `Resolving` or
//! `Probing`. A shared [`RangeLocks`] table guarantees at most one running
//! scan per range key.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use lanwarden_core::events::{EventPayload, ScanEvent};
use lanwarden_core::{
    Device, DeviceId, DeviceStatus, NetworkRange, PortFinding, PortState, ScanError, ScanPhase,
    ScanRun, ScanRunId, ScanStatus, SecurityFinding,
};
use lanwarden_store::ResultSink;

use crate::classifier::{gateway_like_hosts, DeviceClassifier, ResponseHints};
use crate::config::DiscoverConfig;
use crate::diff;
use crate::host_probe::{probe_with_timeout, HostProbe, LivenessResult};
use crate::neighbor::NeighborTable;
use crate::port_probe::{PortObservation, PortProbe};
use crate::resolver::AddressSpaceResolver;
use crate::risk::RiskAssessor;

const EVENT_CAPACITY: usize = 1024;
const MAX_FINISHED_RUNS: usize = 256;

// ── Per-range lock table ──────────────────────────────────────────

/// In-memory lock table: range key → the scan run holding it.
#[derive(Debug, Default)]
pub struct RangeLocks {
    held: Mutex<HashMap<String, ScanRunId>>,
}

impl RangeLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Compare-and-swap: take the lock for `key` if nobody holds it.
    pub fn try_acquire(self: &Arc<Self>, key: &str, id: ScanRunId) -> Option<RangeLease> {
        let mut held = self.held.lock();
        if held.contains_key(key) {
            return None;
        }
        held.insert(key.to_string(), id);
        Some(RangeLease {
            locks: Arc::clone(self),
            key: key.to_string(),
            id,
        })
    }

    pub fn holder(&self, key: &str) -> Option<ScanRunId> {
        self.held.lock().get(key).copied()
    }
}

/// Held for the lifetime of a scan run; released on drop, including unwinding.
#[derive(Debug)]
pub struct RangeLease {
    locks: Arc<RangeLocks>,
    key: String,
    id: ScanRunId,
}

impl Drop for RangeLease {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock();
        if held.get(&self.key) == Some(&self.id) {
            held.remove(&self.key);
        }
    }
}

// ── Handles and snapshots ─────────────────────────────────────────

/// Returned by [`ScanCoordinator::start_scan`].
pub struct ScanHandle {
    pub id: ScanRunId,
    updates: watch::Receiver<ScanRun>,
}

impl ScanHandle {
    /// Wait for the run to reach a terminal status. The range lock is
    /// already released when this returns.
    pub async fn wait(mut self) -> ScanRun {
        if let Ok(run) = self.updates.wait_for(|run| run.status.is_terminal()).await {
            return run.clone();
        }
        let last = self.updates.borrow().clone();
        last
    }
}

/// Current state of a scan run as seen by the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSnapshot {
    pub run: ScanRun,
    pub phase: ScanPhase,
}

struct RunEntry {
    run: ScanRun,
    phase: ScanPhase,
    cancel: CancellationToken,
    updates: watch::Sender<ScanRun>,
    lease: Option<RangeLease>,
}

/// The collaborators a coordinator drives.
pub struct ScanEngine {
    pub host_probe: Arc<dyn HostProbe>,
    pub port_probe: Arc<dyn PortProbe>,
    pub neighbors: Arc<dyn NeighborTable>,
    pub classifier: DeviceClassifier,
    pub sink: Arc<dyn ResultSink>,
}

struct Shared {
    config: DiscoverConfig,
    ports: Vec<u16>,
    resolver: AddressSpaceResolver,
    engine: ScanEngine,
    locks: Arc<RangeLocks>,
    runs: RwLock<HashMap<ScanRunId, RunEntry>>,
    events: broadcast::Sender<ScanEvent>,
}

/// What one worker learned about a live host.
struct HostOutcome {
    ip: IpAddr,
    liveness: LivenessResult,
    ports: Vec<PortObservation>,
}

// ── Coordinator ───────────────────────────────────────────────────

/// Orchestrates scan runs. Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct ScanCoordinator {
    shared: Arc<Shared>,
}

impl ScanCoordinator {
    pub fn new(
        config: DiscoverConfig,
        engine: ScanEngine,
        locks: Arc<RangeLocks>,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                ports: config.port_list(),
                resolver: AddressSpaceResolver::new(config.max_range_addresses),
                config,
                engine,
                locks,
                runs: RwLock::new(HashMap::new()),
                events,
            }),
        })
    }

    /// Lifecycle events of every scan run started after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.shared.events.subscribe()
    }

    pub fn sink(&self) -> Arc<dyn ResultSink> {
        Arc::clone(&self.shared.engine.sink)
    }

    /// Start a scan of `range`.
    ///
    /// The range lock is taken first, so resolution runs under it. A second
    /// start for a range key that is already being scanned fails with
    /// `AlreadyRunning` and creates nothing. Invalid and oversized ranges
    /// are rejected before a scan run exists.
    pub fn start_scan(&self, range: &NetworkRange) -> Result<ScanHandle, ScanError> {
        if !range.enabled {
            return Err(ScanError::Configuration(format!(
                "range {} is disabled",
                range.cidr
            )));
        }
        let key = range.key()?;
        let run = ScanRun::start(key.clone());
        let lease = self
            .shared
            .locks
            .try_acquire(&key, run.id)
            .ok_or_else(|| ScanError::AlreadyRunning { range: key.clone() })?;

        // A rejected range releases the lease here and leaves no run behind.
        let resolved = self.shared.resolver.expand(range)?;

        let cancel = CancellationToken::new();
        let (updates, receiver) = watch::channel(run.clone());
        {
            let mut runs = self.shared.runs.write();
            prune_finished(&mut runs);
            runs.insert(
                run.id,
                RunEntry {
                    run: run.clone(),
                    phase: ScanPhase::Resolving,
                    cancel: cancel.clone(),
                    updates,
                    lease: Some(lease),
                },
            );
        }

        tracing::info!(
            scan_id = %run.id,
            range = %run.range,
            targets = resolved.addresses.len(),
            "Scan started"
        );
        self.shared.emit(EventPayload::ScanStarted {
            scan_id: run.id,
            range: run.range.clone(),
            targets: resolved.addresses.len() as u32,
        });

        let shared = Arc::clone(&self.shared);
        let id = run.id;
        tokio::spawn(async move {
            let task = execute(Arc::clone(&shared), run, resolved.addresses, cancel);
            if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                tracing::error!(scan_id = %id, "Scan task panicked");
                shared.fail(id, "scan task panicked".to_string());
            }
        });

        Ok(ScanHandle {
            id,
            updates: receiver,
        })
    }

    /// Status of a scan run: live runs from the coordinator, older ones from
    /// the result sink.
    pub async fn get_scan(&self, id: ScanRunId) -> Result<ScanSnapshot, ScanError> {
        let live = self.shared.runs.read().get(&id).map(|entry| ScanSnapshot {
            run: entry.run.clone(),
            phase: entry.phase,
        });
        if let Some(snapshot) = live {
            return Ok(snapshot);
        }

        match self.shared.engine.sink.get_scan_run(id).await? {
            Some(run) => Ok(ScanSnapshot {
                phase: phase_for_status(&run),
                run,
            }),
            None => Err(ScanError::UnknownScan(id)),
        }
    }

    /// Request cooperative cancellation.
    ///
    /// Returns `true` when the request was accepted, `false` when the run is
    /// already classifying, persisting, or finished.
    pub fn cancel_scan(&self, id: ScanRunId) -> Result<bool, ScanError> {
        let runs = self.shared.runs.read();
        let entry = runs.get(&id).ok_or(ScanError::UnknownScan(id))?;
        if !entry.phase.is_cancellable() {
            tracing::debug!(scan_id = %id, phase = ?entry.phase, "Cancellation not applicable");
            return Ok(false);
        }
        entry.cancel.cancel();
        tracing::info!(scan_id = %id, range = %entry.run.range, "Cancellation requested");
        Ok(true)
    }

    /// The scan run currently holding the lock for a range key.
    pub fn running_scan(&self, range_key: &str) -> Option<ScanRunId> {
        self.shared.locks.holder(range_key)
    }
}

impl Shared {
    fn emit(&self, payload: EventPayload) {
        // No subscribers is fine.
        let _ = self.events.send(ScanEvent::new(payload));
    }

    /// Move a run to `next`. Refused transitions leave the run untouched.
    /// Leaving `Probing` is refused once cancellation was requested.
    fn advance(&self, id: ScanRunId, next: ScanPhase) -> bool {
        let mut runs = self.runs.write();
        let Some(entry) = runs.get_mut(&id) else {
            return false;
        };
        if !entry.phase.can_advance_to(next) {
            return false;
        }
        if next == ScanPhase::Classifying && entry.cancel.is_cancelled() {
            return false;
        }
        tracing::debug!(scan_id = %id, from = ?entry.phase, to = ?next, "Phase transition");
        entry.phase = next;
        true
    }

    /// Record the terminal run, release the range lock, then wake waiters.
    fn finish(&self, run: ScanRun, phase: ScanPhase) {
        let mut runs = self.runs.write();
        if let Some(entry) = runs.get_mut(&run.id) {
            if entry.phase.is_terminal() {
                return;
            }
            entry.phase = phase;
            entry.run = run.clone();
            drop(entry.lease.take());
            entry.updates.send_replace(run);
        }
    }

    fn fail(&self, id: ScanRunId, reason: String) {
        let run = {
            let runs = self.runs.read();
            match runs.get(&id) {
                Some(entry) if !entry.phase.is_terminal() => entry.run.clone(),
                _ => return,
            }
        };
        let mut failed = run;
        failed.fail(reason.clone());
        tracing::warn!(scan_id = %id, range = %failed.range, reason = %reason, "Scan failed");
        self.emit(EventPayload::ScanFailed {
            scan_id: id,
            range: failed.range.clone(),
            reason,
        });
        self.finish(failed, ScanPhase::Failed);
    }

    fn cancelled(&self, mut run: ScanRun) {
        run.cancel();
        tracing::info!(scan_id = %run.id, range = %run.range, "Scan cancelled");
        self.emit(EventPayload::ScanCancelled {
            scan_id: run.id,
            range: run.range.clone(),
        });
        self.finish(run, ScanPhase::Cancelled);
    }
}

/// Drop the oldest finished runs once the registry grows past its cap.
fn prune_finished(runs: &mut HashMap<ScanRunId, RunEntry>) {
    let mut finished: Vec<(chrono::DateTime<Utc>, ScanRunId)> = runs
        .values()
        .filter(|e| e.phase.is_terminal())
        .map(|e| (e.run.completed_at.unwrap_or(e.run.started_at), e.run.id))
        .collect();
    if finished.len() < MAX_FINISHED_RUNS {
        return;
    }
    finished.sort_by_key(|(at, _)| *at);
    let excess = finished.len() + 1 - MAX_FINISHED_RUNS;
    for (_, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
}

fn phase_for_status(run: &ScanRun) -> ScanPhase {
    match run.status {
        ScanStatus::Running => ScanPhase::Probing,
        ScanStatus::Completed => ScanPhase::Completed,
        ScanStatus::Failed => ScanPhase::Failed,
        ScanStatus::Cancelled => ScanPhase::Cancelled,
    }
}

// ── Scan task ─────────────────────────────────────────────────────

async fn execute(
    shared: Arc<Shared>,
    run: ScanRun,
    addresses: Vec<IpAddr>,
    cancel: CancellationToken,
) {
    let started = Instant::now();

    if !shared.advance(run.id, ScanPhase::Probing) {
        shared.cancelled(run);
        return;
    }

    let ProbeReport {
        alive: outcomes,
        probed: hosts_probed,
    } = probe_hosts(&shared, run.id, addresses, &cancel).await;

    if !shared.advance(run.id, ScanPhase::Classifying) {
        // Per-host results are discarded.
        shared.cancelled(run);
        return;
    }

    let alive = outcomes.len() as u32;
    let Assessment {
        devices,
        ports,
        findings,
        summary,
        new_devices,
        newly_offline,
    } = match classify(&shared, &run, outcomes).await {
        Ok(assessment) => assessment,
        Err(e) => {
            shared.fail(run.id, e.to_string());
            return;
        }
    };

    if !shared.advance(run.id, ScanPhase::Persisting) {
        shared.fail(run.id, "classification did not complete".to_string());
        return;
    }

    let mut completed = run.clone();
    completed.complete(alive, hosts_probed);

    if let Err(e) = shared
        .engine
        .sink
        .save_scan_result(&completed, &devices, &ports, &findings)
        .await
    {
        let err: ScanError = e.into();
        shared.fail(run.id, err.to_string());
        return;
    }

    for device in devices.iter().filter(|d| new_devices.contains(&d.id)) {
        shared.emit(EventPayload::DeviceDiscovered {
            scan_id: run.id,
            device_id: device.id,
            ip: device.ip,
            device_type: device.device_type,
        });
    }
    for device in devices.iter().filter(|d| newly_offline.contains(&d.id)) {
        shared.emit(EventPayload::DeviceOffline {
            scan_id: run.id,
            device_id: device.id,
            ip: device.ip,
            last_seen: device.last_seen,
        });
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        scan_id = %run.id,
        range = %run.range,
        hosts_probed,
        devices_found = alive,
        findings = findings.len(),
        new = summary.new_count,
        changed = summary.changed_count,
        offline = summary.offline_count,
        duration_ms,
        "Scan complete"
    );
    shared.emit(EventPayload::ScanCompleted {
        scan_id: run.id,
        range: run.range.clone(),
        devices_found: alive,
        hosts_probed,
        findings: findings.len() as u32,
        new_devices: summary.new_count,
        changed_devices: summary.changed_count,
        offline_devices: summary.offline_count,
        duration_ms,
    });
    shared.finish(completed, ScanPhase::Completed);
}

/// Result of the probing phase.
struct ProbeReport {
    /// Live hosts with their port observations.
    alive: Vec<HostOutcome>,
    /// Hosts whose probing ran to a verdict, alive or not.
    probed: u32,
}

/// Fan out liveness and port probes over a bounded worker pool.
///
/// At the scan deadline in-flight probes are aborted and every host without
/// a result counts as not alive and not probed. After cancellation no new
/// host is started and in-flight probes are drained.
async fn probe_hosts(
    shared: &Arc<Shared>,
    scan_id: ScanRunId,
    addresses: Vec<IpAddr>,
    cancel: &CancellationToken,
) -> ProbeReport {
    let concurrency = shared.config.max_concurrency.min(addresses.len()).max(1);
    let permits = Arc::new(Semaphore::new(concurrency));
    let deadline = tokio::time::sleep(shared.config.scan_deadline());
    tokio::pin!(deadline);

    let mut pending = addresses.into_iter();
    let mut workers: JoinSet<Option<HostOutcome>> = JoinSet::new();
    let mut alive = Vec::new();
    let mut probed = 0u32;
    let mut deadline_hit = false;

    loop {
        let spawning = !deadline_hit && !cancel.is_cancelled() && pending.len() > 0;
        if workers.is_empty() && !spawning {
            break;
        }

        tokio::select! {
            _ = &mut deadline, if !deadline_hit => {
                deadline_hit = true;
                tracing::warn!(
                    scan_id = %scan_id,
                    in_flight = workers.len(),
                    unprobed = pending.len(),
                    "Scan deadline reached, remaining hosts marked not alive"
                );
                workers.abort_all();
            }
            permit = Arc::clone(&permits).acquire_owned(), if spawning => {
                let Ok(permit) = permit else { break };
                if cancel.is_cancelled() {
                    continue;
                }
                let Some(ip) = pending.next() else { continue };
                let shared = Arc::clone(shared);
                let cancel = cancel.clone();
                workers.spawn(async move {
                    let outcome = probe_host(&shared, ip, &cancel).await;
                    drop(permit);
                    outcome
                });
            }
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                match joined {
                    Ok(Some(outcome)) => {
                        probed += 1;
                        alive.push(outcome);
                    }
                    Ok(None) => probed += 1,
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        tracing::warn!(scan_id = %scan_id, error = %e, "Probe worker panicked")
                    }
                }
            }
            _ = cancel.cancelled(), if spawning => {}
            else => break,
        }
    }

    tracing::debug!(scan_id = %scan_id, alive = alive.len(), probed, "Probing finished");
    ProbeReport { alive, probed }
}

async fn probe_host(
    shared: &Shared,
    ip: IpAddr,
    cancel: &CancellationToken,
) -> Option<HostOutcome> {
    let config = &shared.config;
    let liveness =
        probe_with_timeout(shared.engine.host_probe.as_ref(), ip, config.host_timeout()).await;
    if !liveness.alive || cancel.is_cancelled() {
        return None;
    }

    let ports = shared
        .engine
        .port_probe
        .scan_ports(ip, &shared.ports, config.port_timeout(), config.port_concurrency)
        .await;

    tracing::trace!(
        ip = %ip,
        method = ?liveness.method,
        rtt_ms = ?liveness.rtt_ms,
        open = ports.iter().filter(|p| p.state == PortState::Open).count(),
        "Host alive"
    );
    Some(HostOutcome {
        ip,
        liveness,
        ports,
    })
}

/// Everything one scan run hands to the result sink.
struct Assessment {
    devices: Vec<Device>,
    ports: Vec<PortFinding>,
    findings: Vec<SecurityFinding>,
    summary: diff::DiffSummary,
    new_devices: Vec<DeviceId>,
    newly_offline: Vec<DeviceId>,
}

/// Build devices, port findings and security findings for the live hosts
/// and merge them with the stored state of the range.
async fn classify(
    shared: &Shared,
    run: &ScanRun,
    mut outcomes: Vec<HostOutcome>,
) -> Result<Assessment, ScanError> {
    outcomes.sort_by_key(|o| o.ip);

    let macs = match shared.engine.neighbors.snapshot().await {
        Ok(macs) => macs,
        Err(e) => {
            tracing::warn!(scan_id = %run.id, error = %e, "Neighbour table unavailable");
            HashMap::new()
        }
    };
    let live: Vec<IpAddr> = outcomes.iter().map(|o| o.ip).collect();
    let gateways = gateway_like_hosts(&macs, &live, &shared.config.gateways);

    let now = Utc::now();
    let mut observed = Vec::with_capacity(outcomes.len());
    let mut ports = Vec::new();

    for outcome in outcomes {
        let mac = macs.get(&outcome.ip).cloned();
        let open: Vec<u16> = outcome
            .ports
            .iter()
            .filter(|p| p.state == PortState::Open)
            .map(|p| p.port)
            .collect();
        let hints = ResponseHints {
            banners: outcome
                .ports
                .iter()
                .filter_map(|p| p.banner_hint.clone().map(|b| (p.port, b)))
                .collect::<BTreeMap<_, _>>(),
            gateway_like: gateways.contains(&outcome.ip),
        };
        let class = shared
            .engine
            .classifier
            .classify(mac.as_deref(), &open, &hints);

        let device_id = DeviceId::for_host(&run.range, outcome.ip);
        tracing::debug!(
            scan_id = %run.id,
            ip = %outcome.ip,
            method = ?outcome.liveness.method,
            device_type = %class.device_type,
            "Host classified"
        );

        ports.extend(
            outcome
                .ports
                .into_iter()
                .map(|p| p.into_finding(device_id, run.id)),
        );
        observed.push(Device {
            id: device_id,
            range: run.range.clone(),
            ip: outcome.ip,
            mac_address: mac,
            vendor: class.vendor,
            device_type: class.device_type,
            first_seen: now,
            last_seen: now,
            status: DeviceStatus::Online,
            last_scan_id: run.id,
        });
    }

    let previous = shared.engine.sink.get_devices(&run.range).await?;
    let merged = diff::compute_diff(observed, &previous);

    let findings: Vec<SecurityFinding> = merged
        .devices
        .iter()
        .filter(|d| d.status == DeviceStatus::Online)
        .flat_map(|d| RiskAssessor::assess(d, &ports))
        .collect();

    Ok(Assessment {
        devices: merged.devices,
        ports,
        findings,
        summary: merged.summary,
        new_devices: merged.new_devices,
        newly_offline: merged.newly_offline,
    })
}
