//! Scan scheduling engine.
//!
//! Spawns one tokio task per scheduled range, each triggering a scan at the
//! range's interval. A semaphore limits how many scheduled scans run at once;
//! manual triggers bypass it but still respect the per-range lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use lanwarden_core::{NetworkRange, ScanError, ScanRunId};

use crate::config::DiscoverConfig;
use crate::coordinator::{ScanCoordinator, ScanHandle};
use crate::error::Result;
use crate::resolver::AddressSpaceResolver;

/// The scheduler manages periodic scan jobs for multiple ranges.
pub struct ScanScheduler {
    config: DiscoverConfig,
    coordinator: ScanCoordinator,
    resolver: AddressSpaceResolver,
    concurrency: Arc<Semaphore>,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ScanScheduler {
    pub fn new(config: DiscoverConfig, coordinator: ScanCoordinator) -> Self {
        let resolver = AddressSpaceResolver::new(config.max_range_addresses);
        Self::with_resolver(config, coordinator, resolver)
    }

    pub fn with_resolver(
        config: DiscoverConfig,
        coordinator: ScanCoordinator,
        resolver: AddressSpaceResolver,
    ) -> Self {
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent_scans.max(1)));
        Self {
            config,
            coordinator,
            resolver,
            concurrency,
            jobs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn coordinator(&self) -> &ScanCoordinator {
        &self.coordinator
    }

    /// Scan `range` now and then every `every`. Replaces an existing job for
    /// the same range key. Returns the range key.
    pub fn schedule(&self, range: NetworkRange, every: Duration) -> Result<String> {
        if !range.enabled {
            let msg = format!("range {} is disabled", range.cidr);
            return Err(ScanError::Configuration(msg).into());
        }
        if every.is_zero() {
            let msg = "scan interval must be non-zero".to_string();
            return Err(ScanError::Configuration(msg).into());
        }
        // Rejects malformed and oversized ranges before a job exists.
        let key = self.resolver.expand(&range)?.key;

        let handle = tokio::spawn(run_range_loop(
            self.coordinator.clone(),
            range,
            every,
            Arc::clone(&self.concurrency),
            self.shutdown.child_token(),
        ));

        if let Some(previous) = self.jobs.lock().insert(key.clone(), handle) {
            previous.abort();
            tracing::info!(range = %key, "Replaced existing schedule");
        }
        tracing::info!(range = %key, interval_secs = every.as_secs(), "Range scheduled");
        Ok(key)
    }

    /// Stop periodic scans of a range key. A scan already running finishes.
    pub fn unschedule(&self, range_key: &str) -> bool {
        match self.jobs.lock().remove(range_key) {
            Some(handle) => {
                handle.abort();
                tracing::info!(range = %range_key, "Range unscheduled");
                true
            }
            None => false,
        }
    }

    /// Range keys with an active schedule, sorted.
    pub fn scheduled(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.jobs.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Manual trigger outside the schedule.
    pub fn trigger_now(
        &self,
        range: &NetworkRange,
    ) -> std::result::Result<ScanHandle, ScanError> {
        self.coordinator.start_scan(range)
    }

    pub fn cancel(&self, id: ScanRunId) -> std::result::Result<bool, ScanError> {
        self.coordinator.cancel_scan(id)
    }

    /// Schedule every enabled configured range (plus auto-detected local
    /// ranges when enabled) and run until [`ScanScheduler::shutdown`].
    pub async fn run(&self) -> Result<()> {
        let configured = self.config.configured_ranges();
        let ranges = if self.config.auto_detect {
            self.resolver.all_ranges(&configured)
        } else {
            configured
        };

        for range in ranges {
            if !range.enabled {
                tracing::info!(cidr = %range.cidr, "Range disabled, skipping");
                continue;
            }
            let every = match range.key() {
                Ok(key) => self.config.interval_for(&key),
                Err(e) => {
                    tracing::warn!(cidr = %range.cidr, error = %e, "Skipping invalid range");
                    continue;
                }
            };
            let cidr = range.cidr.clone();
            if let Err(e) = self.schedule(range, every) {
                tracing::warn!(cidr = %cidr, error = %e, "Skipping unschedulable range");
            }
        }

        let count = self.jobs.lock().len();
        if count == 0 {
            let msg = "no enabled network ranges".to_string();
            return Err(ScanError::Configuration(msg).into());
        }
        tracing::info!(range_count = count, "Scheduler started");

        self.shutdown.cancelled().await;

        let jobs: Vec<(String, JoinHandle<()>)> = self.jobs.lock().drain().collect();
        for (key, handle) in jobs {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::error!(range = %key, error = %e, "Range scan task panicked");
                }
            }
        }
        tracing::info!("Scheduler stopped");
        Ok(())
    }

    /// Stop every range loop. Running scans are asked to cancel.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ScanScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Per-range scan loop with configurable interval.
async fn run_range_loop(
    coordinator: ScanCoordinator,
    range: NetworkRange,
    every: Duration,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let _permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        tracing::info!(cidr = %range.cidr, "Scheduled scan triggered");

        let handle = match coordinator.start_scan(&range) {
            Ok(handle) => handle,
            Err(ScanError::AlreadyRunning { range }) => {
                tracing::debug!(range = %range, "Scan already running, skipping tick");
                continue;
            }
            Err(e) => {
                tracing::error!(
                    cidr = %range.cidr,
                    error = %e,
                    "Scheduled scan failed to start"
                );
                continue;
            }
        };

        let id = handle.id;
        tokio::select! {
            run = handle.wait() => {
                tracing::info!(
                    scan_id = %run.id,
                    range = %run.range,
                    status = run.status.as_str(),
                    "Scheduled scan finished"
                );
            }
            _ = shutdown.cancelled() => {
                if let Err(e) = coordinator.cancel_scan(id) {
                    tracing::debug!(scan_id = %id, error = %e, "Cancel on shutdown failed");
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::IpAddr;

    use async_trait::async_trait;
    use ipnet::IpNet;
    use lanwarden_core::ScanStatus;
    use lanwarden_store::MemoryStore;

    use crate::classifier::{DeviceClassifier, OuiTable};
    use crate::coordinator::{RangeLocks, ScanEngine};
    use crate::error::DiscoverError;
    use crate::host_probe::{HostProbe, LivenessResult, ProbeMethod};
    use crate::neighbor::NeighborTable;
    use crate::port_probe::{PortObservation, PortProbe};
    use crate::resolver::InterfaceSource;

    struct FakeHosts {
        alive: HashSet<IpAddr>,
        delay: Duration,
    }

    #[async_trait]
    impl HostProbe for FakeHosts {
        async fn probe(&self, addr: IpAddr, _timeout: Duration) -> LivenessResult {
            tokio::time::sleep(self.delay).await;
            if self.alive.contains(&addr) {
                LivenessResult::alive(ProbeMethod::Tcp, Some(self.delay))
            } else {
                LivenessResult::not_alive()
            }
        }
    }

    struct ClosedPorts;

    #[async_trait]
    impl PortProbe for ClosedPorts {
        async fn scan_ports(
            &self,
            _addr: IpAddr,
            ports: &[u16],
            _timeout: Duration,
            _concurrency: usize,
        ) -> Vec<PortObservation> {
            ports.iter().map(|p| PortObservation::closed(*p)).collect()
        }
    }

    struct NoNeighbors;

    #[async_trait]
    impl NeighborTable for NoNeighbors {
        async fn snapshot(&self) -> Result<HashMap<IpAddr, String>> {
            Ok(HashMap::new())
        }
    }

    struct FakeInterfaces(Vec<IpNet>);

    impl InterfaceSource for FakeInterfaces {
        fn networks(&self) -> Vec<IpNet> {
            self.0.clone()
        }
    }

    fn config() -> DiscoverConfig {
        DiscoverConfig {
            auto_detect: false,
            ports: vec![22, 80],
            ..Default::default()
        }
    }

    fn scheduler_with(
        config: DiscoverConfig,
        delay: Duration,
    ) -> (ScanScheduler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = ScanEngine {
            host_probe: Arc::new(FakeHosts {
                alive: HashSet::from(["10.9.0.1".parse().unwrap()]),
                delay,
            }),
            port_probe: Arc::new(ClosedPorts),
            neighbors: Arc::new(NoNeighbors),
            classifier: DeviceClassifier::new(vec![Box::new(OuiTable::builtin())]),
            sink: store.clone(),
        };
        let coordinator = ScanCoordinator::new(config.clone(), engine, RangeLocks::new()).unwrap();
        let resolver = AddressSpaceResolver::with_interfaces(
            config.max_range_addresses,
            Arc::new(FakeInterfaces(vec!["192.168.77.14/24".parse().unwrap()])),
        );
        (
            ScanScheduler::with_resolver(config, coordinator, resolver),
            store,
        )
    }

    async fn wait_for_runs(store: &MemoryStore, count: usize) {
        for _ in 0..100 {
            if store.runs().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {count} persisted runs, found {}", store.runs().len());
    }

    #[tokio::test]
    async fn test_schedule_scans_immediately() {
        let (scheduler, store) = scheduler_with(config(), Duration::ZERO);

        let key = scheduler
            .schedule(NetworkRange::configured("10.9.0.0/30"), Duration::from_secs(3600))
            .unwrap();
        assert_eq!(key, "10.9.0.0/30");
        assert_eq!(scheduler.scheduled(), vec!["10.9.0.0/30".to_string()]);

        wait_for_runs(&store, 1).await;
        let run = &store.runs()[0];
        assert_eq!(run.status, ScanStatus::Completed);
        assert_eq!(run.devices_found, 1);
    }

    #[tokio::test]
    async fn test_schedule_rejects_bad_ranges() {
        let (scheduler, _store) = scheduler_with(config(), Duration::ZERO);

        let mut disabled = NetworkRange::configured("10.9.0.0/30");
        disabled.enabled = false;
        assert!(scheduler.schedule(disabled, Duration::from_secs(60)).is_err());

        let too_large =
            scheduler.schedule(NetworkRange::configured("10.0.0.0/8"), Duration::from_secs(60));
        assert!(matches!(
            too_large,
            Err(DiscoverError::Scan(ScanError::RangeTooLarge { .. }))
        ));
        assert!(scheduler.scheduled().is_empty());
    }

    #[tokio::test]
    async fn test_reschedule_and_unschedule() {
        let (scheduler, _store) = scheduler_with(config(), Duration::ZERO);

        scheduler
            .schedule(NetworkRange::configured("10.9.0.0/30"), Duration::from_secs(3600))
            .unwrap();
        scheduler
            .schedule(NetworkRange::configured("10.9.0.1/30"), Duration::from_secs(60))
            .unwrap();
        assert_eq!(scheduler.scheduled().len(), 1);

        assert!(scheduler.unschedule("10.9.0.0/30"));
        assert!(!scheduler.unschedule("10.9.0.0/30"));
        assert!(scheduler.scheduled().is_empty());
    }

    #[tokio::test]
    async fn test_manual_trigger_respects_range_lock() {
        let (scheduler, _store) = scheduler_with(config(), Duration::from_millis(300));
        let range = NetworkRange::configured("10.9.0.0/30");

        let handle = scheduler.trigger_now(&range).unwrap();
        assert!(matches!(
            scheduler.trigger_now(&range),
            Err(ScanError::AlreadyRunning { .. })
        ));
        assert!(scheduler.cancel(handle.id).unwrap());
        assert_eq!(handle.wait().await.status, ScanStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_run_without_ranges_fails() {
        let (scheduler, _store) = scheduler_with(config(), Duration::ZERO);
        let err = scheduler.run().await.unwrap_err();
        assert!(matches!(err, DiscoverError::Scan(ScanError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_run_includes_detected_ranges_until_shutdown() {
        let config = DiscoverConfig {
            auto_detect: true,
            ranges: vec![crate::config::RangeSchedule {
                cidr: "10.9.0.0/30".to_string(),
                name: Some("lab".to_string()),
                interval_secs: Some(3600),
                enabled: true,
            }],
            ..config()
        };
        let (scheduler, store) = scheduler_with(config, Duration::ZERO);
        let scheduler = Arc::new(scheduler);

        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };

        wait_for_runs(&store, 2).await;
        assert_eq!(
            scheduler.scheduled(),
            vec!["10.9.0.0/30".to_string(), "192.168.77.0/24".to_string()]
        );

        scheduler.shutdown();
        runner.await.unwrap().unwrap();
        assert!(scheduler.scheduled().is_empty());
    }
}
