//! Neo4j connection management and the graph-backed result sink.

use async_trait::async_trait;
use neo4rs::{ConfigBuilder, Graph, Query};

use lanwarden_core::{Device, DeviceId, PortFinding, ScanRun, ScanRunId, SecurityFinding};

use crate::sink::{validate_result_set, ResultSink, StoreError};

/// Configuration for connecting to Neo4j.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
    pub fetch_size: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "lanwarden-dev".to_string(),
            max_connections: 16,
            fetch_size: 256,
        }
    }
}

/// Thread-safe Neo4j graph client with connection pooling.
///
/// Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct GraphClient {
    graph: Graph,
}

impl GraphClient {
    /// Connect to Neo4j with the given configuration.
    pub async fn connect(config: &GraphConfig) -> Result<Self, StoreError> {
        let neo_config = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.user)
            .password(&config.password)
            .max_connections(config.max_connections as usize)
            .fetch_size(config.fetch_size)
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let graph = Graph::connect(neo_config)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        tracing::info!(uri = %config.uri, "Connected to Neo4j");
        Ok(Self { graph })
    }

    /// Execute a write-only query (CREATE, MERGE, DELETE, SET).
    pub async fn run(&self, query: Query) -> Result<(), StoreError> {
        self.graph.run(query).await?;
        Ok(())
    }

    /// Execute a read query and collect all rows.
    pub async fn query_rows(&self, query: Query) -> Result<Vec<neo4rs::Row>, StoreError> {
        let mut stream = self.graph.execute(query).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Execute a read query and return the first row, if any.
    pub async fn query_one(&self, query: Query) -> Result<Option<neo4rs::Row>, StoreError> {
        let mut stream = self.graph.execute(query).await?;
        Ok(stream.next().await?)
    }

    /// Begin a transaction.
    pub async fn start_txn(&self) -> Result<neo4rs::Txn, StoreError> {
        Ok(self.graph.start_txn().await?)
    }
}

#[async_trait]
impl ResultSink for GraphClient {
    async fn save_scan_result(
        &self,
        run: &ScanRun,
        devices: &[Device],
        ports: &[PortFinding],
        findings: &[SecurityFinding],
    ) -> Result<(), StoreError> {
        validate_result_set(run, devices, ports, findings)?;
        self.write_result_set(run, devices, ports, findings).await
    }

    async fn get_devices(&self, range: &str) -> Result<Vec<Device>, StoreError> {
        self.list_devices(range).await
    }

    async fn get_latest_findings(&self, range: &str) -> Result<Vec<SecurityFinding>, StoreError> {
        self.list_findings(range).await
    }

    async fn get_port_findings(&self, device_id: DeviceId) -> Result<Vec<PortFinding>, StoreError> {
        self.list_ports(device_id).await
    }

    async fn get_scan_run(&self, id: ScanRunId) -> Result<Option<ScanRun>, StoreError> {
        self.find_scan_run(id).await
    }
}
