//! Run orchestration
//!
//! One backup pool at a time, one source pool at a time, one filesystem at
//! a time. Only `NoBackupPools` and configuration errors end the run early;
//! everything else is logged and counted in the summary.

use crate::backend::StorageBackend;
use crate::config::RunConfig;
use crate::inventory::Inventory;
use crate::planner::{BackupStatus, FilesystemReport, TransferPlanner};
use holdfast_common::{format_size, Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of a whole run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Backup pools that were actually used
    pub backup_pools: Vec<String>,
    pub reports: Vec<FilesystemReport>,
}

impl RunSummary {
    pub fn count(&self, status: BackupStatus) -> usize {
        self.reports.iter().filter(|r| r.status == status).count()
    }

    /// True when every filesystem was replicated
    pub fn all_replicated(&self) -> bool {
        self.reports.iter().all(|r| r.status == BackupStatus::Replicated)
    }

    /// Log one line per filesystem plus totals
    pub fn log(&self) {
        for report in &self.reports {
            let mode = report
                .mode()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string());
            info!(
                "{} -> {}: {:?}, {}, {} in {:.1?}",
                report.filesystem,
                report.pool,
                report.status,
                mode,
                format_size(report.bytes_transferred()),
                report.elapsed()
            );
        }
        info!(
            "{} replicated, {} size exceeded, {} failed, {} skipped",
            self.count(BackupStatus::Replicated),
            self.count(BackupStatus::SizeExceeded),
            self.count(BackupStatus::Failed),
            self.count(BackupStatus::Skipped)
        );
    }
}

pub struct Orchestrator {
    backend: Arc<dyn StorageBackend>,
    config: Arc<RunConfig>,
    inventory: Inventory,
    planner: TransferPlanner,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn StorageBackend>, config: RunConfig) -> Self {
        let config = Arc::new(config);
        Self {
            inventory: Inventory::new(backend.clone()),
            planner: TransferPlanner::new(backend.clone(), config.clone()),
            backend,
            config,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<RunSummary> {
        self.config.validate()?;
        if self.config.dry_run {
            info!("Pretend mode: no snapshot, hold or transfer will be made");
        }

        let pools = self.inventory.pools().await;

        let mut backup_pools = Vec::new();
        for pool in &self.config.backup_pools {
            if self.attach(pool, &pools).await {
                backup_pools.push(pool.clone());
            }
        }
        if backup_pools.is_empty() {
            info!("No backup pools available");
            return Err(Error::NoBackupPools);
        }

        let sources = self.source_pools(&pools);
        info!("Backing up {} to {}", sources.join(" "), backup_pools.join(" "));

        let mut summary = RunSummary {
            backup_pools: backup_pools.clone(),
            reports: Vec::new(),
        };
        for backup_pool in &backup_pools {
            info!("Processing backup pool {}", backup_pool);
            for source in &sources {
                let filesystems = self
                    .inventory
                    .eligible_filesystems(source, &self.config.backup_property)
                    .await;
                for filesystem in filesystems {
                    info!("Backing up {} to {}", filesystem, backup_pool);
                    let report = self.planner.backup_filesystem(&filesystem, backup_pool).await;
                    summary.reports.push(report);
                }
            }
            self.detach(backup_pool).await;
        }
        Ok(summary)
    }

    /// Make `pool` usable as a backup target: import it when needed and
    /// check the device restriction
    async fn attach(&self, pool: &str, listed: &[String]) -> bool {
        let imported = if listed.iter().any(|p| p == pool) {
            false
        } else {
            info!("Importing pool {}", pool);
            if let Err(e) = self.backend.import_pool(pool).await {
                error!("Could not import backup pool {}: {}", pool, e);
                return false;
            }
            true
        };

        let Some(device) = self.config.device_filter() else {
            return true;
        };
        let devices = match self.backend.pool_devices(pool).await {
            Ok(devices) => devices,
            Err(e) => {
                error!("Could not list devices of {}: {}", pool, e);
                Vec::new()
            }
        };
        // no reported devices means the restriction cannot be confirmed
        if !devices.is_empty() && devices.iter().all(|d| d == device) {
            return true;
        }

        warn!("Pool {} is not on device {} ({}), skipping", pool, device, devices.join(" "));
        if imported {
            self.detach(pool).await;
        }
        false
    }

    async fn detach(&self, pool: &str) {
        info!("Exporting pool {}", pool);
        if let Err(e) = self.backend.export_pool(pool).await {
            error!("Could not export pool {}: {}", pool, e);
        }
    }

    /// Listed pools that are not backup pools, restricted to the requested
    /// sources if any were given
    fn source_pools(&self, listed: &[String]) -> Vec<String> {
        listed
            .iter()
            .filter(|p| !self.config.backup_pools.contains(*p))
            .filter(|p| self.config.source_pools.is_empty() || self.config.source_pools.contains(*p))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, MemoryBackend};

    fn config() -> RunConfig {
        RunConfig {
            stamp: "202401010000".to_string(),
            ..RunConfig::new(vec!["backup".to_string()])
        }
    }

    #[tokio::test]
    async fn test_source_pools_exclude_backup_pools() {
        let backend = MemoryBackend::new();
        let mut config = config();
        config.backup_pools.push("offsite".to_string());
        config.source_pools = vec!["tank".to_string(), "backup".to_string()];
        let orchestrator = Orchestrator::new(Arc::new(backend), config);

        let listed: Vec<String> = ["backup", "offsite", "tank", "scratch"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(orchestrator.source_pools(&listed), vec!["tank"]);
    }

    #[tokio::test]
    async fn test_no_backup_pools() {
        let backend = MemoryBackend::new();
        backend.add_pool("tank", &["ada0"], 0);
        let orchestrator = Orchestrator::new(Arc::new(backend), config());
        assert!(matches!(orchestrator.run().await, Err(Error::NoBackupPools)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let backend = MemoryBackend::new();
        let orchestrator = Orchestrator::new(Arc::new(backend.clone()), RunConfig::new(Vec::new()));
        assert!(matches!(orchestrator.run().await, Err(Error::InvalidConfig(_))));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_device_mismatch_exports_imported_pool() {
        let backend = MemoryBackend::new();
        backend.add_pool("tank", &["ada0"], 0).add_exported_pool("backup", &["da0"], 1 << 20);
        let mut config = config();
        config.device = Some("/dev/da1".to_string());
        let orchestrator = Orchestrator::new(Arc::new(backend.clone()), config);

        assert!(matches!(orchestrator.run().await, Err(Error::NoBackupPools)));
        assert!(!backend.pool_imported("backup"));
        let calls = backend.calls();
        assert!(calls.contains(&BackendCall::ImportPool("backup".to_string())));
        assert!(calls.contains(&BackendCall::ExportPool("backup".to_string())));
    }

    #[tokio::test]
    async fn test_pool_without_devices_fails_device_check() {
        let backend = MemoryBackend::new();
        backend.add_pool("tank", &["ada0"], 0).add_pool("backup", &[], 1 << 20);
        let mut config = config();
        config.device = Some("da0".to_string());
        let orchestrator = Orchestrator::new(Arc::new(backend.clone()), config);

        assert!(matches!(orchestrator.run().await, Err(Error::NoBackupPools)));
        assert!(backend.pool_imported("backup"));
        assert!(!backend.calls().contains(&BackendCall::ExportPool("backup".to_string())));
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let summary = RunSummary::default();
        assert!(summary.all_replicated());
        assert_eq!(summary.count(BackupStatus::Failed), 0);
        summary.log();
    }
}
