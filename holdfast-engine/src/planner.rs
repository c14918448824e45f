//! Transfer planner
//!
//! Backs up one filesystem to one backup pool: mirror the parent hierarchy,
//! take this run's snapshot, send it in full or incrementally from the
//! newest base that works, then hand the outcome to the retention manager.

use crate::backend::StorageBackend;
use crate::config::RunConfig;
use crate::executor::TransferExecutor;
use crate::inventory::Inventory;
use crate::retention::RetentionManager;
use holdfast_common::{Result, SnapshotName, Transfer, TransferMode, TransferOutcome};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Final state of one filesystem backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// A transfer succeeded
    Replicated,
    /// The capacity gate refused the transfer
    SizeExceeded,
    /// Every transfer attempt failed
    Failed,
    /// Nothing was attempted (hierarchy or snapshot creation failed)
    Skipped,
}

/// What happened to one filesystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemReport {
    pub filesystem: String,
    pub pool: String,
    /// Snapshot created for this run
    pub snapshot: Option<SnapshotName>,
    /// Transfer attempts in the order they were made
    pub attempts: Vec<Transfer>,
    pub status: BackupStatus,
    /// Whether the new snapshot ended up held
    pub held: bool,
}

impl FilesystemReport {
    fn skipped(filesystem: &str, pool: &str) -> Self {
        Self {
            filesystem: filesystem.to_string(),
            pool: pool.to_string(),
            snapshot: None,
            attempts: Vec::new(),
            status: BackupStatus::Skipped,
            held: false,
        }
    }

    /// Transfer mode chosen first: full, or incremental from the newest base
    pub fn mode(&self) -> Option<&TransferMode> {
        self.attempts.first().map(|t| &t.mode)
    }

    /// The attempt that succeeded, if any
    pub fn successful(&self) -> Option<&Transfer> {
        self.attempts.iter().find(|t| t.succeeded())
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.successful().map(|t| t.bytes_transferred).unwrap_or(0)
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.attempts.iter().map(Transfer::elapsed).sum()
    }
}

pub struct TransferPlanner {
    backend: Arc<dyn StorageBackend>,
    config: Arc<RunConfig>,
    inventory: Inventory,
    executor: TransferExecutor,
    retention: RetentionManager,
}

impl TransferPlanner {
    pub fn new(backend: Arc<dyn StorageBackend>, config: Arc<RunConfig>) -> Self {
        Self {
            inventory: Inventory::new(backend.clone()),
            executor: TransferExecutor::new(backend.clone()),
            retention: RetentionManager::new(backend.clone(), config.hold_tag.clone()),
            backend,
            config,
        }
    }

    /// Create the ancestors of `filesystem` under `pool`, parent first.
    /// The filesystem itself is created by the full receive.
    pub async fn ensure_hierarchy(&self, filesystem: &str, pool: &str) -> Result<()> {
        let existing: HashSet<String> = self.backend.list_filesystems(pool).await?.into_iter().collect();
        let segments: Vec<&str> = filesystem.split('/').collect();
        for depth in 1..segments.len() {
            let path = segments[..depth].join("/");
            if existing.contains(&format!("{}/{}", pool, path)) {
                continue;
            }
            info!("Creating {}/{}", pool, path);
            self.backend.create_filesystem(pool, &path).await?;
        }
        Ok(())
    }

    /// Back up `filesystem` to `pool`
    pub async fn backup_filesystem(&self, filesystem: &str, pool: &str) -> FilesystemReport {
        let mut report = FilesystemReport::skipped(filesystem, pool);

        if let Err(e) = self.ensure_hierarchy(filesystem, pool).await {
            error!(filesystem, pool, "Failed to create hierarchy for {} on {}: {}", filesystem, pool, e);
            return report;
        }

        let bases = self.inventory.backup_snapshots(filesystem, pool).await;

        let label = self.config.label(pool);
        let snapshot = match self.backend.create_snapshot(filesystem, &label).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Failed to create snapshot {}@{}: {}", filesystem, label, e);
                return report;
            }
        };
        info!(filesystem, pool, "Created snapshot {}", snapshot);
        report.snapshot = Some(snapshot.clone());

        if bases.is_empty() {
            info!("No previous {} snapshot of {}, sending in full", pool, filesystem);
            let transfer = self.executor.execute(&snapshot, TransferMode::Full, pool).await;
            report.attempts.push(transfer);
        } else {
            for base in bases {
                let mode = TransferMode::Incremental { base };
                let transfer = self.executor.execute(&snapshot, mode, pool).await;
                let outcome = transfer.outcome;
                report.attempts.push(transfer);
                match outcome {
                    TransferOutcome::Success => break,
                    // a larger span from an older base will not fit either
                    TransferOutcome::SizeExceeded => break,
                    TransferOutcome::TransferError => continue,
                }
            }
        }

        if report.successful().is_some() {
            report.status = BackupStatus::Replicated;
            self.retain(&snapshot, &mut report).await;
        } else {
            report.status = match report.attempts.last().map(|t| t.outcome) {
                Some(TransferOutcome::SizeExceeded) => BackupStatus::SizeExceeded,
                _ => BackupStatus::Failed,
            };
            self.discard(&snapshot).await;
        }
        report
    }

    async fn retain(&self, snapshot: &SnapshotName, report: &mut FilesystemReport) {
        report.held = self.retention.hold(snapshot).await.is_ok();

        let used = report.successful().and_then(|t| t.mode.base().cloned());
        // newer bases that failed are no longer the backup pool's newest snapshot
        let stale: Vec<SnapshotName> = report
            .attempts
            .iter()
            .take_while(|t| !t.succeeded())
            .filter_map(|t| t.mode.base().cloned())
            .collect();

        if report.held {
            if let Some(base) = &used {
                if let Err(e) = self.retention.rotate_base(base).await {
                    warn!("Previous base {} kept: {}", base, e);
                }
            }
            for base in &stale {
                if let Err(e) = self.retention.retire(base, self.config.destroy).await {
                    warn!("Superseded base {} not retired: {}", base, e);
                }
            }
        } else if used.is_some() || !stale.is_empty() {
            warn!("{} is not held, keeping previous bases", snapshot);
        }

        if self.config.destroy {
            let destination = format!("{}/{}", report.pool, report.filesystem);
            let pruned = self
                .retention
                .prune(&destination, &report.pool, self.config.keep_destination)
                .await;
            if !pruned.is_empty() {
                info!("Pruned {} old snapshot(s) from {}", pruned.len(), destination);
            }
        }
    }

    async fn discard(&self, snapshot: &SnapshotName) {
        if self.config.destroy {
            // nothing was received, the snapshot has no use left
            let _ = self.retention.destroy(snapshot).await;
        } else {
            warn!("Leaving unreplicated snapshot {} in place, unheld", snapshot);
        }
    }
}
