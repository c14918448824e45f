//! Snapshot retention
//!
//! Holds pin the snapshot that the next incremental transfer will start
//! from. A snapshot is only destroyed after its hold is gone, and every
//! failure here is logged and reported back without stopping the run.

use crate::backend::StorageBackend;
use crate::inventory::Inventory;
use holdfast_common::{Error, Result, SnapshotName};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct RetentionManager {
    backend: Arc<dyn StorageBackend>,
    inventory: Inventory,
    tag: String,
}

impl RetentionManager {
    pub fn new(backend: Arc<dyn StorageBackend>, tag: impl Into<String>) -> Self {
        Self {
            inventory: Inventory::new(backend.clone()),
            backend,
            tag: tag.into(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Whether our tag currently holds `snapshot`
    pub async fn is_held(&self, snapshot: &SnapshotName) -> Result<bool> {
        let holds = self.backend.list_holds(snapshot).await?;
        Ok(holds.iter().any(|t| t == &self.tag))
    }

    /// Pin `snapshot`. Holding an already held snapshot is a no-op.
    pub async fn hold(&self, snapshot: &SnapshotName) -> Result<()> {
        match self.is_held(snapshot).await {
            Ok(true) => {
                debug!("{} is already held by {}", snapshot, self.tag);
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => debug!("could not list holds of {}: {}", snapshot, e),
        }
        self.backend.hold(snapshot, &self.tag).await.map_err(|e| {
            error!("Failed to hold {}: {}", snapshot, e);
            e
        })?;
        info!("Holding {}", snapshot);
        Ok(())
    }

    pub async fn release(&self, snapshot: &SnapshotName) -> Result<()> {
        self.backend.release(snapshot, &self.tag).await.map_err(|e| {
            error!("Failed to release {}: {}", snapshot, e);
            e
        })?;
        info!("Released {}", snapshot);
        Ok(())
    }

    pub async fn destroy(&self, snapshot: &SnapshotName) -> Result<()> {
        self.backend.destroy_snapshot(snapshot).await.map_err(|e| {
            error!("Failed to destroy {}: {}", snapshot, e);
            e
        })?;
        info!("Destroyed {}", snapshot);
        Ok(())
    }

    /// Release then destroy a superseded incremental base.
    ///
    /// When the release fails the destroy is only attempted if the hold is
    /// confirmed gone.
    pub async fn rotate_base(&self, base: &SnapshotName) -> Result<()> {
        if let Err(e) = self.release(base).await {
            match self.is_held(base).await {
                Ok(false) => warn!("{} carries no {} hold, destroying anyway", base, self.tag),
                _ => {
                    return Err(Error::Retention(format!(
                        "keeping {}, its hold could not be released: {}",
                        base, e
                    )))
                }
            }
        }
        self.destroy(base).await
    }

    /// Drop our hold on a base that can no longer start an incremental
    /// transfer, and destroy it too when `destroy` is set
    pub async fn retire(&self, snapshot: &SnapshotName, destroy: bool) -> Result<()> {
        if self.is_held(snapshot).await.unwrap_or(true) {
            self.release(snapshot).await?;
        }
        if destroy {
            self.destroy(snapshot).await?;
        }
        Ok(())
    }

    /// Destroy all but the `keep` newest snapshots replicated to `pool` on
    /// `filesystem`. Returns the snapshots that were destroyed.
    pub async fn prune(&self, filesystem: &str, pool: &str, keep: usize) -> Vec<SnapshotName> {
        let snapshots = self.inventory.backup_snapshots(filesystem, pool).await;
        let mut destroyed = Vec::new();
        for snapshot in snapshots.into_iter().skip(keep) {
            if self.destroy(&snapshot).await.is_ok() {
                destroyed.push(snapshot);
            }
        }
        destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, Fault, MemoryBackend};

    const TAG: &str = "holdfast:backup";

    fn setup() -> (MemoryBackend, RetentionManager) {
        let backend = MemoryBackend::new();
        backend.add_pool("tank", &[], 0).add_filesystem("tank/data");
        backend
            .add_snapshot("tank/data", "backup_202401010000", None)
            .add_snapshot("tank/data", "backup_202401020000", Some(TAG));
        let retention = RetentionManager::new(Arc::new(backend.clone()), TAG);
        (backend, retention)
    }

    #[tokio::test]
    async fn test_hold_is_idempotent() {
        let (backend, retention) = setup();
        let snap = SnapshotName::new("tank/data", "backup_202401010000");
        retention.hold(&snap).await.unwrap();
        retention.hold(&snap).await.unwrap();
        assert_eq!(backend.holds_of("tank/data@backup_202401010000"), vec![TAG]);
        assert!(retention.is_held(&snap).await.unwrap());
    }

    #[tokio::test]
    async fn test_rotate_base_releases_before_destroy() {
        let (backend, retention) = setup();
        let base = SnapshotName::new("tank/data", "backup_202401020000");
        retention.rotate_base(&base).await.unwrap();

        assert_eq!(backend.snapshot_labels("tank/data"), vec!["backup_202401010000"]);
        let order: Vec<BackendCall> = backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BackendCall::Release(_) | BackendCall::DestroySnapshot(_)))
            .collect();
        assert_eq!(
            order,
            vec![
                BackendCall::Release("tank/data@backup_202401020000".to_string()),
                BackendCall::DestroySnapshot("tank/data@backup_202401020000".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_rotate_base_keeps_still_held_snapshot() {
        let (backend, retention) = setup();
        backend.inject(Fault::Release("tank/data@backup_202401020000".to_string()));
        let base = SnapshotName::new("tank/data", "backup_202401020000");

        let err = retention.rotate_base(&base).await.unwrap_err();
        assert!(matches!(err, Error::Retention(_)));
        assert!(!backend
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::DestroySnapshot(_))));
        assert_eq!(backend.snapshot_labels("tank/data").len(), 2);
    }

    #[tokio::test]
    async fn test_rotate_unheld_base() {
        let (backend, retention) = setup();
        let base = SnapshotName::new("tank/data", "backup_202401010000");
        retention.rotate_base(&base).await.unwrap();
        assert_eq!(backend.snapshot_labels("tank/data"), vec!["backup_202401020000"]);
    }

    #[tokio::test]
    async fn test_retire_releases_and_optionally_destroys() {
        let (backend, retention) = setup();
        let held = SnapshotName::new("tank/data", "backup_202401020000");
        retention.retire(&held, false).await.unwrap();
        assert!(backend.holds_of("tank/data@backup_202401020000").is_empty());
        assert_eq!(backend.snapshot_labels("tank/data").len(), 2);

        let unheld = SnapshotName::new("tank/data", "backup_202401010000");
        retention.retire(&unheld, true).await.unwrap();
        assert_eq!(backend.snapshot_labels("tank/data"), vec!["backup_202401020000"]);
        assert!(!backend
            .calls()
            .contains(&BackendCall::Release("tank/data@backup_202401010000".to_string())));
    }

    #[tokio::test]
    async fn test_destroy_held_snapshot_fails() {
        let (_backend, retention) = setup();
        let snap = SnapshotName::new("tank/data", "backup_202401020000");
        assert!(retention.destroy(&snap).await.is_err());
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let backend = MemoryBackend::new();
        backend.add_pool("backup", &[], 0).add_filesystem("backup/tank/data");
        for label in ["backup_1", "other_1", "backup_2", "backup_3", "backup_4"] {
            backend.add_snapshot("backup/tank/data", label, None);
        }
        let retention = RetentionManager::new(Arc::new(backend.clone()), TAG);

        let destroyed = retention.prune("backup/tank/data", "backup", 2).await;
        let labels: Vec<&str> = destroyed.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["backup_2", "backup_1"]);
        assert_eq!(
            backend.snapshot_labels("backup/tank/data"),
            vec!["other_1", "backup_3", "backup_4"]
        );
    }
}
