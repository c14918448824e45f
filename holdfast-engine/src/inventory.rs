//! Snapshot inventory reader
//!
//! Ordering contract: filesystems come parent-before-child and snapshots
//! newest-first, whatever order the backend reported them in. A failed
//! query is logged and yields an empty list so one unreachable pool does not
//! stop the others.

use crate::backend::StorageBackend;
use holdfast_common::{Result, SnapshotName};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone)]
pub struct Inventory {
    backend: Arc<dyn StorageBackend>,
}

impl Inventory {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Imported pools
    pub async fn pools(&self) -> Vec<String> {
        let pools = contained(self.backend.list_pools().await, "pools");
        debug!("available pools: {}", pools.join(" "));
        pools
    }

    /// Filesystems of a pool, parents before children
    pub async fn filesystems(&self, pool: &str) -> Vec<String> {
        let mut filesystems = contained(
            self.backend.list_filesystems(pool).await,
            &format!("filesystems in pool {}", pool),
        );
        sort_hierarchically(&mut filesystems);
        debug!("filesystems in pool {}: {}", pool, filesystems.join(" "));
        filesystems
    }

    /// Filesystems of a pool whose `property` is `true`
    pub async fn eligible_filesystems(&self, pool: &str, property: &str) -> Vec<String> {
        let mut eligible = Vec::new();
        for fs in self.filesystems(pool).await {
            match self.backend.get_property(&fs, property).await {
                Ok(value) if value == "true" => eligible.push(fs),
                Ok(_) => {}
                Err(e) => error!("Failed to retrieve property {} from {}: {}", property, fs, e),
            }
        }
        eligible
    }

    /// Snapshots of a filesystem, newest first
    pub async fn snapshots(&self, filesystem: &str) -> Result<Vec<SnapshotName>> {
        let mut snapshots = self.backend.list_snapshots(filesystem).await?;
        snapshots.retain(|s| s.filesystem == filesystem);
        snapshots.reverse();
        Ok(snapshots)
    }

    /// Snapshots taken for replication to `pool`, newest first
    pub async fn backup_snapshots(&self, filesystem: &str, pool: &str) -> Vec<SnapshotName> {
        let mut snapshots = contained(
            self.snapshots(filesystem).await,
            &format!("snapshots for {}", filesystem),
        );
        snapshots.retain(|s| s.belongs_to_pool(pool));
        snapshots
    }
}

fn contained<T>(result: Result<Vec<T>>, what: &str) -> Vec<T> {
    match result {
        Ok(items) => items,
        Err(e) => {
            error!("could not get {}: {}", what, e);
            Vec::new()
        }
    }
}

/// Order by path segments so every prefix sorts before its extensions
fn sort_hierarchically(filesystems: &mut [String]) {
    filesystems.sort_by(|a, b| a.split('/').cmp(b.split('/')));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Fault, MemoryBackend};

    #[test]
    fn test_sort_hierarchically() {
        let mut names = vec![
            "tank/a/b".to_string(),
            "tank/a-x".to_string(),
            "tank".to_string(),
            "tank/a".to_string(),
        ];
        sort_hierarchically(&mut names);
        assert_eq!(names, vec!["tank", "tank/a", "tank/a/b", "tank/a-x"]);
    }

    #[tokio::test]
    async fn test_snapshots_newest_first() {
        let backend = MemoryBackend::new();
        backend.add_pool("tank", &[], 0).add_filesystem("tank/data");
        backend
            .add_snapshot("tank/data", "backup_202401010000", None)
            .add_snapshot("tank/data", "manual", None)
            .add_snapshot("tank/data", "backup_202401020000", None)
            .add_snapshot("tank/data", "offsite_202401020000", None);
        let inventory = Inventory::new(Arc::new(backend));

        let all = inventory.snapshots("tank/data").await.unwrap();
        assert_eq!(all.first().map(|s| s.label.as_str()), Some("offsite_202401020000"));

        let labels: Vec<String> = inventory
            .backup_snapshots("tank/data", "backup")
            .await
            .into_iter()
            .map(|s| s.label)
            .collect();
        assert_eq!(labels, vec!["backup_202401020000", "backup_202401010000"]);
    }

    #[tokio::test]
    async fn test_query_failure_yields_empty() {
        let backend = MemoryBackend::new();
        backend.add_pool("tank", &[], 0).add_filesystem("tank/data");
        backend.add_snapshot("tank/data", "backup_1", None);
        backend.inject(Fault::ListSnapshots("tank/data".to_string()));
        backend.inject(Fault::ListFilesystems("tank".to_string()));
        let inventory = Inventory::new(Arc::new(backend));

        assert!(inventory.snapshots("tank/data").await.is_err());
        assert!(inventory.backup_snapshots("tank/data", "backup").await.is_empty());
        assert!(inventory.filesystems("tank").await.is_empty());
        assert!(inventory.filesystems("missing").await.is_empty());
    }

    #[tokio::test]
    async fn test_eligible_filesystems() {
        let backend = MemoryBackend::new();
        backend.add_pool("tank", &[], 0);
        backend
            .add_backup_filesystem("tank/data", "holdfast:backup")
            .add_filesystem("tank/scratch")
            .set_property("tank/media", "holdfast:backup", "false");
        let inventory = Inventory::new(Arc::new(backend));

        let eligible = inventory.eligible_filesystems("tank", "holdfast:backup").await;
        assert_eq!(eligible, vec!["tank/data"]);
    }
}
