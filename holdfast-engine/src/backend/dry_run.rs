//! Pretend mode
//!
//! Wraps a backend so that inventory reads reach the real pools while every
//! snapshot, hold, destroy and transfer is only logged. Synthesised results
//! cost nothing: size estimates are zero and streams are empty.

use super::{
    ReadyCompletion, ReceiveSink, SendStream, StageExit, StorageBackend,
};
use async_trait::async_trait;
use holdfast_common::{Result, SnapshotName};
use std::sync::Arc;
use tracing::info;

pub struct DryRunBackend {
    inner: Arc<dyn StorageBackend>,
}

impl DryRunBackend {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StorageBackend for DryRunBackend {
    async fn list_pools(&self) -> Result<Vec<String>> {
        self.inner.list_pools().await
    }

    // A detached backup pool has to be attached to be inspected at all.
    async fn import_pool(&self, name: &str) -> Result<()> {
        self.inner.import_pool(name).await
    }

    async fn export_pool(&self, name: &str) -> Result<()> {
        self.inner.export_pool(name).await
    }

    async fn pool_devices(&self, name: &str) -> Result<Vec<String>> {
        self.inner.pool_devices(name).await
    }

    async fn pool_free_space(&self, name: &str) -> Result<u64> {
        self.inner.pool_free_space(name).await
    }

    async fn list_filesystems(&self, pool: &str) -> Result<Vec<String>> {
        self.inner.list_filesystems(pool).await
    }

    async fn get_property(&self, filesystem: &str, key: &str) -> Result<String> {
        self.inner.get_property(filesystem, key).await
    }

    async fn list_snapshots(&self, filesystem: &str) -> Result<Vec<SnapshotName>> {
        self.inner.list_snapshots(filesystem).await
    }

    async fn create_snapshot(&self, filesystem: &str, label: &str) -> Result<SnapshotName> {
        let snapshot = SnapshotName::new(filesystem, label);
        info!("would run: zfs snapshot {}", snapshot);
        Ok(snapshot)
    }

    async fn create_filesystem(&self, pool: &str, path: &str) -> Result<()> {
        info!("would run: zfs create {}/{}", pool, path);
        Ok(())
    }

    async fn hold(&self, snapshot: &SnapshotName, tag: &str) -> Result<()> {
        info!("would run: zfs hold {} {}", tag, snapshot);
        Ok(())
    }

    async fn release(&self, snapshot: &SnapshotName, tag: &str) -> Result<()> {
        info!("would run: zfs release {} {}", tag, snapshot);
        Ok(())
    }

    async fn list_holds(&self, snapshot: &SnapshotName) -> Result<Vec<String>> {
        self.inner.list_holds(snapshot).await
    }

    async fn destroy_snapshot(&self, snapshot: &SnapshotName) -> Result<()> {
        info!("would run: zfs destroy {}", snapshot);
        Ok(())
    }

    async fn estimate_transfer_size(
        &self,
        _target: &SnapshotName,
        _base: Option<&SnapshotName>,
    ) -> Result<u64> {
        Ok(0)
    }

    async fn open_send_stream(
        &self,
        target: &SnapshotName,
        base: Option<&SnapshotName>,
    ) -> Result<SendStream> {
        let stage = match base {
            Some(base) => format!("zfs send -i {} {}", base, target),
            None => format!("zfs send {}", target),
        };
        info!("would run: {}", stage);
        Ok(SendStream {
            stage,
            reader: Box::new(tokio::io::empty()),
            completion: Box::new(ReadyCompletion(StageExit::success())),
        })
    }

    async fn open_receive_sink(&self, pool: &str, filesystem: &str) -> Result<ReceiveSink> {
        let stage = format!("zfs recv {}/{}", pool, filesystem);
        info!("would run: {}", stage);
        Ok(ReceiveSink {
            stage,
            writer: Box::new(tokio::io::sink()),
            completion: Box::new(ReadyCompletion(StageExit::success())),
        })
    }
}
