//! Storage backend interface
//!
//! Everything the replication engine needs from the volume manager, as typed
//! operations. `zfs` shells out to the real tools, `memory` keeps a complete
//! pool/snapshot model in process for tests (built with the `testing`
//! feature), and `dry_run` wraps either one and
//! suppresses every mutating call.

pub mod command;
pub mod dry_run;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod zfs;

pub use dry_run::DryRunBackend;
#[cfg(any(test, feature = "testing"))]
pub use memory::{BackendCall, Fault, MemoryBackend};
pub use zfs::{CommandPaths, ZfsBackend};

use async_trait::async_trait;
use holdfast_common::{Result, SnapshotName};
use tokio::io::{AsyncRead, AsyncWrite};

/// Producing end of a replication stream
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;
/// Consuming end of a replication stream
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How one pipeline stage terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageExit {
    /// Exit status, `None` if the stage was killed or never ran
    pub code: Option<i32>,
    /// Captured diagnostic output
    pub diagnostics: String,
}

impl StageExit {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            diagnostics: String::new(),
        }
    }

    pub fn failed(code: Option<i32>, diagnostics: impl Into<String>) -> Self {
        Self {
            code,
            diagnostics: diagnostics.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Waits for a pipeline stage to terminate once its stream is exhausted
#[async_trait]
pub trait StageCompletion: Send {
    async fn wait(self: Box<Self>) -> StageExit;
}

/// A stage that has already finished
pub struct ReadyCompletion(pub StageExit);

#[async_trait]
impl StageCompletion for ReadyCompletion {
    async fn wait(self: Box<Self>) -> StageExit {
        self.0
    }
}

/// A stage running as a tokio task
pub struct TaskCompletion(pub tokio::task::JoinHandle<StageExit>);

#[async_trait]
impl StageCompletion for TaskCompletion {
    async fn wait(self: Box<Self>) -> StageExit {
        match self.0.await {
            Ok(exit) => exit,
            Err(e) => StageExit::failed(None, format!("stage task aborted: {}", e)),
        }
    }
}

/// Output side of `send`
pub struct SendStream {
    /// Human readable description, used in logs
    pub stage: String,
    pub reader: ByteReader,
    pub completion: Box<dyn StageCompletion>,
}

/// Input side of `receive`
pub struct ReceiveSink {
    /// Human readable description, used in logs
    pub stage: String,
    pub writer: ByteWriter,
    pub completion: Box<dyn StageCompletion>,
}

/// Typed operations on pools, filesystems and snapshots.
///
/// Listing operations report failures as `Error::Query`; mutating ones as
/// `Error::Retention` (holds, releases, destroys) or `Error::System`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Names of the currently imported pools
    async fn list_pools(&self) -> Result<Vec<String>>;

    async fn import_pool(&self, name: &str) -> Result<()>;

    async fn export_pool(&self, name: &str) -> Result<()>;

    /// Member devices of an imported pool
    async fn pool_devices(&self, name: &str) -> Result<Vec<String>>;

    /// Bytes available for new data on the pool
    async fn pool_free_space(&self, name: &str) -> Result<u64>;

    /// Filesystems of a pool, the pool's root filesystem included
    async fn list_filesystems(&self, pool: &str) -> Result<Vec<String>>;

    async fn get_property(&self, filesystem: &str, key: &str) -> Result<String>;

    /// Snapshots of exactly this filesystem, oldest first
    async fn list_snapshots(&self, filesystem: &str) -> Result<Vec<SnapshotName>>;

    async fn create_snapshot(&self, filesystem: &str, label: &str) -> Result<SnapshotName>;

    /// Create `<pool>/<path>`; its parent must already exist
    async fn create_filesystem(&self, pool: &str, path: &str) -> Result<()>;

    async fn hold(&self, snapshot: &SnapshotName, tag: &str) -> Result<()>;

    async fn release(&self, snapshot: &SnapshotName, tag: &str) -> Result<()>;

    /// Tags currently holding the snapshot
    async fn list_holds(&self, snapshot: &SnapshotName) -> Result<Vec<String>>;

    async fn destroy_snapshot(&self, snapshot: &SnapshotName) -> Result<()>;

    /// Size of the stream `open_send_stream` would produce
    async fn estimate_transfer_size(
        &self,
        target: &SnapshotName,
        base: Option<&SnapshotName>,
    ) -> Result<u64>;

    async fn open_send_stream(
        &self,
        target: &SnapshotName,
        base: Option<&SnapshotName>,
    ) -> Result<SendStream>;

    /// Receive into `<pool>/<filesystem>`
    async fn open_receive_sink(&self, pool: &str, filesystem: &str) -> Result<ReceiveSink>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_completion() {
        let completion: Box<dyn StageCompletion> = Box::new(ReadyCompletion(StageExit::success()));
        assert!(completion.wait().await.is_success());
    }

    #[tokio::test]
    async fn test_task_completion_reports_abort() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            StageExit::success()
        });
        handle.abort();
        let completion: Box<dyn StageCompletion> = Box::new(TaskCompletion(handle));
        let exit = completion.wait().await;
        assert!(!exit.is_success());
        assert_eq!(exit.code, None);
        assert!(exit.diagnostics.contains("stage task aborted"));
    }

    #[test]
    fn test_stage_exit_nonzero() {
        let exit = StageExit::failed(Some(1), "cannot receive");
        assert!(!exit.is_success());
    }
}
