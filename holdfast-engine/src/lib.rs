//! Holdfast replication engine
//!
//! Replicates flagged filesystems to backup pools with full or incremental
//! snapshot streams, and keeps the held snapshot chain that lets the next
//! run resume incrementally.

pub mod backend;
pub mod capacity;
pub mod config;
pub mod executor;
pub mod inventory;
pub mod orchestrator;
pub mod planner;
pub mod retention;

pub use backend::{DryRunBackend, StorageBackend, ZfsBackend};
#[cfg(any(test, feature = "testing"))]
pub use backend::MemoryBackend;
pub use capacity::{CapacityGate, Clearance};
pub use config::RunConfig;
pub use executor::TransferExecutor;
pub use inventory::Inventory;
pub use orchestrator::{Orchestrator, RunSummary};
pub use planner::{BackupStatus, FilesystemReport, TransferPlanner};
pub use retention::RetentionManager;
