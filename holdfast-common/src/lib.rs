//! Common types and utilities shared between holdfast-engine and holdfast-cli

pub mod size;
pub mod snapshot;
pub mod transfer;

pub use size::format_size;
pub use snapshot::SnapshotName;
pub use transfer::{Transfer, TransferMode, TransferOutcome};

/// Error taxonomy for a replication run.
///
/// Every variant is contained at the smallest scope that can absorb it:
/// query and retention failures are logged and the run carries on, capacity
/// and transfer failures end one filesystem's attempt, and only
/// `NoBackupPools` / `InvalidConfig` reach the process exit code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Stream size {estimated} exceeds available space {available} on pool {pool}")]
    CapacityExceeded {
        pool: String,
        estimated: u64,
        available: u64,
    },

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Retention operation failed: {0}")]
    Retention(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No backup pools available")]
    NoBackupPools,

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when retrying with a larger incremental span cannot help.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
