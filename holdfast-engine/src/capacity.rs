//! Pre-flight capacity check
//!
//! Compares the estimated stream size with the free space reported by the
//! destination pool. Nothing is reserved: a pass only means the transfer is
//! worth attempting, the pipeline result stays authoritative.

use crate::backend::StorageBackend;
use holdfast_common::{Error, Result, SnapshotName};
use std::sync::Arc;

/// Figures behind a passed check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clearance {
    pub estimated: u64,
    pub available: u64,
}

#[derive(Clone)]
pub struct CapacityGate {
    backend: Arc<dyn StorageBackend>,
}

impl CapacityGate {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// `Error::CapacityExceeded` when the stream would not fit on `pool`
    pub async fn check(
        &self,
        target: &SnapshotName,
        base: Option<&SnapshotName>,
        pool: &str,
    ) -> Result<Clearance> {
        let estimated = self.backend.estimate_transfer_size(target, base).await?;
        let available = self.backend.pool_free_space(pool).await?;

        if estimated > available {
            return Err(Error::CapacityExceeded {
                pool: pool.to_string(),
                estimated,
                available,
            });
        }
        Ok(Clearance { estimated, available })
    }
}
