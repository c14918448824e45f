//! Run configuration
//!
//! Built once at start-up and handed to every component; nothing reads
//! flags from global state.

use holdfast_common::{Error, Result, SnapshotName};
use serde::{Deserialize, Serialize};

/// User property that marks a filesystem for backup
pub const DEFAULT_BACKUP_PROPERTY: &str = "holdfast:backup";
/// Tag used for snapshot holds
pub const DEFAULT_HOLD_TAG: &str = "holdfast:backup";
/// Timestamp part of snapshot labels
pub const STAMP_FORMAT: &str = "%Y%m%d%H%M";
/// Snapshots kept per filesystem on the backup pool when pruning
pub const DEFAULT_KEEP_DESTINATION: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Pools that receive the replicated snapshots
    pub backup_pools: Vec<String>,
    /// Restrict the source pools; empty means every non-backup pool
    pub source_pools: Vec<String>,
    /// Destroy snapshots once they are no longer needed
    pub destroy: bool,
    /// Log mutating operations instead of running them
    pub dry_run: bool,
    /// Only use backup pools that live entirely on this device
    pub device: Option<String>,
    /// Snapshots kept per filesystem on the backup pool when `destroy` is set
    pub keep_destination: usize,
    pub backup_property: String,
    pub hold_tag: String,
    /// Run timestamp, shared by every label created in this run
    pub stamp: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            backup_pools: Vec::new(),
            source_pools: Vec::new(),
            destroy: false,
            dry_run: false,
            device: None,
            keep_destination: DEFAULT_KEEP_DESTINATION,
            backup_property: DEFAULT_BACKUP_PROPERTY.to_string(),
            hold_tag: DEFAULT_HOLD_TAG.to_string(),
            stamp: run_stamp(chrono::Local::now()),
        }
    }
}

impl RunConfig {
    pub fn new(backup_pools: Vec<String>) -> Self {
        Self {
            backup_pools,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup_pools.is_empty() {
            return Err(Error::InvalidConfig("at least one backup pool is required".to_string()));
        }
        if let Some(pool) = self.backup_pools.iter().find(|p| self.source_pools.contains(p)) {
            return Err(Error::InvalidConfig(format!(
                "pool {} is both a backup pool and a source pool",
                pool
            )));
        }
        if self.keep_destination == 0 {
            return Err(Error::InvalidConfig("keep count must be at least 1".to_string()));
        }
        if self.backup_property.is_empty() || self.hold_tag.is_empty() {
            return Err(Error::InvalidConfig("property name and hold tag must not be empty".to_string()));
        }
        if self.stamp.is_empty() || self.stamp.contains(&['@', '/', ' '][..]) {
            return Err(Error::InvalidConfig(format!("invalid label timestamp {:?}", self.stamp)));
        }
        Ok(())
    }

    /// Device restriction without a leading `/dev/`
    pub fn device_filter(&self) -> Option<&str> {
        self.device
            .as_deref()
            .map(strip_dev)
            .filter(|d| !d.is_empty())
    }

    /// Label for snapshots replicated to `pool` in this run
    pub fn label(&self, pool: &str) -> String {
        SnapshotName::backup_label(pool, &self.stamp)
    }
}

/// Format the run timestamp
pub fn run_stamp<Tz: chrono::TimeZone>(now: chrono::DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format(STAMP_FORMAT).to_string()
}

fn strip_dev(device: &str) -> &str {
    device.strip_prefix("/dev/").unwrap_or(device)
}
