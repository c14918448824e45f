//! Snapshot naming
//!
//! A snapshot is addressed as `filesystem@label`. Labels written by holdfast
//! are `<backup pool>_<timestamp>`, so the labels belonging to one backup
//! pool sort in creation order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fully qualified snapshot name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotName {
    /// Filesystem (dataset) the snapshot belongs to
    pub filesystem: String,
    /// Part after the `@`
    pub label: String,
}

impl SnapshotName {
    pub fn new(filesystem: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            filesystem: filesystem.into(),
            label: label.into(),
        }
    }

    /// Label used for snapshots replicated to `pool` at `stamp`.
    pub fn backup_label(pool: &str, stamp: &str) -> String {
        format!("{}_{}", pool, stamp)
    }

    /// Whether this snapshot was taken for replication to `pool`.
    pub fn belongs_to_pool(&self, pool: &str) -> bool {
        self.label
            .strip_prefix(pool)
            .map(|rest| rest.starts_with('_'))
            .unwrap_or(false)
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.filesystem, self.label)
    }
}

impl FromStr for SnapshotName {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.split_once('@') {
            Some((fs, label)) if !fs.is_empty() && !label.is_empty() && !label.contains('@') => {
                Ok(Self::new(fs, label))
            }
            _ => Err(crate::Error::Query(format!("not a snapshot name: {}", s))),
        }
    }
}
