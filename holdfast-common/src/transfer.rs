//! Transfer records
//!
//! A `Transfer` lives for one planner iteration and is only kept afterwards
//! as part of the run summary.

use crate::SnapshotName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a snapshot is replicated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TransferMode {
    /// Entire snapshot content
    Full,
    /// Delta between `base` and the target snapshot
    Incremental { base: SnapshotName },
}

impl TransferMode {
    pub fn base(&self) -> Option<&SnapshotName> {
        match self {
            TransferMode::Full => None,
            TransferMode::Incremental { base } => Some(base),
        }
    }

    pub fn is_incremental(&self) -> bool {
        matches!(self, TransferMode::Incremental { .. })
    }
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferMode::Full => write!(f, "full"),
            TransferMode::Incremental { base } => write!(f, "incremental from {}", base),
        }
    }
}

/// Result of one transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    /// Send and receive both exited zero
    Success,
    /// Refused by the capacity gate, no data moved
    SizeExceeded,
    /// Size query, send or receive failed
    TransferError,
}

/// One send/receive attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    /// Snapshot being replicated
    pub target: SnapshotName,
    pub mode: TransferMode,
    /// Receiving filesystem, `<pool>/<source filesystem>`
    pub destination: String,
    /// Estimated stream size from the capacity gate
    pub estimated_bytes: u64,
    /// Bytes that went through the pipe
    pub bytes_transferred: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: TransferOutcome,
    /// Captured stderr of whichever stage failed
    pub diagnostics: Option<String>,
}

impl Transfer {
    pub fn succeeded(&self) -> bool {
        self.outcome == TransferOutcome::Success
    }

    /// Wall-clock duration of the attempt
    pub fn elapsed(&self) -> std::time::Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_outcome_serialization() {
        let json = serde_json::to_string(&TransferOutcome::SizeExceeded).unwrap();
        assert_eq!(json, "\"size_exceeded\"");
    }

    #[test]
    fn test_transfer_mode_serialization() {
        let mode = TransferMode::Incremental {
            base: SnapshotName::new("tank/data", "backup_1"),
        };
        let json = serde_json::to_value(&mode).unwrap();
        assert_eq!(json["mode"], "incremental");
        assert_eq!(json["base"]["label"], "backup_1");

        let full = serde_json::to_value(&TransferMode::Full).unwrap();
        assert_eq!(full["mode"], "full");
    }

    #[test]
    fn test_elapsed_never_negative() {
        let now = Utc::now();
        let transfer = Transfer {
            target: SnapshotName::new("tank/data", "backup_2"),
            mode: TransferMode::Full,
            destination: "backup/tank/data".to_string(),
            estimated_bytes: 0,
            bytes_transferred: 0,
            started_at: now,
            finished_at: now - chrono::Duration::seconds(5),
            outcome: TransferOutcome::TransferError,
            diagnostics: None,
        };
        assert_eq!(transfer.elapsed(), std::time::Duration::ZERO);
        assert!(!transfer.succeeded());
    }
}
