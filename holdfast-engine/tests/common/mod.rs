//! Common test fixtures

#![allow(dead_code)]

use holdfast_engine::{MemoryBackend, RunConfig};

pub const TAG: &str = "holdfast:backup";
pub const GIB: u64 = 1 << 30;

/// Source pool `tank` with `tank/data` flagged for backup, and an empty
/// backup pool `backup`
pub fn pools() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend
        .add_pool("tank", &["ada0"], 10 * GIB)
        .add_pool("backup", &["ada1"], 10 * GIB);
    backend
        .add_backup_filesystem("tank/data", TAG)
        .write_data("tank/data", 4096);
    backend
}

/// Run configuration for backup pool `backup` with a fixed timestamp
pub fn run_config(stamp: &str) -> RunConfig {
    RunConfig {
        stamp: stamp.to_string(),
        ..RunConfig::new(vec!["backup".to_string()])
    }
}

/// `tank/data` already replicated at 2024-01-01 and 2024-01-02, the newest
/// one held on the source; both exist on the backup pool
pub fn replicated_twice() -> MemoryBackend {
    let backend = pools();
    backend
        .add_snapshot("tank/data", "backup_202401010000", None)
        .write_data("tank/data", 2048)
        .add_snapshot("tank/data", "backup_202401020000", Some(TAG))
        .write_data("tank/data", 512);
    backend
        .add_filesystem("backup/tank/data")
        .write_data("backup/tank/data", 4096)
        .add_snapshot("backup/tank/data", "backup_202401010000", None)
        .write_data("backup/tank/data", 2048)
        .add_snapshot("backup/tank/data", "backup_202401020000", None);
    backend
}

pub fn labels(backend: &MemoryBackend, filesystem: &str) -> Vec<String> {
    backend.snapshot_labels(filesystem)
}
