//! In-process storage backend
//!
//! Models pools, filesystems, ordered snapshots, holds and free space with
//! the receive rules of the real volume manager: a full stream only lands on
//! a filesystem that does not exist yet (under an existing parent), and an
//! incremental stream only applies when the destination's newest snapshot
//! is the stream's base. Every call is journaled and individual operations
//! can be made to fail, which is what the planner tests are built on.

use super::{ReceiveSink, SendStream, StageExit, StorageBackend, TaskCompletion};
use async_trait::async_trait;
use holdfast_common::{Error, Result, SnapshotName};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const STREAM_MAGIC: &str = "HOLDFAST-STREAM";
const DUPLEX_BUFFER: usize = 64 * 1024;
const ZERO_CHUNK: [u8; 8192] = [0u8; 8192];

/// A journaled backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    ListPools,
    ImportPool(String),
    ExportPool(String),
    PoolDevices(String),
    PoolFreeSpace(String),
    ListFilesystems(String),
    GetProperty(String, String),
    ListSnapshots(String),
    CreateSnapshot(String),
    CreateFilesystem(String),
    Hold(String),
    Release(String),
    ListHolds(String),
    DestroySnapshot(String),
    EstimateTransferSize { target: String, base: Option<String> },
    OpenSendStream { target: String, base: Option<String> },
    OpenReceiveSink(String),
}

impl BackendCall {
    /// Calls that change pool contents or move data
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            BackendCall::CreateSnapshot(_)
                | BackendCall::CreateFilesystem(_)
                | BackendCall::Hold(_)
                | BackendCall::Release(_)
                | BackendCall::DestroySnapshot(_)
                | BackendCall::OpenSendStream { .. }
                | BackendCall::OpenReceiveSink(_)
        )
    }
}

/// Operation that should fail. Snapshot-keyed faults use the full
/// `fs@label` name; `Estimate` and `Send` are keyed by the incremental base,
/// or by the target for full streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fault {
    ListPools,
    ImportPool(String),
    FreeSpace(String),
    ListFilesystems(String),
    ListSnapshots(String),
    CreateSnapshot(String),
    CreateFilesystem(String),
    Hold(String),
    Release(String),
    Destroy(String),
    Estimate(String),
    Send(String),
    Receive(String),
}

#[derive(Debug, Clone)]
struct MemoryPool {
    imported: bool,
    devices: Vec<String>,
    free_space: u64,
}

#[derive(Debug, Clone, Default)]
struct MemoryFilesystem {
    properties: HashMap<String, String>,
    snapshots: Vec<MemorySnapshot>,
    /// Bytes written since the last snapshot
    pending: u64,
}

#[derive(Debug, Clone)]
struct MemorySnapshot {
    label: String,
    written: u64,
    holds: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    pools: BTreeMap<String, MemoryPool>,
    filesystems: BTreeMap<String, MemoryFilesystem>,
    faults: HashSet<Fault>,
    estimates: HashMap<String, u64>,
    calls: Vec<BackendCall>,
}

impl MemoryState {
    fn fail_if(&self, fault: &Fault, err: impl FnOnce() -> Error) -> Result<()> {
        if self.faults.contains(fault) {
            Err(err())
        } else {
            Ok(())
        }
    }

    fn imported_pool(&self, name: &str) -> Result<&MemoryPool> {
        self.pools
            .get(name)
            .filter(|pool| pool.imported)
            .ok_or_else(|| Error::Query(format!("cannot open '{}': no such pool", name)))
    }

    fn filesystem(&self, name: &str) -> Result<&MemoryFilesystem> {
        let pool = name.split('/').next().unwrap_or(name);
        self.imported_pool(pool)?;
        self.filesystems
            .get(name)
            .ok_or_else(|| Error::Query(format!("cannot open '{}': dataset does not exist", name)))
    }

    fn snapshot_index(&self, snapshot: &SnapshotName) -> Result<usize> {
        self.filesystem(&snapshot.filesystem)?
            .snapshots
            .iter()
            .position(|s| s.label == snapshot.label)
            .ok_or_else(|| Error::Query(format!("cannot open '{}': dataset does not exist", snapshot)))
    }

    fn snapshot_mut(&mut self, snapshot: &SnapshotName) -> Result<&mut MemorySnapshot> {
        let index = self.snapshot_index(snapshot)?;
        let fs = self
            .filesystems
            .get_mut(&snapshot.filesystem)
            .ok_or_else(|| Error::Query(format!("cannot open '{}': dataset does not exist", snapshot)))?;
        Ok(&mut fs.snapshots[index])
    }

    /// Bytes a send of `target` (from `base`) carries
    fn stream_size(&self, target: &SnapshotName, base: Option<&SnapshotName>) -> Result<u64> {
        let end = self.snapshot_index(target)?;
        let start = match base {
            None => 0,
            Some(base) => {
                if base.filesystem != target.filesystem {
                    return Err(Error::Query(format!(
                        "incremental source {} is not from the same filesystem as {}",
                        base, target
                    )));
                }
                let index = self.snapshot_index(base)?;
                if index >= end {
                    return Err(Error::Query(format!(
                        "incremental source {} is not earlier than {}",
                        base, target
                    )));
                }
                index + 1
            }
        };
        let fs = self.filesystem(&target.filesystem)?;
        Ok(fs.snapshots[start..=end].iter().map(|s| s.written).sum())
    }

    fn apply_stream(&mut self, destination: &str, header: &StreamHeader, body: u64) -> std::result::Result<(), String> {
        let pool_name = destination.split('/').next().unwrap_or(destination).to_string();
        let pool = self
            .pools
            .get_mut(&pool_name)
            .filter(|p| p.imported)
            .ok_or_else(|| format!("cannot open '{}': no such pool", pool_name))?;
        if body > pool.free_space {
            return Err(format!("cannot receive new filesystem stream: out of space on {}", pool_name));
        }

        match &header.base {
            None => {
                if self.filesystems.contains_key(destination) {
                    return Err(format!(
                        "cannot receive new filesystem stream: destination '{}' exists",
                        destination
                    ));
                }
                let parent = destination.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
                if !self.filesystems.contains_key(parent) {
                    return Err(format!(
                        "cannot receive new filesystem stream: parent of '{}' does not exist",
                        destination
                    ));
                }
                self.filesystems.insert(
                    destination.to_string(),
                    MemoryFilesystem {
                        snapshots: vec![MemorySnapshot {
                            label: header.label.clone(),
                            written: body,
                            holds: Vec::new(),
                        }],
                        ..Default::default()
                    },
                );
            }
            Some(base) => {
                let fs = self.filesystems.get_mut(destination).ok_or_else(|| {
                    format!("cannot receive incremental stream: destination '{}' does not exist", destination)
                })?;
                match fs.snapshots.last() {
                    Some(newest) if &newest.label == base => {}
                    _ => {
                        return Err(format!(
                            "cannot receive incremental stream: most recent snapshot of {} does not match incremental source",
                            destination
                        ))
                    }
                }
                if fs.snapshots.iter().any(|s| s.label == header.label) {
                    return Err(format!(
                        "cannot receive incremental stream: destination {}@{} exists",
                        destination, header.label
                    ));
                }
                fs.snapshots.push(MemorySnapshot {
                    label: header.label.clone(),
                    written: body,
                    holds: Vec::new(),
                });
            }
        }

        if let Some(pool) = self.pools.get_mut(&pool_name) {
            pool.free_space -= body;
        }
        Ok(())
    }
}

/// First line of a simulated replication stream
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamHeader {
    base: Option<String>,
    label: String,
}

impl StreamHeader {
    fn encode(&self) -> String {
        match &self.base {
            None => format!("{} full {}\n", STREAM_MAGIC, self.label),
            Some(base) => format!("{} incremental {} {}\n", STREAM_MAGIC, base, self.label),
        }
    }

    /// Split a received stream into header and body length
    fn decode(data: &[u8]) -> Option<(Self, u64)> {
        let newline = data.iter().position(|b| *b == b'\n')?;
        let line = std::str::from_utf8(&data[..newline]).ok()?;
        let body = (data.len() - newline - 1) as u64;
        let mut parts = line.split(' ');
        if parts.next()? != STREAM_MAGIC {
            return None;
        }
        let header = match (parts.next()?, parts.next(), parts.next()) {
            ("full", Some(label), None) => Self {
                base: None,
                label: label.to_string(),
            },
            ("incremental", Some(base), Some(label)) => Self {
                base: Some(base.to_string()),
                label: label.to_string(),
            },
            _ => return None,
        };
        Some((header, body))
    }
}

/// In-memory storage backend
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: BackendCall) -> MutexGuard<'_, MemoryState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }

    /// Add an imported pool with its root filesystem
    pub fn add_pool(&self, name: &str, devices: &[&str], free_space: u64) -> &Self {
        self.insert_pool(name, devices, free_space, true)
    }

    /// Add a pool that has to be imported before use
    pub fn add_exported_pool(&self, name: &str, devices: &[&str], free_space: u64) -> &Self {
        self.insert_pool(name, devices, free_space, false)
    }

    fn insert_pool(&self, name: &str, devices: &[&str], free_space: u64, imported: bool) -> &Self {
        let mut state = self.state();
        state.pools.insert(
            name.to_string(),
            MemoryPool {
                imported,
                devices: devices.iter().map(|d| d.to_string()).collect(),
                free_space,
            },
        );
        state.filesystems.entry(name.to_string()).or_default();
        drop(state);
        self
    }

    /// Add a filesystem; missing parents are created as well
    pub fn add_filesystem(&self, name: &str) -> &Self {
        let mut state = self.state();
        let segments: Vec<&str> = name.split('/').collect();
        for i in 1..=segments.len() {
            state.filesystems.entry(segments[..i].join("/")).or_default();
        }
        drop(state);
        self
    }

    /// Add a filesystem flagged for backup through `property=true`
    pub fn add_backup_filesystem(&self, name: &str, property: &str) -> &Self {
        self.add_filesystem(name).set_property(name, property, "true")
    }

    pub fn set_property(&self, filesystem: &str, key: &str, value: &str) -> &Self {
        let mut state = self.state();
        state
            .filesystems
            .entry(filesystem.to_string())
            .or_default()
            .properties
            .insert(key.to_string(), value.to_string());
        drop(state);
        self
    }

    /// Simulate new data on a filesystem
    pub fn write_data(&self, filesystem: &str, bytes: u64) -> &Self {
        let mut state = self.state();
        state.filesystems.entry(filesystem.to_string()).or_default().pending += bytes;
        drop(state);
        self
    }

    /// Add a pre-existing snapshot, optionally held by `hold`
    pub fn add_snapshot(&self, filesystem: &str, label: &str, hold: Option<&str>) -> &Self {
        let mut state = self.state();
        let fs = state.filesystems.entry(filesystem.to_string()).or_default();
        let written = std::mem::take(&mut fs.pending);
        fs.snapshots.push(MemorySnapshot {
            label: label.to_string(),
            written,
            holds: hold.map(|tag| vec![tag.to_string()]).unwrap_or_default(),
        });
        drop(state);
        self
    }

    pub fn set_free_space(&self, pool: &str, bytes: u64) -> &Self {
        if let Some(pool) = self.state().pools.get_mut(pool) {
            pool.free_space = bytes;
        }
        self
    }

    /// Report `bytes` for the size estimate keyed like `Fault::Estimate`
    pub fn set_estimate(&self, key: &str, bytes: u64) -> &Self {
        self.state().estimates.insert(key.to_string(), bytes);
        self
    }

    pub fn inject(&self, fault: Fault) -> &Self {
        self.state().faults.insert(fault);
        self
    }

    pub fn clear_fault(&self, fault: &Fault) -> &Self {
        self.state().faults.remove(fault);
        self
    }

    /// Journal of every call so far
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Snapshot labels of a filesystem, oldest first
    pub fn snapshot_labels(&self, filesystem: &str) -> Vec<String> {
        self.state()
            .filesystems
            .get(filesystem)
            .map(|fs| fs.snapshots.iter().map(|s| s.label.clone()).collect())
            .unwrap_or_default()
    }

    /// Hold tags of `fs@label`
    pub fn holds_of(&self, snapshot: &str) -> Vec<String> {
        let Ok(name) = snapshot.parse::<SnapshotName>() else {
            return Vec::new();
        };
        self.state()
            .filesystems
            .get(&name.filesystem)
            .and_then(|fs| fs.snapshots.iter().find(|s| s.label == name.label))
            .map(|s| s.holds.clone())
            .unwrap_or_default()
    }

    pub fn filesystem_exists(&self, name: &str) -> bool {
        self.state().filesystems.contains_key(name)
    }

    pub fn pool_imported(&self, name: &str) -> bool {
        self.state().pools.get(name).map(|p| p.imported).unwrap_or(false)
    }

    pub fn free_space(&self, pool: &str) -> u64 {
        self.state().pools.get(pool).map(|p| p.free_space).unwrap_or(0)
    }
}

fn stream_key(target: &SnapshotName, base: Option<&SnapshotName>) -> String {
    base.unwrap_or(target).to_string()
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn list_pools(&self) -> Result<Vec<String>> {
        let state = self.record(BackendCall::ListPools);
        state.fail_if(&Fault::ListPools, || Error::Query("zpool list: permission denied".into()))?;
        Ok(state
            .pools
            .iter()
            .filter(|(_, pool)| pool.imported)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn import_pool(&self, name: &str) -> Result<()> {
        let mut state = self.record(BackendCall::ImportPool(name.to_string()));
        state.fail_if(&Fault::ImportPool(name.to_string()), || {
            Error::System(format!("cannot import '{}': I/O error", name))
        })?;
        match state.pools.get_mut(name) {
            Some(pool) if !pool.imported => {
                pool.imported = true;
                Ok(())
            }
            Some(_) => Err(Error::System(format!("cannot import '{}': a pool with that name is already created/imported", name))),
            None => Err(Error::System(format!("cannot import '{}': no such pool available", name))),
        }
    }

    async fn export_pool(&self, name: &str) -> Result<()> {
        let mut state = self.record(BackendCall::ExportPool(name.to_string()));
        match state.pools.get_mut(name) {
            Some(pool) if pool.imported => {
                pool.imported = false;
                Ok(())
            }
            _ => Err(Error::System(format!("cannot open '{}': no such pool", name))),
        }
    }

    async fn pool_devices(&self, name: &str) -> Result<Vec<String>> {
        let state = self.record(BackendCall::PoolDevices(name.to_string()));
        Ok(state.imported_pool(name)?.devices.clone())
    }

    async fn pool_free_space(&self, name: &str) -> Result<u64> {
        let state = self.record(BackendCall::PoolFreeSpace(name.to_string()));
        state.fail_if(&Fault::FreeSpace(name.to_string()), || {
            Error::Query(format!("cannot get available space of '{}'", name))
        })?;
        Ok(state.imported_pool(name)?.free_space)
    }

    async fn list_filesystems(&self, pool: &str) -> Result<Vec<String>> {
        let state = self.record(BackendCall::ListFilesystems(pool.to_string()));
        state.fail_if(&Fault::ListFilesystems(pool.to_string()), || {
            Error::Query(format!("cannot list filesystems of '{}'", pool))
        })?;
        state.imported_pool(pool)?;
        let prefix = format!("{}/", pool);
        Ok(state
            .filesystems
            .keys()
            .filter(|name| name.as_str() == pool || name.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn get_property(&self, filesystem: &str, key: &str) -> Result<String> {
        let state = self.record(BackendCall::GetProperty(filesystem.to_string(), key.to_string()));
        Ok(state
            .filesystem(filesystem)?
            .properties
            .get(key)
            .cloned()
            .unwrap_or_else(|| "-".to_string()))
    }

    async fn list_snapshots(&self, filesystem: &str) -> Result<Vec<SnapshotName>> {
        let state = self.record(BackendCall::ListSnapshots(filesystem.to_string()));
        state.fail_if(&Fault::ListSnapshots(filesystem.to_string()), || {
            Error::Query(format!("cannot list snapshots of '{}'", filesystem))
        })?;
        Ok(state
            .filesystem(filesystem)?
            .snapshots
            .iter()
            .map(|s| SnapshotName::new(filesystem, s.label.clone()))
            .collect())
    }

    async fn create_snapshot(&self, filesystem: &str, label: &str) -> Result<SnapshotName> {
        let snapshot = SnapshotName::new(filesystem, label);
        let mut state = self.record(BackendCall::CreateSnapshot(snapshot.to_string()));
        state.fail_if(&Fault::CreateSnapshot(filesystem.to_string()), || {
            Error::System(format!("cannot create snapshot '{}': out of space", snapshot))
        })?;
        if state.filesystem(filesystem)?.snapshots.iter().any(|s| s.label == label) {
            return Err(Error::System(format!("cannot create snapshot '{}': dataset already exists", snapshot)));
        }
        let fs = state
            .filesystems
            .get_mut(filesystem)
            .ok_or_else(|| Error::System(format!("cannot open '{}'", filesystem)))?;
        let written = std::mem::take(&mut fs.pending);
        fs.snapshots.push(MemorySnapshot {
            label: label.to_string(),
            written,
            holds: Vec::new(),
        });
        Ok(snapshot)
    }

    async fn create_filesystem(&self, pool: &str, path: &str) -> Result<()> {
        let name = format!("{}/{}", pool, path);
        let mut state = self.record(BackendCall::CreateFilesystem(name.clone()));
        state.fail_if(&Fault::CreateFilesystem(name.clone()), || {
            Error::System(format!("cannot create '{}': permission denied", name))
        })?;
        state.imported_pool(pool)?;
        if state.filesystems.contains_key(&name) {
            return Err(Error::System(format!("cannot create '{}': dataset already exists", name)));
        }
        let parent = name.rsplit_once('/').map(|(p, _)| p).unwrap_or(pool);
        if !state.filesystems.contains_key(parent) {
            return Err(Error::System(format!("cannot create '{}': parent does not exist", name)));
        }
        state.filesystems.insert(name, MemoryFilesystem::default());
        Ok(())
    }

    async fn hold(&self, snapshot: &SnapshotName, tag: &str) -> Result<()> {
        let mut state = self.record(BackendCall::Hold(snapshot.to_string()));
        state.fail_if(&Fault::Hold(snapshot.to_string()), || {
            Error::Retention(format!("cannot hold snapshot '{}': permission denied", snapshot))
        })?;
        let snap = state
            .snapshot_mut(snapshot)
            .map_err(|e| Error::Retention(e.to_string()))?;
        if snap.holds.iter().any(|t| t == tag) {
            return Err(Error::Retention(format!("cannot hold snapshot '{}': tag already exists on this dataset", snapshot)));
        }
        snap.holds.push(tag.to_string());
        Ok(())
    }

    async fn release(&self, snapshot: &SnapshotName, tag: &str) -> Result<()> {
        let mut state = self.record(BackendCall::Release(snapshot.to_string()));
        state.fail_if(&Fault::Release(snapshot.to_string()), || {
            Error::Retention(format!("cannot release hold from snapshot '{}': permission denied", snapshot))
        })?;
        let snap = state
            .snapshot_mut(snapshot)
            .map_err(|e| Error::Retention(e.to_string()))?;
        match snap.holds.iter().position(|t| t == tag) {
            Some(index) => {
                snap.holds.remove(index);
                Ok(())
            }
            None => Err(Error::Retention(format!(
                "cannot release hold from snapshot '{}': no such tag on this dataset",
                snapshot
            ))),
        }
    }

    async fn list_holds(&self, snapshot: &SnapshotName) -> Result<Vec<String>> {
        let state = self.record(BackendCall::ListHolds(snapshot.to_string()));
        let index = state.snapshot_index(snapshot)?;
        Ok(state.filesystem(&snapshot.filesystem)?.snapshots[index].holds.clone())
    }

    async fn destroy_snapshot(&self, snapshot: &SnapshotName) -> Result<()> {
        let mut state = self.record(BackendCall::DestroySnapshot(snapshot.to_string()));
        state.fail_if(&Fault::Destroy(snapshot.to_string()), || {
            Error::Retention(format!("cannot destroy snapshot {}: permission denied", snapshot))
        })?;
        let index = state
            .snapshot_index(snapshot)
            .map_err(|e| Error::Retention(e.to_string()))?;
        let fs = state
            .filesystems
            .get_mut(&snapshot.filesystem)
            .ok_or_else(|| Error::Retention(format!("cannot open '{}'", snapshot.filesystem)))?;
        if !fs.snapshots[index].holds.is_empty() {
            return Err(Error::Retention(format!("cannot destroy snapshot {}: dataset is busy", snapshot)));
        }
        let removed = fs.snapshots.remove(index);
        // space held only by this snapshot moves to the next one
        if let Some(next) = fs.snapshots.get_mut(index) {
            next.written += removed.written;
        }
        Ok(())
    }

    async fn estimate_transfer_size(
        &self,
        target: &SnapshotName,
        base: Option<&SnapshotName>,
    ) -> Result<u64> {
        let key = stream_key(target, base);
        let state = self.record(BackendCall::EstimateTransferSize {
            target: target.to_string(),
            base: base.map(ToString::to_string),
        });
        state.fail_if(&Fault::Estimate(key.clone()), || {
            Error::Query(format!("cannot estimate stream size for {}", target))
        })?;
        let size = state.stream_size(target, base)?;
        Ok(state.estimates.get(&key).copied().unwrap_or(size))
    }

    async fn open_send_stream(
        &self,
        target: &SnapshotName,
        base: Option<&SnapshotName>,
    ) -> Result<SendStream> {
        let key = stream_key(target, base);
        let state = self.record(BackendCall::OpenSendStream {
            target: target.to_string(),
            base: base.map(ToString::to_string),
        });
        let planned = if state.faults.contains(&Fault::Send(key)) {
            Err(format!("cannot send {}: I/O error", target))
        } else {
            state
                .stream_size(target, base)
                .map(|size| {
                    let header = StreamHeader {
                        base: base.map(|b| b.label.clone()),
                        label: target.label.clone(),
                    };
                    (header, size)
                })
                .map_err(|e| e.to_string())
        };
        drop(state);

        let (reader, mut writer) = tokio::io::duplex(DUPLEX_BUFFER);
        let stage = match base {
            Some(base) => format!("send -i {} {}", base, target),
            None => format!("send {}", target),
        };
        let task = tokio::spawn(async move {
            let (header, size) = match planned {
                Ok(plan) => plan,
                Err(msg) => return StageExit::failed(Some(1), msg),
            };
            if let Err(e) = write_stream(&mut writer, &header, size).await {
                return StageExit::failed(Some(1), format!("write error: {}", e));
            }
            StageExit::success()
        });

        Ok(SendStream {
            stage,
            reader: Box::new(reader),
            completion: Box::new(TaskCompletion(task)),
        })
    }

    async fn open_receive_sink(&self, pool: &str, filesystem: &str) -> Result<ReceiveSink> {
        let destination = format!("{}/{}", pool, filesystem);
        self.record(BackendCall::OpenReceiveSink(destination.clone()));

        let (mut reader, writer) = tokio::io::duplex(DUPLEX_BUFFER);
        let state = Arc::clone(&self.state);
        let stage = format!("recv {}", destination);
        let task = tokio::spawn(async move {
            let mut data = Vec::new();
            if let Err(e) = reader.read_to_end(&mut data).await {
                return StageExit::failed(Some(1), format!("read error: {}", e));
            }
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.faults.contains(&Fault::Receive(destination.clone())) {
                return StageExit::failed(Some(1), format!("cannot receive: failed to write to {}", destination));
            }
            let Some((header, body)) = StreamHeader::decode(&data) else {
                return StageExit::failed(Some(1), "cannot receive: invalid backup stream");
            };
            match state.apply_stream(&destination, &header, body) {
                Ok(()) => StageExit::success(),
                Err(msg) => StageExit::failed(Some(1), msg),
            }
        });

        Ok(ReceiveSink {
            stage,
            writer: Box::new(writer),
            completion: Box::new(TaskCompletion(task)),
        })
    }
}

async fn write_stream(
    writer: &mut tokio::io::DuplexStream,
    header: &StreamHeader,
    size: u64,
) -> std::io::Result<()> {
    writer.write_all(header.encode().as_bytes()).await?;
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(ZERO_CHUNK.len() as u64) as usize;
        writer.write_all(&ZERO_CHUNK[..n]).await?;
        remaining -= n as u64;
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.add_pool("tank", &["ada0"], 10_000).add_pool("backup", &["ada1"], 10_000);
        backend.add_filesystem("tank/data").write_data("tank/data", 100);
        backend
    }

    #[test]
    fn test_stream_header() {
        let header = StreamHeader {
            base: Some("backup_1".to_string()),
            label: "backup_2".to_string(),
        };
        let mut data = header.encode().into_bytes();
        data.extend_from_slice(&[0u8; 10]);
        assert_eq!(StreamHeader::decode(&data), Some((header, 10)));
        assert_eq!(StreamHeader::decode(b""), None);
        assert_eq!(StreamHeader::decode(b"garbage\n"), None);
    }

    #[tokio::test]
    async fn test_snapshot_accounting() {
        let backend = backend();
        let first = backend.create_snapshot("tank/data", "backup_1").await.unwrap();
        backend.write_data("tank/data", 30);
        let second = backend.create_snapshot("tank/data", "backup_2").await.unwrap();

        assert_eq!(backend.estimate_transfer_size(&second, None).await.unwrap(), 130);
        assert_eq!(backend.estimate_transfer_size(&second, Some(&first)).await.unwrap(), 30);
        assert!(backend.estimate_transfer_size(&first, Some(&second)).await.is_err());
        assert_eq!(backend.snapshot_labels("tank/data"), vec!["backup_1", "backup_2"]);
    }

    #[tokio::test]
    async fn test_held_snapshot_cannot_be_destroyed() {
        let backend = backend();
        let snap = backend.create_snapshot("tank/data", "backup_1").await.unwrap();
        backend.hold(&snap, "holdfast:backup").await.unwrap();
        assert!(backend.hold(&snap, "holdfast:backup").await.is_err());

        let err = backend.destroy_snapshot(&snap).await.unwrap_err();
        assert!(err.to_string().contains("dataset is busy"));

        backend.release(&snap, "holdfast:backup").await.unwrap();
        assert!(backend.release(&snap, "holdfast:backup").await.is_err());
        backend.destroy_snapshot(&snap).await.unwrap();
        assert!(backend.snapshot_labels("tank/data").is_empty());
    }

    #[tokio::test]
    async fn test_create_filesystem_requires_parent() {
        let backend = backend();
        assert!(backend.create_filesystem("backup", "tank/data").await.is_err());
        backend.create_filesystem("backup", "tank").await.unwrap();
        backend.create_filesystem("backup", "tank/data").await.unwrap();
        assert!(backend.filesystem_exists("backup/tank/data"));
    }

    #[tokio::test]
    async fn test_import_export() {
        let backend = MemoryBackend::new();
        backend.add_exported_pool("usb", &["da0"], 100);
        assert!(backend.list_pools().await.unwrap().is_empty());
        assert!(backend.list_filesystems("usb").await.is_err());

        backend.import_pool("usb").await.unwrap();
        assert_eq!(backend.list_pools().await.unwrap(), vec!["usb"]);
        assert!(backend.import_pool("usb").await.is_err());

        backend.export_pool("usb").await.unwrap();
        assert!(!backend.pool_imported("usb"));
    }

    #[tokio::test]
    async fn test_faults_and_journal() {
        let backend = backend();
        backend.inject(Fault::CreateSnapshot("tank/data".to_string()));
        assert!(backend.create_snapshot("tank/data", "backup_1").await.is_err());
        backend.clear_fault(&Fault::CreateSnapshot("tank/data".to_string()));
        assert!(backend.create_snapshot("tank/data", "backup_1").await.is_ok());

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(BackendCall::is_mutating));
        assert!(!BackendCall::ListPools.is_mutating());
    }

    #[test]
    fn test_filesystems_listed_parent_first() {
        let backend = MemoryBackend::new();
        backend.add_pool("tank", &[], 0);
        backend.add_filesystem("tank/a/b").add_filesystem("tank/a-x").add_filesystem("tank/a");
        let names: Vec<String> = backend.state().filesystems.keys().cloned().collect();
        assert_eq!(names, vec!["tank", "tank/a", "tank/a-x", "tank/a/b"]);
    }
}
