//! ZFS command adapter
//!
//! Implements the storage backend on top of the `zpool` and `zfs` command
//! line tools. Command assembly and output parsing stay inside this module.

use super::command::{CommandLine, CommandOutput};
use super::{ReceiveSink, SendStream, StorageBackend};
use async_trait::async_trait;
use holdfast_common::{Error, Result, SnapshotName};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Locations of the ZFS tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPaths {
    pub zfs: String,
    pub zpool: String,
    /// Wrapper for pool import/export, e.g. `sudo`
    pub privileged: Option<String>,
}

impl Default for CommandPaths {
    fn default() -> Self {
        Self {
            zfs: "zfs".to_string(),
            zpool: "zpool".to_string(),
            privileged: None,
        }
    }
}

/// Storage backend driving the local ZFS tools
#[derive(Debug, Clone, Default)]
pub struct ZfsBackend {
    paths: CommandPaths,
}

impl ZfsBackend {
    pub fn new(paths: CommandPaths) -> Self {
        Self { paths }
    }

    fn zfs(&self) -> CommandLine {
        CommandLine::new(&self.paths.zfs)
    }

    fn zpool(&self) -> CommandLine {
        CommandLine::new(&self.paths.zpool)
    }

    fn privileged_zpool(&self) -> CommandLine {
        self.zpool().prefixed(self.paths.privileged.as_deref())
    }

    /// Run a listing command, mapping non-zero exit to `Error::Query`
    async fn query(&self, cmd: CommandLine) -> Result<String> {
        let output = cmd.run().await?;
        if !output.success() {
            return Err(Error::Query(format!("{}: {}", cmd, output.diagnostics())));
        }
        Ok(output.stdout)
    }

    /// Run a mutating command, mapping non-zero exit through `err`
    async fn mutate(&self, cmd: CommandLine, err: fn(String) -> Error) -> Result<CommandOutput> {
        let output = cmd.run().await?;
        if !output.success() {
            return Err(err(format!("{}: {}", cmd, output.diagnostics())));
        }
        Ok(output)
    }

    fn send_command(target: &SnapshotName, base: Option<&SnapshotName>) -> Vec<String> {
        let mut args = vec!["send".to_string()];
        if let Some(base) = base {
            args.push("-i".to_string());
            args.push(base.to_string());
        }
        args.push(target.to_string());
        args
    }
}

#[async_trait]
impl StorageBackend for ZfsBackend {
    async fn list_pools(&self) -> Result<Vec<String>> {
        let stdout = self.query(self.zpool().args(["list", "-H", "-o", "name"])).await?;
        Ok(parse_lines(&stdout))
    }

    async fn import_pool(&self, name: &str) -> Result<()> {
        self.mutate(self.privileged_zpool().args(["import", name]), Error::System)
            .await
            .map(|_| ())
    }

    async fn export_pool(&self, name: &str) -> Result<()> {
        self.mutate(self.privileged_zpool().args(["export", name]), Error::System)
            .await
            .map(|_| ())
    }

    async fn pool_devices(&self, name: &str) -> Result<Vec<String>> {
        let stdout = self
            .query(self.zpool().args(["list", "-H", "-v", "-o", "name", name]))
            .await?;
        let devices = parse_devices(&stdout);
        debug!("devices in {}: {:?}", name, devices);
        Ok(devices)
    }

    async fn pool_free_space(&self, name: &str) -> Result<u64> {
        let stdout = self
            .query(self.zfs().args(["get", "-H", "-p", "-o", "value", "available", name]))
            .await?;
        stdout
            .trim()
            .parse::<u64>()
            .map_err(|_| Error::Query(format!("unexpected free space for {}: {:?}", name, stdout.trim())))
    }

    async fn list_filesystems(&self, pool: &str) -> Result<Vec<String>> {
        let stdout = self
            .query(self.zfs().args(["list", "-H", "-r", "-t", "filesystem", "-o", "name", pool]))
            .await?;
        Ok(parse_lines(&stdout))
    }

    async fn get_property(&self, filesystem: &str, key: &str) -> Result<String> {
        let stdout = self
            .query(self.zfs().args(["get", "-H", "-o", "value", key, filesystem]))
            .await?;
        Ok(stdout.trim().to_string())
    }

    async fn list_snapshots(&self, filesystem: &str) -> Result<Vec<SnapshotName>> {
        let stdout = self
            .query(self.zfs().args([
                "list", "-H", "-t", "snapshot", "-o", "name", "-s", "creation", "-d", "1", filesystem,
            ]))
            .await?;
        parse_lines(&stdout)
            .iter()
            .map(|line| line.parse::<SnapshotName>())
            .collect()
    }

    async fn create_snapshot(&self, filesystem: &str, label: &str) -> Result<SnapshotName> {
        let snapshot = SnapshotName::new(filesystem, label);
        self.mutate(self.zfs().args(["snapshot".to_string(), snapshot.to_string()]), Error::System)
            .await?;
        Ok(snapshot)
    }

    async fn create_filesystem(&self, pool: &str, path: &str) -> Result<()> {
        self.mutate(self.zfs().args(["create".to_string(), format!("{}/{}", pool, path)]), Error::System)
            .await
            .map(|_| ())
    }

    async fn hold(&self, snapshot: &SnapshotName, tag: &str) -> Result<()> {
        self.mutate(
            self.zfs().args(["hold".to_string(), tag.to_string(), snapshot.to_string()]),
            Error::Retention,
        )
        .await
        .map(|_| ())
    }

    async fn release(&self, snapshot: &SnapshotName, tag: &str) -> Result<()> {
        self.mutate(
            self.zfs().args(["release".to_string(), tag.to_string(), snapshot.to_string()]),
            Error::Retention,
        )
        .await
        .map(|_| ())
    }

    async fn list_holds(&self, snapshot: &SnapshotName) -> Result<Vec<String>> {
        let stdout = self
            .query(self.zfs().args(["holds".to_string(), "-H".to_string(), snapshot.to_string()]))
            .await?;
        Ok(parse_holds(&stdout))
    }

    async fn destroy_snapshot(&self, snapshot: &SnapshotName) -> Result<()> {
        self.mutate(self.zfs().args(["destroy".to_string(), snapshot.to_string()]), Error::Retention)
            .await
            .map(|_| ())
    }

    async fn estimate_transfer_size(
        &self,
        target: &SnapshotName,
        base: Option<&SnapshotName>,
    ) -> Result<u64> {
        let mut args = vec!["send".to_string(), "-n".to_string(), "-P".to_string()];
        args.extend(Self::send_command(target, base).into_iter().skip(1));
        let cmd = self.zfs().args(args);

        let output = cmd.run().await?;
        if !output.success() {
            return Err(Error::Query(format!("{}: {}", cmd, output.diagnostics())));
        }
        parse_send_size(&output.stdout)
            .or_else(|| parse_send_size(&output.stderr))
            .ok_or_else(|| Error::Query(format!("no size reported by {}", cmd)))
    }

    async fn open_send_stream(
        &self,
        target: &SnapshotName,
        base: Option<&SnapshotName>,
    ) -> Result<SendStream> {
        let cmd = self.zfs().args(Self::send_command(target, base));
        let (stdout, completion) = cmd.spawn_reader()?;
        Ok(SendStream {
            stage: cmd.to_string(),
            reader: Box::new(stdout),
            completion: Box::new(completion),
        })
    }

    async fn open_receive_sink(&self, pool: &str, filesystem: &str) -> Result<ReceiveSink> {
        let cmd = self
            .zfs()
            .args(["recv".to_string(), format!("{}/{}", pool, filesystem)]);
        let (stdin, completion) = cmd.spawn_writer()?;
        Ok(ReceiveSink {
            stage: cmd.to_string(),
            writer: Box::new(stdin),
            completion: Box::new(completion),
        })
    }
}

/// One trimmed, non-empty entry per line
fn parse_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// `zpool list -Hv -o name`: the pool itself, then one vdev/device per line
fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// `zfs holds -H`: snapshot, tag, timestamp
fn parse_holds(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Parsable `zfs send -nP` output ends with `size\t<bytes>`
fn parse_send_size(output: &str) -> Option<u64> {
    output
        .lines()
        .filter(|line| line.starts_with("size"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .find_map(|value| value.parse::<u64>().ok())
}
