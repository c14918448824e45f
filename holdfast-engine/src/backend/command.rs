//! Process execution primitive
//!
//! Runs a program to completion capturing stdout, stderr and the exit
//! status, or spawns it as one end of a streaming pipeline.

use super::{StageCompletion, StageExit};
use async_trait::async_trait;
use holdfast_common::{Error, Result};
use std::fmt;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Trimmed stderr, or the exit status when stderr is empty
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            match self.code {
                Some(code) => format!("exit status {}", code),
                None => "terminated by signal".to_string(),
            }
        } else {
            stderr.to_string()
        }
    }
}

/// Program plus arguments, without a shell in between
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run through a wrapper such as `sudo`
    pub fn prefixed(self, prefix: Option<&str>) -> Self {
        match prefix {
            Some(wrapper) if !wrapper.is_empty() => {
                let mut args = Vec::with_capacity(self.args.len() + 1);
                args.push(self.program);
                args.extend(self.args);
                Self {
                    program: wrapper.to_string(),
                    args,
                }
            }
            _ => self,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        cmd
    }

    /// Run to completion
    pub async fn run(&self) -> Result<CommandOutput> {
        tracing::trace!(command = %self, "running command");
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::System(format!("Failed to run {}: {}", self.program, e)))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code(),
        })
    }

    /// Spawn with stdout piped, for the producing end of a pipeline
    pub fn spawn_reader(&self) -> Result<(ChildStdout, ChildCompletion)> {
        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::System(format!("Failed to start {}: {}", self, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::System(format!("Failed to capture stdout of {}", self)))?;
        Ok((stdout, ChildCompletion::new(child)))
    }

    /// Spawn with stdin piped, for the consuming end of a pipeline
    pub fn spawn_writer(&self) -> Result<(ChildStdin, ChildCompletion)> {
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::System(format!("Failed to start {}: {}", self, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::System(format!("Failed to capture stdin of {}", self)))?;
        Ok((stdin, ChildCompletion::new(child)))
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Child process of a pipeline stage. Stderr is drained on its own task so
/// a chatty stage cannot stall on a full pipe.
pub struct ChildCompletion {
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

impl ChildCompletion {
    fn new(mut child: Child) -> Self {
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });
        Self { child, stderr }
    }
}

#[async_trait]
impl StageCompletion for ChildCompletion {
    async fn wait(mut self: Box<Self>) -> StageExit {
        let status = self.child.wait().await;
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        match status {
            Ok(status) => StageExit {
                code: status.code(),
                diagnostics: stderr.trim().to_string(),
            },
            Err(e) => StageExit::failed(None, format!("failed to wait for stage: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_display() {
        let cmd = CommandLine::new("zfs").args(["send", "-i", "tank@a", "tank@b"]);
        assert_eq!(cmd.to_string(), "zfs send -i tank@a tank@b");
    }

    #[test]
    fn test_prefixed() {
        let cmd = CommandLine::new("zpool").arg("import").arg("backup");
        let sudo = cmd.clone().prefixed(Some("sudo"));
        assert_eq!(sudo.program, "sudo");
        assert_eq!(sudo.args, vec!["zpool", "import", "backup"]);
        assert_eq!(cmd.clone().prefixed(None), cmd);
        assert_eq!(cmd.clone().prefixed(Some("")), cmd);
    }

    #[test]
    fn test_diagnostics_fallback() {
        let output = CommandOutput {
            stdout: String::new(),
            stderr: "  \n".to_string(),
            code: Some(2),
        };
        assert_eq!(output.diagnostics(), "exit status 2");
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command() {
        let output = CommandLine::new("echo").arg("hello test").run().await.unwrap();
        assert!(output.stdout.contains("hello test"));
        assert_eq!(output.stderr, "");
        assert!(output.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_missing_program() {
        let result = CommandLine::new("/nonexistent/holdfast-test-binary").run().await;
        assert!(matches!(result, Err(Error::System(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_pipeline_stages() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut stdout, producer) = CommandLine::new("echo").arg("stream").spawn_reader().unwrap();
        let mut data = Vec::new();
        stdout.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"stream\n");
        assert!(Box::new(producer).wait().await.is_success());

        let (mut stdin, consumer) = CommandLine::new("sh")
            .args(["-c", "cat >/dev/null; echo refused >&2; exit 3"])
            .spawn_writer()
            .unwrap();
        stdin.write_all(b"payload").await.unwrap();
        drop(stdin);
        let exit = Box::new(consumer).wait().await;
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.diagnostics, "refused");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stage_diagnostics_survive_invalid_utf8() {
        let (_stdout, producer) = CommandLine::new("sh")
            .args(["-c", "printf '\\377cannot open' >&2; exit 1"])
            .spawn_reader()
            .unwrap();
        let exit = Box::new(producer).wait().await;
        assert_eq!(exit.code, Some(1));
        assert!(exit.diagnostics.ends_with("cannot open"), "{:?}", exit.diagnostics);
        assert!(exit.diagnostics.starts_with('\u{FFFD}'));
    }
}
