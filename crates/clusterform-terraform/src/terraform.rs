//! terraform CLI wrapper
//!
//! Runs terraform in a working directory, forwarding its output to tracing
//! line by line while it runs.

use crate::error::{Result, TerraformError};
use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Number of trailing stderr lines kept for error messages
const STDERR_TAIL: usize = 20;

/// terraform CLI wrapper
#[derive(Debug, Clone)]
pub struct Terraform {
    binary: String,
    envs: Vec<(String, String)>,
}

impl Default for Terraform {
    fn default() -> Self {
        Self::new("terraform")
    }
}

impl Terraform {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            envs: vec![("TF_IN_AUTOMATION".to_string(), "1".to_string())],
        }
    }

    /// Add an environment variable for every terraform invocation
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn command(&self, dir: Option<&Path>, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    fn spawn_error(&self, error: std::io::Error) -> TerraformError {
        if error.kind() == std::io::ErrorKind::NotFound {
            TerraformError::TerraformNotFound(self.binary.clone())
        } else {
            error.into()
        }
    }

    /// Run `terraform <args>` in `dir`; any non-zero exit is an error
    ///
    /// Always waits for the child to exit, whatever it prints.
    pub async fn run(&self, dir: &Path, args: &[&str]) -> Result<()> {
        let command_line = format!("{} {}", self.binary, args.join(" "));
        tracing::debug!("Running: {} (in {})", command_line, dir.display());

        let mut child = self
            .command(Some(dir), args)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, _, tail) = tokio::join!(
            child.wait(),
            forward_lines(stdout, false),
            forward_lines(stderr, true),
        );
        let status = status?;

        if !status.success() {
            return Err(TerraformError::CommandFailed {
                command: command_line,
                status: describe(status),
                stderr: tail.into_iter().collect::<Vec<_>>().join("\n"),
            });
        }
        Ok(())
    }

    /// First line of `terraform version`
    pub async fn version(&self) -> Result<String> {
        let output = self
            .command(None, &["version"])
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        if !output.status.success() {
            return Err(TerraformError::CommandFailed {
                command: format!("{} version", self.binary),
                status: describe(output.status),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string())
    }
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

/// Log each line of a child stream, keeping the last few when `keep_tail`
///
/// Lines are decoded lossily. A read error stops logging but the rest of
/// the stream is still drained so the child never blocks on a full pipe.
async fn forward_lines<R>(stream: Option<R>, keep_tail: bool) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::new();
    let Some(stream) = stream else {
        return tail;
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if keep_tail {
                    tracing::warn!(target: "terraform", "{}", line);
                    push_tail(&mut tail, line.to_string());
                } else {
                    tracing::info!(target: "terraform", "{}", line);
                }
            }
            Err(e) => {
                tracing::warn!("Failed to read terraform output: {}", e);
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    tracing::debug!("Discarding terraform output failed: {}", e);
                }
                break;
            }
        }
    }
    tail
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if line.trim().is_empty() {
        return;
    }
    if tail.len() == STDERR_TAIL {
        tail.pop_front();
    }
    tail.push_back(line);
}
