//! Local executable runner for container vertices in exec mode.
//!
//! The executable reads a resource context document on stdin and writes the
//! transformed document to stdout. Running local binaries is a privileged
//! operation; configuration load rejects the exec path for service images.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use weft_proxy::ResourceContext;

/// Default bound on a local function run.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ExecRunner {
    path: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExecRunner {
    /// Split a command line into path and arguments.
    pub fn parse(command: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let path = parts.next().ok_or_else(|| anyhow!("empty exec command"))?;
        Ok(Self {
            path,
            args: parts.collect(),
            timeout: timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT),
        })
    }

    /// Run the executable once over a resource context.
    pub async fn run(&self, rctx: &ResourceContext) -> Result<ResourceContext> {
        debug!(path = %self.path, "local function run");
        let mut child = Command::new(&self.path)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("cannot spawn {}", self.path))?;

        let payload = serde_json::to_vec(rctx).context("serializing resource context")?;
        {
            let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("child stdin unavailable"))?;
            stdin.write_all(&payload).await.context("writing function input")?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("function {} timed out after {:?}", self.path, self.timeout))?
            .context("waiting for function")?;

        if !output.status.success() {
            bail!(
                "function {} failed with {}: {}",
                self.path,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        serde_json::from_slice(&output.stdout).context("parsing function output")
    }
}
