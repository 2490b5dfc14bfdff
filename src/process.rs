use anyhow::{Context, Result};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Platform;
use crate::error::PatchError;

/// Time a graceful termination gets before it is escalated.
const GRACE_PERIOD: Duration = Duration::from_millis(1500);

/// Longest process name Linux exposes to `pgrep`/`pkill` name matching.
const LINUX_COMM_LEN: usize = 15;

/// Run an external tool to completion with inherited stdio.
///
/// A non-zero exit becomes [`PatchError::ToolFailed`]; a spawn failure is
/// reported with the program name as context.
pub async fn run_tool<S: AsRef<OsStr>>(
    program: &Path,
    args: &[S],
    cwd: Option<&Path>,
    env_remove: &[&str],
) -> Result<()> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for key in env_remove {
        cmd.env_remove(key);
    }

    debug!(
        program = %program.display(),
        args = ?args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()).collect::<Vec<_>>(),
        cwd = ?cwd,
        "running external tool"
    );

    let status = cmd
        .status()
        .await
        .with_context(|| format!("Failed to run {}", program.display()))?;
    if !status.success() {
        return Err(PatchError::ToolFailed {
            tool: program.display().to_string(),
            status,
        }
        .into());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    NotRunning,
    Graceful,
    Forced,
    /// Detection or killing failed; the caller proceeds as if nothing was running.
    Unknown,
}

#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Stop every instance of `image_name`. Never fails.
    async fn terminate(&self, image_name: &str) -> Termination;
}

pub struct SystemProcesses {
    pub platform: Platform,
    /// Wait after a kill so the OS releases file handles on the archive.
    pub settle_delay: Duration,
}

impl SystemProcesses {
    /// The name `pgrep`/`pkill` will see for `image_name` on this platform.
    fn match_name<'n>(&self, image_name: &'n str) -> &'n str {
        if self.platform != Platform::Linux || image_name.len() <= LINUX_COMM_LEN {
            return image_name;
        }
        let mut end = LINUX_COMM_LEN;
        while !image_name.is_char_boundary(end) {
            end -= 1;
        }
        &image_name[..end]
    }

    async fn probe(&self, program: &str, args: &[&str]) -> Result<std::process::Output> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {program}"))
    }

    async fn is_running(&self, image_name: &str) -> Result<bool> {
        match self.platform {
            Platform::Windows => {
                let filter = format!("IMAGENAME eq {image_name}");
                let output = self
                    .probe("tasklist", &["/FI", &filter, "/NH", "/FO", "CSV"])
                    .await?;
                let listing = String::from_utf8_lossy(&output.stdout).to_ascii_lowercase();
                Ok(listing.contains(&format!("\"{}\"", image_name.to_ascii_lowercase())))
            }
            Platform::MacOs | Platform::Linux => {
                let output = self
                    .probe("pgrep", &["-x", self.match_name(image_name)])
                    .await?;
                // pgrep: 0 = match, 1 = no match, anything else is an error
                match output.status.code() {
                    Some(0) => Ok(true),
                    Some(1) => Ok(false),
                    _ => anyhow::bail!(
                        "pgrep failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                }
            }
        }
    }

    async fn kill(&self, image_name: &str, force: bool) -> Result<()> {
        let output = match (self.platform, force) {
            (Platform::Windows, false) => self.probe("taskkill", &["/IM", image_name]).await?,
            (Platform::Windows, true) => {
                self.probe("taskkill", &["/F", "/IM", image_name]).await?
            }
            (_, false) => {
                self.probe("pkill", &["-TERM", "-x", self.match_name(image_name)])
                    .await?
            }
            (_, true) => {
                self.probe("pkill", &["-KILL", "-x", self.match_name(image_name)])
                    .await?
            }
        };
        if !output.status.success() {
            anyhow::bail!(
                "kill exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn try_terminate(&self, image_name: &str) -> Result<Termination> {
        let matched = self.match_name(image_name);
        if matched != image_name {
            debug!(process = image_name, matched, "matching on the truncated process name");
        }
        if !self.is_running(image_name).await? {
            return Ok(Termination::NotRunning);
        }

        info!(process = image_name, "stopping running instance");
        let graceful = match self.kill(image_name, false).await {
            Ok(()) => {
                tokio::time::sleep(GRACE_PERIOD).await;
                !self.is_running(image_name).await?
            }
            Err(e) => {
                debug!(process = image_name, error = %e, "graceful termination failed");
                false
            }
        };

        let outcome = if graceful {
            Termination::Graceful
        } else {
            warn!(process = image_name, "forcing termination");
            self.kill(image_name, true).await?;
            Termination::Forced
        };

        tokio::time::sleep(self.settle_delay).await;
        Ok(outcome)
    }
}

#[async_trait]
impl ProcessControl for SystemProcesses {
    async fn terminate(&self, image_name: &str) -> Termination {
        match self.try_terminate(image_name).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(process = image_name, error = %format!("{e:#}"), "could not stop target process; continuing");
                Termination::Unknown
            }
        }
    }
}
