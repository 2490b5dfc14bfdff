use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::backup::{self, BackupDecision};
use crate::codec::ArchiveCodec;
use crate::config::{InstallPaths, PackageManager, Platform};
use crate::deps::DependencyInstaller;
use crate::detect::{MarkerSignature, PatchDetector};
use crate::error::PatchError;
use crate::process::{ProcessControl, Termination};
use crate::util;
use crate::workspace::Workspace;
use crate::wrapper::WrapperSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStep {
    KillTarget,
    DetectExistingPatch,
    CreateOrReuseBackup,
    PrepareWorkspace,
    ExtractArchive,
    IsolateOriginalEntry,
    InstallInjectedEntry,
    RefreshDependencies,
    RepackArchive,
    InstallPatchedArchive,
    Cleanup,
}

impl PatchStep {
    pub const COUNT: usize = 11;

    pub fn number(&self) -> usize {
        *self as usize + 1
    }

    pub fn describe(&self) -> &'static str {
        match self {
            PatchStep::KillTarget => "Stopping running application",
            PatchStep::DetectExistingPatch => "Checking for an existing patch",
            PatchStep::CreateOrReuseBackup => "Securing backup",
            PatchStep::PrepareWorkspace => "Preparing workspace",
            PatchStep::ExtractArchive => "Extracting archive",
            PatchStep::IsolateOriginalEntry => "Moving original entry script aside",
            PatchStep::InstallInjectedEntry => "Installing injection wrapper",
            PatchStep::RefreshDependencies => "Installing dependencies",
            PatchStep::RepackArchive => "Repacking archive",
            PatchStep::InstallPatchedArchive => "Replacing live archive",
            PatchStep::Cleanup => "Cleaning up",
        }
    }
}

impl fmt::Display for PatchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Asks the user a yes/no question. Blocks until answered.
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("Failed to read confirmation")
    }
}

/// Answers yes without asking (`--yes`).
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        println!("{prompt} [assumed yes]");
        Ok(true)
    }
}

/// Everything one invocation needs to know about its target.
#[derive(Debug)]
pub struct PatchSession {
    pub platform: Platform,
    pub paths: InstallPaths,
    pub workspace: Workspace,
    pub use_existing_backup: bool,
    pub package_manager: PackageManager,
    /// Entry script, relative to the archive root.
    pub entry_script: PathBuf,
    pub original_entry: String,
    pub wrapper: WrapperSource,
    pub markers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Patched { backup: BackupDecision },
    /// The user declined to re-patch; nothing was changed.
    Cancelled,
}

pub struct Orchestrator<'a> {
    pub codec: &'a dyn ArchiveCodec,
    pub processes: &'a dyn ProcessControl,
    pub installer: &'a dyn DependencyInstaller,
    pub confirm: &'a dyn Confirm,
}

impl Orchestrator<'_> {
    /// Run the whole pipeline, then remove the workspace whatever the result.
    pub async fn run(&self, session: &mut PatchSession) -> Result<PatchOutcome> {
        let result = self.run_steps(session).await;

        announce(PatchStep::Cleanup);
        match session.workspace.cleanup() {
            Ok(()) => println!("      done"),
            Err(e) => error!(
                path = %session.workspace.path().display(),
                error = %format!("{e:#}"),
                "failed to remove workspace"
            ),
        }
        result
    }

    async fn run_steps(&self, s: &mut PatchSession) -> Result<PatchOutcome> {
        let termination = self
            .step(PatchStep::KillTarget, async {
                info!(platform = %s.platform, process = %s.paths.image_name, "looking for running instance");
                Ok(self.processes.terminate(&s.paths.image_name).await)
            })
            .await?;
        if termination == Termination::Unknown {
            warn!("continuing without confirming the application is closed");
        }

        let proceed = self
            .step(PatchStep::DetectExistingPatch, self.detect(s))
            .await?;
        if !proceed {
            info!("re-patch declined; nothing changed");
            return Ok(PatchOutcome::Cancelled);
        }

        let decision = self
            .step(PatchStep::CreateOrReuseBackup, async {
                backup::ensure_backup(&s.paths.archive, &s.paths.backup, s.use_existing_backup)
            })
            .await?;

        let wrapper = self
            .step(PatchStep::PrepareWorkspace, async {
                s.workspace.prepare()?;
                s.wrapper
                    .stage(&s.workspace.wrapper_dir(), &s.original_entry)
            })
            .await?;

        self.step(PatchStep::ExtractArchive, self.extract(s)).await?;
        self.step(PatchStep::IsolateOriginalEntry, async { isolate_entry(s) })
            .await?;
        self.step(PatchStep::InstallInjectedEntry, async {
            install_wrapper(s, &wrapper)
        })
        .await?;
        self.step(PatchStep::RefreshDependencies, self.refresh_dependencies(s))
            .await?;
        self.step(PatchStep::RepackArchive, self.repack(s)).await?;
        self.step(PatchStep::InstallPatchedArchive, async {
            replace_live_archive(s)
        })
        .await?;

        Ok(PatchOutcome::Patched { backup: decision })
    }

    async fn step<T>(&self, step: PatchStep, work: impl Future<Output = Result<T>>) -> Result<T> {
        announce(step);
        match work.await {
            Ok(value) => {
                println!("      done");
                Ok(value)
            }
            Err(source) => {
                error!(step = %step, error = %format!("{source:#}"), "step failed");
                Err(PatchError::Step { step, source }.into())
            }
        }
    }

    /// Returns whether the pipeline should go on.
    async fn detect(&self, s: &mut PatchSession) -> Result<bool> {
        if !s.paths.archive.is_file() {
            return Err(PatchError::ArchiveNotFound {
                path: s.paths.archive.clone(),
            }
            .into());
        }

        let detector = PatchDetector::new(
            self.codec,
            s.entry_script.clone(),
            Box::new(MarkerSignature::new(s.markers.clone())),
        );
        if !detector.is_patched(&s.paths.archive).await {
            s.use_existing_backup = false;
            return Ok(true);
        }

        if !s.paths.backup.is_file() {
            return Err(PatchError::PatchedWithoutBackup {
                archive: s.paths.archive.clone(),
                backup: s.paths.backup.clone(),
            }
            .into());
        }

        let prompt = format!(
            "{} is already patched. Re-patch from the backup at {}?",
            s.paths.archive.display(),
            s.paths.backup.display()
        );
        let confirmed = self.confirm.confirm(&prompt)?;
        s.use_existing_backup = confirmed;
        Ok(confirmed)
    }

    async fn extract(&self, s: &PatchSession) -> Result<()> {
        let source = if s.use_existing_backup {
            &s.paths.backup
        } else {
            &s.paths.archive
        };
        info!(source = %source.display(), "extracting");
        self.codec.extract(source, &s.workspace.tree()).await
    }

    async fn refresh_dependencies(&self, s: &PatchSession) -> Result<()> {
        let tree = s.workspace.tree();
        util::remove_dir_if_exists(&tree.join("node_modules"))?;
        info!(manager = %s.package_manager, "installing dependencies");
        self.installer.install(&tree).await
    }

    async fn repack(&self, s: &PatchSession) -> Result<()> {
        let output = s.workspace.output_archive();
        self.codec.pack(&s.workspace.tree(), &output).await?;
        if !output.is_file() {
            bail!("Packing produced no archive at {}", output.display());
        }
        Ok(())
    }
}

fn announce(step: PatchStep) {
    println!(
        "[{}/{}] {}...",
        step.number(),
        PatchStep::COUNT,
        step.describe()
    );
}

fn isolate_entry(s: &PatchSession) -> Result<()> {
    let entry = s.workspace.tree().join(&s.entry_script);
    if !entry.is_file() {
        return Err(PatchError::EntryScriptMissing { path: entry }.into());
    }
    let original = entry.with_file_name(&s.original_entry);
    fs::rename(&entry, &original).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            entry.display(),
            original.display()
        )
    })
}

fn install_wrapper(s: &PatchSession, wrapper: &std::path::Path) -> Result<()> {
    if !wrapper.is_file() {
        return Err(PatchError::WrapperMissing {
            path: wrapper.to_path_buf(),
        }
        .into());
    }
    let entry = s.workspace.tree().join(&s.entry_script);
    fs::copy(wrapper, &entry)
        .with_context(|| format!("Failed to copy wrapper to {}", entry.display()))?;
    Ok(())
}

/// Copy the new archive next to the live one, then rename it over the live path.
fn replace_live_archive(s: &PatchSession) -> Result<()> {
    let live = &s.paths.archive;
    let mut staged_name = live
        .file_name()
        .context("Live archive path has no file name")?
        .to_os_string();
    staged_name.push(".adpatch-new");
    let staged = live.with_file_name(staged_name);

    let installed = fs::copy(s.workspace.output_archive(), &staged)
        .with_context(|| format!("Failed to stage archive at {}", staged.display()))
        .and_then(|_| {
            fs::rename(&staged, live)
                .with_context(|| format!("Failed to replace {}", live.display()))
        });
    if let Err(e) = installed {
        let _ = fs::remove_file(&staged);
        return Err(e);
    }
    info!(archive = %live.display(), "live archive replaced");
    Ok(())
}
