use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::orchestrator::PatchStep;

/// Failures the binary distinguishes when choosing what to tell the user.
///
/// Anything else bubbling up through `anyhow` is reported verbatim.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Archive not found: {}", path.display())]
    ArchiveNotFound { path: PathBuf },

    #[error("Unsupported platform: {os}")]
    UnsupportedPlatform { os: String },

    #[error(
        "{} is already patched but no backup exists at {}; restore the original archive (e.g. reinstall the application) and run again",
        archive.display(),
        backup.display()
    )]
    PatchedWithoutBackup { archive: PathBuf, backup: PathBuf },

    #[error("Entry script not found in archive: {}", path.display())]
    EntryScriptMissing { path: PathBuf },

    #[error("Injection wrapper not found: {}", path.display())]
    WrapperMissing { path: PathBuf },

    #[error("{tool} exited with {status}")]
    ToolFailed { tool: String, status: ExitStatus },

    #[error("Step '{step}' failed")]
    Step {
        step: PatchStep,
        #[source]
        source: anyhow::Error,
    },
}

impl PatchError {
    /// The step a failure happened in, if it was raised inside the pipeline.
    pub fn step(&self) -> Option<PatchStep> {
        match self {
            PatchError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Whether running again could succeed without the user touching the installation.
///
/// True for pipeline failures that happened before the live archive was
/// written, unless the installation itself is what blocks the patch.
pub fn safe_to_rerun(err: &anyhow::Error) -> bool {
    let step = err.downcast_ref::<PatchError>().and_then(PatchError::step);
    let blocked = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<PatchError>(),
            Some(PatchError::PatchedWithoutBackup { .. })
        )
    });
    step.is_some_and(|s| s != PatchStep::InstallPatchedArchive) && !blocked
}
