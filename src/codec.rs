use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::asar;
use crate::config::CodecKind;
use crate::process;

/// Turns an archive into a directory tree and back.
#[async_trait]
pub trait ArchiveCodec: Send + Sync {
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<()>;
    async fn pack(&self, src: &Path, archive: &Path) -> Result<()>;
}

pub fn for_kind(kind: CodecKind) -> Box<dyn ArchiveCodec> {
    match kind {
        CodecKind::Native => Box::new(NativeCodec),
        CodecKind::External => Box::new(ExternalCodec::default()),
    }
}

/// In-process ASAR implementation.
pub struct NativeCodec;

#[async_trait]
impl ArchiveCodec for NativeCodec {
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || asar::extract(&archive, &dest))
            .await
            .context("Archive extraction task panicked")?
    }

    async fn pack(&self, src: &Path, archive: &Path) -> Result<()> {
        let src = src.to_path_buf();
        let archive = archive.to_path_buf();
        tokio::task::spawn_blocking(move || asar::pack(&src, &archive))
            .await
            .context("Archive packing task panicked")?
    }
}

/// Delegates to the `@electron/asar` command line through `npx`.
pub struct ExternalCodec {
    pub program: PathBuf,
    pub package: String,
}

impl Default for ExternalCodec {
    fn default() -> Self {
        Self {
            program: PathBuf::from(if cfg!(windows) { "npx.cmd" } else { "npx" }),
            package: "@electron/asar".to_string(),
        }
    }
}

impl ExternalCodec {
    async fn run(&self, args: &[&Path], action: &str) -> Result<()> {
        let mut argv = vec![
            "--yes".to_string(),
            self.package.clone(),
            action.to_string(),
        ];
        argv.extend(args.iter().map(|p| p.display().to_string()));
        process::run_tool(&self.program, &argv, None, &[]).await
    }
}

#[async_trait]
impl ArchiveCodec for ExternalCodec {
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        self.run(&[archive, dest], "extract").await
    }

    async fn pack(&self, src: &Path, archive: &Path) -> Result<()> {
        self.run(&[src, archive], "pack").await
    }
}
