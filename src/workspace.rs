use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::util;

/// Scratch directory owned by one patch session.
///
/// The path is chosen when the session starts; the directory itself is only
/// created by [`Workspace::prepare`]. It is removed by [`Workspace::cleanup`]
/// or, failing that, on drop.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Allocate a time-seeded path under `parent` (the system temp dir by default).
    pub fn allocate(parent: Option<&Path>) -> Self {
        let parent = parent
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self::at(parent.join(format!("adpatch-{stamp}")))
    }

    pub fn at(root: PathBuf) -> Self {
        Self {
            root,
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Where the archive is unpacked.
    pub fn tree(&self) -> PathBuf {
        self.root.join("app")
    }

    /// Where the repacked archive is written.
    pub fn output_archive(&self) -> PathBuf {
        self.root.join("out").join("app.asar")
    }

    /// Where the bundled wrapper is staged.
    pub fn wrapper_dir(&self) -> PathBuf {
        self.root.join("wrapper")
    }

    /// Create the directory fresh, discarding leftovers of a crashed run with the same name.
    pub fn prepare(&self) -> Result<()> {
        if self.root.exists() {
            warn!(path = %self.root.display(), "removing stale workspace");
            util::remove_dir_if_exists(&self.root)?;
        }
        fs::create_dir_all(self.root.join("out"))
            .with_context(|| format!("Failed to create workspace: {}", self.root.display()))?;
        debug!(path = %self.root.display(), "workspace ready");
        Ok(())
    }

    pub fn cleanup(&mut self) -> Result<()> {
        util::remove_dir_if_exists(&self.root)?;
        self.removed = true;
        debug!(path = %self.root.display(), "workspace removed");
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.removed {
            let _ = util::remove_dir_if_exists(&self.root);
        }
    }
}
