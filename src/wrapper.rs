use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment flag the wrapper sets; its presence in an entry script marks it as ours.
pub const ENV_MARKER: &str = "ADPATCH_INJECTED";
/// Log tag printed by the wrapper.
pub const LOG_TAG: &str = "[adpatch]";

const TEMPLATE: &str = include_str!("../inject/main.js");
const ORIGINAL_ENTRY_SLOT: &str = "__ORIGINAL_ENTRY__";

pub fn default_markers() -> Vec<String> {
    vec![ENV_MARKER.to_string(), LOG_TAG.to_string()]
}

/// Render the bundled wrapper so it requires `original_entry` from its own directory.
pub fn render(original_entry: &str) -> Result<String> {
    let literal = serde_json::to_string(&format!("./{original_entry}"))
        .context("Failed to encode original entry name")?;
    Ok(TEMPLATE.replace(ORIGINAL_ENTRY_SLOT, &literal))
}

#[derive(Debug, Clone)]
pub enum WrapperSource {
    Bundled,
    File(PathBuf),
}

impl WrapperSource {
    pub fn from_config(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => WrapperSource::File(path),
            None => WrapperSource::Bundled,
        }
    }

    /// Make the wrapper available on disk, returning the file to install.
    ///
    /// An external wrapper is returned as-is; its existence is checked when it is installed.
    pub fn stage(&self, staging_dir: &Path, original_entry: &str) -> Result<PathBuf> {
        match self {
            WrapperSource::File(path) => Ok(path.clone()),
            WrapperSource::Bundled => {
                fs::create_dir_all(staging_dir).with_context(|| {
                    format!("Failed to create directory: {}", staging_dir.display())
                })?;
                let path = staging_dir.join("main.js");
                fs::write(&path, render(original_entry)?)
                    .with_context(|| format!("Failed to write wrapper: {}", path.display()))?;
                Ok(path)
            }
        }
    }
}
