use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::PatchError;

/// Environment variable naming a config file when `--config` is not given.
pub const CONFIG_ENV: &str = "ADPATCH_CONFIG";

/// Name of the pristine copy kept next to the live archive.
pub const BACKUP_FILE_NAME: &str = "app.bak.asar";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub fn current() -> Result<Self, PatchError> {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Result<Self, PatchError> {
        match os {
            "windows" => Ok(Platform::Windows),
            "macos" => Ok(Platform::MacOs),
            "linux" => Ok(Platform::Linux),
            other => Err(PatchError::UnsupportedPlatform {
                os: other.to_string(),
            }),
        }
    }

    /// Image name the OS process table reports for the application.
    pub fn image_name(&self, process_name: &str) -> String {
        match self {
            Platform::Windows if !process_name.to_ascii_lowercase().ends_with(".exe") => {
                format!("{process_name}.exe")
            }
            _ => process_name.to_string(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
            Platform::Linux => "linux",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Npm,
    Pnpm,
    Yarn,
    Bun,
}

impl PackageManager {
    pub fn program(&self) -> &'static str {
        match (self, cfg!(windows)) {
            (PackageManager::Npm, true) => "npm.cmd",
            (PackageManager::Npm, false) => "npm",
            (PackageManager::Pnpm, true) => "pnpm.cmd",
            (PackageManager::Pnpm, false) => "pnpm",
            (PackageManager::Yarn, true) => "yarn.cmd",
            (PackageManager::Yarn, false) => "yarn",
            (PackageManager::Bun, _) => "bun",
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
            PackageManager::Bun => "bun",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Native,
    External,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub target: TargetConfig,
    pub dependencies: DependencyConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    /// Install directory / bundle name of the application.
    pub name: String,
    pub process_name: String,
    pub archive_name: String,
    pub resources_dir: Option<PathBuf>,
    /// Entry script, relative to the archive root.
    pub entry_script: PathBuf,
    /// File name the original entry script is moved to, next to the wrapper.
    pub original_entry: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: "App".to_string(),
            process_name: "App".to_string(),
            archive_name: "app.asar".to_string(),
            resources_dir: None,
            entry_script: PathBuf::from("build").join("main.js"),
            original_entry: "main.original.js".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DependencyConfig {
    pub manager: PackageManager,
    /// Explicit executable, overriding the manager's default program name.
    pub program: Option<PathBuf>,
    pub engine: Vec<String>,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            manager: PackageManager::default(),
            program: None,
            engine: vec![
                "@ghostery/adblocker-electron".to_string(),
                "cross-fetch".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub settle_delay_ms: u64,
    pub workspace_root: Option<PathBuf>,
    pub wrapper: Option<PathBuf>,
    pub codec: CodecKind,
    /// Extra substrings that mark an entry script as already patched.
    pub markers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2000,
            workspace_root: None,
            wrapper: None,
            codec: CodecKind::default(),
            markers: Vec::new(),
        }
    }
}

impl Config {
    /// Load from an explicit path, then `ADPATCH_CONFIG`, then built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

/// Installation paths resolved for one target on one platform.
#[derive(Debug, Clone)]
pub struct InstallPaths {
    pub resources_dir: PathBuf,
    pub archive: PathBuf,
    pub backup: PathBuf,
    pub image_name: String,
}

impl InstallPaths {
    pub fn resolve(platform: Platform, target: &TargetConfig) -> Self {
        let resources_dir = match &target.resources_dir {
            Some(dir) => dir.clone(),
            None => default_resources_dir(platform, &target.name),
        };
        Self {
            archive: resources_dir.join(&target.archive_name),
            backup: resources_dir.join(BACKUP_FILE_NAME),
            image_name: platform.image_name(&target.process_name),
            resources_dir,
        }
    }
}

fn default_resources_dir(platform: Platform, name: &str) -> PathBuf {
    match platform {
        Platform::Windows => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(r"C:\Users\Default\AppData\Local"))
            .join("Programs")
            .join(name)
            .join("resources"),
        Platform::MacOs => PathBuf::from("/Applications")
            .join(format!("{name}.app"))
            .join("Contents")
            .join("Resources"),
        Platform::Linux => {
            let lower = name.to_ascii_lowercase();
            let mut candidates = vec![
                PathBuf::from("/opt").join(name).join("resources"),
                PathBuf::from("/opt").join(&lower).join("resources"),
                PathBuf::from("/usr/lib").join(&lower).join("resources"),
            ];
            if let Some(data) = dirs::data_dir() {
                candidates.push(data.join(&lower).join("resources"));
            }
            let fallback = candidates[0].clone();
            candidates
                .into_iter()
                .find(|dir| dir.is_dir())
                .unwrap_or(fallback)
        }
    }
}
