use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{DependencyConfig, PackageManager};
use crate::process;

/// Variables a launching package manager leaves behind that would make the
/// child pick the launcher's implementation or lifecycle instead of ours.
const LEAKED_ENV: &[&str] = &[
    "npm_config_user_agent",
    "npm_execpath",
    "npm_node_execpath",
    "npm_lifecycle_event",
];

/// Materializes runtime dependencies into an unpacked application tree.
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(&self, tree: &Path) -> Result<()>;
}

pub struct PackageManagerInstaller {
    pub manager: PackageManager,
    pub program: PathBuf,
    pub engine: Vec<String>,
}

impl PackageManagerInstaller {
    pub fn from_config(config: &DependencyConfig) -> Self {
        Self {
            manager: config.manager,
            program: config
                .program
                .clone()
                .unwrap_or_else(|| PathBuf::from(config.manager.program())),
            engine: config.engine.clone(),
        }
    }

    /// Arguments adding the engine packages to the tree's manifest.
    pub fn add_args(&self) -> Vec<String> {
        let mut args: Vec<String> = match self.manager {
            PackageManager::Npm => vec!["install", "--no-audit", "--no-fund", "--install-links"],
            PackageManager::Pnpm => vec!["add", "--config.node-linker=hoisted"],
            PackageManager::Yarn | PackageManager::Bun => vec!["add"],
        }
        .into_iter()
        .map(str::to_string)
        .collect();
        args.extend(self.engine.iter().cloned());
        args
    }

    /// Arguments installing everything the manifest declares.
    pub fn install_args(&self) -> Vec<String> {
        match self.manager {
            PackageManager::Npm => vec![
                "install",
                "--no-audit",
                "--no-fund",
                "--install-links",
                "--omit=dev",
            ],
            PackageManager::Pnpm => vec!["install", "--prod", "--config.node-linker=hoisted"],
            PackageManager::Yarn | PackageManager::Bun => vec!["install", "--production"],
        }
        .into_iter()
        .map(str::to_string)
        .collect()
    }
}

#[async_trait]
impl DependencyInstaller for PackageManagerInstaller {
    async fn install(&self, tree: &Path) -> Result<()> {
        if !self.engine.is_empty() {
            info!(manager = %self.manager, packages = ?self.engine, "adding engine packages");
            process::run_tool(&self.program, &self.add_args(), Some(tree), LEAKED_ENV).await?;
        }
        info!(manager = %self.manager, "installing declared dependencies");
        process::run_tool(&self.program, &self.install_args(), Some(tree), LEAKED_ENV).await
    }
}
