mod asar;
mod backup;
mod codec;
mod config;
mod deps;
mod detect;
mod error;
mod orchestrator;
mod process;
mod util;
mod workspace;
mod wrapper;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::level_filters::LevelFilter;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::backup::BackupDecision;
use crate::config::{Config, InstallPaths, PackageManager, Platform};
use crate::deps::PackageManagerInstaller;
use crate::error::PatchError;
use crate::orchestrator::{
    AssumeYes, Confirm, Orchestrator, PatchOutcome, PatchSession, TerminalConfirm,
};
use crate::process::SystemProcesses;
use crate::workspace::Workspace;
use crate::wrapper::WrapperSource;

const SETUP_MACOS: &str = "\
macOS setup
  1. Quit the application completely (Cmd+Q).
  2. Give your terminal Full Disk Access or App Management permission in
     System Settings > Privacy & Security, so it may modify /Applications.
  3. Make sure Node.js and npm are on PATH (`node --version`, `npm --version`).
  4. Run `adpatch` (or `sudo adpatch` if the bundle is owned by root).
  5. If the application refuses to start afterwards, re-sign it ad hoc:
       codesign --force --deep --sign - /Applications/<App>.app
";

const SETUP_LINUX: &str = "\
Linux setup
  1. Close the application.
  2. Make sure Node.js and npm are on PATH (`node --version`, `npm --version`).
  3. Find the resources directory holding app.asar, for example
     /opt/<App>/resources or /usr/lib/<app>/resources.
  4. If that directory is owned by root, run `sudo adpatch`, otherwise run
     `adpatch` as the user owning the installation. Pass --resources <dir>
     when the installation lives somewhere else.
  5. Sandboxed packages (Snap, Flatpak) have read-only archives and cannot be patched.
";

#[derive(Parser)]
#[command(
    name = "adpatch",
    version,
    about = "Patch an installed Electron application to load an ad blocker before it starts"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Print macOS setup instructions and exit
    #[arg(long, conflicts_with = "setup_linux")]
    setup_macos: bool,

    /// Print Linux setup instructions and exit
    #[arg(long)]
    setup_linux: bool,

    /// Config file (defaults to $ADPATCH_CONFIG, then built-in settings)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Resources directory containing the application archive
    #[arg(long, global = true)]
    resources: Option<PathBuf>,

    /// Package manager used inside the unpacked application
    #[arg(long, value_enum, global = true)]
    package_manager: Option<PackageManager>,

    /// Injection wrapper to install instead of the bundled one
    #[arg(long, global = true)]
    wrapper: Option<PathBuf>,

    /// Re-patch an already patched installation without asking
    #[arg(long, short, global = true)]
    yes: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(long, short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Patch the installed application (default)
    Run,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var("ADPATCH_LOG")
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.resources {
        config.target.resources_dir = Some(dir.clone());
    }
    if let Some(manager) = cli.package_manager {
        config.dependencies.manager = manager;
    }
    if let Some(wrapper) = &cli.wrapper {
        config.session.wrapper = Some(wrapper.clone());
    }
    Ok(config)
}

async fn run(cli: &Cli) -> Result<PatchOutcome> {
    let config = load_config(cli)?;
    let platform = Platform::current()?;
    let paths = InstallPaths::resolve(platform, &config.target);
    if !paths.archive.is_file() {
        return Err(PatchError::ArchiveNotFound { path: paths.archive }.into());
    }
    debug!(?paths, %platform, "resolved installation");

    println!("Patching {}", paths.archive.display());
    println!("  Backup: {}", paths.backup.display());

    let mut markers = wrapper::default_markers();
    markers.extend(config.session.markers.iter().cloned());

    let mut session = PatchSession {
        platform,
        paths,
        workspace: Workspace::allocate(config.session.workspace_root.as_deref()),
        use_existing_backup: false,
        package_manager: config.dependencies.manager,
        entry_script: config.target.entry_script.clone(),
        original_entry: config.target.original_entry.clone(),
        wrapper: WrapperSource::from_config(config.session.wrapper.clone()),
        markers,
    };
    println!("  Workspace: {}", session.workspace.path().display());

    let codec = codec::for_kind(config.session.codec);
    let processes = SystemProcesses {
        platform,
        settle_delay: Duration::from_millis(config.session.settle_delay_ms),
    };
    let installer = PackageManagerInstaller::from_config(&config.dependencies);
    let confirm: Box<dyn Confirm> = if cli.yes {
        Box::new(AssumeYes)
    } else {
        Box::new(TerminalConfirm)
    };

    let orchestrator = Orchestrator {
        codec: codec.as_ref(),
        processes: &processes,
        installer: &installer,
        confirm: confirm.as_ref(),
    };
    orchestrator.run(&mut session).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.setup_macos {
        print!("{SETUP_MACOS}");
        return ExitCode::SUCCESS;
    }
    if cli.setup_linux {
        print!("{SETUP_LINUX}");
        return ExitCode::SUCCESS;
    }

    init_logging(cli.verbose);

    let start = Instant::now();
    let result = match &cli.command {
        None | Some(Commands::Run) => run(&cli).await,
    };
    match result {
        Ok(PatchOutcome::Patched { backup }) => {
            println!("\nPatch applied successfully!");
            let note = match backup {
                BackupDecision::Create => "created",
                BackupDecision::Skip => "kept existing",
                BackupDecision::Reuse => "reused",
            };
            println!("  Backup: {note}");
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
            ExitCode::SUCCESS
        }
        Ok(PatchOutcome::Cancelled) => {
            println!("\nCancelled; no changes were made.");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("\nError: {err:#}");
            if error::safe_to_rerun(&err) {
                eprintln!("The installed archive was not modified; it is safe to run again.");
            }
            ExitCode::FAILURE
        }
    }
}
