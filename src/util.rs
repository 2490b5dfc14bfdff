use anyhow::{Context, Result};
use memmap2::Mmap;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Components relative to the walk root, in walk order.
    pub components: Vec<String>,
    pub kind: EntryKind,
    pub full_path: PathBuf,
    /// File size in bytes (0 for directories and links).
    pub size: u64,
    pub executable: bool,
}

/// Walk a directory tree parent-first in file-name order, without following links.
pub fn walk_directory(root: &Path) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry =
            entry.with_context(|| format!("Failed to read directory entry in {}", root.display()))?;

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(root)
            .with_context(|| "Failed to compute relative path")?;

        let components = relative
            .components()
            .map(|c| {
                c.as_os_str()
                    .to_str()
                    .map(str::to_string)
                    .with_context(|| format!("Non-UTF8 path: {}", relative.display()))
            })
            .collect::<Result<Vec<_>>>()?;

        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to read metadata: {}", full_path.display()))?;
        let size = if kind == EntryKind::File { meta.len() } else { 0 };

        entries.push(DirEntry {
            components,
            kind,
            full_path,
            size,
            executable: is_executable(&meta),
        });
    }

    Ok(entries)
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.is_file() && meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    // SAFETY: We only read from this mapping; the archive is not rewritten while it is open.
    unsafe {
        Mmap::map(&file)
            .with_context(|| format!("Failed to memory-map file: {}", path.display()))
    }
}

/// Stream-hash a file using BLAKE3.
pub fn hash_file(path: &Path) -> Result<blake3::Hash> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = std::io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut reader, &mut hasher)
        .with_context(|| format!("Failed to hash file: {}", path.display()))?;
    Ok(hasher.finalize())
}

/// Remove a directory tree, treating an already-missing tree as success.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::from(e))
            .with_context(|| format!("Failed to remove directory tree: {}", path.display())),
    }
}

/// Copy the tree under `src` to `dest`, checking every copied file against its source hash.
pub fn copy_tree_verified(src: &Path, dest: &Path) -> Result<()> {
    let entries = walk_directory(src)?;
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory: {}", dest.display()))?;

    let mut files = Vec::new();
    for entry in &entries {
        let target = dest.join(entry.components.iter().collect::<PathBuf>());
        match entry.kind {
            EntryKind::Dir => std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {}", target.display()))?,
            EntryKind::Symlink => copy_link(&entry.full_path, &target)?,
            EntryKind::File => files.push((entry, target)),
        }
    }

    files.par_iter().try_for_each(|(entry, target)| -> Result<()> {
        std::fs::copy(&entry.full_path, target).with_context(|| {
            format!(
                "Failed to copy {} to {}",
                entry.full_path.display(),
                target.display()
            )
        })?;
        if hash_file(&entry.full_path)? != hash_file(target)? {
            anyhow::bail!("Copy verification failed for {}", target.display());
        }
        Ok(())
    })
}

#[cfg(unix)]
fn copy_link(src: &Path, dest: &Path) -> Result<()> {
    let target = std::fs::read_link(src)
        .with_context(|| format!("Failed to read link: {}", src.display()))?;
    std::os::unix::fs::symlink(&target, dest)
        .with_context(|| format!("Failed to create link: {}", dest.display()))
}

#[cfg(not(unix))]
fn copy_link(src: &Path, dest: &Path) -> Result<()> {
    std::fs::copy(src, dest)
        .map(|_| ())
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))
}
